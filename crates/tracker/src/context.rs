//! Per-request deadline carried into every request-scoped operation.

use std::time::{Duration, Instant};

use crate::error::{Result, TrackerError};

#[derive(Clone, Copy, Debug, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context without a deadline.
    pub fn background() -> Self {
        Self { deadline: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Fails with [`TrackerError::DeadlineExceeded`] once the deadline has passed.
    /// Called right before commit so an expired request leaves no writes behind.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(TrackerError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_never_expires() {
        assert!(RequestContext::background().check().is_ok());
    }

    #[test]
    fn test_past_deadline_fails() {
        let ctx = RequestContext::with_deadline(Instant::now());
        assert!(matches!(ctx.check(), Err(TrackerError::DeadlineExceeded)));
    }

    #[test]
    fn test_future_deadline_passes() {
        let ctx = RequestContext::with_timeout(Duration::from_secs(60));
        assert!(ctx.check().is_ok());
    }
}
