//! # Availability Tracker
//!
//! Providers are probed periodically. A silent gap longer than `threshold`
//! between two consecutive samples is presumed downtime. Windows are
//! computed once per day by a sweep and stored per (provider, day).
//!
//! ## Window Rule
//!
//! ```text
//! day:       |D ──────────────────────────────────────────── D+86400|
//! samples:    ·100  ·1000                 ·50000
//! windows:         [160, 940]  [1060 ──── 49940]   [50060 ──── 86400]
//! ```
//!
//! - Samples before `D` only anchor the scan. The scan starts with `D`
//!   itself as the anchor.
//! - An in-day window starts at the anchor itself while the anchor is at or
//!   before `D`, otherwise `offset` after it. It ends `offset` before the
//!   sample that closes the gap.
//! - The trailing window always starts `offset` after the last sample and
//!   ends at day end.
//! - A sample within `threshold` after day end proves continuity and
//!   suppresses the trailing window.
//!
//! ## Sweep
//!
//! [`AvailabilityTracker::run_sweep`] walks forward from the stored watermark.
//! Each day commits in its own transaction together with the new watermark,
//! so a failed day is retried on the next run.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracker_common::{
    day_end, day_of, day_start, Day, NodeId, Timestamp, TrackerConfig, SECS_PER_DAY,
};

use crate::context::RequestContext;
use crate::error::{Result, TrackerError};
use crate::model::{AvailabilitySample, DayWindows, NaWindow};
use crate::repository::Repository;

/// Computes the downtime windows of one provider for the day `[day_start, day_end)`.
///
/// `samples` must be ascending and should cover
/// `[day_start - threshold, day_end + threshold]`.
pub fn compute_na_windows(
    samples: &[Timestamp],
    day_start: Timestamp,
    day_end: Timestamp,
    threshold: u64,
    offset: u64,
) -> Vec<NaWindow> {
    // the raw anchor is kept only while it has not moved past day start
    let gap_start = |last: Timestamp| {
        if last <= day_start {
            last
        } else {
            last.saturating_add(offset)
        }
    };

    let mut windows = Vec::new();
    let mut last = day_start;
    let mut next: Option<Timestamp> = None;

    for &t in samples {
        if t < day_start {
            last = t;
            continue;
        }
        if t >= day_end {
            next = Some(t);
            break;
        }
        if t.saturating_sub(last) > threshold {
            let w = NaWindow {
                start: gap_start(last),
                end: t.saturating_sub(offset),
            };
            if w.start < w.end {
                windows.push(w);
            }
        }
        last = t;
    }

    let continued = matches!(next, Some(n) if n.saturating_sub(last) <= threshold);
    if last < day_end.saturating_sub(offset) && !continued {
        let w = NaWindow {
            start: last.saturating_add(offset),
            end: day_end,
        };
        if w.start < w.end {
            windows.push(w);
        }
    }
    windows
}

/// Fraction of the day not covered by `windows`.
pub fn availability_score(windows: &[NaWindow]) -> f64 {
    let down: u64 = windows.iter().map(NaWindow::len).sum();
    1.0 - (down.min(SECS_PER_DAY) as f64 / SECS_PER_DAY as f64)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub days: Vec<Day>,
    pub providers: usize,
}

pub struct AvailabilityTracker {
    repo: Arc<dyn Repository>,
    threshold: u64,
    offset: u64,
}

impl AvailabilityTracker {
    pub fn new(repo: Arc<dyn Repository>, threshold: u64, offset: u64) -> Self {
        Self {
            repo,
            threshold,
            offset,
        }
    }

    pub fn from_config(repo: Arc<dyn Repository>, config: &TrackerConfig) -> Self {
        Self::new(repo, config.na_threshold_secs, config.na_offset_secs)
    }

    /// Stores one availability check and refreshes the provider's last contact.
    pub fn record_sample(&self, ctx: &RequestContext, sample: AvailabilitySample) -> Result<()> {
        let mut tx = self.repo.begin()?;
        let provider = tx
            .find_provider(&sample.provider)?
            .ok_or(TrackerError::UnknownProvider(sample.provider))?;
        if sample.timestamp > provider.last_contact {
            tx.touch_provider(&sample.provider, sample.timestamp)?;
        }
        tx.save_sample(sample)?;
        ctx.check()?;
        tx.commit()?;
        Ok(())
    }

    /// Computes and stores the windows of every provider sampled around `day`,
    /// then advances the watermark to `day`.
    pub fn sweep_day(&self, day: Day) -> Result<usize> {
        let start = day_start(day);
        let end = day_end(day);
        let from = start.saturating_sub(self.threshold);
        let to = end.saturating_add(self.threshold);

        let mut tx = self.repo.begin()?;
        let providers = tx.sampled_providers(from, to)?;
        for provider in &providers {
            let times = tx.sample_times(provider, from, to)?;
            let windows = compute_na_windows(&times, start, end, self.threshold, self.offset);
            let score = availability_score(&windows);
            debug!(
                "day {} provider {}: {} windows, score {:.4}",
                day,
                provider.short(),
                windows.len(),
                score
            );
            tx.set_availability(provider, score)?;
            tx.save_na_windows(provider, day, windows)?;
        }
        tx.set_watermark(day)?;
        tx.commit()?;
        Ok(providers.len())
    }

    /// Sweeps every complete day after the watermark.
    ///
    /// A day is complete once `now` has passed its end by `threshold`, so
    /// post-day samples are in. The first run starts at the day of the
    /// earliest stored sample.
    pub fn run_sweep(&self, now: Timestamp) -> Result<SweepReport> {
        let first = {
            let tx = self.repo.begin()?;
            match tx.watermark()? {
                Some(day) => day + 1,
                None => match tx.earliest_sample()? {
                    Some(ts) => day_of(ts),
                    None => return Ok(SweepReport::default()),
                },
            }
        };

        let mut report = SweepReport::default();
        let mut day = first;
        while day_end(day).saturating_add(self.threshold) <= now {
            report.providers += self.sweep_day(day)?;
            report.days.push(day);
            day += 1;
        }
        if !report.days.is_empty() {
            info!(
                "availability sweep: {} days, {} provider-days",
                report.days.len(),
                report.providers
            );
        }
        Ok(report)
    }

    /// Stored windows for `(provider, day)`, `None` if the day was not swept
    /// for that provider.
    pub fn get_na_windows(&self, provider: &NodeId, day: Day) -> Result<Option<DayWindows>> {
        let tx = self.repo.begin()?;
        Ok(tx.na_windows(provider, day)?.map(|windows| DayWindows {
            provider: *provider,
            day,
            windows,
        }))
    }

    pub fn watermark(&self) -> Result<Option<Day>> {
        let tx = self.repo.begin()?;
        Ok(tx.watermark()?)
    }
}
