use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use tracker_common::unix_now;

use crate::availability::AvailabilityTracker;
use crate::chooser::ProviderChooser;

/// Periodically rebuilds the provider snapshot.
pub struct RefreshJob {
    chooser: Arc<ProviderChooser>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl RefreshJob {
    pub fn new(chooser: Arc<ProviderChooser>, interval: Duration, shutdown: Arc<Notify>) -> Self {
        Self {
            chooser,
            interval,
            shutdown,
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("chooser refresh started: every {:?}", self.interval);
            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        info!("chooser refresh shutting down");
                        break;
                    }
                    _ = sleep(self.interval) => {
                        let chooser = self.chooser.clone();
                        match tokio::task::spawn_blocking(move || chooser.refresh()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!("chooser refresh failed: {}", e),
                            Err(e) => warn!("chooser refresh panicked: {}", e),
                        }
                    }
                }
            }
        })
    }
}

/// Periodically computes downtime windows for completed days.
pub struct SweepJob {
    tracker: Arc<AvailabilityTracker>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl SweepJob {
    pub fn new(
        tracker: Arc<AvailabilityTracker>,
        interval: Duration,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            tracker,
            interval,
            shutdown,
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("availability sweep started: every {:?}", self.interval);
            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        info!("availability sweep shutting down");
                        break;
                    }
                    _ = sleep(self.interval) => {
                        // repository work blocks
                        let tracker = self.tracker.clone();
                        let sweep =
                            tokio::task::spawn_blocking(move || tracker.run_sweep(unix_now()));
                        match sweep.await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!("availability sweep failed: {}", e),
                            Err(e) => warn!("availability sweep panicked: {}", e),
                        }
                    }
                }
            }
        })
    }
}
