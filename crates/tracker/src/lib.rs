//! # Storage Tracker Core
//!
//! Control plane of a decentralized object store. The tracker never touches
//! file bytes beyond tiny inline files. It decides where content goes,
//! notices when it is lost, hands out repair work and scores provider
//! uptime.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                               TRACKER                                 │
//! │                                                                       │
//! │  ┌──────────────────┐   count/choose   ┌──────────────────┐           │
//! │  │ PlacementDecider │─────────────────▶│ ProviderChooser  │◀─ refresh │
//! │  │ (upload / final) │                  │ (snapshot+cursor)│    job    │
//! │  └────────┬─────────┘                  └────────▲─────────┘           │
//! │           │                                     │ choose_replacement  │
//! │           │          ┌──────────────────┐       │                     │
//! │           │          │ IntegrityMonitor │───────┘                     │
//! │           │          │ (miss → task)    │                             │
//! │           │          └────────┬─────────┘                             │
//! │           │                   │          ┌──────────────────────┐     │
//! │           │                   │          │ AvailabilityTracker  │◀─ sweep
//! │           │                   │          │ (samples → windows)  │   job
//! │           ▼                   ▼          └──────────┬───────────┘     │
//! │  ┌─────────────────────────────────────────────────────────────────┐  │
//! │  │                Repository (begin → ... → commit)                │  │
//! │  └─────────────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Operations
//!
//! | Operation | Component |
//! |-----------|-----------|
//! | `choose_providers` | [`ProviderChooser`] |
//! | `decide_placement` / `finalize_placement` | [`PlacementDecider`] |
//! | `report_block_miss` / task queue / action logs | [`IntegrityMonitor`] |
//! | `record_sample` / `run_sweep` / `get_na_windows` | [`AvailabilityTracker`] |
//!
//! [`Tracker`] wires all of them over one repository and adds the provider
//! registry.
//!
//! ## Transactions
//!
//! Every request-scoped operation takes a [`RequestContext`] and runs in one
//! repository transaction. The context deadline is checked right before
//! commit; an expired request rolls back and returns
//! [`TrackerError::DeadlineExceeded`].

pub mod availability;
pub mod chooser;
pub mod context;
pub mod error;
pub mod integrity;
pub mod jobs;
pub mod model;
pub mod placement;
pub mod repository;

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;
use tracker_common::{Day, FileId, NodeId, OwnerId, TaskId, Timestamp, TrackerConfig};

pub use availability::{compute_na_windows, AvailabilityTracker, SweepReport};
pub use chooser::{EligibilityPolicy, ProviderChooser};
pub use context::RequestContext;
pub use error::{RepoError, Result, TrackerError};
pub use integrity::{ActionLogEntry, IngestSummary, IntegrityMonitor, MissReportSummary, Ticket};
pub use placement::{
    FinalizeOutcome, FinalizeRequest, FolderOutcome, PlacementDecider, PlacementOutcome,
    PlacementRequest, PlacementSettings, RejectReason, ReleaseOutcome,
};
pub use repository::{MemoryRepository, Repository, Transaction};

use jobs::{RefreshJob, SweepJob};
use model::{
    AvailabilitySample, BlockMiss, CapacityGrant, CheatingRecord, DayWindows, FileVersion,
    Provider, Task,
};

/// All tracker components over one repository.
pub struct Tracker {
    config: TrackerConfig,
    repo: Arc<dyn Repository>,
    chooser: Arc<ProviderChooser>,
    placement: PlacementDecider,
    integrity: IntegrityMonitor,
    availability: Arc<AvailabilityTracker>,
}

impl Tracker {
    pub fn new(repo: Arc<dyn Repository>, config: TrackerConfig) -> Self {
        let chooser = Arc::new(ProviderChooser::from_config(repo.clone(), &config));
        let placement = PlacementDecider::new(
            repo.clone(),
            chooser.clone(),
            PlacementSettings::from_config(&config),
        );
        let integrity = IntegrityMonitor::from_config(repo.clone(), chooser.clone(), &config);
        let availability = Arc::new(AvailabilityTracker::from_config(repo.clone(), &config));
        Self {
            config,
            repo,
            chooser,
            placement,
            integrity,
            availability,
        }
    }

    /// Tracker over a fresh [`MemoryRepository`].
    pub fn in_memory(config: TrackerConfig) -> Self {
        Self::new(Arc::new(MemoryRepository::new()), config)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn chooser(&self) -> &Arc<ProviderChooser> {
        &self.chooser
    }

    /// Context with the configured default deadline.
    pub fn context(&self) -> RequestContext {
        RequestContext::with_timeout(self.config.request_timeout())
    }

    // ════════════════════════════════════════════════════════════════════════
    // PROVIDER REGISTRY
    // ════════════════════════════════════════════════════════════════════════

    /// Registers a provider under the id derived from `public_key`.
    ///
    /// Registering again updates the address and keeps existing grants.
    /// `capacity` is granted only on first registration.
    pub fn register_provider(
        &self,
        ctx: &RequestContext,
        public_key: &[u8],
        addr: &str,
        capacity: u64,
        now: Timestamp,
    ) -> Result<Provider> {
        if addr.is_empty() {
            return Err(TrackerError::InvalidArgument("empty provider address".into()));
        }
        let id = NodeId::from_public_key(public_key);
        let mut tx = self.repo.begin()?;
        let provider = match tx.find_provider(&id)? {
            Some(mut existing) => {
                existing.addr = addr.to_string();
                existing.last_contact = existing.last_contact.max(now);
                existing
            }
            None => Provider {
                id,
                addr: addr.to_string(),
                public_key: hex::encode(public_key),
                capacity: if capacity > 0 {
                    vec![CapacityGrant {
                        bytes: capacity,
                        granted_at: now,
                    }]
                } else {
                    Vec::new()
                },
                availability: 1.0,
                registered_at: now,
                last_contact: now,
                removed: false,
            },
        };
        tx.upsert_provider(provider.clone())?;
        ctx.check()?;
        tx.commit()?;
        self.chooser.invalidate(&id);
        info!("provider {} registered at {}", id.short(), addr);
        Ok(provider)
    }

    pub fn add_capacity(
        &self,
        ctx: &RequestContext,
        id: &NodeId,
        bytes: u64,
        now: Timestamp,
    ) -> Result<()> {
        if bytes == 0 {
            return Err(TrackerError::InvalidArgument("capacity grant of 0 bytes".into()));
        }
        let mut tx = self.repo.begin()?;
        let grant = CapacityGrant {
            bytes,
            granted_at: now,
        };
        if !tx.add_capacity(id, grant)? {
            return Err(TrackerError::UnknownProvider(*id));
        }
        ctx.check()?;
        tx.commit()?;
        self.chooser.invalidate(id);
        Ok(())
    }

    pub fn touch_provider(&self, id: &NodeId, now: Timestamp) -> Result<()> {
        let mut tx = self.repo.begin()?;
        if !tx.touch_provider(id, now)? {
            return Err(TrackerError::UnknownProvider(*id));
        }
        tx.commit()?;
        Ok(())
    }

    /// Marks a provider removed. It leaves the snapshot on the next refresh.
    pub fn remove_provider(&self, ctx: &RequestContext, id: &NodeId) -> Result<()> {
        let mut tx = self.repo.begin()?;
        if !tx.mark_provider_removed(id)? {
            return Err(TrackerError::UnknownProvider(*id));
        }
        ctx.check()?;
        tx.commit()?;
        self.chooser.invalidate(id);
        info!("provider {} removed", id.short());
        Ok(())
    }

    /// Current provider row. Unlike placement lookups this bypasses the
    /// chooser snapshot, so recent contacts and scores are visible.
    pub fn get_provider(&self, id: &NodeId) -> Result<Option<Provider>> {
        let tx = self.repo.begin()?;
        Ok(tx.find_provider(id)?)
    }

    pub fn list_providers(&self) -> Result<Vec<Provider>> {
        let tx = self.repo.begin()?;
        Ok(tx.find_all_providers()?)
    }

    pub fn refresh_providers(&self) -> Result<usize> {
        self.chooser.refresh()
    }

    pub fn choose_providers(&self, num: usize) -> Result<Vec<Provider>> {
        self.chooser.choose(num)
    }

    // ════════════════════════════════════════════════════════════════════════
    // PLACEMENT
    // ════════════════════════════════════════════════════════════════════════

    pub fn decide_placement(
        &self,
        ctx: &RequestContext,
        req: &PlacementRequest,
    ) -> Result<PlacementOutcome> {
        self.placement.decide_placement(ctx, req)
    }

    pub fn finalize_placement(
        &self,
        ctx: &RequestContext,
        req: &FinalizeRequest,
    ) -> Result<FinalizeOutcome> {
        self.placement.finalize_placement(ctx, req)
    }

    pub fn release_file(&self, ctx: &RequestContext, file_id: FileId) -> Result<ReleaseOutcome> {
        self.placement.release_file(ctx, file_id)
    }

    pub fn make_folder(
        &self,
        ctx: &RequestContext,
        client: &NodeId,
        path: &str,
        name: &str,
    ) -> Result<FolderOutcome> {
        self.placement.make_folder(ctx, client, path, name)
    }

    pub fn list_versions(&self, owner: OwnerId) -> Result<Vec<FileVersion>> {
        self.placement.list_versions(owner)
    }

    // ════════════════════════════════════════════════════════════════════════
    // INTEGRITY
    // ════════════════════════════════════════════════════════════════════════

    pub fn report_block_miss(
        &self,
        ctx: &RequestContext,
        provider: &NodeId,
        misses: &[BlockMiss],
        reported_at: Timestamp,
    ) -> Result<MissReportSummary> {
        self.integrity
            .report_block_miss(ctx, provider, misses, reported_at)
    }

    pub fn pending_tasks(&self, provider: &NodeId, now: Timestamp) -> Result<Vec<Task>> {
        self.integrity.pending_tasks(provider, now)
    }

    pub fn finish_task(
        &self,
        ctx: &RequestContext,
        task: TaskId,
        provider: &NodeId,
        success: bool,
        remark: Option<String>,
    ) -> Result<bool> {
        self.integrity
            .finish_task(ctx, task, provider, success, remark)
    }

    pub fn ingest_action_log(
        &self,
        ctx: &RequestContext,
        reporter: &NodeId,
        entries: &[ActionLogEntry],
        now: Timestamp,
    ) -> Result<IngestSummary> {
        self.integrity.ingest_action_log(ctx, reporter, entries, now)
    }

    pub fn record_cheating(&self, subject: &NodeId, evidence: &str, at: Timestamp) -> Result<()> {
        self.integrity.record_cheating(subject, evidence, at)
    }

    pub fn cheating_records(&self, subject: &NodeId) -> Result<Vec<CheatingRecord>> {
        self.integrity.cheating_records(subject)
    }

    // ════════════════════════════════════════════════════════════════════════
    // AVAILABILITY
    // ════════════════════════════════════════════════════════════════════════

    pub fn record_sample(&self, ctx: &RequestContext, sample: AvailabilitySample) -> Result<()> {
        self.availability.record_sample(ctx, sample)
    }

    pub fn run_sweep(&self, now: Timestamp) -> Result<SweepReport> {
        self.availability.run_sweep(now)
    }

    pub fn get_na_windows(&self, provider: &NodeId, day: Day) -> Result<Option<DayWindows>> {
        self.availability.get_na_windows(provider, day)
    }

    // ════════════════════════════════════════════════════════════════════════
    // BACKGROUND JOBS
    // ════════════════════════════════════════════════════════════════════════

    /// Starts the chooser refresh and availability sweep loops. Each stops
    /// on one `notify_waiters()` of `shutdown`.
    pub fn spawn_jobs(&self, shutdown: Arc<Notify>) -> Vec<JoinHandle<()>> {
        let refresh = Arc::new(RefreshJob::new(
            self.chooser.clone(),
            self.config.chooser_refresh_interval(),
            shutdown.clone(),
        ));
        let sweep = Arc::new(SweepJob::new(
            self.availability.clone(),
            self.config.na_sweep_interval(),
            shutdown,
        ));
        vec![refresh.start(), sweep.start()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> Tracker {
        Tracker::in_memory(TrackerConfig::default())
    }

    #[test]
    fn test_register_is_idempotent() {
        let t = tracker();
        let ctx = RequestContext::background();
        let first = t
            .register_provider(&ctx, b"key-1", "10.0.0.1:7000", 1_000, 10)
            .unwrap();
        let second = t
            .register_provider(&ctx, b"key-1", "10.0.0.9:7000", 5_000, 20)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.addr, "10.0.0.9:7000");
        assert_eq!(second.total_capacity(), 1_000);
        assert_eq!(t.list_providers().unwrap().len(), 1);
        assert_eq!(first.id, NodeId::from_public_key(b"key-1"));
    }

    #[test]
    fn test_capacity_grants_accumulate() {
        let t = tracker();
        let ctx = RequestContext::background();
        let p = t.register_provider(&ctx, b"key", "h:1", 0, 0).unwrap();
        assert_eq!(t.refresh_providers().unwrap(), 0);

        t.add_capacity(&ctx, &p.id, 300, 1).unwrap();
        t.add_capacity(&ctx, &p.id, 200, 2).unwrap();
        assert_eq!(t.refresh_providers().unwrap(), 1);
        let p = t.get_provider(&p.id).unwrap().unwrap();
        assert_eq!(p.capacity.len(), 2);
        assert_eq!(p.total_capacity(), 500);

        assert!(matches!(
            t.add_capacity(&ctx, &p.id, 0, 3),
            Err(TrackerError::InvalidArgument(_))
        ));
        let ghost = NodeId::from_public_key(b"ghost");
        assert!(matches!(
            t.add_capacity(&ctx, &ghost, 1, 3),
            Err(TrackerError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_removed_provider_leaves_pool() {
        let t = tracker();
        let ctx = RequestContext::background();
        let a = t.register_provider(&ctx, b"a", "h:1", 10, 0).unwrap();
        t.register_provider(&ctx, b"b", "h:2", 10, 0).unwrap();
        assert_eq!(t.refresh_providers().unwrap(), 2);
        t.remove_provider(&ctx, &a.id).unwrap();
        assert_eq!(t.refresh_providers().unwrap(), 1);
        assert!(t.get_provider(&a.id).unwrap().unwrap().removed);
    }

    #[test]
    fn test_get_provider_sees_contact_before_refresh() {
        let t = tracker();
        let ctx = RequestContext::background();
        let p = t.register_provider(&ctx, b"key", "h:1", 10, 100).unwrap();
        assert_eq!(t.refresh_providers().unwrap(), 1);

        t.touch_provider(&p.id, 5_000).unwrap();
        assert_eq!(t.get_provider(&p.id).unwrap().unwrap().last_contact, 5_000);
        // the placement snapshot still holds the old row
        assert_eq!(t.chooser().get(&p.id).unwrap().unwrap().last_contact, 100);
    }
}
