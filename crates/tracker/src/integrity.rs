//! # Integrity Monitor
//!
//! Turns provider loss reports into repair work and keeps the task queue
//! that providers poll.
//!
//! ## Miss Report Pipeline
//!
//! ```text
//! report (provider, [(hash, size)], ts)
//!   │
//!   ├─ persist raw report
//!   └─ per block:
//!        owning file? ──no──▶ warn + skip
//!        drop (block, provider) association, keep RemovedBlock audit row
//!        remaining holders? ──no──▶ warn unrepairable
//!        replacement = chooser.choose_replacement(holders + reporter)
//!        enqueue Replicate { sources: holders, target: replacement }
//! ```
//!
//! One batch is one transaction. A block that cannot be located or repaired
//! only affects its own entry.
//!
//! ## Action Logs
//!
//! Transfer receipts carry a ticket `<client>.<provider>.<issued_at>`.
//! A ticket that does not parse, or that does not name the reporting node,
//! becomes a [`CheatingRecord`] against the reporter.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracker_common::cid::short_hash;
use tracker_common::{NodeId, ParseError, TaskId, Timestamp, TrackerConfig};

use crate::chooser::ProviderChooser;
use crate::context::RequestContext;
use crate::error::{Result, TrackerError};
use crate::model::{
    BlockMiss, BlockRecord, CheatingRecord, MissReport, NewTask, RemovedBlock, Task, TaskKind,
};
use crate::repository::Repository;

// ════════════════════════════════════════════════════════════════════════════
// TICKETS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TicketError {
    #[error("ticket must have 3 dot-separated fields, got {0}")]
    FieldCount(usize),

    #[error("bad node id in ticket: {0}")]
    NodeId(#[from] ParseError),

    #[error("bad issue time in ticket: {0}")]
    IssuedAt(String),
}

/// Correlates the client and provider sides of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub client: NodeId,
    pub provider: NodeId,
    pub issued_at: Timestamp,
}

impl Ticket {
    pub fn parse(raw: &str) -> std::result::Result<Self, TicketError> {
        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() != 3 {
            return Err(TicketError::FieldCount(parts.len()));
        }
        let client = NodeId::from_hex(parts[0])?;
        let provider = NodeId::from_hex(parts[1])?;
        let issued_at = parts[2]
            .parse::<u64>()
            .map_err(|e| TicketError::IssuedAt(e.to_string()))?;
        Ok(Ticket {
            client,
            provider,
            issued_at,
        })
    }

    pub fn involves(&self, node: &NodeId) -> bool {
        self.client == *node || self.provider == *node
    }
}

impl FromStr for Ticket {
    type Err = TicketError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ticket::parse(s)
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.client, self.provider, self.issued_at)
    }
}

/// One transfer receipt submitted by a client or provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub ticket: String,
    pub action: String,
    pub bytes: u64,
    pub timestamp: Timestamp,
}

// ════════════════════════════════════════════════════════════════════════════
// SUMMARIES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissReportSummary {
    pub reported: usize,
    /// Blocks whose owning file was found and association dropped.
    pub resolved: usize,
    /// Blocks no file could be located for.
    pub unresolved: usize,
    /// Blocks with no remaining holder or no replacement provider.
    pub unrepairable: usize,
    pub tasks: Vec<TaskId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub accepted: usize,
    pub rejected: usize,
}

// ════════════════════════════════════════════════════════════════════════════
// MONITOR
// ════════════════════════════════════════════════════════════════════════════

pub struct IntegrityMonitor {
    repo: Arc<dyn Repository>,
    chooser: Arc<ProviderChooser>,
    task_ttl_secs: u64,
}

impl IntegrityMonitor {
    pub fn new(
        repo: Arc<dyn Repository>,
        chooser: Arc<ProviderChooser>,
        task_ttl_secs: u64,
    ) -> Self {
        Self {
            repo,
            chooser,
            task_ttl_secs,
        }
    }

    pub fn from_config(
        repo: Arc<dyn Repository>,
        chooser: Arc<ProviderChooser>,
        config: &TrackerConfig,
    ) -> Self {
        Self::new(repo, chooser, config.task_ttl_secs)
    }

    /// Processes a batch of blocks `provider` says it no longer holds.
    pub fn report_block_miss(
        &self,
        ctx: &RequestContext,
        provider: &NodeId,
        misses: &[BlockMiss],
        reported_at: Timestamp,
    ) -> Result<MissReportSummary> {
        self.chooser.ensure_loaded()?;
        let mut tx = self.repo.begin()?;

        tx.save_miss_report(MissReport {
            provider: *provider,
            blocks: misses.to_vec(),
            reported_at,
        })?;

        let mut summary = MissReportSummary {
            reported: misses.len(),
            ..Default::default()
        };

        for miss in misses {
            let file_id = match tx.find_owning_file(provider, &miss.hash, miss.size)? {
                Some(id) => id,
                None => {
                    warn!(
                        "miss report from {}: block {} ({} bytes) not found",
                        provider.short(),
                        short_hash(&miss.hash),
                        miss.size
                    );
                    summary.unresolved += 1;
                    continue;
                }
            };

            tx.remove_block(file_id, &miss.hash, provider)?;
            tx.record_removed_block(RemovedBlock {
                file_id,
                hash: miss.hash.clone(),
                provider: *provider,
                removed_at: reported_at,
            })?;
            summary.resolved += 1;

            let holders = tx.block_holders(file_id, &miss.hash)?;
            if holders.is_empty() {
                warn!(
                    "block {} of file {} is unrepairable: no holder left",
                    short_hash(&miss.hash),
                    file_id
                );
                summary.unrepairable += 1;
                continue;
            }

            let mut exclude = holders.clone();
            exclude.push(*provider);
            let target = match self.chooser.choose_replacement(&exclude)? {
                Some(p) => p,
                None => {
                    warn!(
                        "block {} of file {}: no replacement provider available",
                        short_hash(&miss.hash),
                        file_id
                    );
                    summary.unrepairable += 1;
                    continue;
                }
            };

            let task_id = tx.enqueue_task(NewTask {
                kind: TaskKind::Replicate,
                file_id,
                block_hash: miss.hash.clone(),
                block_size: miss.size,
                target: target.id,
                sources: holders,
                created_at: reported_at,
                expires_at: reported_at.saturating_add(self.task_ttl_secs),
            })?;
            debug!(
                "task {}: replicate {} to {}",
                task_id,
                short_hash(&miss.hash),
                target.id.short()
            );
            summary.tasks.push(task_id);
        }

        ctx.check()?;
        tx.commit()?;
        info!(
            "miss report from {}: {} blocks, {} tasks, {} unresolved, {} unrepairable",
            provider.short(),
            summary.reported,
            summary.tasks.len(),
            summary.unresolved,
            summary.unrepairable
        );
        Ok(summary)
    }

    /// Unfinished, unexpired tasks for `provider`.
    pub fn pending_tasks(&self, provider: &NodeId, now: Timestamp) -> Result<Vec<Task>> {
        let tx = self.repo.begin()?;
        Ok(tx.pending_tasks_for(provider, now)?)
    }

    /// Completes a task. Returns `false` if the task belongs to another
    /// provider or was already finished.
    ///
    /// A successful replicate makes the target a holder of the block.
    pub fn finish_task(
        &self,
        ctx: &RequestContext,
        task_id: TaskId,
        provider: &NodeId,
        success: bool,
        remark: Option<String>,
    ) -> Result<bool> {
        let mut tx = self.repo.begin()?;
        let task = tx
            .find_task(task_id)?
            .ok_or(TrackerError::UnknownTask(task_id))?;

        if !tx.finish_task(task_id, provider, success, remark)? {
            return Ok(false);
        }

        if success && task.kind == TaskKind::Replicate {
            let layout = tx
                .blocks_of_file(task.file_id)?
                .into_iter()
                .find(|b| b.hash == task.block_hash);
            let (partition, index, checksum) = layout
                .map(|b| (b.partition, b.index, b.checksum))
                .unwrap_or((0, 0, false));
            tx.save_blocks(
                task.file_id,
                vec![BlockRecord {
                    file_id: task.file_id,
                    hash: task.block_hash.clone(),
                    size: task.block_size,
                    provider: task.target,
                    partition,
                    index,
                    checksum,
                }],
            )?;
        }

        ctx.check()?;
        tx.commit()?;
        info!(
            "task {} finished by {} (success: {})",
            task_id,
            provider.short(),
            success
        );
        Ok(true)
    }

    pub fn record_cheating(&self, subject: &NodeId, evidence: &str, at: Timestamp) -> Result<()> {
        let mut tx = self.repo.begin()?;
        tx.save_cheating_record(CheatingRecord {
            subject: *subject,
            evidence: evidence.to_string(),
            recorded_at: at,
        })?;
        tx.commit()?;
        warn!("cheating recorded against {}: {}", subject.short(), evidence);
        Ok(())
    }

    pub fn cheating_records(&self, subject: &NodeId) -> Result<Vec<CheatingRecord>> {
        let tx = self.repo.begin()?;
        Ok(tx.cheating_records_for(subject)?)
    }

    /// Validates the tickets of a batch of receipts submitted by `reporter`.
    pub fn ingest_action_log(
        &self,
        ctx: &RequestContext,
        reporter: &NodeId,
        entries: &[ActionLogEntry],
        now: Timestamp,
    ) -> Result<IngestSummary> {
        let mut tx = self.repo.begin()?;
        let mut summary = IngestSummary::default();

        for entry in entries {
            let evidence = match Ticket::parse(&entry.ticket) {
                Ok(ticket) if ticket.involves(reporter) => {
                    summary.accepted += 1;
                    continue;
                }
                Ok(ticket) => format!("ticket {} not issued to reporter", ticket),
                Err(e) => format!("malformed ticket {:?}: {}", entry.ticket, e),
            };
            warn!("action log from {}: {}", reporter.short(), evidence);
            tx.save_cheating_record(CheatingRecord {
                subject: *reporter,
                evidence,
                recorded_at: now,
            })?;
            summary.rejected += 1;
        }

        ctx.check()?;
        tx.commit()?;
        debug!(
            "action log from {}: {} accepted, {} rejected",
            reporter.short(),
            summary.accepted,
            summary.rejected
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chooser::EligibilityPolicy;
    use crate::model::{CapacityGrant, NewFile, Provider};
    use crate::repository::MemoryRepository;
    use std::time::Duration;
    use tracker_common::FileId;

    fn provider(n: u32) -> Provider {
        let pk = format!("holder-{}", n);
        Provider {
            id: NodeId::from_public_key(pk.as_bytes()),
            addr: format!("10.2.0.{}:7000", n),
            public_key: pk,
            capacity: vec![CapacityGrant {
                bytes: 1 << 20,
                granted_at: 0,
            }],
            availability: 1.0,
            registered_at: 0,
            last_contact: 0,
            removed: false,
        }
    }

    fn block(file: FileId, hash: &str, holder: NodeId) -> BlockRecord {
        BlockRecord {
            file_id: file,
            hash: hash.to_string(),
            size: 512,
            provider: holder,
            partition: 0,
            index: 0,
            checksum: false,
        }
    }

    // Providers 0..n registered; "blk" stored on providers 0 and 1.
    fn setup(n: u32) -> (Arc<MemoryRepository>, IntegrityMonitor, FileId) {
        let repo = Arc::new(MemoryRepository::new());
        let file_id;
        {
            let mut tx = repo.begin().unwrap();
            for i in 0..n {
                tx.upsert_provider(provider(i)).unwrap();
            }
            file_id = tx
                .create_file(NewFile {
                    hash: "f".repeat(64),
                    size: 512,
                    data: None,
                    done: true,
                    ref_count: 1,
                    store_volume: 1024,
                    creator: provider(0).id,
                    created_at: 0,
                })
                .unwrap();
            tx.save_blocks(
                file_id,
                vec![block(file_id, "blk", provider(0).id), block(file_id, "blk", provider(1).id)],
            )
            .unwrap();
            tx.commit().unwrap();
        }
        let chooser = Arc::new(ProviderChooser::new(
            repo.clone(),
            EligibilityPolicy::default(),
            Duration::from_secs(60),
        ));
        (repo.clone(), IntegrityMonitor::new(repo, chooser, 3600), file_id)
    }

    fn miss(hash: &str) -> BlockMiss {
        BlockMiss {
            hash: hash.to_string(),
            size: 512,
        }
    }

    #[test]
    fn test_miss_with_other_holder_creates_one_task() {
        let (repo, monitor, file_id) = setup(4);
        let ctx = RequestContext::background();
        let reporter = provider(0).id;

        let summary = monitor
            .report_block_miss(&ctx, &reporter, &[miss("blk")], 1_000)
            .unwrap();
        assert_eq!(summary.tasks.len(), 1);
        assert_eq!(summary.resolved, 1);

        let tx = repo.begin().unwrap();
        assert_eq!(tx.block_holders(file_id, "blk").unwrap(), vec![provider(1).id]);
        assert_eq!(tx.removed_blocks_of_file(file_id).unwrap().len(), 1);
        assert_eq!(tx.miss_reports_for(&reporter).unwrap().len(), 1);

        let task = tx.find_task(summary.tasks[0]).unwrap().unwrap();
        assert_eq!(task.kind, TaskKind::Replicate);
        assert_eq!(task.sources, vec![provider(1).id]);
        assert_ne!(task.target, reporter);
        assert_ne!(task.target, provider(1).id);
        assert_eq!(task.expires_at, 4_600);
    }

    #[test]
    fn test_unresolvable_miss_creates_nothing() {
        let (repo, monitor, _) = setup(4);
        let reporter = provider(2).id;
        let summary = monitor
            .report_block_miss(
                &RequestContext::background(),
                &reporter,
                &[miss("blk"), miss("unknown")],
                1_000,
            )
            .unwrap();
        assert_eq!(summary.unresolved, 2);
        assert!(summary.tasks.is_empty());
        // the raw report is still kept
        assert_eq!(repo.begin().unwrap().miss_reports_for(&reporter).unwrap().len(), 1);
    }

    #[test]
    fn test_last_holder_is_unrepairable() {
        let (_, monitor, _) = setup(4);
        let ctx = RequestContext::background();
        monitor
            .report_block_miss(&ctx, &provider(0).id, &[miss("blk")], 10)
            .unwrap();
        let summary = monitor
            .report_block_miss(&ctx, &provider(1).id, &[miss("blk")], 20)
            .unwrap();
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.unrepairable, 1);
        assert!(summary.tasks.is_empty());
    }

    #[test]
    fn test_no_replacement_available() {
        let (_, monitor, _) = setup(2);
        let summary = monitor
            .report_block_miss(&RequestContext::background(), &provider(0).id, &[miss("blk")], 10)
            .unwrap();
        assert_eq!(summary.unrepairable, 1);
        assert!(summary.tasks.is_empty());
    }

    #[test]
    fn test_finish_replicate_adds_holder() {
        let (repo, monitor, file_id) = setup(3);
        let ctx = RequestContext::background();
        let summary = monitor
            .report_block_miss(&ctx, &provider(0).id, &[miss("blk")], 100)
            .unwrap();
        let task_id = summary.tasks[0];
        let target = provider(2).id;

        assert_eq!(monitor.pending_tasks(&target, 200).unwrap().len(), 1);
        assert!(monitor.pending_tasks(&target, 100 + 3600).unwrap().is_empty());

        assert!(!monitor
            .finish_task(&ctx, task_id, &provider(1).id, true, None)
            .unwrap());
        assert!(monitor
            .finish_task(&ctx, task_id, &target, true, Some("copied".into()))
            .unwrap());
        assert!(!monitor.finish_task(&ctx, task_id, &target, true, None).unwrap());
        assert!(monitor.pending_tasks(&target, 200).unwrap().is_empty());

        let mut holders = repo.begin().unwrap().block_holders(file_id, "blk").unwrap();
        holders.sort();
        let mut expected = vec![provider(1).id, target];
        expected.sort();
        assert_eq!(holders, expected);

        assert!(matches!(
            monitor.finish_task(&ctx, TaskId(77), &target, true, None),
            Err(TrackerError::UnknownTask(TaskId(77)))
        ));
    }

    #[test]
    fn test_ticket_parse() {
        let a = NodeId::from_public_key(b"a");
        let b = NodeId::from_public_key(b"b");
        let raw = format!("{}.{}.1700000000", a, b);
        let ticket = Ticket::parse(&raw).unwrap();
        assert_eq!(ticket.client, a);
        assert_eq!(ticket.provider, b);
        assert_eq!(ticket.issued_at, 1_700_000_000);
        assert_eq!(ticket.to_string(), raw);

        assert_eq!(Ticket::parse("a.b"), Err(TicketError::FieldCount(2)));
        assert!(matches!(Ticket::parse("x.y.z"), Err(TicketError::NodeId(_))));
        let bad_time = format!("{}.{}.soon", a, b);
        assert!(matches!(Ticket::parse(&bad_time), Err(TicketError::IssuedAt(_))));
    }

    #[test]
    fn test_ingest_files_cheating_records() {
        let (_, monitor, _) = setup(1);
        let reporter = provider(0).id;
        let other = NodeId::from_public_key(b"other");
        let entry = |ticket: String| ActionLogEntry {
            ticket,
            action: "upload".into(),
            bytes: 10,
            timestamp: 5,
        };
        let entries = vec![
            entry(format!("{}.{}.5", other, reporter)),
            entry("garbage".into()),
            entry(format!("{}.{}.5", other, other)),
        ];
        let summary = monitor
            .ingest_action_log(&RequestContext::background(), &reporter, &entries, 9)
            .unwrap();
        assert_eq!(summary, IngestSummary { accepted: 1, rejected: 2 });

        let records = monitor.cheating_records(&reporter).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.recorded_at == 9));
    }
}
