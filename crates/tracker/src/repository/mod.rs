//! # Repository Abstraction
//!
//! The tracker engine persists nothing itself. Every read and write goes
//! through a [`Transaction`] obtained from a [`Repository`]:
//!
//! ```text
//! let mut tx = repo.begin()?;   // acquire
//! tx.check_file(..)?;           // reads / writes
//! tx.commit()?;                 // publish
//! // any early return drops `tx` → rollback
//! ```
//!
//! ## Contract
//!
//! - Writes made through a transaction are invisible to other transactions
//!   until [`Transaction::commit`] returns `Ok`.
//! - Dropping a transaction without committing discards all of its writes.
//! - A caller must not open a second transaction on the same repository
//!   while holding one; backends are free to serialize transactions.

pub mod memory;

pub use memory::MemoryRepository;

use tracker_common::{Day, FileId, NodeId, OwnerId, TaskId, Timestamp};

use crate::error::RepoError;
use crate::model::{
    AvailabilitySample, BlockRecord, CapacityGrant, CheatingRecord, File, FileStatus, FileVersion,
    MissReport, NaWindow, NewFile, NewOwnerEntry, NewTask, OwnerEntry, ProofMetadata, Provider,
    RemovedBlock, Task,
};

pub type RepoResult<T> = std::result::Result<T, RepoError>;

/// Source of transactions.
pub trait Repository: Send + Sync {
    fn begin(&self) -> RepoResult<Box<dyn Transaction + '_>>;
}

/// A unit of work against the store. See the module docs for the contract.
pub trait Transaction {
    // ── providers ────────────────────────────────────────────────────────────

    fn find_all_providers(&self) -> RepoResult<Vec<Provider>>;
    fn find_provider(&self, id: &NodeId) -> RepoResult<Option<Provider>>;
    /// Inserts or replaces the provider row.
    fn upsert_provider(&mut self, provider: Provider) -> RepoResult<()>;
    /// Appends a grant; `false` if the provider does not exist.
    fn add_capacity(&mut self, id: &NodeId, grant: CapacityGrant) -> RepoResult<bool>;
    fn touch_provider(&mut self, id: &NodeId, at: Timestamp) -> RepoResult<bool>;
    fn mark_provider_removed(&mut self, id: &NodeId) -> RepoResult<bool>;
    fn set_availability(&mut self, id: &NodeId, score: f64) -> RepoResult<bool>;

    // ── files ────────────────────────────────────────────────────────────────

    fn check_file(&self, hash: &str) -> RepoResult<Option<FileStatus>>;
    fn find_file(&self, id: FileId) -> RepoResult<Option<File>>;
    /// Fails with [`RepoError::Conflict`] if the hash already exists.
    fn create_file(&mut self, file: NewFile) -> RepoResult<FileId>;
    /// Returns the new reference count.
    fn increment_ref_count(&mut self, hash: &str) -> RepoResult<u32>;
    /// Replaces the row with the same id.
    fn update_file(&mut self, file: &File) -> RepoResult<()>;

    // ── ownership tree ───────────────────────────────────────────────────────

    fn find_owner_entry(
        &self,
        client: &NodeId,
        parent: Option<OwnerId>,
        name: &str,
    ) -> RepoResult<Option<OwnerEntry>>;
    fn find_owner_by_id(&self, id: OwnerId) -> RepoResult<Option<OwnerEntry>>;
    /// Fails with [`RepoError::Conflict`] if `(client, parent, name)` exists.
    fn create_owner_entry(&mut self, entry: NewOwnerEntry) -> RepoResult<OwnerId>;
    fn set_owner_content(&mut self, id: OwnerId, hash: &str, modified_at: Timestamp)
        -> RepoResult<()>;
    fn create_version(&mut self, version: FileVersion) -> RepoResult<()>;
    fn list_versions(&self, owner: OwnerId) -> RepoResult<Vec<FileVersion>>;

    /// Walks `segments` from the client's root.
    ///
    /// Returns `None` when a segment is missing or names a file, otherwise
    /// `Some(dir)` where `dir == None` denotes the root.
    fn resolve_path(
        &self,
        client: &NodeId,
        segments: &[&str],
    ) -> RepoResult<Option<Option<OwnerId>>> {
        let mut current: Option<OwnerId> = None;
        for segment in segments {
            match self.find_owner_entry(client, current, segment)? {
                Some(entry) if entry.is_folder => current = Some(entry.id),
                _ => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    // ── blocks ───────────────────────────────────────────────────────────────

    fn save_blocks(&mut self, file: FileId, blocks: Vec<BlockRecord>) -> RepoResult<()>;
    /// Deletes the association; `false` if it did not exist.
    fn remove_block(&mut self, file: FileId, hash: &str, provider: &NodeId) -> RepoResult<bool>;
    fn find_owning_file(
        &self,
        provider: &NodeId,
        hash: &str,
        size: u64,
    ) -> RepoResult<Option<FileId>>;
    /// Providers currently holding block `hash` of `file`.
    fn block_holders(&self, file: FileId, hash: &str) -> RepoResult<Vec<NodeId>>;
    fn blocks_of_file(&self, file: FileId) -> RepoResult<Vec<BlockRecord>>;
    fn record_removed_block(&mut self, removed: RemovedBlock) -> RepoResult<()>;
    fn removed_blocks_of_file(&self, file: FileId) -> RepoResult<Vec<RemovedBlock>>;
    fn save_proofs(&mut self, file: FileId, proofs: Vec<ProofMetadata>) -> RepoResult<()>;
    /// Drops every block association and proof of `file`. Returns the number
    /// of associations dropped.
    fn purge_file_layout(&mut self, file: FileId) -> RepoResult<usize>;
    fn find_proof(&self, file: FileId, block_hash: &str) -> RepoResult<Option<ProofMetadata>>;

    // ── tasks and reports ────────────────────────────────────────────────────

    fn enqueue_task(&mut self, task: NewTask) -> RepoResult<TaskId>;
    fn find_task(&self, id: TaskId) -> RepoResult<Option<Task>>;
    /// Unfinished, unexpired tasks targeting `provider`, oldest first.
    fn pending_tasks_for(&self, provider: &NodeId, now: Timestamp) -> RepoResult<Vec<Task>>;
    /// `false` when the task is missing, targets another provider or is already finished.
    fn finish_task(
        &mut self,
        id: TaskId,
        provider: &NodeId,
        success: bool,
        remark: Option<String>,
    ) -> RepoResult<bool>;
    fn save_miss_report(&mut self, report: MissReport) -> RepoResult<()>;
    fn miss_reports_for(&self, provider: &NodeId) -> RepoResult<Vec<MissReport>>;
    fn save_cheating_record(&mut self, record: CheatingRecord) -> RepoResult<()>;
    fn cheating_records_for(&self, subject: &NodeId) -> RepoResult<Vec<CheatingRecord>>;

    // ── availability ─────────────────────────────────────────────────────────

    fn save_sample(&mut self, sample: AvailabilitySample) -> RepoResult<()>;
    /// Sample timestamps in `[start, end]`, ascending.
    fn sample_times(&self, provider: &NodeId, start: Timestamp, end: Timestamp)
        -> RepoResult<Vec<Timestamp>>;
    /// Providers with at least one sample in `[start, end]`.
    fn sampled_providers(&self, start: Timestamp, end: Timestamp) -> RepoResult<Vec<NodeId>>;
    fn earliest_sample(&self) -> RepoResult<Option<Timestamp>>;
    /// Replaces the windows stored for `(provider, day)`.
    fn save_na_windows(&mut self, provider: &NodeId, day: Day, windows: Vec<NaWindow>)
        -> RepoResult<()>;
    fn na_windows(&self, provider: &NodeId, day: Day) -> RepoResult<Option<Vec<NaWindow>>>;
    /// Last fully swept day.
    fn watermark(&self) -> RepoResult<Option<Day>>;
    fn set_watermark(&mut self, day: Day) -> RepoResult<()>;

    // ── lifecycle ────────────────────────────────────────────────────────────

    /// Publishes every write made through this transaction.
    fn commit(self: Box<Self>) -> RepoResult<()>;
}
