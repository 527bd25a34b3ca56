//! In-memory [`Repository`] used by tests and single-process deployments.
//!
//! A transaction holds the store lock for its whole lifetime and writes
//! straight into the state. Every write first journals how to undo itself;
//! commit discards the journal, drop replays it backwards. Isolation is
//! serializable and a write costs only the rows it touches.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracker_common::{Day, FileId, NodeId, OwnerId, TaskId, Timestamp};

use super::{RepoResult, Repository, Transaction};
use crate::error::RepoError;
use crate::model::{
    AvailabilitySample, BlockRecord, CapacityGrant, CheatingRecord, File, FileStatus, FileVersion,
    MissReport, NaWindow, NewFile, NewOwnerEntry, NewTask, OwnerEntry, ProofMetadata, Provider,
    RemovedBlock, Task,
};

type OwnerKey = (NodeId, Option<OwnerId>, String);

#[derive(Default)]
struct MemoryState {
    providers: BTreeMap<NodeId, Provider>,

    files: BTreeMap<FileId, File>,
    file_by_hash: HashMap<String, FileId>,
    next_file_id: u64,

    owners: BTreeMap<OwnerId, OwnerEntry>,
    owner_index: HashMap<OwnerKey, OwnerId>,
    next_owner_id: u64,
    versions: Vec<FileVersion>,

    blocks: Vec<BlockRecord>,
    removed_blocks: Vec<RemovedBlock>,
    proofs: HashMap<(FileId, String), ProofMetadata>,

    tasks: BTreeMap<TaskId, Task>,
    next_task_id: u64,
    miss_reports: Vec<MissReport>,
    cheating: Vec<CheatingRecord>,

    // per provider, ascending by timestamp
    samples: BTreeMap<NodeId, Vec<AvailabilitySample>>,
    na_windows: BTreeMap<(NodeId, Day), Vec<NaWindow>>,
    watermark: Option<Day>,
}

/// Process-local repository.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `begin` fail with [`RepoError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl Repository for MemoryRepository {
    fn begin(&self) -> RepoResult<Box<dyn Transaction + '_>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepoError::Unavailable("memory repository switched off".into()));
        }
        Ok(Box::new(MemoryTx {
            guard: self.state.lock(),
            journal: Vec::new(),
        }))
    }
}

/// Inverse of one write.
enum Undo {
    Provider(NodeId, Option<Provider>),
    FileCreated { id: FileId, hash: String },
    File(File),
    OwnerCreated { id: OwnerId, key: OwnerKey },
    Owner(OwnerEntry),
    VersionPushed,
    BlockPushed,
    BlockRemoved(usize, BlockRecord),
    RemovedBlockPushed,
    ProofInserted((FileId, String)),
    ProofRemoved((FileId, String), ProofMetadata),
    TaskCreated(TaskId),
    Task(Task),
    MissReportPushed,
    CheatingPushed,
    SampleInserted(NodeId, usize),
    NaWindows((NodeId, Day), Option<Vec<NaWindow>>),
    Watermark(Option<Day>),
}

impl Undo {
    fn revert(self, st: &mut MemoryState) {
        match self {
            Undo::Provider(id, Some(prev)) => {
                st.providers.insert(id, prev);
            }
            Undo::Provider(id, None) => {
                st.providers.remove(&id);
            }
            Undo::FileCreated { id, hash } => {
                st.files.remove(&id);
                st.file_by_hash.remove(&hash);
                st.next_file_id -= 1;
            }
            Undo::File(prev) => {
                st.files.insert(prev.id, prev);
            }
            Undo::OwnerCreated { id, key } => {
                st.owners.remove(&id);
                st.owner_index.remove(&key);
                st.next_owner_id -= 1;
            }
            Undo::Owner(prev) => {
                st.owners.insert(prev.id, prev);
            }
            Undo::VersionPushed => {
                st.versions.pop();
            }
            Undo::BlockPushed => {
                st.blocks.pop();
            }
            Undo::BlockRemoved(at, block) => st.blocks.insert(at, block),
            Undo::RemovedBlockPushed => {
                st.removed_blocks.pop();
            }
            Undo::ProofInserted(key) => {
                st.proofs.remove(&key);
            }
            Undo::ProofRemoved(key, proof) => {
                st.proofs.insert(key, proof);
            }
            Undo::TaskCreated(id) => {
                st.tasks.remove(&id);
                st.next_task_id -= 1;
            }
            Undo::Task(prev) => {
                st.tasks.insert(prev.id, prev);
            }
            Undo::MissReportPushed => {
                st.miss_reports.pop();
            }
            Undo::CheatingPushed => {
                st.cheating.pop();
            }
            Undo::SampleInserted(provider, at) => {
                if let Some(series) = st.samples.get_mut(&provider) {
                    series.remove(at);
                    if series.is_empty() {
                        st.samples.remove(&provider);
                    }
                }
            }
            Undo::NaWindows(key, Some(prev)) => {
                st.na_windows.insert(key, prev);
            }
            Undo::NaWindows(key, None) => {
                st.na_windows.remove(&key);
            }
            Undo::Watermark(prev) => st.watermark = prev,
        }
    }
}

struct MemoryTx<'a> {
    guard: MutexGuard<'a, MemoryState>,
    // applied writes, oldest first
    journal: Vec<Undo>,
}

impl MemoryTx<'_> {
    fn provider_mut(&mut self, id: &NodeId) -> Option<&mut Provider> {
        let prev = self.guard.providers.get(id)?.clone();
        self.journal.push(Undo::Provider(*id, Some(prev)));
        self.guard.providers.get_mut(id)
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        while let Some(undo) = self.journal.pop() {
            undo.revert(&mut self.guard);
        }
    }
}

impl Transaction for MemoryTx<'_> {
    // ── providers ────────────────────────────────────────────────────────────

    fn find_all_providers(&self) -> RepoResult<Vec<Provider>> {
        Ok(self.guard.providers.values().cloned().collect())
    }

    fn find_provider(&self, id: &NodeId) -> RepoResult<Option<Provider>> {
        Ok(self.guard.providers.get(id).cloned())
    }

    fn upsert_provider(&mut self, provider: Provider) -> RepoResult<()> {
        let id = provider.id;
        let prev = self.guard.providers.insert(id, provider);
        self.journal.push(Undo::Provider(id, prev));
        Ok(())
    }

    fn add_capacity(&mut self, id: &NodeId, grant: CapacityGrant) -> RepoResult<bool> {
        Ok(match self.provider_mut(id) {
            Some(p) => {
                p.capacity.push(grant);
                true
            }
            None => false,
        })
    }

    fn touch_provider(&mut self, id: &NodeId, at: Timestamp) -> RepoResult<bool> {
        Ok(match self.provider_mut(id) {
            Some(p) => {
                p.last_contact = p.last_contact.max(at);
                true
            }
            None => false,
        })
    }

    fn mark_provider_removed(&mut self, id: &NodeId) -> RepoResult<bool> {
        Ok(match self.provider_mut(id) {
            Some(p) => {
                p.removed = true;
                true
            }
            None => false,
        })
    }

    fn set_availability(&mut self, id: &NodeId, score: f64) -> RepoResult<bool> {
        Ok(match self.provider_mut(id) {
            Some(p) => {
                p.availability = score;
                true
            }
            None => false,
        })
    }

    // ── files ────────────────────────────────────────────────────────────────

    fn check_file(&self, hash: &str) -> RepoResult<Option<FileStatus>> {
        Ok(self
            .guard
            .file_by_hash
            .get(hash)
            .and_then(|id| self.guard.files.get(id))
            .map(FileStatus::from))
    }

    fn find_file(&self, id: FileId) -> RepoResult<Option<File>> {
        Ok(self.guard.files.get(&id).cloned())
    }

    fn create_file(&mut self, file: NewFile) -> RepoResult<FileId> {
        if self.guard.file_by_hash.contains_key(&file.hash) {
            return Err(RepoError::Conflict(format!("file {} exists", file.hash)));
        }
        self.guard.next_file_id += 1;
        let id = FileId(self.guard.next_file_id);
        self.guard.file_by_hash.insert(file.hash.clone(), id);
        self.journal.push(Undo::FileCreated {
            id,
            hash: file.hash.clone(),
        });
        self.guard.files.insert(
            id,
            File {
                id,
                hash: file.hash,
                size: file.size,
                ref_count: file.ref_count,
                done: file.done,
                removed: false,
                data: file.data,
                store_volume: file.store_volume,
                creator: file.creator,
                created_at: file.created_at,
            },
        );
        Ok(id)
    }

    fn increment_ref_count(&mut self, hash: &str) -> RepoResult<u32> {
        let id = self
            .guard
            .file_by_hash
            .get(hash)
            .copied()
            .ok_or_else(|| RepoError::NotFound(format!("file {}", hash)))?;
        let file = self
            .guard
            .files
            .get_mut(&id)
            .ok_or_else(|| RepoError::NotFound(format!("file {}", id)))?;
        let prev = file.clone();
        file.ref_count = file.ref_count.saturating_add(1);
        let count = file.ref_count;
        self.journal.push(Undo::File(prev));
        Ok(count)
    }

    fn update_file(&mut self, file: &File) -> RepoResult<()> {
        match self.guard.files.get_mut(&file.id) {
            Some(row) if row.hash == file.hash => {
                let prev = std::mem::replace(row, file.clone());
                self.journal.push(Undo::File(prev));
                Ok(())
            }
            Some(_) => Err(RepoError::Conflict(format!("file {} hash is immutable", file.id))),
            None => Err(RepoError::NotFound(format!("file {}", file.id))),
        }
    }

    // ── ownership tree ───────────────────────────────────────────────────────

    fn find_owner_entry(
        &self,
        client: &NodeId,
        parent: Option<OwnerId>,
        name: &str,
    ) -> RepoResult<Option<OwnerEntry>> {
        let key = (*client, parent, name.to_string());
        Ok(self
            .guard
            .owner_index
            .get(&key)
            .and_then(|id| self.guard.owners.get(id))
            .cloned())
    }

    fn find_owner_by_id(&self, id: OwnerId) -> RepoResult<Option<OwnerEntry>> {
        Ok(self.guard.owners.get(&id).cloned())
    }

    fn create_owner_entry(&mut self, entry: NewOwnerEntry) -> RepoResult<OwnerId> {
        let key = (entry.client, entry.parent, entry.name.clone());
        if self.guard.owner_index.contains_key(&key) {
            return Err(RepoError::Conflict(format!("name {} exists", entry.name)));
        }
        if let Some(parent) = entry.parent {
            match self.guard.owners.get(&parent) {
                Some(p) if p.is_folder && p.client == entry.client => {}
                _ => return Err(RepoError::NotFound(format!("folder {}", parent))),
            }
        }
        self.guard.next_owner_id += 1;
        let id = OwnerId(self.guard.next_owner_id);
        self.guard.owner_index.insert(key.clone(), id);
        self.journal.push(Undo::OwnerCreated { id, key });
        self.guard.owners.insert(
            id,
            OwnerEntry {
                id,
                client: entry.client,
                parent: entry.parent,
                name: entry.name,
                is_folder: entry.is_folder,
                hash: entry.hash,
                modified_at: entry.modified_at,
            },
        );
        Ok(id)
    }

    fn set_owner_content(
        &mut self,
        id: OwnerId,
        hash: &str,
        modified_at: Timestamp,
    ) -> RepoResult<()> {
        let entry = self
            .guard
            .owners
            .get_mut(&id)
            .ok_or_else(|| RepoError::NotFound(format!("owner entry {}", id)))?;
        let prev = entry.clone();
        entry.hash = Some(hash.to_string());
        entry.modified_at = modified_at;
        self.journal.push(Undo::Owner(prev));
        Ok(())
    }

    fn create_version(&mut self, version: FileVersion) -> RepoResult<()> {
        self.guard.versions.push(version);
        self.journal.push(Undo::VersionPushed);
        Ok(())
    }

    fn list_versions(&self, owner: OwnerId) -> RepoResult<Vec<FileVersion>> {
        Ok(self
            .guard
            .versions
            .iter()
            .filter(|v| v.owner == owner)
            .cloned()
            .collect())
    }

    // ── blocks ───────────────────────────────────────────────────────────────

    fn save_blocks(&mut self, file: FileId, blocks: Vec<BlockRecord>) -> RepoResult<()> {
        for block in blocks {
            if block.file_id != file {
                return Err(RepoError::Conflict(format!(
                    "block {} belongs to file {}",
                    block.hash, block.file_id
                )));
            }
            let duplicate = self.guard.blocks.iter().any(|b| {
                b.file_id == file && b.hash == block.hash && b.provider == block.provider
            });
            if !duplicate {
                self.guard.blocks.push(block);
                self.journal.push(Undo::BlockPushed);
            }
        }
        Ok(())
    }

    fn remove_block(&mut self, file: FileId, hash: &str, provider: &NodeId) -> RepoResult<bool> {
        let hits: Vec<usize> = self
            .guard
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.file_id == file && b.hash == hash && b.provider == *provider)
            .map(|(i, _)| i)
            .collect();
        // back to front, so undo reinserts front to back
        for &at in hits.iter().rev() {
            let block = self.guard.blocks.remove(at);
            self.journal.push(Undo::BlockRemoved(at, block));
        }
        Ok(!hits.is_empty())
    }

    fn find_owning_file(
        &self,
        provider: &NodeId,
        hash: &str,
        size: u64,
    ) -> RepoResult<Option<FileId>> {
        Ok(self
            .guard
            .blocks
            .iter()
            .find(|b| b.provider == *provider && b.hash == hash && b.size == size)
            .map(|b| b.file_id))
    }

    fn block_holders(&self, file: FileId, hash: &str) -> RepoResult<Vec<NodeId>> {
        Ok(self
            .guard
            .blocks
            .iter()
            .filter(|b| b.file_id == file && b.hash == hash)
            .map(|b| b.provider)
            .collect())
    }

    fn blocks_of_file(&self, file: FileId) -> RepoResult<Vec<BlockRecord>> {
        Ok(self
            .guard
            .blocks
            .iter()
            .filter(|b| b.file_id == file)
            .cloned()
            .collect())
    }

    fn record_removed_block(&mut self, removed: RemovedBlock) -> RepoResult<()> {
        self.guard.removed_blocks.push(removed);
        self.journal.push(Undo::RemovedBlockPushed);
        Ok(())
    }

    fn removed_blocks_of_file(&self, file: FileId) -> RepoResult<Vec<RemovedBlock>> {
        Ok(self
            .guard
            .removed_blocks
            .iter()
            .filter(|r| r.file_id == file)
            .cloned()
            .collect())
    }

    fn save_proofs(&mut self, file: FileId, proofs: Vec<ProofMetadata>) -> RepoResult<()> {
        for proof in proofs {
            let key = (file, proof.block_hash.clone());
            if self.guard.proofs.contains_key(&key) {
                return Err(RepoError::Conflict(format!(
                    "proof metadata for block {} exists",
                    proof.block_hash
                )));
            }
            self.guard.proofs.insert(key.clone(), proof);
            self.journal.push(Undo::ProofInserted(key));
        }
        Ok(())
    }

    fn purge_file_layout(&mut self, file: FileId) -> RepoResult<usize> {
        let hits: Vec<usize> = self
            .guard
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.file_id == file)
            .map(|(i, _)| i)
            .collect();
        for &at in hits.iter().rev() {
            let block = self.guard.blocks.remove(at);
            self.journal.push(Undo::BlockRemoved(at, block));
        }
        let keys: Vec<(FileId, String)> = self
            .guard
            .proofs
            .keys()
            .filter(|(f, _)| *f == file)
            .cloned()
            .collect();
        for key in keys {
            if let Some(proof) = self.guard.proofs.remove(&key) {
                self.journal.push(Undo::ProofRemoved(key, proof));
            }
        }
        Ok(hits.len())
    }

    fn find_proof(&self, file: FileId, block_hash: &str) -> RepoResult<Option<ProofMetadata>> {
        Ok(self
            .guard
            .proofs
            .get(&(file, block_hash.to_string()))
            .cloned())
    }

    // ── tasks and reports ────────────────────────────────────────────────────

    fn enqueue_task(&mut self, task: NewTask) -> RepoResult<TaskId> {
        self.guard.next_task_id += 1;
        let id = TaskId(self.guard.next_task_id);
        self.journal.push(Undo::TaskCreated(id));
        self.guard.tasks.insert(
            id,
            Task {
                id,
                kind: task.kind,
                file_id: task.file_id,
                block_hash: task.block_hash,
                block_size: task.block_size,
                target: task.target,
                sources: task.sources,
                created_at: task.created_at,
                expires_at: task.expires_at,
                finished: false,
                success: None,
                remark: None,
            },
        );
        Ok(id)
    }

    fn find_task(&self, id: TaskId) -> RepoResult<Option<Task>> {
        Ok(self.guard.tasks.get(&id).cloned())
    }

    fn pending_tasks_for(&self, provider: &NodeId, now: Timestamp) -> RepoResult<Vec<Task>> {
        Ok(self
            .guard
            .tasks
            .values()
            .filter(|t| t.target == *provider && t.is_pending(now))
            .cloned()
            .collect())
    }

    fn finish_task(
        &mut self,
        id: TaskId,
        provider: &NodeId,
        success: bool,
        remark: Option<String>,
    ) -> RepoResult<bool> {
        Ok(match self.guard.tasks.get_mut(&id) {
            Some(task) if task.target == *provider && !task.finished => {
                let prev = task.clone();
                task.finished = true;
                task.success = Some(success);
                task.remark = remark;
                self.journal.push(Undo::Task(prev));
                true
            }
            _ => false,
        })
    }

    fn save_miss_report(&mut self, report: MissReport) -> RepoResult<()> {
        self.guard.miss_reports.push(report);
        self.journal.push(Undo::MissReportPushed);
        Ok(())
    }

    fn miss_reports_for(&self, provider: &NodeId) -> RepoResult<Vec<MissReport>> {
        Ok(self
            .guard
            .miss_reports
            .iter()
            .filter(|r| r.provider == *provider)
            .cloned()
            .collect())
    }

    fn save_cheating_record(&mut self, record: CheatingRecord) -> RepoResult<()> {
        self.guard.cheating.push(record);
        self.journal.push(Undo::CheatingPushed);
        Ok(())
    }

    fn cheating_records_for(&self, subject: &NodeId) -> RepoResult<Vec<CheatingRecord>> {
        Ok(self
            .guard
            .cheating
            .iter()
            .filter(|r| r.subject == *subject)
            .cloned()
            .collect())
    }

    // ── availability ─────────────────────────────────────────────────────────

    fn save_sample(&mut self, sample: AvailabilitySample) -> RepoResult<()> {
        let provider = sample.provider;
        let series = self.guard.samples.entry(provider).or_default();
        let pos = series.partition_point(|s| s.timestamp <= sample.timestamp);
        series.insert(pos, sample);
        self.journal.push(Undo::SampleInserted(provider, pos));
        Ok(())
    }

    fn sample_times(
        &self,
        provider: &NodeId,
        start: Timestamp,
        end: Timestamp,
    ) -> RepoResult<Vec<Timestamp>> {
        Ok(self
            .guard
            .samples
            .get(provider)
            .map(|series| {
                let from = series.partition_point(|s| s.timestamp < start);
                series[from..]
                    .iter()
                    .map(|s| s.timestamp)
                    .take_while(|t| *t <= end)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn sampled_providers(&self, start: Timestamp, end: Timestamp) -> RepoResult<Vec<NodeId>> {
        Ok(self
            .guard
            .samples
            .iter()
            .filter(|(_, series)| {
                let from = series.partition_point(|s| s.timestamp < start);
                series.get(from).map_or(false, |s| s.timestamp <= end)
            })
            .map(|(id, _)| *id)
            .collect())
    }

    fn earliest_sample(&self) -> RepoResult<Option<Timestamp>> {
        Ok(self
            .guard
            .samples
            .values()
            .filter_map(|series| series.first().map(|s| s.timestamp))
            .min())
    }

    fn save_na_windows(
        &mut self,
        provider: &NodeId,
        day: Day,
        windows: Vec<NaWindow>,
    ) -> RepoResult<()> {
        let key = (*provider, day);
        let prev = self.guard.na_windows.insert(key, windows);
        self.journal.push(Undo::NaWindows(key, prev));
        Ok(())
    }

    fn na_windows(&self, provider: &NodeId, day: Day) -> RepoResult<Option<Vec<NaWindow>>> {
        Ok(self.guard.na_windows.get(&(*provider, day)).cloned())
    }

    fn watermark(&self) -> RepoResult<Option<Day>> {
        Ok(self.guard.watermark)
    }

    fn set_watermark(&mut self, day: Day) -> RepoResult<()> {
        let prev = self.guard.watermark.replace(day);
        self.journal.push(Undo::Watermark(prev));
        Ok(())
    }

    // ── lifecycle ────────────────────────────────────────────────────────────

    fn commit(mut self: Box<Self>) -> RepoResult<()> {
        self.journal.clear();
        Ok(())
    }
}
