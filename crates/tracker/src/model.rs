//! Persistent records of the tracker.
//!
//! These are plain values exchanged with a [`Repository`](crate::repository::Repository)
//! transaction. Ids are assigned by the repository on insert.

use serde::{Deserialize, Serialize};
use tracker_common::{Day, FileId, NodeId, OwnerId, TaskId, Timestamp};

// ════════════════════════════════════════════════════════════════════════════
// PROVIDER
// ════════════════════════════════════════════════════════════════════════════

/// One capacity grant declared by a provider. Grants accumulate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityGrant {
    pub bytes: u64,
    pub granted_at: Timestamp,
}

/// A storage-supplying node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: NodeId,
    pub addr: String,
    /// Hex-encoded public key the id was derived from.
    pub public_key: String,
    pub capacity: Vec<CapacityGrant>,
    /// Fraction of the last swept day the provider was reachable, 0.0–1.0.
    pub availability: f64,
    pub registered_at: Timestamp,
    pub last_contact: Timestamp,
    pub removed: bool,
}

impl Provider {
    /// Sum of every capacity grant.
    pub fn total_capacity(&self) -> u64 {
        self.capacity
            .iter()
            .fold(0u64, |acc, g| acc.saturating_add(g.bytes))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// FILE / BLOCK
// ════════════════════════════════════════════════════════════════════════════

/// A content-addressed file. `hash` is unique across the table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub id: FileId,
    pub hash: String,
    pub size: u64,
    pub ref_count: u32,
    pub done: bool,
    pub removed: bool,
    /// Bytes for files stored inline.
    pub data: Option<Vec<u8>>,
    /// Physical bytes reserved across providers.
    pub store_volume: u64,
    pub creator: NodeId,
    pub created_at: Timestamp,
}

/// Summary returned by a hash lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStatus {
    pub id: FileId,
    pub active: bool,
    pub removed: bool,
    pub done: bool,
    pub size: u64,
}

impl From<&File> for FileStatus {
    fn from(f: &File) -> Self {
        FileStatus {
            id: f.id,
            active: !f.removed && f.ref_count > 0,
            removed: f.removed,
            done: f.done,
            size: f.size,
        }
    }
}

/// Fields for a new File row.
#[derive(Clone, Debug)]
pub struct NewFile {
    pub hash: String,
    pub size: u64,
    pub data: Option<Vec<u8>>,
    pub done: bool,
    pub ref_count: u32,
    pub store_volume: u64,
    pub creator: NodeId,
    pub created_at: Timestamp,
}

/// One (block, provider) association: `provider` holds a copy of block `hash` of `file`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub file_id: FileId,
    pub hash: String,
    pub size: u64,
    pub provider: NodeId,
    pub partition: u32,
    pub index: u32,
    /// Parity shard of an erasure-coded partition.
    pub checksum: bool,
}

/// Audit row for an association removed after a loss report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedBlock {
    pub file_id: FileId,
    pub hash: String,
    pub provider: NodeId,
    pub removed_at: Timestamp,
}

/// Pre-committed values that allow possession challenges for one block.
/// Written once at finalization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofMetadata {
    pub block_hash: String,
    pub chunk_size: u32,
    pub challenge_params: Vec<u8>,
    pub public_key: Vec<u8>,
    pub random_seed: Vec<u8>,
    pub phi: Vec<Vec<u8>>,
}

// ════════════════════════════════════════════════════════════════════════════
// OWNERSHIP TREE
// ════════════════════════════════════════════════════════════════════════════

/// A node of a client's directory tree. `parent == None` is the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerEntry {
    pub id: OwnerId,
    pub client: NodeId,
    pub parent: Option<OwnerId>,
    pub name: String,
    pub is_folder: bool,
    /// Current content for file entries.
    pub hash: Option<String>,
    pub modified_at: Timestamp,
}

#[derive(Clone, Debug)]
pub struct NewOwnerEntry {
    pub client: NodeId,
    pub parent: Option<OwnerId>,
    pub name: String,
    pub is_folder: bool,
    pub hash: Option<String>,
    pub modified_at: Timestamp,
}

/// Append-only link from an entry to content it has pointed at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub owner: OwnerId,
    pub client: NodeId,
    pub hash: String,
    pub created_at: Timestamp,
}

// ════════════════════════════════════════════════════════════════════════════
// TASKS / REPORTS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Replicate,
    Prove,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub file_id: FileId,
    pub block_hash: String,
    pub block_size: u64,
    /// Provider expected to perform the task.
    pub target: NodeId,
    /// Providers the target can copy from.
    pub sources: Vec<NodeId>,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub finished: bool,
    pub success: Option<bool>,
    pub remark: Option<String>,
}

impl Task {
    pub fn is_pending(&self, now: Timestamp) -> bool {
        !self.finished && now < self.expires_at
    }
}

#[derive(Clone, Debug)]
pub struct NewTask {
    pub kind: TaskKind,
    pub file_id: FileId,
    pub block_hash: String,
    pub block_size: u64,
    pub target: NodeId,
    pub sources: Vec<NodeId>,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

/// One block a provider says it no longer holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMiss {
    pub hash: String,
    pub size: u64,
}

/// Raw loss report, kept for audit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissReport {
    pub provider: NodeId,
    pub blocks: Vec<BlockMiss>,
    pub reported_at: Timestamp,
}

/// Evidence that a provider or client submitted a bogus work receipt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheatingRecord {
    pub subject: NodeId,
    pub evidence: String,
    pub recorded_at: Timestamp,
}

// ════════════════════════════════════════════════════════════════════════════
// AVAILABILITY
// ════════════════════════════════════════════════════════════════════════════

/// One liveness/capacity observation of a provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AvailabilitySample {
    pub provider: NodeId,
    pub timestamp: Timestamp,
    pub latency_ms: u32,
    pub free_capacity: u64,
    pub max_file_size: u64,
}

/// Presumed downtime `[start, end]` of a provider within one day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl NaWindow {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Windows stored for one (provider, day).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindows {
    pub provider: NodeId,
    pub day: Day,
    pub windows: Vec<NaWindow>,
}
