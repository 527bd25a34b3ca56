//! # Placement Decider
//!
//! Negotiates every upload. A request names a client directory, a file name
//! and the content (hash, size, optional inline bytes); the decider answers
//! with exactly one [`PlacementOutcome`].
//!
//! ## Decision Flow
//!
//! ```text
//! resolve path ──✗──▶ Rejected(PathNotFound)
//!      │
//! name collision ──▶ NameConflict (interactive) | Rejected(NameExists)
//!      │
//! hash lookup ──size ≠──▶ Rejected(SizeMismatch)
//!      │   └──done──▶ Deduplicated (ref_count + 1, ownership attached)
//!      │
//! size ≤ inline threshold ──▶ StoredInline | Rejected(InlineDataRequired)
//!      │
//! provider pool P ──0──▶ Rejected(NoProviders)
//!      ├── P ≥ min_erasure_providers ──▶ StoreByPieces { P - P/3, P/3 }
//!      └── otherwise ──────────────────▶ StoreByReplicas { providers }
//! ```
//!
//! Large files leave a pending row behind (`done = false`). The client then
//! transfers blocks to providers out of band and calls
//! [`PlacementDecider::finalize_placement`] with the realized layout.
//!
//! [`PlacementDecider::release_file`] drops one reference. The last release
//! marks the row removed and purges its blocks and proofs. A later upload of
//! the same content revives the row.
//!
//! ## Atomicity
//!
//! Each call runs in one repository transaction. Rejections drop the
//! transaction, so a rejected request never leaves writes behind.
//!
//! ## Outcome Codes
//!
//! | code | meaning |
//! |------|---------|
//! | 1 | deduplicated against an existing file |
//! | 2 | stored inline |
//! | 3 | store by erasure-coded pieces |
//! | 4 | store by full replicas |
//! | 5 | name conflict, caller must confirm |
//! | 6 | finalized |
//! | 7 | ownership attached to an already finalized file |
//! | 8 | reference released, file still in use |
//! | 9 | last reference released, file removed |
//! | 101.. | rejected, see [`RejectReason::code`] |

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracker_common::cid::{is_content_hash, matches_content, short_hash};
use tracker_common::{unix_now, FileId, NodeId, OwnerId, Timestamp, TrackerConfig};

use crate::chooser::ProviderChooser;
use crate::context::RequestContext;
use crate::error::Result;
use crate::model::{BlockRecord, File, FileVersion, NewFile, NewOwnerEntry, ProofMetadata};
use crate::repository::{RepoResult, Repository, Transaction};

// ════════════════════════════════════════════════════════════════════════════
// SETTINGS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementSettings {
    pub inline_threshold: u64,
    pub replication_factor: u64,
    pub replica_count: usize,
    pub min_erasure_providers: usize,
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self {
            inline_threshold: 8192,
            replication_factor: 3,
            replica_count: 3,
            min_erasure_providers: 6,
        }
    }
}

impl PlacementSettings {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            inline_threshold: config.inline_threshold,
            replication_factor: config.replication_factor,
            replica_count: config.replica_count,
            min_erasure_providers: config.min_erasure_providers,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// REQUESTS / OUTCOMES
// ════════════════════════════════════════════════════════════════════════════

/// Upload negotiation input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub client: NodeId,
    /// Slash-separated directory path; empty for the root.
    pub path: String,
    pub name: String,
    /// Lowercase hex SHA-256 of the content.
    pub hash: String,
    pub size: u64,
    pub modified_at: Timestamp,
    #[serde(default)]
    pub data: Option<Vec<u8>>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub new_version: bool,
}

/// Why a request was refused. Codes are stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// 101: a path segment does not exist or names a file.
    PathNotFound,
    /// 102: the name is taken and the request may not overwrite it.
    NameExists,
    /// 103: empty name or name containing `/`.
    InvalidName,
    /// 104: hash is not 64 lowercase hex characters.
    InvalidHash,
    /// 105: the hash is known with a different size.
    SizeMismatch,
    /// 106: small file without inline bytes of the declared length.
    InlineDataRequired,
    /// 107: inline bytes do not hash to the declared hash.
    InlineHashMismatch,
    /// 108: no eligible provider to place the file on.
    NoProviders,
    /// 109: finalize for a file id that does not exist.
    FileNotFound,
    /// 110: finalize or release of a removed file.
    FileRemoved,
    /// 111: a block in the layout lists no provider.
    BlockWithoutProvider,
    /// 112: a block in the layout lists an unregistered provider.
    UnknownProvider,
    /// 113: proof metadata is missing, duplicated or names an unknown block.
    ProofMismatch,
    /// 114: finalize with an empty layout.
    EmptyLayout,
}

impl RejectReason {
    pub fn code(&self) -> u16 {
        match self {
            RejectReason::PathNotFound => 101,
            RejectReason::NameExists => 102,
            RejectReason::InvalidName => 103,
            RejectReason::InvalidHash => 104,
            RejectReason::SizeMismatch => 105,
            RejectReason::InlineDataRequired => 106,
            RejectReason::InlineHashMismatch => 107,
            RejectReason::NoProviders => 108,
            RejectReason::FileNotFound => 109,
            RejectReason::FileRemoved => 110,
            RejectReason::BlockWithoutProvider => 111,
            RejectReason::UnknownProvider => 112,
            RejectReason::ProofMismatch => 113,
            RejectReason::EmptyLayout => 114,
        }
    }
}

/// Provider handed to a client for replica placement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRef {
    pub id: NodeId,
    pub addr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PlacementOutcome {
    Deduplicated {
        file_id: FileId,
        owner_id: OwnerId,
        ref_count: u32,
    },
    StoredInline {
        file_id: FileId,
        owner_id: OwnerId,
    },
    StoreByPieces {
        file_id: FileId,
        data_piece_count: usize,
        verify_piece_count: usize,
    },
    StoreByReplicas {
        file_id: FileId,
        replica_count: usize,
        providers: Vec<ProviderRef>,
    },
    NameConflict {
        existing: OwnerId,
        is_folder: bool,
    },
    Rejected {
        reason: RejectReason,
    },
}

impl PlacementOutcome {
    pub fn code(&self) -> u16 {
        match self {
            PlacementOutcome::Deduplicated { .. } => 1,
            PlacementOutcome::StoredInline { .. } => 2,
            PlacementOutcome::StoreByPieces { .. } => 3,
            PlacementOutcome::StoreByReplicas { .. } => 4,
            PlacementOutcome::NameConflict { .. } => 5,
            PlacementOutcome::Rejected { reason } => reason.code(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, PlacementOutcome::Rejected { .. })
    }

    fn rejected(reason: RejectReason) -> Self {
        PlacementOutcome::Rejected { reason }
    }
}

/// One stored block as realized by the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockPlacement {
    pub hash: String,
    pub size: u64,
    pub providers: Vec<NodeId>,
    #[serde(default)]
    pub checksum: bool,
}

/// Blocks of one erasure-coding partition (or one replica group).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Partition {
    pub blocks: Vec<BlockPlacement>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub file_id: FileId,
    pub client: NodeId,
    pub path: String,
    pub name: String,
    pub modified_at: Timestamp,
    #[serde(default)]
    pub new_version: bool,
    pub partitions: Vec<Partition>,
    pub proofs: Vec<ProofMetadata>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    Finalized {
        file_id: FileId,
        owner_id: OwnerId,
        store_volume: u64,
    },
    Attached {
        file_id: FileId,
        owner_id: OwnerId,
    },
    Rejected {
        reason: RejectReason,
    },
}

impl FinalizeOutcome {
    pub fn code(&self) -> u16 {
        match self {
            FinalizeOutcome::Finalized { .. } => 6,
            FinalizeOutcome::Attached { .. } => 7,
            FinalizeOutcome::Rejected { reason } => reason.code(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released { file_id: FileId, ref_count: u32 },
    Removed { file_id: FileId, purged_blocks: usize },
    Rejected { reason: RejectReason },
}

impl ReleaseOutcome {
    pub fn code(&self) -> u16 {
        match self {
            ReleaseOutcome::Released { .. } => 8,
            ReleaseOutcome::Removed { .. } => 9,
            ReleaseOutcome::Rejected { reason } => reason.code(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FolderOutcome {
    Created { owner_id: OwnerId },
    Rejected { reason: RejectReason },
}

// Where new content gets linked into the client's tree.
enum OwnerTarget {
    Fresh { parent: Option<OwnerId>, name: String },
    Version(OwnerId),
}

// ════════════════════════════════════════════════════════════════════════════
// DECIDER
// ════════════════════════════════════════════════════════════════════════════

pub struct PlacementDecider {
    repo: Arc<dyn Repository>,
    chooser: Arc<ProviderChooser>,
    settings: PlacementSettings,
}

impl PlacementDecider {
    pub fn new(
        repo: Arc<dyn Repository>,
        chooser: Arc<ProviderChooser>,
        settings: PlacementSettings,
    ) -> Self {
        Self {
            repo,
            chooser,
            settings,
        }
    }

    pub fn settings(&self) -> &PlacementSettings {
        &self.settings
    }

    /// Decides how the content of `req` gets stored.
    pub fn decide_placement(
        &self,
        ctx: &RequestContext,
        req: &PlacementRequest,
    ) -> Result<PlacementOutcome> {
        if !is_valid_name(&req.name) {
            return Ok(PlacementOutcome::rejected(RejectReason::InvalidName));
        }
        if !is_content_hash(&req.hash) {
            return Ok(PlacementOutcome::rejected(RejectReason::InvalidHash));
        }
        // The snapshot load opens its own transaction.
        self.chooser.ensure_loaded()?;

        let mut tx = self.repo.begin()?;
        let now = unix_now();

        let segments = split_path(&req.path);
        let parent = match tx.resolve_path(&req.client, &segments)? {
            Some(dir) => dir,
            None => return Ok(PlacementOutcome::rejected(RejectReason::PathNotFound)),
        };

        let target = match tx.find_owner_entry(&req.client, parent, &req.name)? {
            None => OwnerTarget::Fresh {
                parent,
                name: req.name.clone(),
            },
            Some(entry) if req.new_version && !entry.is_folder => OwnerTarget::Version(entry.id),
            Some(entry) => {
                return Ok(if req.interactive {
                    PlacementOutcome::NameConflict {
                        existing: entry.id,
                        is_folder: entry.is_folder,
                    }
                } else {
                    PlacementOutcome::rejected(RejectReason::NameExists)
                });
            }
        };

        let existing = match tx.check_file(&req.hash)? {
            Some(status) => {
                if status.size != req.size {
                    return Ok(PlacementOutcome::rejected(RejectReason::SizeMismatch));
                }
                tx.find_file(status.id)?
            }
            None => None,
        };

        if let Some(file) = &existing {
            if file.done && !file.removed {
                let ref_count = tx.increment_ref_count(&file.hash)?;
                let owner_id =
                    attach(&mut *tx, &req.client, target, &file.hash, req.modified_at, now)?;
                ctx.check()?;
                tx.commit()?;
                info!(
                    "dedup {} for client {} (refs {})",
                    short_hash(&file.hash),
                    req.client.short(),
                    ref_count
                );
                return Ok(PlacementOutcome::Deduplicated {
                    file_id: file.id,
                    owner_id,
                    ref_count,
                });
            }
        }

        if req.size <= self.settings.inline_threshold {
            let data = match &req.data {
                Some(d) if d.len() as u64 == req.size => d.clone(),
                _ => return Ok(PlacementOutcome::rejected(RejectReason::InlineDataRequired)),
            };
            if !matches_content(&req.hash, &data) {
                return Ok(PlacementOutcome::rejected(RejectReason::InlineHashMismatch));
            }
            let file_id = match existing {
                Some(mut file) => {
                    file.removed = false;
                    file.done = true;
                    file.data = Some(data);
                    file.ref_count = 1;
                    file.store_volume = req.size;
                    tx.update_file(&file)?;
                    file.id
                }
                None => tx.create_file(NewFile {
                    hash: req.hash.clone(),
                    size: req.size,
                    data: Some(data),
                    done: true,
                    ref_count: 1,
                    store_volume: req.size,
                    creator: req.client,
                    created_at: now,
                })?,
            };
            let owner_id = attach(&mut *tx, &req.client, target, &req.hash, req.modified_at, now)?;
            ctx.check()?;
            tx.commit()?;
            debug!("stored {} inline ({} bytes)", short_hash(&req.hash), req.size);
            return Ok(PlacementOutcome::StoredInline { file_id, owner_id });
        }

        let pool = self.chooser.count()?;
        if pool == 0 {
            return Ok(PlacementOutcome::rejected(RejectReason::NoProviders));
        }

        let store_volume = req.size.saturating_mul(self.settings.replication_factor);
        let file_id = match existing {
            Some(mut file) => {
                // a pending upload in flight, or a removed file being revived
                if file.removed {
                    file.removed = false;
                    file.done = false;
                    file.ref_count = 0;
                }
                file.data = None;
                file.store_volume = store_volume;
                tx.update_file(&file)?;
                file.id
            }
            None => tx.create_file(NewFile {
                hash: req.hash.clone(),
                size: req.size,
                data: None,
                done: false,
                ref_count: 0,
                store_volume,
                creator: req.client,
                created_at: now,
            })?,
        };

        let outcome = if pool >= self.settings.min_erasure_providers {
            let verify_piece_count = pool / 3;
            PlacementOutcome::StoreByPieces {
                file_id,
                data_piece_count: pool - verify_piece_count,
                verify_piece_count,
            }
        } else {
            let providers: Vec<ProviderRef> = self
                .chooser
                .choose(self.settings.replica_count.min(pool))?
                .into_iter()
                .map(|p| ProviderRef {
                    id: p.id,
                    addr: p.addr,
                })
                .collect();
            PlacementOutcome::StoreByReplicas {
                file_id,
                replica_count: providers.len(),
                providers,
            }
        };

        ctx.check()?;
        tx.commit()?;
        info!(
            "pending file {} ({} bytes), pool {}, code {}",
            short_hash(&req.hash),
            req.size,
            pool,
            outcome.code()
        );
        Ok(outcome)
    }

    /// Records the realized block layout of a pending file and links it
    /// into the client's tree.
    pub fn finalize_placement(
        &self,
        ctx: &RequestContext,
        req: &FinalizeRequest,
    ) -> Result<FinalizeOutcome> {
        if !is_valid_name(&req.name) {
            return Ok(FinalizeOutcome::Rejected {
                reason: RejectReason::InvalidName,
            });
        }

        let mut tx = self.repo.begin()?;
        let now = unix_now();

        let mut file = match tx.find_file(req.file_id)? {
            Some(f) if f.removed => return Ok(finalize_rejected(RejectReason::FileRemoved)),
            Some(f) => f,
            None => return Ok(finalize_rejected(RejectReason::FileNotFound)),
        };

        let resolved = resolve_target(&*tx, &req.client, &req.path, &req.name, req.new_version)?;
        let target = match resolved {
            Ok(t) => t,
            Err(reason) => return Ok(finalize_rejected(reason)),
        };

        if file.done {
            tx.increment_ref_count(&file.hash)?;
            let owner_id = attach(&mut *tx, &req.client, target, &file.hash, req.modified_at, now)?;
            ctx.check()?;
            tx.commit()?;
            return Ok(FinalizeOutcome::Attached {
                file_id: file.id,
                owner_id,
            });
        }

        let (records, store_volume) = match self.validate_layout(&*tx, &file, req)? {
            Ok(v) => v,
            Err(reason) => return Ok(finalize_rejected(reason)),
        };
        let block_count = records.len();

        tx.save_blocks(file.id, records)?;
        tx.save_proofs(file.id, req.proofs.clone())?;

        file.done = true;
        file.store_volume = store_volume;
        tx.update_file(&file)?;
        tx.increment_ref_count(&file.hash)?;
        let owner_id = attach(&mut *tx, &req.client, target, &file.hash, req.modified_at, now)?;

        ctx.check()?;
        tx.commit()?;
        info!(
            "finalized file {} with {} block copies, volume {}",
            short_hash(&file.hash),
            block_count,
            store_volume
        );
        Ok(FinalizeOutcome::Finalized {
            file_id: file.id,
            owner_id,
            store_volume,
        })
    }

    fn validate_layout(
        &self,
        tx: &dyn Transaction,
        file: &File,
        req: &FinalizeRequest,
    ) -> RepoResult<std::result::Result<(Vec<BlockRecord>, u64), RejectReason>> {
        if req.partitions.iter().all(|p| p.blocks.is_empty()) {
            return Ok(Err(RejectReason::EmptyLayout));
        }

        let mut known: HashMap<NodeId, bool> = HashMap::new();
        let mut block_hashes: HashSet<&str> = HashSet::new();
        let mut records = Vec::new();
        let mut store_volume = 0u64;

        for (p_idx, partition) in req.partitions.iter().enumerate() {
            for (b_idx, block) in partition.blocks.iter().enumerate() {
                if block.providers.is_empty() {
                    return Ok(Err(RejectReason::BlockWithoutProvider));
                }
                for provider in &block.providers {
                    let ok = match known.get(provider) {
                        Some(&ok) => ok,
                        None => {
                            let ok = matches!(tx.find_provider(provider)?, Some(p) if !p.removed);
                            known.insert(*provider, ok);
                            ok
                        }
                    };
                    if !ok {
                        return Ok(Err(RejectReason::UnknownProvider));
                    }
                    records.push(BlockRecord {
                        file_id: file.id,
                        hash: block.hash.clone(),
                        size: block.size,
                        provider: *provider,
                        partition: p_idx as u32,
                        index: b_idx as u32,
                        checksum: block.checksum,
                    });
                }
                block_hashes.insert(block.hash.as_str());
                store_volume = store_volume
                    .saturating_add(block.size.saturating_mul(block.providers.len() as u64));
            }
        }

        let mut proved: HashSet<&str> = HashSet::new();
        for proof in &req.proofs {
            if !block_hashes.contains(proof.block_hash.as_str())
                || !proved.insert(proof.block_hash.as_str())
            {
                return Ok(Err(RejectReason::ProofMismatch));
            }
        }
        if proved.len() != block_hashes.len() {
            return Ok(Err(RejectReason::ProofMismatch));
        }

        Ok(Ok((records, store_volume)))
    }

    /// Drops one reference to a file. Releasing the last reference, or
    /// abandoning a pending upload, removes the row and purges its layout.
    pub fn release_file(&self, ctx: &RequestContext, file_id: FileId) -> Result<ReleaseOutcome> {
        let mut tx = self.repo.begin()?;
        let mut file = match tx.find_file(file_id)? {
            Some(f) if f.removed => {
                return Ok(ReleaseOutcome::Rejected {
                    reason: RejectReason::FileRemoved,
                })
            }
            Some(f) => f,
            None => {
                return Ok(ReleaseOutcome::Rejected {
                    reason: RejectReason::FileNotFound,
                })
            }
        };

        if file.done && file.ref_count > 1 {
            file.ref_count -= 1;
            tx.update_file(&file)?;
            ctx.check()?;
            tx.commit()?;
            return Ok(ReleaseOutcome::Released {
                file_id,
                ref_count: file.ref_count,
            });
        }

        let purged_blocks = tx.purge_file_layout(file_id)?;
        file.removed = true;
        file.done = false;
        file.ref_count = 0;
        file.data = None;
        file.store_volume = 0;
        tx.update_file(&file)?;
        ctx.check()?;
        tx.commit()?;
        info!(
            "removed file {} ({} block copies purged)",
            short_hash(&file.hash),
            purged_blocks
        );
        Ok(ReleaseOutcome::Removed {
            file_id,
            purged_blocks,
        })
    }

    /// Creates a folder entry under `path`.
    pub fn make_folder(
        &self,
        ctx: &RequestContext,
        client: &NodeId,
        path: &str,
        name: &str,
    ) -> Result<FolderOutcome> {
        if !is_valid_name(name) {
            return Ok(FolderOutcome::Rejected {
                reason: RejectReason::InvalidName,
            });
        }
        let mut tx = self.repo.begin()?;
        let parent = match tx.resolve_path(client, &split_path(path))? {
            Some(dir) => dir,
            None => {
                return Ok(FolderOutcome::Rejected {
                    reason: RejectReason::PathNotFound,
                })
            }
        };
        if tx.find_owner_entry(client, parent, name)?.is_some() {
            return Ok(FolderOutcome::Rejected {
                reason: RejectReason::NameExists,
            });
        }
        let owner_id = tx.create_owner_entry(NewOwnerEntry {
            client: *client,
            parent,
            name: name.to_string(),
            is_folder: true,
            hash: None,
            modified_at: unix_now(),
        })?;
        ctx.check()?;
        tx.commit()?;
        Ok(FolderOutcome::Created { owner_id })
    }

    /// Content history of one file entry, oldest first.
    pub fn list_versions(&self, owner: OwnerId) -> Result<Vec<FileVersion>> {
        let tx = self.repo.begin()?;
        Ok(tx.list_versions(owner)?)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HELPERS
// ════════════════════════════════════════════════════════════════════════════

fn finalize_rejected(reason: RejectReason) -> FinalizeOutcome {
    FinalizeOutcome::Rejected { reason }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/')
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn resolve_target(
    tx: &dyn Transaction,
    client: &NodeId,
    path: &str,
    name: &str,
    new_version: bool,
) -> RepoResult<std::result::Result<OwnerTarget, RejectReason>> {
    let parent = match tx.resolve_path(client, &split_path(path))? {
        Some(dir) => dir,
        None => return Ok(Err(RejectReason::PathNotFound)),
    };
    Ok(match tx.find_owner_entry(client, parent, name)? {
        None => Ok(OwnerTarget::Fresh {
            parent,
            name: name.to_string(),
        }),
        Some(entry) if new_version && !entry.is_folder => Ok(OwnerTarget::Version(entry.id)),
        Some(_) => Err(RejectReason::NameExists),
    })
}

// Links `hash` into the tree and appends a version row.
fn attach(
    tx: &mut dyn Transaction,
    client: &NodeId,
    target: OwnerTarget,
    hash: &str,
    modified_at: Timestamp,
    now: Timestamp,
) -> RepoResult<OwnerId> {
    let owner = match target {
        OwnerTarget::Fresh { parent, name } => tx.create_owner_entry(NewOwnerEntry {
            client: *client,
            parent,
            name,
            is_folder: false,
            hash: Some(hash.to_string()),
            modified_at,
        })?,
        OwnerTarget::Version(id) => {
            tx.set_owner_content(id, hash, modified_at)?;
            id
        }
    };
    tx.create_version(FileVersion {
        owner,
        client: *client,
        hash: hash.to_string(),
        created_at: now,
    })?;
    Ok(owner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chooser::EligibilityPolicy;
    use crate::model::{CapacityGrant, Provider};
    use crate::repository::MemoryRepository;
    use std::time::Duration;
    use tracker_common::cid::sha256_hex;

    fn provider(n: u32) -> Provider {
        let pk = format!("pk-{}", n);
        Provider {
            id: NodeId::from_public_key(pk.as_bytes()),
            addr: format!("10.1.0.{}:7000", n),
            public_key: pk,
            capacity: vec![CapacityGrant {
                bytes: 1 << 30,
                granted_at: 0,
            }],
            availability: 1.0,
            registered_at: 0,
            last_contact: 0,
            removed: false,
        }
    }

    fn setup(providers: u32) -> (Arc<MemoryRepository>, PlacementDecider) {
        let repo = Arc::new(MemoryRepository::new());
        {
            let mut tx = repo.begin().unwrap();
            for i in 0..providers {
                tx.upsert_provider(provider(i)).unwrap();
            }
            tx.commit().unwrap();
        }
        let chooser = Arc::new(ProviderChooser::new(
            repo.clone(),
            EligibilityPolicy::default(),
            Duration::from_secs(60),
        ));
        let decider = PlacementDecider::new(repo.clone(), chooser, PlacementSettings::default());
        (repo, decider)
    }

    fn client() -> NodeId {
        NodeId::from_public_key(b"client")
    }

    fn large_request(name: &str, hash: &str, size: u64) -> PlacementRequest {
        PlacementRequest {
            client: client(),
            path: String::new(),
            name: name.to_string(),
            hash: hash.to_string(),
            size,
            modified_at: 100,
            data: None,
            interactive: false,
            new_version: false,
        }
    }

    fn inline_request(name: &str, data: &[u8]) -> PlacementRequest {
        PlacementRequest {
            data: Some(data.to_vec()),
            ..large_request(name, &sha256_hex(data), data.len() as u64)
        }
    }

    fn finalize_for(file_id: FileId, name: &str, providers: &[NodeId]) -> FinalizeRequest {
        FinalizeRequest {
            file_id,
            client: client(),
            path: String::new(),
            name: name.to_string(),
            modified_at: 200,
            new_version: false,
            partitions: vec![Partition {
                blocks: vec![
                    BlockPlacement {
                        hash: "b1".into(),
                        size: 6000,
                        providers: providers.to_vec(),
                        checksum: false,
                    },
                    BlockPlacement {
                        hash: "b2".into(),
                        size: 4000,
                        providers: providers[..1].to_vec(),
                        checksum: true,
                    },
                ],
            }],
            proofs: vec![proof("b1"), proof("b2")],
        }
    }

    fn proof(block: &str) -> ProofMetadata {
        ProofMetadata {
            block_hash: block.to_string(),
            chunk_size: 1024,
            challenge_params: vec![1],
            public_key: vec![2],
            random_seed: vec![3],
            phi: vec![vec![4], vec![5]],
        }
    }

    const BIG_HASH: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn test_twelve_providers_split_eight_four() {
        let (repo, decider) = setup(12);
        let ctx = RequestContext::background();
        let out = decider
            .decide_placement(&ctx, &large_request("big.bin", BIG_HASH, 10_000))
            .unwrap();
        match out {
            PlacementOutcome::StoreByPieces {
                data_piece_count,
                verify_piece_count,
                file_id,
            } => {
                assert_eq!(data_piece_count, 8);
                assert_eq!(verify_piece_count, 4);
                let tx = repo.begin().unwrap();
                let file = tx.find_file(file_id).unwrap().unwrap();
                assert!(!file.done);
                assert_eq!(file.store_volume, 30_000);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_small_pool_falls_back_to_replicas() {
        let (_, decider) = setup(2);
        let out = decider
            .decide_placement(&RequestContext::background(), &large_request("f", BIG_HASH, 10_000))
            .unwrap();
        match out {
            PlacementOutcome::StoreByReplicas {
                replica_count,
                providers,
                ..
            } => {
                assert_eq!(replica_count, 2);
                assert_eq!(providers.len(), 2);
                assert_ne!(providers[0].id, providers[1].id);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_no_providers_rejects_without_writes() {
        let (repo, decider) = setup(0);
        let out = decider
            .decide_placement(&RequestContext::background(), &large_request("f", BIG_HASH, 10_000))
            .unwrap();
        assert_eq!(out.code(), RejectReason::NoProviders.code());
        assert!(repo.begin().unwrap().check_file(BIG_HASH).unwrap().is_none());
    }

    #[test]
    fn test_inline_boundary() {
        let (_, decider) = setup(0);
        let ctx = RequestContext::background();
        let data = vec![7u8; 8192];
        let out = decider.decide_placement(&ctx, &inline_request("tiny", &data)).unwrap();
        assert!(matches!(out, PlacementOutcome::StoredInline { .. }));

        let mut missing = inline_request("tiny2", &[9u8; 100]);
        missing.data = None;
        assert_eq!(
            decider.decide_placement(&ctx, &missing).unwrap(),
            PlacementOutcome::Rejected {
                reason: RejectReason::InlineDataRequired
            }
        );

        let mut short = inline_request("tiny3", &[9u8; 100]);
        short.size = 101;
        assert_eq!(
            decider.decide_placement(&ctx, &short).unwrap(),
            PlacementOutcome::Rejected {
                reason: RejectReason::InlineDataRequired
            }
        );
    }

    #[test]
    fn test_inline_hash_must_match_data() {
        let (_, decider) = setup(0);
        let mut req = inline_request("x", b"hello");
        req.hash = sha256_hex(b"world");
        let out = decider.decide_placement(&RequestContext::background(), &req).unwrap();
        assert_eq!(out.code(), 107);
    }

    #[test]
    fn test_dedup_increments_ref_count() {
        let (repo, decider) = setup(0);
        let ctx = RequestContext::background();
        let data = b"shared content";
        decider.decide_placement(&ctx, &inline_request("a", data)).unwrap();

        let mut second = inline_request("b", data);
        second.data = None;
        let out = decider.decide_placement(&ctx, &second).unwrap();
        assert!(matches!(out, PlacementOutcome::Deduplicated { ref_count: 2, .. }));

        let out = decider.decide_placement(&ctx, &inline_request("c", data)).unwrap();
        assert!(matches!(out, PlacementOutcome::Deduplicated { ref_count: 3, .. }));

        let tx = repo.begin().unwrap();
        let status = tx.check_file(&sha256_hex(data)).unwrap().unwrap();
        assert_eq!(tx.find_file(status.id).unwrap().unwrap().ref_count, 3);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let (_, decider) = setup(0);
        let ctx = RequestContext::background();
        decider.decide_placement(&ctx, &inline_request("a", b"abc")).unwrap();
        let mut req = large_request("b", &sha256_hex(b"abc"), 4);
        req.data = Some(b"abcd".to_vec());
        assert_eq!(
            decider.decide_placement(&ctx, &req).unwrap().code(),
            RejectReason::SizeMismatch.code()
        );
    }

    #[test]
    fn test_name_collision_modes() {
        let (_, decider) = setup(0);
        let ctx = RequestContext::background();
        let first = decider.decide_placement(&ctx, &inline_request("doc", b"v1")).unwrap();
        let owner = match first {
            PlacementOutcome::StoredInline { owner_id, .. } => owner_id,
            other => panic!("unexpected outcome {:?}", other),
        };

        let out = decider.decide_placement(&ctx, &inline_request("doc", b"v2")).unwrap();
        assert_eq!(out.code(), RejectReason::NameExists.code());

        let mut interactive = inline_request("doc", b"v2");
        interactive.interactive = true;
        assert_eq!(
            decider.decide_placement(&ctx, &interactive).unwrap(),
            PlacementOutcome::NameConflict {
                existing: owner,
                is_folder: false
            }
        );

        let mut version = inline_request("doc", b"v2");
        version.new_version = true;
        let out = decider.decide_placement(&ctx, &version).unwrap();
        assert!(matches!(
            out,
            PlacementOutcome::StoredInline { owner_id, .. } if owner_id == owner
        ));

        let history = decider.list_versions(owner).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].hash, sha256_hex(b"v2"));
    }

    #[test]
    fn test_path_resolution() {
        let (_, decider) = setup(0);
        let ctx = RequestContext::background();
        let mut req = inline_request("f", b"x");
        req.path = "docs/2024".into();
        assert_eq!(
            decider.decide_placement(&ctx, &req).unwrap().code(),
            RejectReason::PathNotFound.code()
        );

        assert!(matches!(
            decider.make_folder(&ctx, &client(), "", "docs").unwrap(),
            FolderOutcome::Created { .. }
        ));
        assert!(matches!(
            decider.make_folder(&ctx, &client(), "/docs/", "2024").unwrap(),
            FolderOutcome::Created { .. }
        ));
        assert!(matches!(
            decider.decide_placement(&ctx, &req).unwrap(),
            PlacementOutcome::StoredInline { .. }
        ));

        // a folder is never overwritten by a new version
        let mut clash = inline_request("docs", b"y");
        clash.new_version = true;
        assert_eq!(
            decider.decide_placement(&ctx, &clash).unwrap().code(),
            RejectReason::NameExists.code()
        );
    }

    #[test]
    fn test_invalid_name_and_hash() {
        let (_, decider) = setup(0);
        let ctx = RequestContext::background();
        assert_eq!(
            decider.decide_placement(&ctx, &inline_request("a/b", b"x")).unwrap().code(),
            RejectReason::InvalidName.code()
        );
        let req = large_request("a", "not-a-hash", 10);
        assert_eq!(
            decider.decide_placement(&ctx, &req).unwrap().code(),
            RejectReason::InvalidHash.code()
        );
    }

    #[test]
    fn test_finalize_records_layout() {
        let (repo, decider) = setup(3);
        let ctx = RequestContext::background();
        let file_id = match decider
            .decide_placement(&ctx, &large_request("big", BIG_HASH, 10_000))
            .unwrap()
        {
            PlacementOutcome::StoreByReplicas { file_id, .. } => file_id,
            other => panic!("unexpected outcome {:?}", other),
        };
        let ids: Vec<NodeId> = (0..2).map(|i| provider(i).id).collect();
        let out = decider
            .finalize_placement(&ctx, &finalize_for(file_id, "big", &ids))
            .unwrap();
        assert_eq!(out.code(), 6);
        match out {
            FinalizeOutcome::Finalized { store_volume, .. } => assert_eq!(store_volume, 16_000),
            other => panic!("unexpected outcome {:?}", other),
        }

        let tx = repo.begin().unwrap();
        let file = tx.find_file(file_id).unwrap().unwrap();
        assert!(file.done);
        assert_eq!(file.ref_count, 1);
        assert_eq!(tx.blocks_of_file(file_id).unwrap().len(), 3);
        assert!(tx.find_proof(file_id, "b2").unwrap().is_some());
        drop(tx);

        // the same content can now be deduplicated
        let out = decider
            .decide_placement(&ctx, &large_request("copy", BIG_HASH, 10_000))
            .unwrap();
        assert!(matches!(out, PlacementOutcome::Deduplicated { ref_count: 2, .. }));

        let again = decider
            .finalize_placement(&ctx, &finalize_for(file_id, "third", &ids))
            .unwrap();
        assert!(matches!(again, FinalizeOutcome::Attached { .. }));
    }

    #[test]
    fn test_release_removes_then_upload_revives() {
        let (repo, decider) = setup(3);
        let ctx = RequestContext::background();
        let ids: Vec<NodeId> = (0..2).map(|i| provider(i).id).collect();
        let file_id = match decider
            .decide_placement(&ctx, &large_request("big", BIG_HASH, 10_000))
            .unwrap()
        {
            PlacementOutcome::StoreByReplicas { file_id, .. } => file_id,
            other => panic!("unexpected outcome {:?}", other),
        };
        decider
            .finalize_placement(&ctx, &finalize_for(file_id, "big", &ids))
            .unwrap();
        decider
            .decide_placement(&ctx, &large_request("copy", BIG_HASH, 10_000))
            .unwrap();

        assert_eq!(
            decider.release_file(&ctx, file_id).unwrap(),
            ReleaseOutcome::Released {
                file_id,
                ref_count: 1
            }
        );
        let out = decider.release_file(&ctx, file_id).unwrap();
        assert_eq!(out.code(), 9);
        assert_eq!(
            out,
            ReleaseOutcome::Removed {
                file_id,
                purged_blocks: 3
            }
        );
        assert_eq!(
            decider.release_file(&ctx, file_id).unwrap().code(),
            RejectReason::FileRemoved.code()
        );
        assert_eq!(
            decider
                .finalize_placement(&ctx, &finalize_for(file_id, "late", &ids))
                .unwrap()
                .code(),
            RejectReason::FileRemoved.code()
        );
        assert_eq!(
            decider.release_file(&ctx, FileId(999)).unwrap().code(),
            RejectReason::FileNotFound.code()
        );
        {
            let tx = repo.begin().unwrap();
            let file = tx.find_file(file_id).unwrap().unwrap();
            assert!(file.removed);
            assert_eq!(file.ref_count, 0);
            assert!(tx.blocks_of_file(file_id).unwrap().is_empty());
            assert!(tx.find_proof(file_id, "b1").unwrap().is_none());
        }

        // same content again: the row comes back as a pending upload
        let revived = match decider
            .decide_placement(&ctx, &large_request("again", BIG_HASH, 10_000))
            .unwrap()
        {
            PlacementOutcome::StoreByReplicas { file_id, .. } => file_id,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(revived, file_id);
        let out = decider
            .finalize_placement(&ctx, &finalize_for(file_id, "again", &ids))
            .unwrap();
        assert!(matches!(out, FinalizeOutcome::Finalized { store_volume: 16_000, .. }));

        let tx = repo.begin().unwrap();
        let file = tx.find_file(file_id).unwrap().unwrap();
        assert!(file.done && !file.removed);
        assert_eq!(file.ref_count, 1);
        assert_eq!(tx.blocks_of_file(file_id).unwrap().len(), 3);
        assert!(tx.find_proof(file_id, "b1").unwrap().is_some());
    }

    #[test]
    fn test_finalize_rejections_leave_file_pending() {
        let (repo, decider) = setup(3);
        let ctx = RequestContext::background();
        let file_id = match decider
            .decide_placement(&ctx, &large_request("big", BIG_HASH, 10_000))
            .unwrap()
        {
            PlacementOutcome::StoreByReplicas { file_id, .. } => file_id,
            other => panic!("unexpected outcome {:?}", other),
        };
        let ids = vec![provider(0).id];

        let mut unknown = finalize_for(file_id, "big", &[NodeId::from_public_key(b"nobody")]);
        unknown.partitions[0].blocks[1].providers = ids.clone();
        assert_eq!(
            decider.finalize_placement(&ctx, &unknown).unwrap().code(),
            RejectReason::UnknownProvider.code()
        );

        let mut no_proof = finalize_for(file_id, "big", &ids);
        no_proof.proofs.pop();
        assert_eq!(
            decider.finalize_placement(&ctx, &no_proof).unwrap().code(),
            RejectReason::ProofMismatch.code()
        );

        let mut dup_proof = finalize_for(file_id, "big", &ids);
        dup_proof.proofs.push(proof("b1"));
        assert_eq!(
            decider.finalize_placement(&ctx, &dup_proof).unwrap().code(),
            RejectReason::ProofMismatch.code()
        );

        let mut empty = finalize_for(file_id, "big", &ids);
        empty.partitions[0].blocks[0].providers.clear();
        assert_eq!(
            decider.finalize_placement(&ctx, &empty).unwrap().code(),
            RejectReason::BlockWithoutProvider.code()
        );

        assert_eq!(
            decider
                .finalize_placement(&ctx, &finalize_for(FileId(999), "big", &ids))
                .unwrap()
                .code(),
            RejectReason::FileNotFound.code()
        );

        let tx = repo.begin().unwrap();
        assert!(!tx.find_file(file_id).unwrap().unwrap().done);
        assert!(tx.blocks_of_file(file_id).unwrap().is_empty());
    }

    #[test]
    fn test_pending_upload_reused() {
        let (repo, decider) = setup(3);
        let ctx = RequestContext::background();
        let first = decider
            .decide_placement(&ctx, &large_request("a", BIG_HASH, 10_000))
            .unwrap();
        let second = decider
            .decide_placement(&ctx, &large_request("b", BIG_HASH, 10_000))
            .unwrap();
        let id = |o: &PlacementOutcome| match o {
            PlacementOutcome::StoreByReplicas { file_id, .. } => *file_id,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(id(&first), id(&second));
        assert_eq!(repo.begin().unwrap().find_file(FileId(2)).unwrap(), None);
    }

    #[test]
    fn test_expired_deadline_rolls_back() {
        let (repo, decider) = setup(0);
        let ctx = RequestContext::with_deadline(std::time::Instant::now());
        let req = inline_request("late", b"late bytes");
        assert!(decider.decide_placement(&ctx, &req).is_err());
        assert!(repo
            .begin()
            .unwrap()
            .check_file(&req.hash)
            .unwrap()
            .is_none());
    }
}
