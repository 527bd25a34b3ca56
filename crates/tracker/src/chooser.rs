//! # Provider Chooser
//!
//! Keeps a refreshed, stable-ordered snapshot of eligible providers and
//! hands them out with a single shared cursor:
//!
//! ```text
//! snapshot: [p0 p1 p2 p3 p4 p5 p6 p7 p8 p9]      cursor = 5
//! choose(4) ─────────────▶ [p5 p6 p7 p8]          cursor = 9
//! choose(5) ─────────────▶ [p9 p0 p1 p2 p3]       cursor = 4
//! ```
//!
//! Successive calls sweep the whole snapshot before any provider is
//! repeated. Nothing is randomized.
//!
//! ## Locking
//!
//! Snapshot, lookup index and cursor live behind one mutex. `choose` holds
//! it for the duration of the slice walk only. `refresh` reads the
//! repository without the lock, builds the new snapshot, then swaps it in
//! and clamps the cursor.
//!
//! `refresh` opens its own repository transaction, so callers must not
//! invoke any lazily-refreshing method while holding a transaction. Use
//! [`ProviderChooser::ensure_loaded`] first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};
use tracker_common::{unix_now, Cache, NodeId, Timestamp, TrackerConfig, TtlCache};

use crate::error::Result;
use crate::model::Provider;
use crate::repository::Repository;

// ════════════════════════════════════════════════════════════════════════════
// ELIGIBILITY
// ════════════════════════════════════════════════════════════════════════════

/// Which registered providers may receive new placements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EligibilityPolicy {
    /// Minimum accumulated capacity grants, in bytes.
    pub min_capacity: u64,
    /// Maximum time since last contact. `None` disables the check.
    pub max_silence_secs: Option<u64>,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            min_capacity: 1,
            max_silence_secs: None,
        }
    }
}

impl EligibilityPolicy {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            min_capacity: config.min_provider_capacity,
            max_silence_secs: config.provider_max_silence_secs,
        }
    }

    pub fn is_eligible(&self, provider: &Provider, now: Timestamp) -> bool {
        if provider.removed || provider.total_capacity() < self.min_capacity {
            return false;
        }
        match self.max_silence_secs {
            Some(max) => now.saturating_sub(provider.last_contact) <= max,
            None => true,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CHOOSER
// ════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Snapshot {
    providers: Vec<Provider>,
    index: HashMap<NodeId, usize>,
    cursor: usize,
    loaded: bool,
    refreshed_at: Option<Timestamp>,
}

pub struct ProviderChooser {
    repo: Arc<dyn Repository>,
    policy: EligibilityPolicy,
    state: Mutex<Snapshot>,
    // providers read straight from the repository on a snapshot miss
    fallback: TtlCache<NodeId, Provider>,
}

impl ProviderChooser {
    pub fn new(repo: Arc<dyn Repository>, policy: EligibilityPolicy, cache_ttl: Duration) -> Self {
        Self {
            repo,
            policy,
            state: Mutex::new(Snapshot::default()),
            fallback: TtlCache::new(cache_ttl),
        }
    }

    pub fn from_config(repo: Arc<dyn Repository>, config: &TrackerConfig) -> Self {
        Self::new(
            repo,
            EligibilityPolicy::from_config(config),
            config.provider_cache_ttl(),
        )
    }

    pub fn policy(&self) -> &EligibilityPolicy {
        &self.policy
    }

    /// Reloads the provider list and swaps in a new snapshot.
    pub fn refresh(&self) -> Result<usize> {
        self.refresh_at(unix_now())
    }

    /// [`refresh`](Self::refresh) with an explicit clock for the staleness check.
    pub fn refresh_at(&self, now: Timestamp) -> Result<usize> {
        let all = {
            let tx = self.repo.begin()?;
            tx.find_all_providers()?
        };

        let mut providers: Vec<Provider> = all
            .into_iter()
            .filter(|p| self.policy.is_eligible(p, now))
            .collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        let index: HashMap<NodeId, usize> = providers
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id, i))
            .collect();
        let count = providers.len();

        let mut st = self.state.lock();
        st.providers = providers;
        st.index = index;
        st.cursor = if count == 0 { 0 } else { st.cursor % count };
        st.loaded = true;
        st.refreshed_at = Some(now);
        drop(st);

        info!("provider snapshot refreshed: {} eligible", count);
        Ok(count)
    }

    /// Refreshes once if no snapshot has been built yet.
    pub fn ensure_loaded(&self) -> Result<()> {
        if !self.state.lock().loaded {
            self.refresh()?;
        }
        Ok(())
    }

    /// Size of the current snapshot.
    pub fn count(&self) -> Result<usize> {
        self.ensure_loaded()?;
        Ok(self.state.lock().providers.len())
    }

    /// Returns `min(num, count)` providers starting at the cursor, wrapping,
    /// and advances the cursor by `num`.
    pub fn choose(&self, num: usize) -> Result<Vec<Provider>> {
        self.ensure_loaded()?;
        let mut st = self.state.lock();
        let n = st.providers.len();
        if n == 0 || num == 0 {
            return Ok(Vec::new());
        }
        let start = st.cursor % n;
        let chosen: Vec<Provider> = (0..num.min(n))
            .map(|i| st.providers[(start + i) % n].clone())
            .collect();
        st.cursor = (start + num % n) % n;
        debug!("chose {} providers from slot {}", chosen.len(), start);
        Ok(chosen)
    }

    /// Walks the cursor one slot at a time and returns the first provider not
    /// in `exclude`. Gives up after one full lap.
    pub fn choose_replacement(&self, exclude: &[NodeId]) -> Result<Option<Provider>> {
        self.ensure_loaded()?;
        let mut st = self.state.lock();
        let n = st.providers.len();
        for _ in 0..n {
            let slot = st.cursor % n;
            st.cursor = (slot + 1) % n;
            let candidate = &st.providers[slot];
            if !exclude.contains(&candidate.id) {
                return Ok(Some(candidate.clone()));
            }
        }
        Ok(None)
    }

    /// Snapshot lookup with a repository fallback for providers registered
    /// after the last refresh.
    pub fn get(&self, id: &NodeId) -> Result<Option<Provider>> {
        {
            let st = self.state.lock();
            if let Some(&i) = st.index.get(id) {
                return Ok(Some(st.providers[i].clone()));
            }
        }
        if let Some(p) = self.fallback.get(id) {
            return Ok(Some(p));
        }
        let found = {
            let tx = self.repo.begin()?;
            tx.find_provider(id)?
        };
        if let Some(p) = &found {
            self.fallback.set(*id, p.clone());
        }
        Ok(found)
    }

    /// Drops a cached fallback entry, e.g. after the provider row changed.
    pub fn invalidate(&self, id: &NodeId) {
        self.fallback.expire(id);
    }

    pub fn cursor(&self) -> usize {
        self.state.lock().cursor
    }

    pub fn refreshed_at(&self) -> Option<Timestamp> {
        self.state.lock().refreshed_at
    }

    /// Ids of the current snapshot, in selection order.
    pub fn snapshot_ids(&self) -> Vec<NodeId> {
        self.state.lock().providers.iter().map(|p| p.id).collect()
    }
}
