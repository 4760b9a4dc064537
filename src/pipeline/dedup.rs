//! Short-horizon deduplication over stable item ids.
//!
//! A capacity-capped moka cache maps item id to first-seen timestamp with a
//! TTL equal to the horizon H. First sightings are journaled to SQLite so a
//! restart within H does not re-admit already-processed items.

use crate::storage::OracleStore;
use anyhow::Result;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Concurrent seen-set shared by all collectors.
pub struct Deduplicator {
    cache: Cache<String, i64>,
    store: Option<Arc<OracleStore>>,
    horizon_s: u64,
}

impl Deduplicator {
    /// Build an empty deduplicator.
    pub fn new(capacity: u64, horizon_s: u64, store: Option<Arc<OracleStore>>) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(Duration::from_secs(horizon_s))
            .build();
        Self {
            cache,
            store,
            horizon_s,
        }
    }

    /// Build a deduplicator and warm it from the journal.
    pub async fn with_journal(
        capacity: u64,
        horizon_s: u64,
        store: Arc<OracleStore>,
        now_ts: i64,
    ) -> Result<Self> {
        let dedup = Self::new(capacity, horizon_s, Some(store.clone()));
        let cutoff = now_ts - horizon_s as i64;
        let entries = store.load_seen_since(cutoff).await?;
        let count = entries.len();
        for (item_id, first_seen_ts) in entries {
            dedup.cache.insert(item_id, first_seen_ts).await;
        }
        store.prune_seen(cutoff).await?;
        info!("deduplicator warmed with {} journaled ids", count);
        Ok(dedup)
    }

    /// Record `id` if unseen. Returns true on first sighting within the
    /// horizon, false for a duplicate. Safe for concurrent callers; exactly
    /// one caller wins for a given id.
    pub async fn check_and_insert(&self, id: &str, now_ts: i64) -> bool {
        let entry = self.cache.entry_by_ref(id).or_insert(now_ts).await;
        let fresh = entry.is_fresh();
        if fresh {
            if let Some(store) = &self.store {
                if let Err(e) = store.record_seen(&[(id.to_string(), now_ts)]).await {
                    // The journal is best-effort; a lost row only risks one
                    // duplicate after a restart.
                    warn!("failed to journal seen item {}: {}", id, e);
                }
            }
        } else {
            debug!("duplicate item {} dropped", id);
        }
        fresh
    }

    /// Whether `id` has been seen within the horizon.
    pub async fn contains(&self, id: &str) -> bool {
        self.cache.get(id).await.is_some()
    }

    /// Approximate number of tracked ids.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop journal rows past the horizon. Called on graceful shutdown and
    /// periodically by the orchestrator.
    pub async fn prune_journal(&self, now_ts: i64) -> Result<()> {
        if let Some(store) = &self.store {
            store.prune_seen(now_ts - self.horizon_s as i64).await?;
        }
        Ok(())
    }
}
