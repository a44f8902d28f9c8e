//! Invalid-CID marks with a validity window, plus provider error snapshots.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::store::{KeyValueStore, StoreError};
use crate::cid::Cid;
use crate::clock::{Clock, to_time_delta};
use crate::provider::{ProviderErrorState, ProviderKey, ProviderRegistry};

/// Store key of the CID → marked-at map.
pub const CID_VALIDITY_KEY: &str = "CID_VALIDITY";

/// Store key of the provider error snapshot.
pub const PROVIDER_ERRORS_KEY: &str = "PROVIDER_ERRORS";

/// Persisted record of a CID that failed to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCidEntry {
    pub cid: Cid,
    pub marked_at: DateTime<Utc>,
}

/// Known-bad CIDs, skipped by source selection until their mark expires.
///
/// Expiry is lazy: a mark older than the window is ignored by
/// [`is_invalid`](Self::is_invalid) and dropped on the next persist.
#[derive(Debug)]
pub struct InvalidationCache {
    entries: Mutex<HashMap<Cid, DateTime<Utc>>>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
    persist_lock: tokio::sync::Mutex<()>,
}

impl InvalidationCache {
    /// Reads persisted marks from `store`.
    ///
    /// Entries whose key is not a well-formed CID are dropped with a warning.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - If the store could not be read
    /// - `StoreError::Serialization` - If the persisted map is corrupt
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        window: Duration,
    ) -> Result<Self, StoreError> {
        let mut entries = HashMap::new();

        if let Some(raw) = store.load(CID_VALIDITY_KEY).await? {
            let persisted: BTreeMap<String, DateTime<Utc>> =
                serde_json::from_str(&raw).map_err(|source| StoreError::Serialization {
                    key: CID_VALIDITY_KEY.to_string(),
                    source,
                })?;

            for (value, marked_at) in persisted {
                match Cid::parse(&value) {
                    Ok(cid) => {
                        entries.insert(cid, marked_at);
                    }
                    Err(e) => tracing::warn!("Dropping persisted invalid mark: {}", e),
                }
            }
        }

        tracing::info!("Loaded {} invalid CID marks", entries.len());
        Ok(Self {
            entries: Mutex::new(entries),
            store,
            clock,
            window,
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Marks `cid` invalid as of now and persists the map.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - If persisting failed; the in-memory mark is kept
    pub async fn mark_invalid(&self, cid: &Cid) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.entries.lock().insert(cid.clone(), now);
        tracing::info!("Marked CID {} invalid", cid);
        self.persist().await
    }

    /// Whether `cid` carries a mark younger than the validity window.
    pub fn is_invalid(&self, cid: &Cid) -> bool {
        let now = self.clock.now();
        self.entries
            .lock()
            .get(cid)
            .is_some_and(|marked_at| now - *marked_at < to_time_delta(self.window))
    }

    /// Whether any mark exists for `cid`, expired or not.
    pub fn contains(&self, cid: &Cid) -> bool {
        self.entries.lock().contains_key(cid)
    }

    /// Removes the mark for `cid`, persisting only if one existed.
    ///
    /// Returns whether a mark was removed.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - If persisting failed
    pub async fn clear(&self, cid: &Cid) -> Result<bool, StoreError> {
        let removed = self.entries.lock().remove(cid).is_some();
        if removed {
            tracing::info!("Cleared invalid mark for CID {}", cid);
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Current marks, including expired ones not yet pruned.
    pub fn entries(&self) -> Vec<InvalidCidEntry> {
        let mut entries: Vec<InvalidCidEntry> = self
            .entries
            .lock()
            .iter()
            .map(|(cid, marked_at)| InvalidCidEntry {
                cid: cid.clone(),
                marked_at: *marked_at,
            })
            .collect();
        entries.sort_by_key(|entry| entry.marked_at);
        entries
    }

    /// Saves every provider's error counters.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - If the store could not be written
    pub async fn persist_provider_errors(
        &self,
        registry: &ProviderRegistry,
    ) -> Result<(), StoreError> {
        let snapshot = registry.error_snapshot();
        let raw = serde_json::to_string(&snapshot).map_err(|source| {
            StoreError::Serialization {
                key: PROVIDER_ERRORS_KEY.to_string(),
                source,
            }
        })?;
        self.store.save(PROVIDER_ERRORS_KEY, &raw).await
    }

    /// Restores persisted error counters into `registry`.
    ///
    /// Returns the number of providers in the snapshot.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - If the store could not be read
    /// - `StoreError::Serialization` - If the snapshot is corrupt
    pub async fn restore_provider_errors(
        &self,
        registry: &ProviderRegistry,
    ) -> Result<usize, StoreError> {
        let Some(raw) = self.store.load(PROVIDER_ERRORS_KEY).await? else {
            return Ok(0);
        };

        let snapshot: BTreeMap<ProviderKey, ProviderErrorState> = serde_json::from_str(&raw)
            .map_err(|source| StoreError::Serialization {
                key: PROVIDER_ERRORS_KEY.to_string(),
                source,
            })?;
        registry.restore_errors(&snapshot);
        tracing::debug!("Restored error state for {} providers", snapshot.len());
        Ok(snapshot.len())
    }

    async fn persist(&self) -> Result<(), StoreError> {
        // Snapshot under the persist lock so the last writer saves the newest map
        let _guard = self.persist_lock.lock().await;

        let raw = {
            let now = self.clock.now();
            let window = to_time_delta(self.window);
            let mut entries = self.entries.lock();
            entries.retain(|_, marked_at| now - *marked_at < window);

            let persisted: BTreeMap<&str, DateTime<Utc>> = entries
                .iter()
                .map(|(cid, marked_at)| (cid.as_str(), *marked_at))
                .collect();
            serde_json::to_string(&persisted).map_err(|source| StoreError::Serialization {
                key: CID_VALIDITY_KEY.to_string(),
                source,
            })?
        };

        self.store.save(CID_VALIDITY_KEY, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::INVALID_CID_WINDOW;
    use crate::invalidation::MemoryStore;
    use crate::provider::{CorsMode, FailureKind, Outcome, Provider};

    const CID: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";

    async fn cache_with(clock: &ManualClock, store: Arc<dyn KeyValueStore>) -> InvalidationCache {
        InvalidationCache::load(store, Arc::new(clock.clone()), INVALID_CID_WINDOW)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_mark_expires_after_window() {
        let clock = ManualClock::default();
        let cache = cache_with(&clock, Arc::new(MemoryStore::new())).await;
        let cid = Cid::parse(CID).unwrap();

        cache.mark_invalid(&cid).await.unwrap();
        assert!(cache.is_invalid(&cid));

        clock.advance(Duration::from_secs(60 * 60));
        assert!(cache.is_invalid(&cid));

        clock.advance(Duration::from_secs(48 * 60 * 60));
        assert!(!cache.is_invalid(&cid));
        assert!(cache.contains(&cid)); // Lazy expiry keeps the entry
    }

    #[tokio::test]
    async fn test_marks_survive_reload() {
        let clock = ManualClock::default();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cid = Cid::parse(CID).unwrap();

        let cache = cache_with(&clock, Arc::clone(&store)).await;
        cache.mark_invalid(&cid).await.unwrap();

        let reloaded = cache_with(&clock, store).await;
        assert!(reloaded.is_invalid(&cid));
        assert_eq!(reloaded.entries()[0].marked_at, clock.now());
    }

    #[tokio::test]
    async fn test_clear_removes_mark() {
        let clock = ManualClock::default();
        let cache = cache_with(&clock, Arc::new(MemoryStore::new())).await;
        let cid = Cid::parse(CID).unwrap();

        assert!(!cache.clear(&cid).await.unwrap());
        cache.mark_invalid(&cid).await.unwrap();
        assert!(cache.clear(&cid).await.unwrap());
        assert!(!cache.is_invalid(&cid));
    }

    #[tokio::test]
    async fn test_malformed_persisted_keys_dropped() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::new());
        let raw = format!(
            "{{\"not-a-cid\":\"2024-01-01T00:00:00Z\",\"{CID}\":\"{}\"}}",
            clock.now().to_rfc3339()
        );
        store.save(CID_VALIDITY_KEY, &raw).await.unwrap();

        let cache = cache_with(&clock, store).await;
        assert_eq!(cache.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_map_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.save(CID_VALIDITY_KEY, "[1, 2").await.unwrap();

        let result =
            InvalidationCache::load(store, Arc::new(ManualClock::default()), INVALID_CID_WINDOW)
                .await;
        assert!(matches!(result, Err(StoreError::Serialization { .. })));
    }

    #[tokio::test]
    async fn test_provider_errors_survive_restart() {
        let clock = ManualClock::default();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let provider =
            Provider::new("a", "A", "https://a.test/ipfs/{cid}", CorsMode::Cors).unwrap();

        let registry = ProviderRegistry::new();
        registry.register(provider.clone()).unwrap();
        for _ in 0..3 {
            registry
                .record_outcome(
                    &provider.key,
                    Outcome::Failure {
                        kind: FailureKind::Cors,
                    },
                )
                .unwrap();
        }

        let cache = cache_with(&clock, Arc::clone(&store)).await;
        cache.persist_provider_errors(&registry).await.unwrap();

        let fresh = ProviderRegistry::new();
        fresh.register(provider.clone()).unwrap();
        let restored = cache_with(&clock, store)
            .await
            .restore_provider_errors(&fresh)
            .await
            .unwrap();

        assert_eq!(restored, 1);
        let stats = fresh.stats(&provider.key).unwrap();
        assert_eq!(stats.cors_error_count, 3);
        assert!(stats.is_disqualified());
    }
}
