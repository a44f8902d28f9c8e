//! Provider registry with atomic per-provider statistics and ranking.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use url::Url;

use super::catalog::ProviderCatalog;
use super::stats::{Outcome, ProviderErrorState, ProviderStats};
use super::{Provider, ProviderError, ProviderKey};
use crate::cid::Cid;
use crate::clock::{Clock, SystemClock};

/// Weight of normalized speed in the ranking score.
const SPEED_WEIGHT: f64 = 0.7;

/// Weight of the raw success count in the ranking score.
const SUCCESS_WEIGHT: f64 = 0.3;

/// Catalogue of providers and their running statistics.
///
/// Each provider's statistics sit behind their own lock; `record_outcome`
/// is the only mutation path, so concurrent reports never lose updates.
#[derive(Debug)]
pub struct ProviderRegistry {
    slots: RwLock<Vec<Arc<ProviderSlot>>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct ProviderSlot {
    provider: Provider,
    stats: Mutex<ProviderStats>,
}

/// Provider snapshot together with its ranking score.
#[derive(Debug, Clone)]
pub struct RankedProvider {
    pub provider: Provider,
    pub stats: ProviderStats,
    pub score: f64,
    /// Position in registration order
    pub order: usize,
}

impl ProviderRegistry {
    /// Creates an empty registry using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty registry stamping outcomes with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            clock,
        }
    }

    /// Creates a registry holding every provider of `catalog`, in order.
    ///
    /// # Errors
    ///
    /// - `ProviderError::DuplicateProvider` - Catalog repeats a key
    /// - `ProviderError::InvalidTemplate` - An entry lacks the `{cid}` placeholder
    pub fn from_catalog(
        catalog: &ProviderCatalog,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ProviderError> {
        let registry = Self::with_clock(clock);
        for provider in catalog.providers()? {
            registry.register(provider)?;
        }
        Ok(registry)
    }

    /// Adds a provider with zeroed statistics.
    ///
    /// # Errors
    ///
    /// - `ProviderError::DuplicateProvider` - Key already registered
    pub fn register(&self, provider: Provider) -> Result<(), ProviderError> {
        let mut slots = self.slots.write();

        if slots.iter().any(|slot| slot.provider.key == provider.key) {
            return Err(ProviderError::DuplicateProvider { key: provider.key });
        }

        tracing::debug!(
            "Registered provider {} ({})",
            provider.key,
            provider.url_template
        );
        slots.push(Arc::new(ProviderSlot {
            provider,
            stats: Mutex::new(ProviderStats::default()),
        }));
        Ok(())
    }

    /// Records the outcome of one interaction with `key`.
    ///
    /// # Errors
    ///
    /// - `ProviderError::UnknownProvider` - Key not registered
    pub fn record_outcome(&self, key: &ProviderKey, outcome: Outcome) -> Result<(), ProviderError> {
        let slot = self.slot(key)?;
        let now = self.clock.now();
        let mut stats = slot.stats.lock();
        stats.apply(outcome, now);

        if let Outcome::Failure { kind } = outcome {
            tracing::debug!(
                "Provider {} failure {:?} (errors={})",
                key,
                kind,
                stats.error_count
            );
            if stats.is_disqualified() {
                tracing::warn!("Provider {} disqualified after {} errors", key, stats.error_count);
            }
        }
        Ok(())
    }

    /// Providers ordered by score, best first.
    ///
    /// Disqualified providers are left out when `exclude_disqualified` is set.
    pub fn ranked_providers(&self, exclude_disqualified: bool) -> Vec<Provider> {
        self.ranked(exclude_disqualified)
            .into_iter()
            .map(|ranked| ranked.provider)
            .collect()
    }

    /// Scored snapshot of the ranking, best first.
    ///
    /// `score = 0.7 * normalized_speed + 0.3 * success_count`, where speed is
    /// normalized against the fastest candidate. Ties go to the lower average
    /// latency, then to the earlier registration.
    pub fn ranked(&self, exclude_disqualified: bool) -> Vec<RankedProvider> {
        let snapshot: Vec<(usize, Provider, ProviderStats)> = self
            .slots
            .read()
            .iter()
            .enumerate()
            .map(|(order, slot)| (order, slot.provider.clone(), slot.stats.lock().clone()))
            .filter(|(_, _, stats)| !exclude_disqualified || !stats.is_disqualified())
            .collect();

        let fastest = snapshot
            .iter()
            .map(|(_, _, stats)| stats.avg_speed_bytes_per_sec)
            .fold(0.0_f64, f64::max);

        let mut ranked: Vec<RankedProvider> = snapshot
            .into_iter()
            .map(|(order, provider, stats)| {
                let normalized_speed = if fastest > 0.0 {
                    stats.avg_speed_bytes_per_sec / fastest
                } else {
                    0.0
                };
                let score =
                    SPEED_WEIGHT * normalized_speed + SUCCESS_WEIGHT * stats.success_count as f64;
                RankedProvider {
                    provider,
                    stats,
                    score,
                    order,
                }
            })
            .collect();

        ranked.sort_by(compare_ranked);
        ranked
    }

    /// Zeroes the statistics of one provider.
    ///
    /// # Errors
    ///
    /// - `ProviderError::UnknownProvider` - Key not registered
    pub fn reset_stats(&self, key: &ProviderKey) -> Result<(), ProviderError> {
        let slot = self.slot(key)?;
        *slot.stats.lock() = ProviderStats::default();
        tracing::info!("Reset statistics for provider {}", key);
        Ok(())
    }

    /// Zeroes the statistics of every provider.
    pub fn reset_all_stats(&self) {
        for slot in self.slots.read().iter() {
            *slot.stats.lock() = ProviderStats::default();
        }
        tracing::info!("Reset statistics for all providers");
    }

    /// Provider registered under `key`.
    pub fn provider(&self, key: &ProviderKey) -> Option<Provider> {
        self.slot(key).ok().map(|slot| slot.provider.clone())
    }

    /// Statistics snapshot of `key`.
    pub fn stats(&self, key: &ProviderKey) -> Option<ProviderStats> {
        self.slot(key).ok().map(|slot| slot.stats.lock().clone())
    }

    /// Builds the URL serving `cid` from `key`.
    ///
    /// # Errors
    ///
    /// - `ProviderError::UnknownProvider` - Key not registered
    /// - `ProviderError::InvalidUrl` - Template does not produce a valid URL
    pub fn resolve_url(&self, key: &ProviderKey, cid: &Cid) -> Result<Url, ProviderError> {
        self.slot(key)?.provider.url_for(cid)
    }

    /// Whether every registered provider is disqualified.
    ///
    /// False for an empty registry.
    pub fn all_disqualified(&self) -> bool {
        let slots = self.slots.read();
        !slots.is_empty() && slots.iter().all(|slot| slot.stats.lock().is_disqualified())
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Error counters of every provider, keyed by provider key.
    pub fn error_snapshot(&self) -> BTreeMap<ProviderKey, ProviderErrorState> {
        self.slots
            .read()
            .iter()
            .map(|slot| (slot.provider.key.clone(), slot.stats.lock().error_state()))
            .collect()
    }

    /// Restores persisted error counters; unknown keys are ignored.
    pub fn restore_errors(&self, snapshot: &BTreeMap<ProviderKey, ProviderErrorState>) {
        for slot in self.slots.read().iter() {
            if let Some(state) = snapshot.get(&slot.provider.key) {
                slot.stats.lock().restore_errors(state);
            }
        }
    }

    fn slot(&self, key: &ProviderKey) -> Result<Arc<ProviderSlot>, ProviderError> {
        self.slots
            .read()
            .iter()
            .find(|slot| &slot.provider.key == key)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider { key: key.clone() })
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn compare_ranked(a: &RankedProvider, b: &RankedProvider) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.stats.avg_latency_ms.total_cmp(&b.stats.avg_latency_ms))
        .then_with(|| a.order.cmp(&b.order))
}
