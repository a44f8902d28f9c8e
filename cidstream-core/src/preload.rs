//! Background warming of upcoming CIDs.
//!
//! Upcoming rotation entries are validated and their first chunk fetched at
//! `Preload` priority, so provider statistics and invalid marks are current
//! before the user navigates. Validation results are kept in a small LRU for
//! the next load to reuse.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cid::Cid;
use crate::config::PreloadConfig;
use crate::rotation::Rotation;
use crate::scheduler::{FetchError, Priority};
use crate::services::DeliveryServices;
use crate::validator::{ValidationError, ValidationResult};

/// Immediately next entry.
pub const PRIORITY_NEXT: u8 = 1;

/// Further lookahead entries.
pub const PRIORITY_LOOKAHEAD: u8 = 2;

/// Warms upcoming CIDs with bounded concurrency.
///
/// Cloning shares the same queue and workers.
#[derive(Debug, Clone)]
pub struct PreloadManager {
    inner: Arc<PreloadInner>,
}

#[derive(Debug)]
struct PreloadInner {
    services: DeliveryServices,
    rotation: Rotation,
    config: PreloadConfig,
    state: Mutex<PreloadState>,
    warmed: Mutex<LruCache<Cid, ValidationResult>>,
    busy: watch::Sender<bool>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct PreloadState {
    /// Min-heap on (priority, enqueue sequence)
    heap: BinaryHeap<Reverse<(u8, u64, String)>>,
    queued: HashSet<String>,
    active: HashSet<String>,
    sequence: u64,
}

impl PreloadManager {
    pub fn new(services: DeliveryServices, rotation: Rotation, config: PreloadConfig) -> Self {
        let capacity = NonZeroUsize::new(config.warmed_capacity).unwrap_or(NonZeroUsize::MIN);
        let (busy, _) = watch::channel(false);

        Self {
            inner: Arc::new(PreloadInner {
                services,
                rotation,
                config,
                state: Mutex::new(PreloadState::default()),
                warmed: Mutex::new(LruCache::new(capacity)),
                busy,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Queues the next `lookahead_depth` rotation entries after the current one.
    ///
    /// Returns how many were newly queued.
    pub fn schedule_upcoming(&self) -> usize {
        let upcoming = self.inner.rotation.upcoming(self.inner.config.lookahead_depth);
        let queued = upcoming
            .iter()
            .enumerate()
            .filter(|(position, cid)| {
                let priority = if *position == 0 {
                    PRIORITY_NEXT
                } else {
                    PRIORITY_LOOKAHEAD
                };
                self.enqueue(cid, priority)
            })
            .count();

        if queued > 0 {
            tracing::debug!("Queued {} CIDs for preloading", queued);
        }
        queued
    }

    /// Queues `cid` at `priority` (1 = next, 2 = lookahead).
    ///
    /// Returns false when the CID is already queued, running or warmed.
    pub fn enqueue(&self, cid: &str, priority: u8) -> bool {
        if self.inner.cancel.is_cancelled() {
            return false;
        }
        if let Ok(parsed) = Cid::parse(cid)
            && self.inner.warmed.lock().contains(&parsed)
        {
            return false;
        }

        {
            let mut state = self.inner.state.lock();
            if state.queued.contains(cid) || state.active.contains(cid) {
                return false;
            }
            state.sequence += 1;
            let sequence = state.sequence;
            state.heap.push(Reverse((priority, sequence, cid.to_string())));
            state.queued.insert(cid.to_string());
        }

        PreloadInner::pump(&self.inner);
        true
    }

    /// Removes and returns the warmed validation result for `cid`.
    pub fn take_warmed(&self, cid: &Cid) -> Option<ValidationResult> {
        self.inner.warmed.lock().pop(cid)
    }

    /// Whether a warmed result is cached for `cid`.
    pub fn is_warmed(&self, cid: &Cid) -> bool {
        self.inner.warmed.lock().contains(cid)
    }

    /// CIDs preloading right now.
    pub fn active(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// CIDs waiting for a slot.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().heap.len()
    }

    /// Resolves once the queue is empty and no preload runs.
    pub async fn wait_idle(&self) {
        let mut busy = self.inner.busy.subscribe();
        // The sender lives in `inner`, so the channel cannot close here
        let _ = busy.wait_for(|busy| !*busy).await;
    }

    /// Cancels running preloads and drops the queue.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.state.lock();
        state.heap.clear();
        state.queued.clear();
        self.inner.refresh_busy(&state);
    }
}

impl PreloadInner {
    /// Starts queued preloads while slots are free.
    fn pump(inner: &Arc<Self>) {
        let mut state = inner.state.lock();
        let cap = inner.config.max_concurrent.max(1);

        while state.active.len() < cap {
            let Some(Reverse((priority, _, cid))) = state.heap.pop() else {
                break;
            };
            state.queued.remove(&cid);
            state.active.insert(cid.clone());

            tracing::debug!("Preloading {} (priority {})", cid, priority);
            let worker = Arc::clone(inner);
            tokio::spawn(async move {
                worker.preload(&cid).await;
                worker.state.lock().active.remove(&cid);
                Self::pump(&worker);
            });
        }

        inner.refresh_busy(&state);
    }

    fn refresh_busy(&self, state: &PreloadState) {
        let busy = !state.heap.is_empty() || !state.active.is_empty();
        self.busy.send_if_modified(|current| {
            let changed = *current != busy;
            *current = busy;
            changed
        });
    }

    async fn preload(&self, raw: &str) {
        let services = &self.services;
        let validation = match services.validator.validate(raw, &self.cancel).await {
            Ok(validation) => validation,
            Err(ValidationError::Cancelled) => return,
            Err(ValidationError::MalformedCid(e)) => {
                tracing::warn!("Removing from rotation: {}", e);
                self.rotation.remove(raw);
                return;
            }
            Err(ValidationError::MarkedInvalid { cid }) => {
                tracing::debug!("Not preloading {}: marked invalid", cid);
                return;
            }
            Err(ValidationError::NoAvailableProvider { cid }) => {
                tracing::debug!("Not preloading {}: no provider available", cid);
                return;
            }
            Err(e @ ValidationError::AllProvidersFailed { .. }) => {
                tracing::warn!("Preload validation failed: {}", e);
                self.give_up(raw).await;
                return;
            }
        };

        let fetched = services
            .scheduler
            .fetch_chunk_from(
                &validation.cid,
                0,
                Priority::Preload,
                &validation.reachable,
                &self.cancel,
            )
            .await;

        match fetched {
            Ok(_) => {
                if let Err(e) = services.invalidation.clear(&validation.cid).await {
                    tracing::warn!("Failed to clear invalid mark for {}: {}", validation.cid, e);
                }
                tracing::debug!("Warmed {} via {}", validation.cid, validation.provider);
                self.warmed
                    .lock()
                    .put(validation.cid.clone(), validation);
            }
            Err(FetchError::Cancelled) => {}
            Err(e) => {
                tracing::warn!("Preload fetch failed: {}", e);
                self.give_up(raw).await;
            }
        }
    }

    async fn give_up(&self, raw: &str) {
        if let Ok(cid) = Cid::parse(raw)
            && let Err(e) = self.services.invalidation.mark_invalid(&cid).await
        {
            tracing::warn!("Failed to persist invalid mark for {}: {}", cid, e);
        }
        self.rotation.remove(raw);
    }
}
