//! Streaming loop keeping a lookahead window of chunks in flight.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::FetchError;
use super::chunk::{Chunk, Priority};
use super::fetcher::ChunkScheduler;
use super::queue::PriorityLanes;
use crate::cid::Cid;
use crate::provider::ProviderKey;

#[derive(Debug, Clone, Copy)]
struct ChunkRequest {
    index: u64,
    priority: Priority,
}

#[derive(Debug)]
struct FetchResult {
    generation: u64,
    index: u64,
    result: Result<Chunk, FetchError>,
}

/// Ordered delivery of one CID's chunks from a provider chain.
///
/// Chunk 0 starts `Critical` and the rest of the lookahead window `High`;
/// each delivered chunk schedules the next unscheduled index at `Normal`.
/// At most `max_in_flight` fetches run at once and an index is never in
/// flight twice. A seek bumps the generation so results of superseded
/// fetches are dropped instead of delivered.
///
/// Dropping the stream cancels its outstanding fetches.
#[derive(Debug)]
pub struct ChunkStream {
    scheduler: Arc<ChunkScheduler>,
    cid: Cid,
    chain: Arc<Vec<ProviderKey>>,
    lookahead: u64,
    max_in_flight: usize,
    max_recoveries: u32,
    cancel: CancellationToken,
    generation: u64,
    generation_cancel: CancellationToken,
    pending: PriorityLanes<ChunkRequest>,
    ready: PriorityLanes<Chunk>,
    scheduled: HashSet<u64>,
    in_flight: HashSet<u64>,
    next_unscheduled: u64,
    /// Exclusive upper bound on chunk indices, once the end is known
    limit: Option<u64>,
    recoveries: HashMap<u64, u32>,
    results_tx: mpsc::UnboundedSender<FetchResult>,
    results_rx: mpsc::UnboundedReceiver<FetchResult>,
}

impl ChunkStream {
    /// Starts streaming `cid` from the beginning using `chain` as the
    /// provider order. Cancelling `cancel` stops the stream.
    pub fn start(
        scheduler: Arc<ChunkScheduler>,
        cid: Cid,
        chain: Vec<ProviderKey>,
        cancel: &CancellationToken,
    ) -> Self {
        Self::start_at(scheduler, cid, chain, cancel, 0)
    }

    /// Starts streaming at the chunk containing `byte_position`.
    pub fn start_at(
        scheduler: Arc<ChunkScheduler>,
        cid: Cid,
        chain: Vec<ProviderKey>,
        cancel: &CancellationToken,
        byte_position: u64,
    ) -> Self {
        let config = scheduler.config();
        let lookahead = config.lookahead.max(1);
        let max_in_flight = config.max_in_flight.max(1);
        let max_recoveries = config.max_recoveries;
        let chunk_size = config.chunk_size;

        let cancel = cancel.child_token();
        let generation_cancel = cancel.child_token();
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        let mut stream = Self {
            scheduler,
            cid,
            chain: Arc::new(chain),
            lookahead,
            max_in_flight,
            max_recoveries,
            cancel,
            generation: 0,
            generation_cancel,
            pending: PriorityLanes::new(),
            ready: PriorityLanes::new(),
            scheduled: HashSet::new(),
            in_flight: HashSet::new(),
            next_unscheduled: 0,
            limit: None,
            recoveries: HashMap::new(),
            results_tx,
            results_rx,
        };

        tracing::debug!(
            "Starting stream for {} at chunk {} via {:?}",
            stream.cid,
            byte_position / chunk_size,
            stream.chain
        );
        stream.schedule_window(byte_position / chunk_size);
        stream
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// Current provider order.
    pub fn chain(&self) -> &[ProviderKey] {
        &self.chain
    }

    /// Incremented by every seek.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns the next completed chunk, highest priority first.
    ///
    /// `Ok(None)` once every chunk up to the end of the resource has been
    /// delivered. Cancel safe: dropping the future loses no chunk.
    ///
    /// # Errors
    ///
    /// - `FetchError::ChunkFetchExhausted` - A chunk failed after every recovery
    /// - `FetchError::Cancelled` - The stream was stopped
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, FetchError> {
        loop {
            if let Some(chunk) = self.ready.pop() {
                self.schedule_next();
                return Ok(Some(chunk));
            }
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            self.dispatch();
            if self.in_flight.is_empty() {
                tracing::debug!("Stream for {} complete", self.cid);
                return Ok(None);
            }

            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                message = self.results_rx.recv() => message,
            };
            // The stream holds a sender, so the channel never closes here
            let Some(message) = message else {
                return Err(FetchError::Cancelled);
            };
            self.handle_result(message)?;
        }
    }

    /// Restarts the schedule at the chunk containing `byte_position`.
    ///
    /// In-flight fetches are cancelled and pending or ready chunks dropped.
    pub fn seek(&mut self, byte_position: u64) {
        self.generation += 1;
        self.generation_cancel.cancel();
        self.generation_cancel = self.cancel.child_token();

        self.pending.clear();
        self.ready.clear();
        self.scheduled.clear();
        self.in_flight.clear();
        self.recoveries.clear();

        let start = byte_position / self.scheduler.config().chunk_size;
        tracing::debug!(
            "Seek in {} to byte {} (chunk {}, generation {})",
            self.cid,
            byte_position,
            start,
            self.generation
        );
        self.schedule_window(start);
    }

    /// Cancels every outstanding fetch; later calls return `Cancelled`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn schedule_window(&mut self, start: u64) {
        self.next_unscheduled = start;
        for offset in 0..self.lookahead {
            let index = start + offset;
            if self.past_end(index) {
                break;
            }
            let priority = if offset == 0 {
                Priority::Critical
            } else {
                Priority::High
            };
            self.schedule(index, priority);
            self.next_unscheduled = index + 1;
        }
    }

    fn schedule_next(&mut self) {
        let index = self.next_unscheduled;
        if self.past_end(index) {
            return;
        }
        self.next_unscheduled += 1;
        self.schedule(index, Priority::Normal);
    }

    fn schedule(&mut self, index: u64, priority: Priority) {
        if self.past_end(index) || !self.scheduled.insert(index) {
            return;
        }
        self.pending.push(priority, ChunkRequest { index, priority });
    }

    fn dispatch(&mut self) {
        while self.in_flight.len() < self.max_in_flight {
            let Some(request) = self.pending.pop() else {
                break;
            };
            if self.past_end(request.index) || !self.in_flight.insert(request.index) {
                continue;
            }

            let scheduler = Arc::clone(&self.scheduler);
            let cid = self.cid.clone();
            let chain = Arc::clone(&self.chain);
            let cancel = self.generation_cancel.clone();
            let results = self.results_tx.clone();
            let generation = self.generation;

            tracing::trace!(
                "Dispatching chunk {} of {} at {:?}",
                request.index,
                cid,
                request.priority
            );
            tokio::spawn(async move {
                let result = scheduler
                    .fetch_chunk_from(&cid, request.index, request.priority, &chain, &cancel)
                    .await;
                let _ = results.send(FetchResult {
                    generation,
                    index: request.index,
                    result,
                });
            });
        }
    }

    fn handle_result(&mut self, message: FetchResult) -> Result<(), FetchError> {
        if message.generation != self.generation {
            tracing::trace!(
                "Dropping chunk {} from superseded generation {}",
                message.index,
                message.generation
            );
            return Ok(());
        }
        self.in_flight.remove(&message.index);

        match message.result {
            Ok(chunk) => {
                if chunk.is_empty() {
                    self.set_limit(chunk.index);
                    return Ok(());
                }
                if chunk.is_final() {
                    self.set_limit(chunk.index + 1);
                }
                if self.past_end(chunk.index) {
                    return Ok(());
                }
                self.recoveries.remove(&chunk.index);
                self.ready.push(chunk.priority, chunk);
                Ok(())
            }
            Err(FetchError::Cancelled) => Ok(()),
            Err(error @ FetchError::ChunkFetchExhausted { .. }) => {
                let used = self.recoveries.entry(message.index).or_insert(0);
                if *used >= self.max_recoveries {
                    tracing::warn!(
                        "Chunk {} of {} unrecoverable after {} recoveries",
                        message.index,
                        self.cid,
                        used
                    );
                    return Err(error);
                }
                *used += 1;

                tracing::warn!(
                    "Buffer recovery {}/{} for chunk {} of {}",
                    used,
                    self.max_recoveries,
                    message.index,
                    self.cid
                );
                self.chain = Arc::new(self.scheduler.rank_chain(&self.chain));
                self.pending.push(
                    Priority::Critical,
                    ChunkRequest {
                        index: message.index,
                        priority: Priority::Critical,
                    },
                );
                Ok(())
            }
        }
    }

    fn set_limit(&mut self, limit: u64) {
        let limit = self.limit.map_or(limit, |current| current.min(limit));
        self.limit = Some(limit);
        self.pending.retain(|request| request.index < limit);
        self.ready.retain(|chunk| chunk.index < limit);
    }

    fn past_end(&self, index: u64) -> bool {
        self.limit.is_some_and(|limit| index >= limit)
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
