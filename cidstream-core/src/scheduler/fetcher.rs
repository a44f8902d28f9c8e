//! Single-chunk fetching across a provider chain.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::FetchError;
use super::admission::FetchAdmission;
use super::chunk::{Chunk, Priority};
use crate::cid::Cid;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::net::{ByteRange, FetchRequest, FetchResponse, Transport};
use crate::provider::{FailureKind, Outcome, ProviderKey, ProviderRegistry};

/// Elapsed time floor for speed estimates.
const MIN_ELAPSED: Duration = Duration::from_millis(1);

/// HTTP 416 Range Not Satisfiable.
const RANGE_NOT_SATISFIABLE: u16 = 416;

/// Fetches byte ranges of CIDs from ranked providers with per-provider retry.
///
/// Every attempt passes through one shared [`FetchAdmission`], so fetches
/// from all streams and the preload warmer are ordered by priority. Every
/// completed attempt is reported to the [`ProviderRegistry`]; attempts
/// interrupted by cancellation are not.
#[derive(Debug)]
pub struct ChunkScheduler {
    registry: Arc<ProviderRegistry>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    admission: FetchAdmission,
    config: SchedulerConfig,
}

enum Attempt {
    Data(Bytes),
    PastEnd,
}

impl ChunkScheduler {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            clock,
            admission: FetchAdmission::new(config.max_concurrent_fetches),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn admission(&self) -> &FetchAdmission {
        &self.admission
    }

    /// Byte range covered by chunk `index`.
    pub fn chunk_range(&self, index: u64) -> ByteRange {
        ByteRange::for_chunk(index, self.config.chunk_size)
    }

    /// Fetches chunk `index` trying every provider in current ranking order.
    ///
    /// Qualified providers come first; disqualified ones are tried last as
    /// a last resort.
    ///
    /// # Errors
    ///
    /// - `FetchError::ChunkFetchExhausted` - Every provider used up its attempts
    /// - `FetchError::Cancelled` - `cancel` fired
    pub async fn fetch_chunk(
        &self,
        cid: &Cid,
        index: u64,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<Chunk, FetchError> {
        let chain: Vec<ProviderKey> = self
            .registry
            .ranked(false)
            .into_iter()
            .map(|ranked| ranked.provider.key)
            .collect();
        let chain = self.rank_chain(&chain);
        self.fetch_chunk_from(cid, index, priority, &chain, cancel)
            .await
    }

    /// Fetches chunk `index` trying `chain` in the given order.
    ///
    /// Each provider gets up to `retry.max_attempts` attempts with
    /// exponential backoff before the next provider is tried.
    ///
    /// # Errors
    ///
    /// - `FetchError::ChunkFetchExhausted` - Every provider used up its attempts
    /// - `FetchError::Cancelled` - `cancel` fired
    pub async fn fetch_chunk_from(
        &self,
        cid: &Cid,
        index: u64,
        priority: Priority,
        chain: &[ProviderKey],
        cancel: &CancellationToken,
    ) -> Result<Chunk, FetchError> {
        let range = self.chunk_range(index);
        let retry = &self.config.retry;
        let mut attempts = 0;

        for key in chain {
            let Some(provider) = self.registry.provider(key) else {
                tracing::warn!("Skipping unregistered provider {} in chain", key);
                continue;
            };
            let url = match provider.url_for(cid) {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!("Skipping provider {}: {}", key, e);
                    continue;
                }
            };

            for attempt in 0..retry.max_attempts {
                if cancel.is_cancelled() {
                    return Err(FetchError::Cancelled);
                }
                attempts += 1;

                let request = FetchRequest {
                    url: url.clone(),
                    range: Some(range),
                    cors_mode: provider.cors_mode,
                };
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    permit = self.admission.acquire(priority) => permit,
                };
                let started = self.clock.monotonic_now();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    result = self.transport.fetch(request) => result,
                };
                let elapsed = self.clock.monotonic_now() - started;
                drop(permit);

                let failure = match result {
                    Ok(response) => {
                        let latency = response.first_byte_latency;
                        match interpret(response, range) {
                            Ok(Attempt::Data(data)) => {
                                self.record_success(key, data.len(), elapsed, latency);
                                tracing::debug!(
                                    "Chunk {} of {} from {} ({} bytes, {:?})",
                                    index,
                                    cid,
                                    key,
                                    data.len(),
                                    elapsed
                                );
                                return Ok(Chunk {
                                    cid: cid.clone(),
                                    index,
                                    byte_range: range,
                                    priority,
                                    data,
                                    provider_used: key.clone(),
                                });
                            }
                            Ok(Attempt::PastEnd) => {
                                tracing::debug!("Chunk {} of {} is past the end", index, cid);
                                return Ok(Chunk {
                                    cid: cid.clone(),
                                    index,
                                    byte_range: range,
                                    priority,
                                    data: Bytes::new(),
                                    provider_used: key.clone(),
                                });
                            }
                            Err(kind) => kind,
                        }
                    }
                    Err(e) => e.failure_kind(),
                };

                tracing::warn!(
                    "Chunk {} of {} failed on {} (attempt {}/{}): {:?}",
                    index,
                    cid,
                    key,
                    attempt + 1,
                    retry.max_attempts,
                    failure
                );
                if let Err(e) = self
                    .registry
                    .record_outcome(key, Outcome::Failure { kind: failure })
                {
                    tracing::warn!("Dropped outcome for {}: {}", key, e);
                }

                if retry.should_retry(attempt + 1) {
                    retry
                        .backoff(self.clock.as_ref(), attempt, cancel)
                        .await
                        .map_err(|_| FetchError::Cancelled)?;
                }
            }
        }

        Err(FetchError::ChunkFetchExhausted {
            cid: cid.clone(),
            index,
            attempts,
        })
    }

    /// Re-sorts `chain` by current ranking: qualified providers in rank
    /// order, then disqualified ones in rank order. Unknown keys are dropped.
    pub fn rank_chain(&self, chain: &[ProviderKey]) -> Vec<ProviderKey> {
        let ranked = self.registry.ranked(false);
        let (qualified, disqualified): (Vec<_>, Vec<_>) = ranked
            .into_iter()
            .filter(|ranked| chain.contains(&ranked.provider.key))
            .partition(|ranked| !ranked.stats.is_disqualified());

        qualified
            .into_iter()
            .chain(disqualified)
            .map(|ranked| ranked.provider.key)
            .collect()
    }

    fn record_success(&self, key: &ProviderKey, bytes: usize, elapsed: Duration, latency: Duration) {
        let secs = elapsed.max(MIN_ELAPSED).as_secs_f64();
        let outcome = Outcome::Success {
            speed_bytes_per_sec: bytes as f64 / secs,
            latency_ms: latency.as_secs_f64() * 1000.0,
        };
        if let Err(e) = self.registry.record_outcome(key, outcome) {
            tracing::warn!("Dropped outcome for {}: {}", key, e);
        }
    }
}

/// Maps a response onto chunk data for `range`.
///
/// A `200` carrying the whole resource is sliced down to the range.
fn interpret(response: FetchResponse, range: ByteRange) -> Result<Attempt, FailureKind> {
    match response.status {
        206 => {
            let mut body = response.body;
            body.truncate(range.len() as usize);
            Ok(Attempt::Data(body))
        }
        200 => {
            let len = response.body.len() as u64;
            if range.start >= len {
                return Ok(Attempt::PastEnd);
            }
            let end = (range.end + 1).min(len);
            Ok(Attempt::Data(
                response.body.slice(range.start as usize..end as usize),
            ))
        }
        RANGE_NOT_SATISFIABLE => Ok(Attempt::PastEnd),
        status => Err(FailureKind::HttpStatus(status)),
    }
}
