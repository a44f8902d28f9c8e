//! Two-stage source validation for a CID.
//!
//! A provider can serve a CID when its host resolves (reachability) and a
//! small leading range decodes as video (playability). Reachability runs
//! for every candidate in parallel; playability is a race with staggered
//! deadlines where the first passing candidate wins.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cid::{Cid, CidError};
use crate::clock::{self, Clock};
use crate::config::ValidationConfig;
use crate::invalidation::InvalidationCache;
use crate::net::{ByteRange, FetchRequest, NetworkStack, ResolveError};
use crate::provider::{FailureKind, Outcome, Provider, ProviderKey, ProviderRegistry};

/// Winning source for a CID plus the fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub cid: Cid,
    pub provider: ProviderKey,
    pub url: Url,
    /// Providers that passed reachability, winner first
    pub reachable: Vec<ProviderKey>,
}

/// Errors that occur while validating a CID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    MalformedCid(#[from] CidError),

    #[error("CID {cid} is marked invalid")]
    MarkedInvalid { cid: Cid },

    #[error("No provider available for {cid}")]
    NoAvailableProvider { cid: Cid },

    #[error("All {candidates} candidate providers failed for {cid}")]
    AllProvidersFailed { cid: Cid, candidates: usize },

    #[error("Validation cancelled")]
    Cancelled,
}

impl ValidationError {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoAvailableProvider { .. } | Self::AllProvidersFailed { .. }
        )
    }
}

/// Determines which providers can serve a CID right now.
#[derive(Debug)]
pub struct CidValidator {
    registry: Arc<ProviderRegistry>,
    invalidation: Arc<InvalidationCache>,
    network: NetworkStack,
    clock: Arc<dyn Clock>,
    config: ValidationConfig,
    rng: Mutex<ChaCha8Rng>,
}

impl CidValidator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        invalidation: Arc<InvalidationCache>,
        network: NetworkStack,
        clock: Arc<dyn Clock>,
        config: ValidationConfig,
    ) -> Self {
        let seed = config.shuffle_seed.unwrap_or_else(rand::random);
        Self {
            registry,
            invalidation,
            network,
            clock,
            config,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    /// Parses `raw` and validates it.
    ///
    /// # Errors
    ///
    /// - `ValidationError::MalformedCid` - Not a canonical CID; no network call made
    /// - See [`validate_cid`](Self::validate_cid) for the rest
    pub async fn validate(
        &self,
        raw: &str,
        cancel: &CancellationToken,
    ) -> Result<ValidationResult, ValidationError> {
        let cid = Cid::parse(raw)?;
        self.validate_cid(&cid, cancel).await
    }

    /// Finds the provider to stream `cid` from.
    ///
    /// # Errors
    ///
    /// - `ValidationError::MarkedInvalid` - CID failed recently
    /// - `ValidationError::NoAvailableProvider` - Registry empty or fully disqualified
    /// - `ValidationError::AllProvidersFailed` - No candidate passed both stages
    /// - `ValidationError::Cancelled` - `cancel` fired
    pub async fn validate_cid(
        &self,
        cid: &Cid,
        cancel: &CancellationToken,
    ) -> Result<ValidationResult, ValidationError> {
        if self.invalidation.is_invalid(cid) {
            tracing::debug!("Skipping {}: marked invalid", cid);
            return Err(ValidationError::MarkedInvalid { cid: cid.clone() });
        }

        let ordered = self.candidate_order();
        if ordered.is_empty() {
            tracing::warn!("No qualified provider for {}", cid);
            return Err(ValidationError::NoAvailableProvider { cid: cid.clone() });
        }

        let candidates: Vec<(Provider, Url)> = ordered
            .into_iter()
            .filter_map(|provider| match provider.url_for(cid) {
                Ok(url) => Some((provider, url)),
                Err(e) => {
                    tracing::warn!("Dropping candidate: {}", e);
                    None
                }
            })
            .collect();

        let reachable = self.reachability_stage(&candidates, cancel).await?;
        tracing::debug!(
            "{} of {} candidates reachable for {}",
            reachable.len(),
            candidates.len(),
            cid
        );
        if reachable.is_empty() {
            return Err(ValidationError::AllProvidersFailed {
                cid: cid.clone(),
                candidates: candidates.len(),
            });
        }

        let (winner, failures) = self.playability_stage(&reachable, cancel).await?;
        let Some(winner) = winner else {
            for (index, kind) in failures {
                let key = &reachable[index].0.key;
                if let Err(e) = self.registry.record_outcome(key, Outcome::Failure { kind }) {
                    tracing::warn!("Dropped outcome for {}: {}", key, e);
                }
            }
            tracing::warn!("Every reachable provider failed playability for {}", cid);
            return Err(ValidationError::AllProvidersFailed {
                cid: cid.clone(),
                candidates: reachable.len(),
            });
        };

        let (provider, url) = &reachable[winner];
        let mut chain = vec![provider.key.clone()];
        chain.extend(
            reachable
                .iter()
                .enumerate()
                .filter(|(index, _)| *index != winner)
                .map(|(_, (provider, _))| provider.key.clone()),
        );

        tracing::info!("Validated {} via {}", cid, provider.key);
        Ok(ValidationResult {
            cid: cid.clone(),
            provider: provider.key.clone(),
            url: url.clone(),
            reachable: chain,
        })
    }

    /// Qualified providers in rank order, shuffled within equal scores.
    fn candidate_order(&self) -> Vec<Provider> {
        let ranked = self.registry.ranked(true);
        let mut rng = self.rng.lock();

        ranked
            .chunk_by(|a, b| a.score.total_cmp(&b.score).is_eq())
            .flat_map(|group| {
                let mut group: Vec<Provider> =
                    group.iter().map(|ranked| ranked.provider.clone()).collect();
                group.shuffle(&mut *rng);
                group
            })
            .collect()
    }

    async fn reachability_stage(
        &self,
        candidates: &[(Provider, Url)],
        cancel: &CancellationToken,
    ) -> Result<Vec<(Provider, Url)>, ValidationError> {
        let lookups = candidates.iter().map(|(_, url)| self.resolve(url, cancel));
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ValidationError::Cancelled),
            results = join_all(lookups) => results,
        };

        Ok(candidates
            .iter()
            .zip(results)
            .filter_map(|(candidate, result)| match result {
                Ok(()) => Some(candidate.clone()),
                Err(e) => {
                    tracing::debug!("Provider {} unreachable: {}", candidate.0.key, e);
                    None
                }
            })
            .collect())
    }

    async fn resolve(&self, url: &Url, cancel: &CancellationToken) -> Result<(), ResolveError> {
        let Some(host) = url.host_str() else {
            return Err(ResolveError::NoRecords {
                host: url.to_string(),
            });
        };
        let policy = &self.config.resolve_retry;

        let mut attempt = 0;
        loop {
            let error = match self.network.resolver.resolve(host).await {
                Ok(addrs) if !addrs.is_empty() => return Ok(()),
                Ok(_) => ResolveError::NoRecords {
                    host: host.to_string(),
                },
                Err(e) => e,
            };

            attempt += 1;
            if !policy.should_retry(attempt) {
                return Err(error);
            }
            if policy
                .backoff(self.clock.as_ref(), attempt - 1, cancel)
                .await
                .is_err()
            {
                return Err(error);
            }
        }
    }

    /// Races probes; returns the winning index or every failure.
    async fn playability_stage(
        &self,
        reachable: &[(Provider, Url)],
        cancel: &CancellationToken,
    ) -> Result<(Option<usize>, Vec<(usize, FailureKind)>), ValidationError> {
        let mut race: FuturesUnordered<_> = reachable
            .iter()
            .enumerate()
            .map(|(index, (provider, url))| {
                let deadline = self.deadline_for(index);
                async move {
                    let outcome =
                        clock::timeout(self.clock.as_ref(), deadline, self.probe(provider, url))
                            .await;
                    (index, outcome.unwrap_or(Err(FailureKind::Timeout)))
                }
            })
            .collect();

        let mut failures = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ValidationError::Cancelled),
                next = race.next() => next,
            };

            match next {
                Some((index, Ok(()))) => return Ok((Some(index), failures)),
                Some((index, Err(kind))) => {
                    tracing::debug!(
                        "Provider {} failed playability: {:?}",
                        reachable[index].0.key,
                        kind
                    );
                    failures.push((index, kind));
                }
                None => return Ok((None, failures)),
            }
        }
    }

    /// Deadline of candidate `index`: `base + index * stagger`.
    fn deadline_for(&self, index: usize) -> Duration {
        let stagger = self
            .config
            .probe_stagger
            .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));
        self.config.base_probe_timeout.saturating_add(stagger)
    }

    async fn probe(&self, provider: &Provider, url: &Url) -> Result<(), FailureKind> {
        let request = FetchRequest {
            url: url.clone(),
            range: Some(ByteRange::new(0, self.config.probe_bytes.saturating_sub(1))),
            cors_mode: provider.cors_mode,
        };
        let response = self
            .network
            .transport
            .fetch(request)
            .await
            .map_err(|e| e.failure_kind())?;

        // Opaque responses expose neither status nor headers
        if !response.opaque {
            if !response.is_success() {
                return Err(FailureKind::HttpStatus(response.status));
            }
            if !response.declares_video() {
                return Err(FailureKind::NotVideo);
            }
        }

        self.network
            .probe
            .probe(url, &response.body)
            .await
            .map_err(|_| FailureKind::Undecodable)?;
        Ok(())
    }
}
