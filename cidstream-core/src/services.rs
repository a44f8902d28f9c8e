//! Shared delivery services wired from configuration.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::CidStreamConfig;
use crate::invalidation::InvalidationCache;
use crate::net::NetworkStack;
use crate::provider::ProviderRegistry;
use crate::scheduler::ChunkScheduler;
use crate::validator::CidValidator;

/// Components shared by the playback session and the preload warmer.
///
/// Built once per process; every field is cheap to clone.
#[derive(Debug, Clone)]
pub struct DeliveryServices {
    pub registry: Arc<ProviderRegistry>,
    pub invalidation: Arc<InvalidationCache>,
    pub validator: Arc<CidValidator>,
    pub scheduler: Arc<ChunkScheduler>,
    pub clock: Arc<dyn Clock>,
}

impl DeliveryServices {
    pub fn new(
        config: &CidStreamConfig,
        registry: Arc<ProviderRegistry>,
        invalidation: Arc<InvalidationCache>,
        network: NetworkStack,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = Arc::new(ChunkScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&network.transport),
            Arc::clone(&clock),
            config.scheduler.clone(),
        ));
        let validator = Arc::new(CidValidator::new(
            Arc::clone(&registry),
            Arc::clone(&invalidation),
            network,
            Arc::clone(&clock),
            config.validation.clone(),
        ));

        Self {
            registry,
            invalidation,
            validator,
            scheduler,
            clock,
        }
    }
}
