//! Media player capability driven by the playback session.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use url::Url;

use crate::cid::Cid;
use crate::provider::ProviderKey;
use crate::scheduler::Chunk;

/// Source handed to the player when a load succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub cid: Cid,
    pub provider: ProviderKey,
    pub url: Url,
}

/// Errors reported by a player.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlayerError {
    #[error("Autoplay blocked until user interaction")]
    AutoplayBlocked,

    #[error("Player rejected the request: {reason}")]
    Rejected { reason: String },
}

/// Back-pressure between chunk delivery and player consumption.
///
/// The session takes one credit per delivered chunk; the player returns
/// credits as it consumes buffered data.
#[derive(Debug, Clone)]
pub struct BufferDemand {
    credits: Arc<Semaphore>,
}

impl BufferDemand {
    /// Allows `buffered_chunks` chunks ahead of consumption.
    pub fn new(buffered_chunks: usize) -> Self {
        Self {
            credits: Arc::new(Semaphore::new(buffered_chunks.max(1))),
        }
    }

    /// Returns credits for `chunks` consumed chunks.
    pub fn consumed(&self, chunks: usize) {
        self.credits.add_permits(chunks);
    }

    /// Credits currently available.
    pub fn available(&self) -> usize {
        self.credits.available_permits()
    }

    /// Waits for and takes one credit. Returns false if demand was closed.
    pub(crate) async fn acquire(&self) -> bool {
        match self.credits.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Wakes pending acquirers with failure; used when a load ends.
    pub(crate) fn close(&self) {
        self.credits.close();
    }
}

/// Player driven by the session. Implementations must tolerate chunks
/// arriving out of index order; each carries its byte range.
#[async_trait]
pub trait Player: Send + Sync + fmt::Debug {
    /// Attaches a new source. Buffered chunks follow through `append_chunk`.
    ///
    /// # Errors
    ///
    /// - `PlayerError::Rejected` - Source could not be attached
    async fn set_source(&self, source: &MediaSource, demand: BufferDemand)
    -> Result<(), PlayerError>;

    /// Buffers one chunk of the current source.
    ///
    /// # Errors
    ///
    /// - `PlayerError::Rejected` - Chunk could not be buffered
    async fn append_chunk(&self, chunk: &Chunk) -> Result<(), PlayerError>;

    /// Detaches the current source and drops buffered data.
    async fn clear_source(&self);

    /// Starts playback.
    ///
    /// # Errors
    ///
    /// - `PlayerError::AutoplayBlocked` - Playback needs a user gesture
    async fn play(&self) -> Result<(), PlayerError>;

    async fn pause(&self);

    /// Moves the playhead to `byte_position` of the current source.
    ///
    /// # Errors
    ///
    /// - `PlayerError::Rejected` - Position outside the source
    async fn seek(&self, byte_position: u64) -> Result<(), PlayerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffer_demand_credits() {
        let demand = BufferDemand::new(2);
        assert!(demand.acquire().await);
        assert!(demand.acquire().await);
        assert_eq!(demand.available(), 0);

        demand.consumed(1);
        assert_eq!(demand.available(), 1);

        demand.close();
        assert!(!demand.acquire().await);
    }
}
