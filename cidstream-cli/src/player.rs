//! Headless player for running sessions without a display.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cidstream_core::scheduler::Chunk;
use cidstream_core::{BufferDemand, MediaSource, Player, PlayerError};
use tokio::sync::Mutex;

/// Player that counts buffered bytes and discards them immediately.
#[derive(Debug, Default)]
pub struct HeadlessPlayer {
    demand: Mutex<Option<BufferDemand>>,
    buffered_bytes: AtomicU64,
    buffered_chunks: AtomicU64,
}

impl HeadlessPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes appended since the last source change.
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    pub fn buffered_chunks(&self) -> u64 {
        self.buffered_chunks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Player for HeadlessPlayer {
    async fn set_source(
        &self,
        source: &MediaSource,
        demand: BufferDemand,
    ) -> Result<(), PlayerError> {
        tracing::info!("Source set: {} via {} ({})", source.cid, source.provider, source.url);
        self.buffered_bytes.store(0, Ordering::Relaxed);
        self.buffered_chunks.store(0, Ordering::Relaxed);
        *self.demand.lock().await = Some(demand);
        Ok(())
    }

    async fn append_chunk(&self, chunk: &Chunk) -> Result<(), PlayerError> {
        self.buffered_bytes
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        self.buffered_chunks.fetch_add(1, Ordering::Relaxed);
        if let Some(demand) = self.demand.lock().await.as_ref() {
            demand.consumed(1);
        }
        Ok(())
    }

    async fn clear_source(&self) {
        *self.demand.lock().await = None;
    }

    async fn play(&self) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn pause(&self) {}

    async fn seek(&self, byte_position: u64) -> Result<(), PlayerError> {
        tracing::debug!("Seek to byte {}", byte_position);
        Ok(())
    }
}
