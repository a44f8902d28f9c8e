//! Chunk scheduling: ranged fetches across providers and the per-stream loop.
//!
//! Provides:
//! - [`ChunkScheduler`] fetching single chunks with retry and provider escalation
//! - [`ChunkStream`] keeping a lookahead window of chunks in flight for one CID
//! - [`FetchAdmission`] ordering every fetch of a scheduler by priority
//! - Priority lanes shared by the pending, ready and admission queues

pub mod admission;
pub mod chunk;
pub mod fetcher;
pub mod queue;
pub mod stream;

pub use admission::{AdmissionPermit, FetchAdmission};
pub use chunk::{Chunk, Priority};
pub use fetcher::ChunkScheduler;
pub use queue::PriorityLanes;
pub use stream::ChunkStream;

use crate::cid::Cid;

/// Errors that occur while fetching chunks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Every provider in the chain used up its attempts
    #[error("Chunk {index} of {cid} failed after {attempts} attempts")]
    ChunkFetchExhausted { cid: Cid, index: u64, attempts: u32 },

    #[error("Chunk fetch cancelled")]
    Cancelled,
}
