//! Chunk and priority types.

use bytes::Bytes;

use crate::cid::Cid;
use crate::net::ByteRange;
use crate::provider::ProviderKey;

/// Scheduling priority of a chunk fetch, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Throwaway warm-up fetch for an upcoming CID
    Preload,
    Normal,
    High,
    /// Playback is blocked on this chunk
    Critical,
}

/// One fetched byte range of a CID's media.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub cid: Cid,
    pub index: u64,
    pub byte_range: ByteRange,
    pub priority: Priority,
    pub data: Bytes,
    pub provider_used: ProviderKey,
}

impl Chunk {
    /// Whether the payload is shorter than the requested range, ending the resource.
    pub fn is_final(&self) -> bool {
        (self.data.len() as u64) < self.byte_range.len()
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
