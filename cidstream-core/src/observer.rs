//! Playback event hooks for the presentation layer.

use std::fmt;

use crate::scheduler::Chunk;

/// Receives playback events. Hooks must not block and cannot fail.
pub trait PlaybackObserver: Send + Sync + fmt::Debug {
    /// A chunk was handed to the player.
    fn on_chunk_ready(&self, _chunk: &Chunk) {}

    /// A CID was given up on and removed from the rotation.
    fn on_load_failed(&self, _cid: &str) {}

    /// The player refused to start without a user gesture.
    fn on_autoplay_blocked(&self) {}

    /// A load started (`true`) or finished either way (`false`).
    fn on_spinner_update(&self, _is_loading: bool) {}
}

/// Observer ignoring every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PlaybackObserver for NoopObserver {}
