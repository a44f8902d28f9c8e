//! cidstream core - multi-gateway delivery scheduler for CID-addressed video
//!
//! This crate validates which HTTP gateways can serve a content identifier,
//! ranks them by observed performance, streams fixed-size byte ranges from
//! the best of them with priority ordering and automatic recovery, and
//! serializes player commands so loads, seeks and playback changes never
//! race each other.

pub mod cid;
pub mod clock;
pub mod command;
pub mod config;
pub mod invalidation;
pub mod net;
pub mod observer;
pub mod player;
pub mod preload;
pub mod provider;
pub mod retry;
pub mod rotation;
pub mod scheduler;
pub mod services;
pub mod session;
pub mod tracing_setup;
pub mod validator;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types for convenient access
pub use cid::{Cid, CidError, CidVersion};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{
    Command, CommandError, CommandExecutor, CommandKind, CommandOutcome, CommandQueue, LoadTarget,
    spawn_command_queue,
};
pub use config::CidStreamConfig;
pub use invalidation::{FileStore, InvalidationCache, KeyValueStore, MemoryStore, StoreError};
pub use net::{NetworkStack, TransportError};
pub use observer::{NoopObserver, PlaybackObserver};
pub use player::{BufferDemand, MediaSource, Player, PlayerError};
pub use preload::PreloadManager;
pub use provider::{CorsMode, Provider, ProviderCatalog, ProviderError, ProviderKey, ProviderRegistry};
pub use retry::RetryPolicy;
pub use rotation::{Direction, Rotation};
pub use scheduler::{Chunk, ChunkScheduler, ChunkStream, FetchError, Priority};
pub use services::DeliveryServices;
pub use session::{PlaybackSession, PlayerState, SessionError, SessionStatus, StatusHandle};
pub use validator::{CidValidator, ValidationError, ValidationResult};

/// Errors that can bubble up from any cidstream subsystem.
#[derive(Debug, thiserror::Error)]
pub enum CidStreamError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("CID error: {0}")]
    Cid(#[from] CidError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CidStreamError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            CidStreamError::Cid(e) => e.to_string(),
            CidStreamError::Validation(e) => match e {
                ValidationError::MalformedCid(e) => e.to_string(),
                ValidationError::MarkedInvalid { cid } => {
                    format!("{cid} failed recently and is skipped for now")
                }
                ValidationError::NoAvailableProvider { .. } => {
                    "No gateway is available right now".to_string()
                }
                ValidationError::AllProvidersFailed { cid, .. } => {
                    format!("No gateway could serve {cid}")
                }
                ValidationError::Cancelled => "Validation was cancelled".to_string(),
            },
            CidStreamError::Fetch(FetchError::ChunkFetchExhausted { cid, .. }) => {
                format!("Could not download {cid} from any gateway")
            }
            CidStreamError::Fetch(FetchError::Cancelled) => "Download was cancelled".to_string(),
            CidStreamError::Command(CommandError::Timeout { kind, .. }) => {
                format!("The {kind} request took too long")
            }
            CidStreamError::Command(_) | CidStreamError::Session(_) => {
                "Playback error occurred".to_string()
            }
            CidStreamError::Provider(_) | CidStreamError::Configuration { .. } => {
                "Configuration error occurred".to_string()
            }
            CidStreamError::Store(_) | CidStreamError::Io(_) => {
                "File system error occurred".to_string()
            }
            CidStreamError::Transport(_) => "Network error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            CidStreamError::Configuration { .. }
                | CidStreamError::Cid(_)
                | CidStreamError::Validation(ValidationError::MalformedCid(_))
                | CidStreamError::Provider(ProviderError::InvalidTemplate { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, CidStreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_cid_is_user_error() {
        let error: CidStreamError = Cid::parse("not-a-cid").unwrap_err().into();
        assert!(error.is_user_error());
        assert!(error.user_message().contains("not-a-cid"));
    }

    #[test]
    fn test_timeout_message_names_command() {
        let error = CidStreamError::from(CommandError::Timeout {
            kind: CommandKind::Seek,
            timeout: std::time::Duration::from_secs(1),
        });
        assert!(!error.is_user_error());
        assert_eq!(error.user_message(), "The seek request took too long");
    }
}
