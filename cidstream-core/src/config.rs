//! Centralized configuration for cidstream.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Size of one scheduled byte range.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024; // 1 MiB

/// How long an invalid-CID mark suppresses a CID.
pub const INVALID_CID_WINDOW: Duration = Duration::from_secs(48 * 60 * 60);

/// Central configuration for all cidstream components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct CidStreamConfig {
    pub validation: ValidationConfig,
    pub scheduler: SchedulerConfig,
    pub command: CommandConfig,
    pub preload: PreloadConfig,
    pub session: SessionConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

/// Two-stage provider validation settings.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Deadline for the first candidate in the playability race
    pub base_probe_timeout: Duration,
    /// Extra deadline granted to each later candidate
    pub probe_stagger: Duration,
    /// Leading bytes fetched by a playability probe
    pub probe_bytes: u64,
    /// Retry policy for hostname resolution
    pub resolve_retry: RetryPolicy,
    /// Seed for shuffling equally ranked providers (None = entropy)
    pub shuffle_seed: Option<u64>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            base_probe_timeout: Duration::from_millis(5000),
            probe_stagger: Duration::from_millis(1000),
            probe_bytes: 64 * 1024, // 64 KiB
            resolve_retry: RetryPolicy::host_resolution(),
            shuffle_seed: None,
        }
    }
}

/// Chunk fetching and streaming loop settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Bytes per chunk
    pub chunk_size: u64,
    /// Chunks scheduled when a stream starts (first one critical)
    pub lookahead: u64,
    /// Concurrent chunk fetches per stream
    pub max_in_flight: usize,
    /// Concurrent transport requests across every stream and preload
    pub max_concurrent_fetches: usize,
    /// Buffer-recovery reissues per chunk before giving up
    pub max_recoveries: u32,
    /// Per-provider retry policy
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            lookahead: 2,
            max_in_flight: 3,
            max_concurrent_fetches: 4,
            max_recoveries: 2,
            retry: RetryPolicy::chunk_fetch(),
        }
    }
}

/// Command queue settings.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Timeout applied when a command is enqueued without one
    pub default_timeout: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Preload warmer settings.
#[derive(Debug, Clone)]
pub struct PreloadConfig {
    /// Upcoming CIDs considered for warming
    pub lookahead_depth: usize,
    /// CIDs preloaded at the same time
    pub max_concurrent: usize,
    /// Validation results kept for reuse by later loads
    pub warmed_capacity: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            lookahead_depth: 3,
            max_concurrent: 2,
            warmed_capacity: 8,
        }
    }
}

/// Playback session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Caller-level retry for next/previous loads
    pub load_retry: RetryPolicy,
    /// Chunks the feeder may deliver ahead of player consumption
    pub buffer_chunks: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            load_retry: RetryPolicy::caller_load(),
            buffer_chunks: 4,
        }
    }
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Whole-request timeout for gateway fetches
    pub request_timeout: Duration,
    /// TCP/TLS connect timeout
    pub connect_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Origin sent to `cors` providers; responses must echo it back
    pub origin: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: "cidstream/0.1.0",
            origin: None,
        }
    }
}

/// Persisted state configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding persisted key-value state
    pub state_dir: PathBuf,
    /// Temporary file suffix used for atomic writes
    pub temp_file_suffix: &'static str,
    /// Validity window of an invalid-CID mark
    pub invalid_cid_window: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            temp_file_suffix: ".tmp",
            invalid_cid_window: INVALID_CID_WINDOW,
        }
    }
}

impl CidStreamConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("CIDSTREAM_PROBE_TIMEOUT_MS") {
            config.validation.base_probe_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("CIDSTREAM_PROBE_STAGGER_MS") {
            config.validation.probe_stagger = Duration::from_millis(ms);
        }

        if let Some(seed) = env_parse::<u64>("CIDSTREAM_SHUFFLE_SEED") {
            config.validation.shuffle_seed = Some(seed);
        }

        if let Some(lookahead) = env_parse::<u64>("CIDSTREAM_LOOKAHEAD") {
            config.scheduler.lookahead = lookahead.max(1);
        }

        if let Some(count) = env_parse::<usize>("CIDSTREAM_MAX_FETCHES") {
            config.scheduler.max_concurrent_fetches = count.max(1);
        }

        if let Some(count) = env_parse::<usize>("CIDSTREAM_PRELOAD_CONCURRENCY") {
            config.preload.max_concurrent = count.max(1);
        }

        if let Ok(dir) = std::env::var("CIDSTREAM_STATE_DIR") {
            config.storage.state_dir = PathBuf::from(dir);
        }

        if let Ok(origin) = std::env::var("CIDSTREAM_ORIGIN") {
            config.network.origin = Some(origin);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Fixed shuffle seed and short probe deadlines so races resolve quickly
    /// under a paused runtime.
    pub fn for_testing() -> Self {
        Self {
            validation: ValidationConfig {
                base_probe_timeout: Duration::from_millis(500),
                probe_stagger: Duration::from_millis(100),
                shuffle_seed: Some(42),
                ..Default::default()
            },
            command: CommandConfig {
                default_timeout: Duration::from_secs(5),
            },
            ..Default::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = CidStreamConfig::default();

        assert_eq!(config.scheduler.chunk_size, 1_048_576);
        assert_eq!(config.scheduler.lookahead, 2);
        assert_eq!(config.scheduler.max_concurrent_fetches, 4);
        assert_eq!(config.scheduler.retry.max_attempts, 3);
        assert_eq!(
            config.validation.base_probe_timeout,
            Duration::from_millis(5000)
        );
        assert_eq!(config.validation.probe_stagger, Duration::from_millis(1000));
        assert_eq!(config.preload.lookahead_depth, 3);
        assert_eq!(config.preload.max_concurrent, 2);
        assert_eq!(config.session.load_retry.max_attempts, 5);
        assert_eq!(config.session.load_retry.max_delay, Duration::from_secs(10));
        assert_eq!(
            config.storage.invalid_cid_window,
            Duration::from_secs(172_800)
        );
    }

    #[test]
    fn test_testing_preset_is_deterministic() {
        let config = CidStreamConfig::for_testing();
        assert_eq!(config.validation.shuffle_seed, Some(42));
        assert!(config.validation.base_probe_timeout < Duration::from_secs(1));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("CIDSTREAM_PROBE_TIMEOUT_MS", "2500");
            std::env::set_var("CIDSTREAM_LOOKAHEAD", "0");
            std::env::set_var("CIDSTREAM_PRELOAD_CONCURRENCY", "4");
            std::env::set_var("CIDSTREAM_STATE_DIR", "/tmp/cidstream-state");
        }

        let config = CidStreamConfig::from_env();

        assert_eq!(
            config.validation.base_probe_timeout,
            Duration::from_millis(2500)
        );
        assert_eq!(config.scheduler.lookahead, 1); // Clamped
        assert_eq!(config.preload.max_concurrent, 4);
        assert_eq!(
            config.storage.state_dir,
            PathBuf::from("/tmp/cidstream-state")
        );

        // Cleanup
        unsafe {
            std::env::remove_var("CIDSTREAM_PROBE_TIMEOUT_MS");
            std::env::remove_var("CIDSTREAM_LOOKAHEAD");
            std::env::remove_var("CIDSTREAM_PRELOAD_CONCURRENCY");
            std::env::remove_var("CIDSTREAM_STATE_DIR");
        }
    }
}
