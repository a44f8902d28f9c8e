//! Per-provider health statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors since the last reset at which a provider stops being ranked.
pub const DISQUALIFICATION_THRESHOLD: u64 = 3;

/// Classification of a failed provider interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum FailureKind {
    /// Connection or transfer failure
    Network,
    /// Cross-origin policy rejected the response
    Cors,
    /// No response before the deadline
    Timeout,
    /// Non-success HTTP status
    HttpStatus(u16),
    /// Response did not declare a video content type
    NotVideo,
    /// Bytes could not be decoded as a video container
    Undecodable,
}

/// Result of one provider interaction, reported to the registry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Success {
        speed_bytes_per_sec: f64,
        latency_ms: f64,
    },
    Failure {
        kind: FailureKind,
    },
}

/// Most recent failure of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: FailureKind,
    pub at: DateTime<Utc>,
}

/// Running health statistics of one provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderStats {
    pub success_count: u64,
    pub error_count: u64,
    pub cors_error_count: u64,
    pub avg_speed_bytes_per_sec: f64,
    pub avg_latency_ms: f64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
}

/// Error counters persisted across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderErrorState {
    pub error_count: u64,
    pub cors_error_count: u64,
    pub last_error: Option<LastError>,
}

impl ProviderStats {
    /// Applies one outcome observed at `at`.
    ///
    /// Successes update the running means with count-weighted incremental
    /// averaging over the post-increment success count.
    pub fn apply(&mut self, outcome: Outcome, at: DateTime<Utc>) {
        match outcome {
            Outcome::Success {
                speed_bytes_per_sec,
                latency_ms,
            } => {
                self.success_count += 1;
                let n = self.success_count as f64;
                self.avg_speed_bytes_per_sec =
                    (self.avg_speed_bytes_per_sec * (n - 1.0) + speed_bytes_per_sec) / n;
                self.avg_latency_ms = (self.avg_latency_ms * (n - 1.0) + latency_ms) / n;
                self.last_used_at = Some(at);
            }
            Outcome::Failure { kind } => {
                self.error_count += 1;
                if kind == FailureKind::Cors {
                    self.cors_error_count += 1;
                }
                self.last_error = Some(LastError { kind, at });
            }
        }
    }

    /// Whether the provider is excluded from default ranking.
    pub fn is_disqualified(&self) -> bool {
        self.error_count >= DISQUALIFICATION_THRESHOLD
    }

    /// Error counters for persistence.
    pub fn error_state(&self) -> ProviderErrorState {
        ProviderErrorState {
            error_count: self.error_count,
            cors_error_count: self.cors_error_count,
            last_error: self.last_error,
        }
    }

    /// Restores persisted error counters, keeping performance figures.
    pub fn restore_errors(&mut self, state: &ProviderErrorState) {
        self.error_count = state.error_count;
        self.cors_error_count = state.cors_error_count;
        self.last_error = state.last_error;
    }
}
