//! Network capabilities used by validation and chunk fetching.
//!
//! Gateways are reached only through these traits so the scheduler and the
//! validator run unchanged against reqwest, the system resolver, or the
//! scripted mocks in [`crate::testing`].

pub mod dns;
pub mod http;
pub mod media;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

pub use dns::SystemResolver;
pub use http::HttpTransport;
pub use media::{ContainerFormat, ContainerProbe, detect_container};

use crate::config::NetworkConfig;
use crate::provider::{CorsMode, FailureKind};

/// Inclusive byte range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Creates a range; `end` is clamped to be at least `start`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Range covered by chunk `index` of `chunk_size` bytes.
    pub fn for_chunk(index: u64, chunk_size: u64) -> Self {
        let start = index.saturating_mul(chunk_size);
        Self::new(start, start.saturating_add(chunk_size.saturating_sub(1)))
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; an inclusive range covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value of the HTTP `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// One ranged GET against a gateway.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub range: Option<ByteRange>,
    pub cors_mode: CorsMode,
}

/// Response of a gateway fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    /// Declared content type; `None` for opaque responses
    pub content_type: Option<String>,
    pub body: Bytes,
    /// Headers unavailable (`no-cors` provider)
    pub opaque: bool,
    /// Time from request to response headers
    pub first_byte_latency: Duration,
}

impl FetchResponse {
    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the declared content type is `video/*`.
    pub fn declares_video(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("video/"))
    }
}

/// Transport-level failures. HTTP statuses are reported in the response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Network failure: {reason}")]
    Network { reason: String },

    #[error("Cross-origin check failed: {reason}")]
    Cors { reason: String },

    #[error("Request timed out")]
    Timeout,
}

impl TransportError {
    /// Classification recorded against the provider.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Network { .. } => FailureKind::Network,
            Self::Cors { .. } => FailureKind::Cors,
            Self::Timeout => FailureKind::Timeout,
        }
    }
}

/// Hostname resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("Failed to resolve {host}: {reason}")]
    Lookup { host: String, reason: String },

    #[error("No address records for {host}")]
    NoRecords { host: String },
}

/// Playability probe failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("Sample does not decode as video: {reason}")]
    Undecodable { reason: String },
}

/// HTTP range fetches against gateways.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Performs one GET, optionally ranged.
    ///
    /// # Errors
    ///
    /// - `TransportError::Network` - Connection or body transfer failed
    /// - `TransportError::Cors` - Response failed the cross-origin check
    /// - `TransportError::Timeout` - No response within the request timeout
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError>;
}

/// Name resolution used by the reachability stage.
#[async_trait]
pub trait HostResolver: Send + Sync + fmt::Debug {
    /// Resolves `host` to at least one address.
    ///
    /// # Errors
    ///
    /// - `ResolveError::Lookup` - Resolver failed
    /// - `ResolveError::NoRecords` - Resolver returned nothing
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Confirms a leading sample decodes as a video container.
#[async_trait]
pub trait PlaybackProbe: Send + Sync + fmt::Debug {
    /// Inspects `sample`, fetched from `url`.
    ///
    /// # Errors
    ///
    /// - `ProbeError::Undecodable` - Sample is not a recognizable container
    async fn probe(&self, url: &Url, sample: &Bytes) -> Result<ContainerFormat, ProbeError>;
}

/// Bundle of the three network capabilities.
#[derive(Debug, Clone)]
pub struct NetworkStack {
    pub transport: Arc<dyn Transport>,
    pub resolver: Arc<dyn HostResolver>,
    pub probe: Arc<dyn PlaybackProbe>,
}

impl NetworkStack {
    /// Production stack: reqwest transport, system resolver, container sniffing.
    ///
    /// # Errors
    ///
    /// - `TransportError::Network` - HTTP client could not be built
    pub fn production(config: &NetworkConfig) -> Result<Self, TransportError> {
        Ok(Self {
            transport: Arc::new(HttpTransport::new(config)?),
            resolver: Arc::new(SystemResolver::new()),
            probe: Arc::new(ContainerProbe),
        })
    }
}
