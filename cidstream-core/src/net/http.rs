//! reqwest-backed gateway transport.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, ORIGIN, RANGE};

use super::{FetchRequest, FetchResponse, Transport, TransportError};
use crate::config::NetworkConfig;
use crate::provider::CorsMode;

/// Production transport using a shared reqwest client.
///
/// For `cors` providers with a configured origin, the request carries an
/// `Origin` header and the response must allow it back. `no-cors` responses
/// are returned opaque, without a content type.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    origin: Option<String>,
}

impl HttpTransport {
    /// Builds the client from network settings.
    ///
    /// # Errors
    ///
    /// - `TransportError::Network` - TLS backend or client configuration failed
    pub fn new(config: &NetworkConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| TransportError::Network {
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            origin: config.origin.clone(),
        })
    }

    fn check_cors(&self, response: &reqwest::Response) -> Result<(), TransportError> {
        let Some(origin) = &self.origin else {
            return Ok(());
        };

        let allowed = response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|value| value.to_str().ok());

        match allowed {
            Some("*") => Ok(()),
            Some(value) if value == origin => Ok(()),
            Some(value) => Err(TransportError::Cors {
                reason: format!("origin {origin} not allowed (got {value})"),
            }),
            None => Err(TransportError::Cors {
                reason: "missing Access-Control-Allow-Origin".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        let mut builder = self.client.get(request.url.clone());

        if let Some(range) = request.range {
            builder = builder.header(RANGE, range.header_value());
        }
        if request.cors_mode == CorsMode::Cors
            && let Some(origin) = &self.origin
        {
            builder = builder.header(ORIGIN, origin);
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(classify)?;
        let first_byte_latency = started.elapsed();

        let opaque = request.cors_mode == CorsMode::NoCors;
        if !opaque {
            self.check_cors(&response)?;
        }

        let status = response.status().as_u16();
        let content_type = if opaque {
            None
        } else {
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        let body = response.bytes().await.map_err(classify)?;

        tracing::trace!(
            "GET {} -> {} ({} bytes, {:?})",
            request.url,
            status,
            body.len(),
            first_byte_latency
        );

        Ok(FetchResponse {
            status,
            content_type,
            body,
            opaque,
            first_byte_latency,
        })
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Network {
            reason: format!("Failed to connect: {error}"),
        }
    } else {
        TransportError::Network {
            reason: format!("HTTP request failed: {error}"),
        }
    }
}
