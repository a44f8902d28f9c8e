//! Gateway providers, their health statistics and performance ranking.
//!
//! Provides:
//! - Immutable provider descriptions built from URL templates
//! - Per-provider statistics updated through a single entry point
//! - Deterministic ranking with disqualification of failing providers

pub mod catalog;
pub mod registry;
pub mod stats;

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

pub use catalog::{ProviderCatalog, ProviderEntry};
pub use registry::{ProviderRegistry, RankedProvider};
pub use stats::{
    DISQUALIFICATION_THRESHOLD, FailureKind, LastError, Outcome, ProviderErrorState, ProviderStats,
};

use crate::cid::Cid;

/// Placeholder substituted with the CID in a URL template.
pub const CID_PLACEHOLDER: &str = "{cid}";

/// Identity of a registered provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderKey(String);

impl ProviderKey {
    /// Creates a key from any string-like value.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Cross-origin behavior of a provider, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CorsMode {
    /// Headers are readable and must be validated.
    #[default]
    Cors,
    /// Opaque responses; headers cannot be trusted or inspected.
    NoCors,
}

/// An HTTP gateway serving content behind a URL template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub key: ProviderKey,
    pub display_name: String,
    pub url_template: String,
    pub cors_mode: CorsMode,
}

impl Provider {
    /// Creates a provider description.
    ///
    /// # Errors
    ///
    /// - `ProviderError::InvalidTemplate` - Template lacks the `{cid}` placeholder
    pub fn new(
        key: impl Into<String>,
        display_name: impl Into<String>,
        url_template: impl Into<String>,
        cors_mode: CorsMode,
    ) -> Result<Self, ProviderError> {
        let key = ProviderKey::new(key);
        let url_template = url_template.into();

        if !url_template.contains(CID_PLACEHOLDER) {
            return Err(ProviderError::InvalidTemplate {
                key,
                template: url_template,
            });
        }

        Ok(Self {
            key,
            display_name: display_name.into(),
            url_template,
            cors_mode,
        })
    }

    /// Builds the URL serving `cid` from this provider.
    ///
    /// # Errors
    ///
    /// - `ProviderError::InvalidUrl` - Substituted template is not a valid URL
    pub fn url_for(&self, cid: &Cid) -> Result<Url, ProviderError> {
        let raw = self.url_template.replace(CID_PLACEHOLDER, cid.as_str());
        Url::parse(&raw).map_err(|e| ProviderError::InvalidUrl {
            key: self.key.clone(),
            reason: e.to_string(),
        })
    }
}

/// Errors raised by provider configuration and registration.
///
/// These are configuration faults and are not retried.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {key} is already registered")]
    DuplicateProvider { key: ProviderKey },

    #[error("Provider {key} is not registered")]
    UnknownProvider { key: ProviderKey },

    #[error("Provider {key} template {template:?} lacks the {{cid}} placeholder")]
    InvalidTemplate { key: ProviderKey, template: String },

    #[error("Provider {key} produced an invalid URL: {reason}")]
    InvalidUrl { key: ProviderKey, reason: String },

    #[error("Invalid provider catalog")]
    Catalog(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_requires_placeholder() {
        let result = Provider::new("bad", "Bad", "https://example.com/ipfs/", CorsMode::Cors);
        assert!(matches!(result, Err(ProviderError::InvalidTemplate { .. })));
    }

    #[test]
    fn test_url_substitution() {
        let provider = Provider::new(
            "dweb",
            "dweb.link",
            "https://{cid}.ipfs.dweb.link/",
            CorsMode::Cors,
        )
        .unwrap();
        let cid = Cid::parse("bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi").unwrap();

        let url = provider.url_for(&cid).unwrap();
        assert_eq!(
            url.host_str(),
            Some("bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi.ipfs.dweb.link")
        );
    }

    #[test]
    fn test_unparseable_url_is_reported() {
        let provider = Provider::new("broken", "Broken", "ht!tp://{cid}", CorsMode::Cors).unwrap();
        let cid = Cid::parse("QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG").unwrap();
        assert!(matches!(
            provider.url_for(&cid),
            Err(ProviderError::InvalidUrl { .. })
        ));
    }
}
