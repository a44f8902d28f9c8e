//! Provider catalogue loaded from configuration.
//!
//! The catalogue is a JSON object mapping provider keys to their display
//! name, URL template and cross-origin mode. Entry order is preserved and
//! becomes registration order, which is the final ranking tie-breaker.

use serde::{Deserialize, Serialize};

use super::{CorsMode, Provider, ProviderError};

/// Provider entry as written in a catalogue file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEntry {
    pub display_name: String,
    pub url_template: String,
    #[serde(default)]
    pub cors_mode: CorsMode,
}

/// Ordered provider catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderCatalog {
    entries: Vec<(String, ProviderEntry)>,
}

impl ProviderCatalog {
    /// Parses a catalogue from its JSON representation.
    ///
    /// # Errors
    ///
    /// - `ProviderError::Catalog` - Not a JSON object of provider entries
    pub fn from_json(json: &str) -> Result<Self, ProviderError> {
        // serde_json's Map does not keep insertion order without the
        // preserve_order feature, so walk the object by hand.
        let entries: OrderedEntries = serde_json::from_str(json)?;
        Ok(Self { entries: entries.0 })
    }

    /// Appends an entry, builder style.
    pub fn with_entry(mut self, key: impl Into<String>, entry: ProviderEntry) -> Self {
        self.entries.push((key.into(), entry));
        self
    }

    /// Public gateways used when no catalogue is configured.
    pub fn builtin() -> Self {
        let gateways = [
            ("ipfs-io", "ipfs.io", "https://ipfs.io/ipfs/{cid}", CorsMode::Cors),
            (
                "dweb-link",
                "dweb.link",
                "https://dweb.link/ipfs/{cid}",
                CorsMode::Cors,
            ),
            (
                "w3s-link",
                "w3s.link",
                "https://w3s.link/ipfs/{cid}",
                CorsMode::Cors,
            ),
            (
                "4everland",
                "4EVERLAND",
                "https://4everland.io/ipfs/{cid}",
                CorsMode::Cors,
            ),
            (
                "pinata",
                "Pinata",
                "https://gateway.pinata.cloud/ipfs/{cid}",
                CorsMode::NoCors,
            ),
        ];

        gateways
            .into_iter()
            .fold(Self::default(), |catalog, (key, name, template, cors)| {
                catalog.with_entry(
                    key,
                    ProviderEntry {
                        display_name: name.to_string(),
                        url_template: template.to_string(),
                        cors_mode: cors,
                    },
                )
            })
    }

    /// Builds provider descriptions in catalogue order.
    ///
    /// # Errors
    ///
    /// - `ProviderError::InvalidTemplate` - An entry lacks the `{cid}` placeholder
    pub fn providers(&self) -> Result<Vec<Provider>, ProviderError> {
        self.entries
            .iter()
            .map(|(key, entry)| {
                Provider::new(
                    key.as_str(),
                    entry.display_name.as_str(),
                    entry.url_template.as_str(),
                    entry.cors_mode,
                )
            })
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalogue has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct OrderedEntries(Vec<(String, ProviderEntry)>);

impl<'de> Deserialize<'de> for OrderedEntries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> serde::de::Visitor<'de> for EntriesVisitor {
            type Value = OrderedEntries;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a map of provider key to provider entry")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((key, entry)) = map.next_entry::<String, ProviderEntry>()? {
                    entries.push((key, entry));
                }
                Ok(OrderedEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_catalog_keeps_order() {
        let json = r#"{
            "zeta": {"displayName": "Zeta", "urlTemplate": "https://zeta.test/ipfs/{cid}"},
            "alpha": {"displayName": "Alpha", "urlTemplate": "https://{cid}.alpha.test", "corsMode": "no-cors"}
        }"#;

        let catalog = ProviderCatalog::from_json(json).unwrap();
        let providers = catalog.providers().unwrap();

        assert_eq!(providers[0].key.as_str(), "zeta");
        assert_eq!(providers[0].cors_mode, CorsMode::Cors);
        assert_eq!(providers[1].key.as_str(), "alpha");
        assert_eq!(providers[1].cors_mode, CorsMode::NoCors);
    }

    #[test]
    fn test_missing_placeholder_is_fatal() {
        let json = r#"{"bad": {"displayName": "Bad", "urlTemplate": "https://bad.test/"}}"#;
        let catalog = ProviderCatalog::from_json(json).unwrap();
        assert!(matches!(
            catalog.providers(),
            Err(ProviderError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn test_builtin_catalog_is_valid() {
        let catalog = ProviderCatalog::builtin();
        assert_eq!(catalog.providers().unwrap().len(), catalog.len());
        assert!(!catalog.is_empty());
    }
}
