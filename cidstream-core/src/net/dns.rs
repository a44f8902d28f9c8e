//! System name resolution.

use std::net::IpAddr;

use async_trait::async_trait;

use super::{HostResolver, ResolveError};

/// Resolver backed by `tokio::net::lookup_host`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl SystemResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        // Literal addresses need no lookup
        if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 443))
            .await
            .map_err(|e| ResolveError::Lookup {
                host: host.to_string(),
                reason: e.to_string(),
            })?
            .map(|addr| addr.ip())
            .collect();

        if addrs.is_empty() {
            return Err(ResolveError::NoRecords {
                host: host.to_string(),
            });
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_address_skips_lookup() {
        let resolver = SystemResolver::new();
        let addrs = resolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(addrs, vec![IpAddr::from([127, 0, 0, 1])]);

        let addrs = resolver.resolve("[::1]").await.unwrap();
        assert!(addrs[0].is_loopback());
    }
}
