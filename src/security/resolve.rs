//! DNS resolution that refuses private destinations.
//!
//! The textual SSRF guard runs before any lookup, so a public-looking name that
//! resolves to `10.0.0.1` would slip through. The upstream client uses this
//! resolver instead of the system one: it resolves the name, drops every
//! private, loopback or link-local address, and fails when nothing is left.
//! The connector only ever sees the surviving addresses.

use std::net::SocketAddr;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use crate::security::ssrf::is_private_ip;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to resolve {host}: {source}")]
    Lookup {
        host: String,
        source: std::io::Error,
    },
    #[error("{0} did not resolve to any address")]
    NoAddresses(String),
    #[error("{host} resolves only to private addresses ({blocked} refused)")]
    PrivateOnly { host: String, blocked: usize },
}

/// Resolver handed to the upstream HTTP client.
#[derive(Debug, Clone, Default)]
pub struct GuardedResolver;

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs = resolve_public(&host).await?;
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok::<Addrs, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

/// Resolve `host` and keep only addresses that are safe to connect to.
pub async fn resolve_public(host: &str) -> Result<Vec<SocketAddr>, ResolveError> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|source| ResolveError::Lookup {
            host: host.to_string(),
            source,
        })?
        .collect();

    if resolved.is_empty() {
        return Err(ResolveError::NoAddresses(host.to_string()));
    }

    let (public, blocked) = partition_public(resolved);
    if public.is_empty() {
        tracing::warn!(host = %host, blocked, "Refusing host that resolves only to private addresses");
        return Err(ResolveError::PrivateOnly {
            host: host.to_string(),
            blocked,
        });
    }
    if blocked > 0 {
        tracing::warn!(host = %host, blocked, "Dropped private addresses from resolution");
    }

    Ok(public)
}

/// Split resolved addresses into the public ones and a count of refused ones.
pub fn partition_public(addrs: Vec<SocketAddr>) -> (Vec<SocketAddr>, usize) {
    let total = addrs.len();
    let public: Vec<SocketAddr> = addrs
        .into_iter()
        .filter(|addr| !is_private_ip(addr.ip()))
        .collect();
    let blocked = total - public.len();
    (public, blocked)
}
