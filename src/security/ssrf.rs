//! SSRF guard: decides whether a syntactically valid target may be fetched.
//!
//! Rules run in order and the first violation wins:
//! 1. scheme allowlist (`http`, `https`)
//! 2. literal IP hosts are refused outright
//! 3. private, loopback and link-local host names (textual, pre-resolution)
//! 4. optional domain allowlist
//!
//! Rule 3 cannot see what a name resolves to. DNS rebinding is handled at
//! connect time by [`crate::security::resolve::GuardedResolver`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use super::{host_matches, normalize_host, SecurityVerdict};

/// Rule identifiers reported in `matched_rule`.
pub mod rules {
    pub const SCHEME: &str = "ssrf.scheme";
    pub const IP_LITERAL: &str = "ssrf.ip-literal";
    pub const PRIVATE_HOST: &str = "ssrf.private-host";
    pub const DOMAIN_ALLOWLIST: &str = "ssrf.domain-allowlist";
}

#[derive(Debug, Clone, Default)]
pub struct SsrfGuard {
    domain_allowlist: Vec<String>,
}

impl SsrfGuard {
    pub fn new(domain_allowlist: Vec<String>) -> Self {
        Self {
            domain_allowlist: domain_allowlist
                .iter()
                .map(|entry| normalize_host(entry))
                .filter(|entry| !entry.is_empty())
                .collect(),
        }
    }

    pub fn evaluate(&self, url: &Url) -> SecurityVerdict {
        let verdict = self.check(url);
        if let Some(rule) = &verdict.matched_rule {
            tracing::warn!(
                rule = %rule,
                host = url.host_str().unwrap_or(""),
                reason = verdict.reason.as_deref().unwrap_or(""),
                "SSRF guard denied target"
            );
        }
        verdict
    }

    fn check(&self, url: &Url) -> SecurityVerdict {
        if !matches!(url.scheme(), "http" | "https") {
            return SecurityVerdict::deny(
                rules::SCHEME,
                format!("scheme '{}' is not allowed", url.scheme()),
            );
        }

        let domain = match url.host() {
            Some(Host::Domain(domain)) => normalize_host(domain),
            Some(Host::Ipv4(ip)) => {
                return SecurityVerdict::deny(
                    rules::IP_LITERAL,
                    format!("IP literal host {ip} is not allowed"),
                )
            }
            Some(Host::Ipv6(ip)) => {
                return SecurityVerdict::deny(
                    rules::IP_LITERAL,
                    format!("IP literal host [{ip}] is not allowed"),
                )
            }
            None => return SecurityVerdict::deny(rules::PRIVATE_HOST, "target has no host"),
        };

        if is_private_host(&domain) {
            return SecurityVerdict::deny(
                rules::PRIVATE_HOST,
                format!("host '{domain}' names a private or loopback network"),
            );
        }

        if !self.domain_allowlist.is_empty()
            && !self
                .domain_allowlist
                .iter()
                .any(|entry| host_matches(&domain, entry))
        {
            return SecurityVerdict::deny(
                rules::DOMAIN_ALLOWLIST,
                format!("host '{domain}' is not on the domain allowlist"),
            );
        }

        SecurityVerdict::allow()
    }
}

/// Textual private-network heuristic over a host name or bracketed IPv6 literal.
pub fn is_private_host(host: &str) -> bool {
    let host = normalize_host(host);
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if host == "localhost"
        || host.ends_with(".localhost")
        || host == "ip6-localhost"
        || host == "ip6-loopback"
    {
        return true;
    }

    if host.contains(':') {
        return host == "::"
            || host == "::1"
            || host.starts_with("fe8")
            || host.starts_with("fe9")
            || host.starts_with("fea")
            || host.starts_with("feb")
            || host.starts_with("fc")
            || host.starts_with("fd")
            || host.starts_with("::ffff:");
    }

    if ["10.", "127.", "192.168.", "169.254.", "0."]
        .iter()
        .any(|prefix| host.starts_with(prefix))
    {
        return true;
    }

    if let Some(rest) = host.strip_prefix("172.") {
        if let Some(second) = rest.split('.').next().and_then(|s| s.parse::<u8>().ok()) {
            return (16..=31).contains(&second);
        }
    }

    false
}

/// Whether an address must never be connected to on behalf of a client.
pub fn is_private_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

fn is_private_ipv4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_unspecified()
        || octets[0] == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
}

fn is_private_ipv6(addr: Ipv6Addr) -> bool {
    if addr.is_loopback() || addr.is_unspecified() {
        return true;
    }
    let segments = addr.segments();
    // fe80::/10 link-local, fc00::/7 unique-local
    if segments[0] & 0xFFC0 == 0xFE80 || segments[0] & 0xFE00 == 0xFC00 {
        return true;
    }
    match addr.to_ipv4_mapped() {
        Some(v4) => is_private_ipv4(v4),
        None => false,
    }
}
