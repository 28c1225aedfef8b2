//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::security::patterns::RuleSet;

/// Root configuration for the streaming gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, TLS, stream capacity).
    pub listener: ListenerConfig,

    /// Upstream fetch behaviour (timeouts, size limits, DNS hardening).
    pub upstream: UpstreamConfig,

    /// Target and request screening policy.
    pub security: SecurityConfig,

    /// Per-client, per-target request budget.
    pub rate_limit: RateLimitConfig,

    /// Logging, metrics and event sampling.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum relays running at once. Further requests get 503.
    pub max_concurrent_streams: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            max_concurrent_streams: 1024,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Upstream fetch configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Time allowed between sending the request and receiving response headers.
    pub response_timeout_secs: u64,

    /// Longest stall tolerated between two body chunks.
    pub idle_timeout_secs: u64,

    /// Redirect hops followed before giving up. Every hop is re-screened.
    pub max_redirects: usize,

    /// Largest resource relayed, in bytes. 0 disables the limit.
    pub max_stream_bytes: u64,

    /// Resolve hostnames before connecting and refuse private addresses.
    pub resolve_check: bool,

    /// User-Agent sent upstream. The client's own header is forwarded when unset.
    pub user_agent: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            response_timeout_secs: 15,
            idle_timeout_secs: 30,
            max_redirects: 5,
            max_stream_bytes: 4 * 1024 * 1024 * 1024, // 4 GiB
            resolve_check: true,
            user_agent: None,
        }
    }
}

/// Security screening configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Hostnames (and their subdomains) that may be fetched. Empty allows any public host.
    pub domain_allowlist: Vec<String>,

    /// Referrer hosts accepted for cross-site requests. Empty admits only same-host referrers.
    pub referrer_allowlist: Vec<String>,

    /// Attack pattern rules, evaluated in order.
    pub rules: RuleSet,

    /// Deny requests from automated clients instead of only flagging them.
    pub block_automated_clients: bool,

    /// Case-insensitive User-Agent fragments identifying automated clients.
    pub automated_client_signatures: Vec<String>,

    /// Take the client IP from the first X-Forwarded-For entry.
    pub trust_forwarded_for: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            domain_allowlist: Vec::new(),
            referrer_allowlist: Vec::new(),
            rules: RuleSet::default(),
            block_automated_clients: false,
            automated_client_signatures: default_automated_signatures(),
            trust_forwarded_for: false,
        }
    }
}

fn default_automated_signatures() -> Vec<String> {
    [
        "curl",
        "wget",
        "python-requests",
        "python-urllib",
        "aiohttp",
        "go-http-client",
        "java/",
        "okhttp",
        "libwww-perl",
        "httpie",
        "axios",
        "node-fetch",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Window length in seconds.
    pub window_secs: u64,

    /// Requests allowed per key in one window.
    pub max_requests: u32,

    /// How often stale counters are evicted, in seconds.
    pub eviction_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            max_requests: 10,
            eviction_interval_secs: 60,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human readable or JSON log lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Fraction of allowed requests tagged with a `sampled` event.
    pub sampling_rate: f64,

    /// Completed transfers above this many bytes get a `large_transfer` event.
    pub large_transfer_bytes: u64,

    /// Capacity of the asynchronous event buffer.
    pub event_buffer: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
            sampling_rate: 0.01,
            large_transfer_bytes: 10 * 1024 * 1024, // 10 MiB
            event_buffer: 1024,
        }
    }
}
