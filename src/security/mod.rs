//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Parsed request:
//!     → ssrf.rs (scheme, literal IP, private host, domain allowlist)
//!     → patterns.rs (attack pattern rule set over the raw target)
//!     → referrer.rs (cross-site Referer allowlist)
//!     → user_agent.rs (flag or block automated clients)
//!     → rate_limit.rs (per client + target window counter)
//!     → Pass to relay
//!
//! At connect time:
//!     → resolve.rs (refuse hostnames resolving only to private addresses)
//! ```
//!
//! # Design Decisions
//! - Cheap checks run before expensive ones
//! - Fail closed: the first violated rule denies, and names itself
//! - No trust in client input

pub mod patterns;
pub mod rate_limit;
pub mod referrer;
pub mod resolve;
pub mod ssrf;
pub mod user_agent;

use serde::Serialize;

use crate::config::SecurityConfig;

use self::patterns::AttackDetector;
use self::referrer::ReferrerPolicy;
use self::ssrf::SsrfGuard;
use self::user_agent::UserAgentPolicy;

/// Outcome of one screening stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub matched_rule: Option<String>,
}

impl SecurityVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            matched_rule: None,
        }
    }

    pub fn deny(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            matched_rule: Some(rule.into()),
        }
    }

    pub fn is_denied(&self) -> bool {
        !self.allowed
    }
}

/// Every screening rule that may change on config reload, swapped as one unit.
#[derive(Debug)]
pub struct SecurityPolicy {
    pub ssrf: SsrfGuard,
    pub detector: AttackDetector,
    pub referrer: ReferrerPolicy,
    pub user_agent: UserAgentPolicy,
}

impl SecurityPolicy {
    pub fn from_config(config: &SecurityConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            ssrf: SsrfGuard::new(config.domain_allowlist.clone()),
            detector: AttackDetector::compile(&config.rules)?,
            referrer: ReferrerPolicy::new(config.referrer_allowlist.clone()),
            user_agent: UserAgentPolicy::new(
                &config.automated_client_signatures,
                config.block_automated_clients,
            ),
        })
    }
}

/// True when `host` equals `entry` or is a subdomain of it. Both sides are compared
/// case-insensitively with any trailing dot removed.
pub fn host_matches(host: &str, entry: &str) -> bool {
    let host = normalize_host(host);
    let entry = normalize_host(entry);
    if entry.is_empty() {
        return false;
    }
    host == entry
        || (host.len() > entry.len()
            && host.ends_with(entry.as_str())
            && host.as_bytes()[host.len() - entry.len() - 1] == b'.')
}

pub(crate) fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}
