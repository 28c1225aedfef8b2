//! Referer validation for cross-site playback.

use url::Url;

use super::{host_matches, normalize_host, SecurityVerdict};

pub mod rules {
    pub const MALFORMED: &str = "referrer.malformed";
    pub const NOT_ALLOWED: &str = "referrer.not-allowed";
}

/// Accepts a request when it has no Referer, when the Referer is same-host with
/// the target, or when the Referer host is on the allowlist. Any other
/// cross-site Referer is denied, so an empty allowlist admits none.
#[derive(Debug, Clone, Default)]
pub struct ReferrerPolicy {
    allowlist: Vec<String>,
}

impl ReferrerPolicy {
    pub fn new(allowlist: Vec<String>) -> Self {
        Self {
            allowlist: allowlist.iter().map(|e| normalize_host(e)).collect(),
        }
    }

    pub fn check(&self, target: &Url, referrer: Option<&str>) -> SecurityVerdict {
        let referrer = match referrer.map(str::trim) {
            None | Some("") => return SecurityVerdict::allow(),
            Some(raw) => raw,
        };

        let referrer_host = match Url::parse(referrer)
            .ok()
            .and_then(|url| url.host_str().map(normalize_host))
        {
            Some(host) => host,
            None => {
                return SecurityVerdict::deny(rules::MALFORMED, "Referer is not an absolute URL")
            }
        };

        let target_host = target.host_str().map(normalize_host).unwrap_or_default();
        if referrer_host == target_host {
            return SecurityVerdict::allow();
        }

        if self
            .allowlist
            .iter()
            .any(|entry| host_matches(&referrer_host, entry))
        {
            SecurityVerdict::allow()
        } else {
            SecurityVerdict::deny(
                rules::NOT_ALLOWED,
                format!("referrer host '{referrer_host}' is not allowed"),
            )
        }
    }
}
