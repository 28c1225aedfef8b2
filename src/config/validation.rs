//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, sampling rate in [0, 1])
//! - Compile every attack pattern once so bad rules fail at load time
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::GatewayConfig;
use crate::security::patterns::AttackDetector;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check a parsed configuration for values that deserialize but make no sense.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_concurrent_streams == 0 {
        errors.push(ValidationError::new("listener.max_concurrent_streams", "must be > 0"));
    }

    let upstream = &config.upstream;
    for (field, value) in [
        ("upstream.connect_timeout_secs", upstream.connect_timeout_secs),
        ("upstream.response_timeout_secs", upstream.response_timeout_secs),
        ("upstream.idle_timeout_secs", upstream.idle_timeout_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be > 0"));
        }
    }

    if config.rate_limit.window_secs == 0 {
        errors.push(ValidationError::new("rate_limit.window_secs", "must be > 0"));
    }
    if config.rate_limit.max_requests == 0 {
        errors.push(ValidationError::new("rate_limit.max_requests", "must be > 0"));
    }
    if config.rate_limit.eviction_interval_secs == 0 {
        errors.push(ValidationError::new("rate_limit.eviction_interval_secs", "must be > 0"));
    }

    let rate = config.observability.sampling_rate;
    if !(0.0..=1.0).contains(&rate) {
        errors.push(ValidationError::new(
            "observability.sampling_rate",
            format!("{rate} is outside [0, 1]"),
        ));
    }
    if config.observability.event_buffer == 0 {
        errors.push(ValidationError::new("observability.event_buffer", "must be > 0"));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    check_hosts("security.domain_allowlist", &config.security.domain_allowlist, &mut errors);
    check_hosts("security.referrer_allowlist", &config.security.referrer_allowlist, &mut errors);

    let mut seen = HashSet::new();
    for rule in &config.security.rules.rules {
        if !seen.insert(rule.id.as_str()) {
            errors.push(ValidationError::new(
                "security.rules",
                format!("duplicate rule id '{}'", rule.id),
            ));
        }
    }
    if let Err(e) = AttackDetector::compile(&config.security.rules) {
        errors.push(ValidationError::new("security.rules", e.to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_hosts(field: &str, entries: &[String], errors: &mut Vec<ValidationError>) {
    for entry in entries {
        let bare = !entry.is_empty()
            && entry
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
        if !bare {
            errors.push(ValidationError::new(
                field,
                format!("'{entry}' must be a bare lowercase hostname"),
            ));
        }
    }
}
