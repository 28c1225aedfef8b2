//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file, then apply environment overrides.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let mut config: GatewayConfig = toml::from_str(&content)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Build a configuration from defaults and environment overrides only.
pub fn load_from_env() -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Apply `GATEWAY_*` overrides read through `lookup`.
///
/// Values that fail to parse are logged and skipped; validation runs afterwards.
pub fn apply_env_overrides<F>(config: &mut GatewayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(addr) = lookup("GATEWAY_BIND_ADDRESS") {
        config.listener.bind_address = addr;
    }
    if let Some(list) = lookup("GATEWAY_DOMAIN_ALLOWLIST") {
        config.security.domain_allowlist = split_list(&list);
    }
    if let Some(list) = lookup("GATEWAY_REFERRER_ALLOWLIST") {
        config.security.referrer_allowlist = split_list(&list);
    }
    if let Some(value) = lookup("GATEWAY_RATE_LIMIT_MAX") {
        match value.parse() {
            Ok(max) => config.rate_limit.max_requests = max,
            Err(_) => tracing::warn!(value = %value, "Ignoring invalid GATEWAY_RATE_LIMIT_MAX"),
        }
    }
    if let Some(value) = lookup("GATEWAY_RATE_LIMIT_WINDOW_SECS") {
        match value.parse() {
            Ok(secs) => config.rate_limit.window_secs = secs,
            Err(_) => tracing::warn!(value = %value, "Ignoring invalid GATEWAY_RATE_LIMIT_WINDOW_SECS"),
        }
    }
    if let Some(value) = lookup("GATEWAY_SAMPLING_RATE") {
        match value.parse() {
            Ok(rate) => config.observability.sampling_rate = rate,
            Err(_) => tracing::warn!(value = %value, "Ignoring invalid GATEWAY_SAMPLING_RATE"),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|entry| entry.trim().to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect()
}
