//! Post-merge validation: ranges and cross-field rules.

use std::net::SocketAddr;

use crate::error::{ConfigError, ConfigResult};
use crate::types::{Config, StorageBackend};

/// Longest producer wait we accept (10 minutes).
const MAX_APPEND_TIMEOUT_MS: u64 = 600_000;

/// Validate a merged configuration.
///
/// # Errors
///
/// Returns the first [`ConfigError::ValidationError`] found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_audit(config)?;
    validate_keys(config)?;
    validate_storage(config)?;
    validate_gateway(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_audit(config: &Config) -> ConfigResult<()> {
    let a = &config.audit;
    if a.append_timeout_ms == 0 || a.append_timeout_ms > MAX_APPEND_TIMEOUT_MS {
        return Err(invalid(
            "audit.append_timeout_ms",
            format!("must be between 1 and {MAX_APPEND_TIMEOUT_MS}"),
        ));
    }
    if a.queue_capacity == 0 {
        return Err(invalid("audit.queue_capacity", "must be at least 1"));
    }
    if a.query_batch_size == 0 {
        return Err(invalid("audit.query_batch_size", "must be at least 1"));
    }
    if a.max_query_limit == 0 {
        return Err(invalid("audit.max_query_limit", "must be at least 1"));
    }
    Ok(())
}

fn validate_keys(config: &Config) -> ConfigResult<()> {
    if !config.keys.ephemeral && config.keys.directory.as_os_str().is_empty() {
        return Err(invalid(
            "keys.directory",
            "a key directory is required unless keys.ephemeral = true",
        ));
    }
    Ok(())
}

fn validate_storage(config: &Config) -> ConfigResult<()> {
    if config.storage.backend == StorageBackend::Surrealkv
        && config.storage.path.as_os_str().is_empty()
    {
        return Err(invalid(
            "storage.path",
            "the surrealkv backend needs a data directory",
        ));
    }
    // Ephemeral keys die with the process; a persistent chain outlives them.
    if config.storage.backend == StorageBackend::Surrealkv && config.keys.ephemeral {
        return Err(invalid(
            "keys.ephemeral",
            "ephemeral keys cannot be combined with persistent storage",
        ));
    }
    Ok(())
}

fn validate_gateway(config: &Config) -> ConfigResult<()> {
    if config.gateway.enabled && config.gateway.bind.parse::<SocketAddr>().is_err() {
        return Err(invalid(
            "gateway.bind",
            format!("'{}' is not a socket address", config.gateway.bind),
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;
    if !matches!(
        l.level.as_str(),
        "trace" | "debug" | "info" | "warn" | "error" | "off"
    ) {
        return Err(invalid(
            "logging.level",
            format!("unknown level '{}'", l.level),
        ));
    }
    if !matches!(l.format.as_str(), "pretty" | "compact" | "json" | "full") {
        return Err(invalid(
            "logging.format",
            format!(
                "unknown format '{}'; expected one of: pretty, compact, json, full",
                l.format
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = Config::default();
        config.audit.append_timeout_ms = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("audit.append_timeout_ms"));
    }

    #[test]
    fn test_ephemeral_keys_with_persistent_storage_rejected() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Surrealkv;
        config.keys.ephemeral = true;
        assert!(matches!(
            validate(&config),
            Err(ConfigError::ValidationError { ref field, .. }) if field == "keys.ephemeral"
        ));
    }

    #[test]
    fn test_bad_bind_rejected_only_when_enabled() {
        let mut config = Config::default();
        config.gateway.bind = "not an address".to_owned();
        assert!(validate(&config).is_err());
        config.gateway.enabled = false;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        assert!(validate(&config).is_err());
    }
}
