//! Error types for the gateway.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] warden_config::ConfigError),

    /// Logging could not be set up.
    #[error("telemetry error: {0}")]
    Telemetry(#[from] warden_telemetry::TelemetryError),

    /// The audit service failed to start or stop.
    #[error("audit error: {0}")]
    Audit(#[from] warden_audit::AuditError),

    /// The RPC server failed.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
