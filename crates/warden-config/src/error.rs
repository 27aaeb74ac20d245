use std::io;

use thiserror::Error;

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// Path that could not be read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Failed to parse TOML.
    #[error("Failed to parse config at {path}: {source}")]
    ParseError {
        /// Path (or pseudo-path) of the TOML that failed.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range or inconsistent.
    #[error("Validation error in field '{field}': {message}")]
    ValidationError {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// An environment variable could not be coerced to its field type.
    #[error("Environment variable '{var_name}': {message}")]
    EnvError {
        /// Name of the variable.
        var_name: String,
        /// What is wrong with it.
        message: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
