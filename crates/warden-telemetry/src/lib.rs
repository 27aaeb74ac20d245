//! Warden Telemetry - structured logging for the audit service.
//!
//! # Example
//!
//! ```rust,no_run
//! use warden_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), warden_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Json)
//!     .with_directive("warden_audit=debug");
//! setup_logging(&config)?;
//!
//! tracing::info!(sequence = 0, "chain opened");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{FileRotation, LogConfig, LogFormat, LogTarget, setup_logging};
