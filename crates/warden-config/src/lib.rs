#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Configuration for the Warden audit service.
//!
//! # Usage
//!
//! ```rust,no_run
//! use warden_config::Config;
//!
//! // Embedded defaults, then the file, then WARDEN_* fallbacks.
//! let config = Config::load(Some(std::path::Path::new("warden.toml"))).unwrap();
//! println!("mandatory audit: {}", config.audit.mandatory);
//! ```
//!
//! # Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Config file** passed to [`Config::load`]
//! 2. **Environment variables** (`WARDEN_*`), used only for fields the file
//!    left unset
//! 3. **Embedded defaults** (`defaults.toml` compiled into the binary)
//!
//! This crate depends on no other warden crate. Conversion into runtime
//! option types happens in `warden-gateway`.

/// `WARDEN_*` environment variable fallbacks.
pub mod env;
/// Configuration error types.
pub mod error;
/// File loading and layering.
pub mod loader;
/// Configuration struct definitions.
pub mod types;
/// Validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use types::*;

impl Config {
    /// Load defaults, overlay `path` if given, then apply env fallbacks.
    ///
    /// A missing file is not an error; the defaults are used.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file is unreadable, oversized,
    /// malformed, or the merged configuration fails validation.
    pub fn load(path: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(path, &env::collect_env_vars())
    }

    /// Parse a configuration from TOML text layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the text is malformed or invalid.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        loader::load_str(text, &std::collections::HashMap::new())
    }
}
