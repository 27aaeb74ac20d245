//! Config loading:
//! 1. Parse embedded `defaults.toml` -> base
//! 2. Deep-merge the config file, if any, recording which fields it set
//! 3. Apply `WARDEN_*` env fallbacks for fields the file left unset
//! 4. Deserialize the merged tree -> [`Config`]
//! 5. Validate

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::{debug, info};

use crate::env::apply_env_fallbacks;
use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: usize = 1_048_576;

/// Load the layered configuration. A missing file falls back to defaults.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file is unreadable, oversized or
/// malformed, if an env fallback cannot be coerced, or if the merged
/// configuration fails validation.
pub fn load<S: std::hash::BuildHasher>(
    path: Option<&Path>,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<Config> {
    let overlay = match path {
        Some(p) => try_load_file(p)?,
        None => None,
    };
    if let (Some(p), Some(_)) = (path, overlay.as_ref()) {
        info!(path = %p.display(), "loaded config file");
    }
    build(overlay.as_ref(), env_vars)
}

/// Load from TOML text layered over the defaults.
///
/// # Errors
///
/// Same as [`load`].
pub fn load_str<S: std::hash::BuildHasher>(
    text: &str,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<Config> {
    let overlay = parse(text, "<inline>")?;
    build(Some(&overlay), env_vars)
}

fn build<S: std::hash::BuildHasher>(
    overlay: Option<&toml::Value>,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<Config> {
    let mut merged = parse(DEFAULTS_TOML, "<embedded defaults>")?;

    let mut file_fields = HashSet::new();
    if let Some(overlay) = overlay {
        record_leaves(overlay, "", &mut file_fields);
        deep_merge(&mut merged, overlay);
    }

    let env_count = apply_env_fallbacks(&mut merged, &file_fields, env_vars)?;
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable fallbacks");
    }

    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    validate::validate(&config)?;
    Ok(config)
}

fn parse(text: &str, origin: &str) -> ConfigResult<toml::Value> {
    toml::from_str(text).map_err(|e| ConfigError::ParseError {
        path: origin.to_owned(),
        source: e,
    })
}

/// Read and parse a file, returning `None` if it does not exist.
///
/// Reads once and checks the size afterwards so there is no stat/read race.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                content.len()
            ),
        });
    }

    parse(&content, &path.display().to_string()).map(Some)
}

/// Recursively merge `overlay` into `base`. Tables merge per key; scalars
/// and arrays from the overlay replace the base value.
fn deep_merge(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                match base_table.get_mut(key) {
                    Some(base_val) => deep_merge(base_val, overlay_val),
                    None => {
                        base_table.insert(key.clone(), overlay_val.clone());
                    },
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}

/// Collect the dotted paths of every leaf in `val`.
fn record_leaves(val: &toml::Value, prefix: &str, out: &mut HashSet<String>) {
    if let toml::Value::Table(table) = val {
        for (key, child) in table {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            record_leaves(child, &path, out);
        }
    } else {
        out.insert(prefix.to_owned());
    }
}
