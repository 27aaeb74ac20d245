//! `WARDEN_*` environment variables are a **fallback**: they fill fields the
//! config file did not set and never override the file.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

#[derive(Clone, Copy)]
enum Kind {
    Bool,
    Integer,
    Text,
}

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: Kind,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "WARDEN_AUDIT_MANDATORY",
        field_path: "audit.mandatory",
        kind: Kind::Bool,
    },
    EnvMapping {
        var_name: "WARDEN_AUDIT_APPEND_TIMEOUT_MS",
        field_path: "audit.append_timeout_ms",
        kind: Kind::Integer,
    },
    EnvMapping {
        var_name: "WARDEN_AUDIT_ANCHOR_INTERVAL",
        field_path: "audit.anchor_interval",
        kind: Kind::Integer,
    },
    EnvMapping {
        var_name: "WARDEN_KEY_DIR",
        field_path: "keys.directory",
        kind: Kind::Text,
    },
    EnvMapping {
        var_name: "WARDEN_KEYS_EPHEMERAL",
        field_path: "keys.ephemeral",
        kind: Kind::Bool,
    },
    EnvMapping {
        var_name: "WARDEN_STORAGE_BACKEND",
        field_path: "storage.backend",
        kind: Kind::Text,
    },
    EnvMapping {
        var_name: "WARDEN_STORAGE_PATH",
        field_path: "storage.path",
        kind: Kind::Text,
    },
    EnvMapping {
        var_name: "WARDEN_GATEWAY_BIND",
        field_path: "gateway.bind",
        kind: Kind::Text,
    },
    EnvMapping {
        var_name: "WARDEN_LOG_LEVEL",
        field_path: "logging.level",
        kind: Kind::Text,
    },
    EnvMapping {
        var_name: "WARDEN_LOG_FORMAT",
        field_path: "logging.format",
        kind: Kind::Text,
    },
];

/// Snapshot the `WARDEN_*` variables of the current process.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("WARDEN_"))
        .collect()
}

/// Apply env fallbacks to every field not present in `file_fields`.
///
/// Returns the number of variables applied.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] when a variable cannot be coerced to
/// its field's type.
pub fn apply_env_fallbacks<S: std::hash::BuildHasher>(
    merged: &mut toml::Value,
    file_fields: &HashSet<String>,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;
    for mapping in ENV_MAPPINGS {
        if file_fields.contains(mapping.field_path) {
            continue;
        }
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };
        let value = coerce(mapping, raw)?;
        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var fallback"
        );
        set_field(merged, mapping.field_path, value);
        count = count.saturating_add(1);
    }
    Ok(count)
}

fn coerce(mapping: &EnvMapping, raw: &str) -> ConfigResult<toml::Value> {
    let raw = raw.trim();
    let bad = |message: String| ConfigError::EnvError {
        var_name: mapping.var_name.to_owned(),
        message,
    };
    match mapping.kind {
        Kind::Bool => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(toml::Value::Boolean(true)),
            "0" | "false" | "no" | "off" => Ok(toml::Value::Boolean(false)),
            other => Err(bad(format!("expected a boolean, got '{other}'"))),
        },
        Kind::Integer => raw
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|e| bad(format!("expected an integer: {e}"))),
        Kind::Text => Ok(toml::Value::String(raw.to_owned())),
    }
}

fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut segments = path.split('.').peekable();
    let mut current = root;
    while let Some(segment) = segments.next() {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        if segments.peek().is_none() {
            table.insert(segment.to_owned(), value);
            return;
        }
        current = table
            .entry(segment.to_owned())
            .or_insert(toml::Value::Table(toml::map::Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> toml::Value {
        toml::from_str("[audit]\nmandatory = false\n").unwrap()
    }

    #[test]
    fn test_env_fills_unset_field() {
        let mut merged = base();
        let env = HashMap::from([("WARDEN_AUDIT_MANDATORY".to_owned(), "yes".to_owned())]);
        let applied = apply_env_fallbacks(&mut merged, &HashSet::new(), &env).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(merged["audit"]["mandatory"].as_bool(), Some(true));
    }

    #[test]
    fn test_env_never_overrides_file() {
        let mut merged = base();
        let file_fields = HashSet::from(["audit.mandatory".to_owned()]);
        let env = HashMap::from([("WARDEN_AUDIT_MANDATORY".to_owned(), "true".to_owned())]);
        let applied = apply_env_fallbacks(&mut merged, &file_fields, &env).unwrap();
        assert_eq!(applied, 0);
        assert_eq!(merged["audit"]["mandatory"].as_bool(), Some(false));
    }

    #[test]
    fn test_env_creates_missing_tables() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let env = HashMap::from([("WARDEN_KEY_DIR".to_owned(), "/var/lib/warden".to_owned())]);
        apply_env_fallbacks(&mut merged, &HashSet::new(), &env).unwrap();
        assert_eq!(merged["keys"]["directory"].as_str(), Some("/var/lib/warden"));
    }

    #[test]
    fn test_env_bad_integer_is_reported() {
        let mut merged = base();
        let env = HashMap::from([(
            "WARDEN_AUDIT_APPEND_TIMEOUT_MS".to_owned(),
            "soon".to_owned(),
        )]);
        let err = apply_env_fallbacks(&mut merged, &HashSet::new(), &env).unwrap_err();
        assert!(matches!(err, ConfigError::EnvError { ref var_name, .. } if var_name == "WARDEN_AUDIT_APPEND_TIMEOUT_MS"));
    }
}
