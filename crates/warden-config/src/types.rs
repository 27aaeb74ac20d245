use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Audit chain behaviour.
    pub audit: AuditSection,
    /// Signing key storage.
    pub keys: KeysSection,
    /// Durable entry storage.
    pub storage: StorageSection,
    /// Public query surface.
    pub gateway: GatewaySection,
    /// Logging.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// AuditSection
// ---------------------------------------------------------------------------

/// Audit chain behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    /// Propagate audit failures to callers instead of logging and continuing.
    pub mandatory: bool,
    /// How long a producer may wait for its turn in the append queue.
    pub append_timeout_ms: u64,
    /// Capacity of the append queue. Producers beyond it wait.
    pub queue_capacity: usize,
    /// Record a Merkle root anchor every N entries (0 disables anchors).
    pub anchor_interval: u64,
    /// Entries fetched per storage read when streaming queries.
    pub query_batch_size: usize,
    /// Upper bound for the `limit` of one page.
    pub max_query_limit: usize,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            mandatory: false,
            append_timeout_ms: 5_000,
            queue_capacity: 4_096,
            anchor_interval: 1_000,
            query_batch_size: 256,
            max_query_limit: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// KeysSection
// ---------------------------------------------------------------------------

/// Where the signing key and key ring live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysSection {
    /// Directory holding `active.key` and `keyring.json`.
    pub directory: PathBuf,
    /// Keep keys in memory only. Signatures will not verify after restart.
    pub ephemeral: bool,
}

impl Default for KeysSection {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/keys"),
            ephemeral: false,
        }
    }
}

// ---------------------------------------------------------------------------
// StorageSection
// ---------------------------------------------------------------------------

/// Storage backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory; the chain is lost on exit.
    #[default]
    Memory,
    /// Embedded `SurrealKV` at [`StorageSection::path`].
    Surrealkv,
}

/// Durable entry storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Which backend to use.
    pub backend: StorageBackend,
    /// Data directory for persistent backends.
    pub path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("data/audit"),
        }
    }
}

// ---------------------------------------------------------------------------
// GatewaySection
// ---------------------------------------------------------------------------

/// JSON-RPC query surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Whether to serve the query surface at all.
    pub enabled: bool,
    /// Socket address to bind.
    pub bind: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:7787".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging settings, mirrored into `warden_telemetry::LogConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Base level filter (`trace` .. `error`).
    pub level: String,
    /// `pretty`, `compact`, `json` or `full`.
    pub format: String,
    /// Extra `target=level` directives.
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
