//! Logging configuration and setup.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::error::{TelemetryError, TelemetryResult};

type FilteredRegistry = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

/// File rotation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRotation {
    /// Rotate daily.
    #[default]
    Daily,
    /// Rotate hourly.
    Hourly,
    /// Rotate every minute.
    Minutely,
    /// Never rotate.
    Never,
}

impl From<FileRotation> for Rotation {
    fn from(value: FileRotation) -> Self {
        match value {
            FileRotation::Daily => Rotation::DAILY,
            FileRotation::Hourly => Rotation::HOURLY,
            FileRotation::Minutely => Rotation::MINUTELY,
            FileRotation::Never => Rotation::NEVER,
        }
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-readable.
    Pretty,
    /// Single-line (default).
    #[default]
    Compact,
    /// One JSON object per event, for log shippers.
    Json,
    /// The default `tracing-subscriber` layout.
    Full,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            "full" => Ok(Self::Full),
            other => Err(TelemetryError::ConfigError(format!(
                "unknown log format '{other}'"
            ))),
        }
    }
}

/// Where log lines go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Standard output.
    Stdout,
    /// Standard error.
    #[default]
    Stderr,
    /// Rolling files in the given directory.
    File(PathBuf),
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base level filter (e.g. `info`).
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Output target.
    #[serde(default)]
    pub target: LogTarget,
    /// File name prefix when logging to files.
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    /// Rotation when logging to files.
    #[serde(default)]
    pub rotation: FileRotation,
    /// Include timestamps.
    #[serde(default = "default_true")]
    pub timestamps: bool,
    /// Include source file and line.
    #[serde(default)]
    pub file_info: bool,
    /// Use ANSI colours (ignored for JSON).
    #[serde(default = "default_true")]
    pub ansi: bool,
    /// Extra directives such as `warden_audit=debug`.
    #[serde(default)]
    pub directives: Vec<String>,
}

fn default_file_prefix() -> String {
    "warden".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            target: LogTarget::default(),
            file_prefix: default_file_prefix(),
            rotation: FileRotation::default(),
            timestamps: true,
            file_info: false,
            ansi: true,
            directives: Vec::new(),
        }
    }
}

impl LogConfig {
    /// A config at the given base level.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    /// Set the format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Log to rolling files in `directory`. Disables ANSI colours.
    #[must_use]
    pub fn with_file_logging(mut self, directory: impl Into<PathBuf>, rotation: FileRotation) -> Self {
        self.target = LogTarget::File(directory.into());
        self.rotation = rotation;
        self.ansi = false;
        self
    }

    /// Add a directive override.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Disable timestamps.
    #[must_use]
    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    /// Build a config from the `[logging]` section of the service config.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ConfigError`] for an unknown format.
    #[cfg(feature = "config")]
    pub fn from_section(section: &warden_config::LoggingSection) -> TelemetryResult<Self> {
        Ok(Self {
            level: section.level.clone(),
            format: section.format.parse()?,
            directives: section.directives.clone(),
            ..Default::default()
        })
    }

    fn build_filter(&self) -> TelemetryResult<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)
            .map_err(|e| TelemetryError::ConfigError(e.to_string()))?;
        for directive in &self.directives {
            let parsed = directive
                .parse()
                .map_err(|e: tracing_subscriber::filter::ParseError| {
                    TelemetryError::ConfigError(format!("directive '{directive}': {e}"))
                })?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }

    fn build_layer<W>(&self, writer: W) -> BoxedLayer
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        let base = fmt::layer()
            .with_writer(writer)
            .with_ansi(self.ansi && self.format != LogFormat::Json)
            .with_file(self.file_info)
            .with_line_number(self.file_info)
            .with_target(true);

        match (self.format, self.timestamps) {
            (LogFormat::Json, true) => base.json().boxed(),
            (LogFormat::Json, false) => base.json().without_time().boxed(),
            (LogFormat::Pretty, true) => base.pretty().boxed(),
            (LogFormat::Pretty, false) => base.pretty().without_time().boxed(),
            (LogFormat::Compact, true) => base.compact().boxed(),
            (LogFormat::Compact, false) => base.compact().without_time().boxed(),
            (LogFormat::Full, true) => base.boxed(),
            (LogFormat::Full, false) => base.without_time().boxed(),
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// Returns an error if the filter is invalid, the log directory cannot be
/// created, or a global subscriber is already installed.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let filter = config.build_filter()?;

    let layer = match &config.target {
        LogTarget::Stdout => config.build_layer(std::io::stdout),
        LogTarget::Stderr => config.build_layer(std::io::stderr),
        LogTarget::File(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                RollingFileAppender::new(config.rotation.into(), dir, &config.file_prefix);
            config.build_layer(appender)
        },
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| TelemetryError::InitError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.target, LogTarget::Stderr);
        assert!(config.timestamps);
    }

    #[test]
    fn test_file_logging_disables_ansi() {
        let config = LogConfig::new("debug").with_file_logging("/tmp/warden-logs", FileRotation::Hourly);
        assert!(!config.ansi);
        assert_eq!(config.rotation, FileRotation::Hourly);
        assert_eq!(config.target, LogTarget::File(PathBuf::from("/tmp/warden-logs")));
    }

    #[test]
    fn test_format_parses() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let config = LogConfig::new("warn").with_format(LogFormat::Pretty);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"format\":\"pretty\""));
        let parsed: LogConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.format, LogFormat::Pretty);
    }

    #[test]
    fn test_build_filter_accepts_directives() {
        let config = LogConfig::new("info").with_directive("warden_audit=trace");
        assert!(config.build_filter().is_ok());
    }

    #[test]
    fn test_build_filter_rejects_bad_directive() {
        let config = LogConfig::new("info").with_directive("[broken=syntax");
        assert!(matches!(
            config.build_filter(),
            Err(TelemetryError::ConfigError(_))
        ));
    }
}
