//! Tracing subscriber setup
//!
//! Ingest steps log through `tracing` with structured fields:
//!
//! ```rust
//! use tracing::{info, warn};
//!
//! let granule_id = "MOD09GQ.A2017224.h09v02.006.2017227165020";
//! info!(granule_id = %granule_id, files = 3, "Granule staged");
//! warn!(provider = "podaac", attempt = 2, "Lock busy, retrying");
//! ```
//!
//! [`init_logging`] installs the global subscriber once per process. Output
//! goes to stderr, to a rotating file, or both, as text or JSON lines.
//! The SDK and transport crates are quieted to `warn` unless a directive
//! says otherwise.
//!
//! ```no_run
//! use granary_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("Ingest step started");
//!     Ok(())
//! }
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Dependencies that are chatty at `info`
const QUIET_CRATES: &[&str] = &["aws_config", "aws_smithy_runtime", "hyper", "hyper_util", "russh", "suppaftp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    #[default]
    Stderr,
    File,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Parse a lowercase serde name, e.g. `"both"` or `"hourly"`
fn parse_name<T: for<'de> Deserialize<'de>>(var: &str, value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_lowercase()))
        .with_context(|| format!("{} has unsupported value {:?}", var, value))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base directive, e.g. `info` or `granary_ingest=debug`
    pub level: String,
    pub sink: LogSink,
    pub json: bool,
    pub dir: PathBuf,
    pub file_prefix: String,
    pub rotation: LogRotation,
    /// Extra directives applied after the base level
    pub directives: Vec<String>,
    pub with_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            sink: LogSink::Stderr,
            json: false,
            dir: PathBuf::from("./logs"),
            file_prefix: "granary".to_string(),
            rotation: LogRotation::Daily,
            directives: Vec::new(),
            with_location: false,
        }
    }
}

impl LogConfig {
    /// Read `LOG_LEVEL`, `LOG_SINK`, `LOG_FORMAT` (`text`/`json`), `LOG_DIR`,
    /// `LOG_FILE_PREFIX`, `LOG_ROTATION`, `LOG_FILTER` (comma separated) and
    /// `LOG_LOCATION`.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(level) = var("LOG_LEVEL") {
            config.level = level;
        }
        if let Some(sink) = var("LOG_SINK") {
            config.sink = parse_name("LOG_SINK", &sink)?;
        }
        if let Some(format) = var("LOG_FORMAT") {
            config.json = match format.to_lowercase().as_str() {
                "json" => true,
                "text" => false,
                other => bail!("LOG_FORMAT has unsupported value {:?}", other),
            };
        }
        if let Some(dir) = var("LOG_DIR") {
            config.dir = PathBuf::from(dir);
        }
        if let Some(prefix) = var("LOG_FILE_PREFIX") {
            config.file_prefix = prefix;
        }
        if let Some(rotation) = var("LOG_ROTATION") {
            config.rotation = parse_name("LOG_ROTATION", &rotation)?;
        }
        if let Some(filter) = var("LOG_FILTER") {
            config.directives = filter
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
        }
        config.with_location = var("LOG_LOCATION").is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

        Ok(config)
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Log to a rotating file under `dir` instead of stderr
    pub fn with_file(mut self, dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        self.sink = LogSink::File;
        self.dir = dir.into();
        self.file_prefix = prefix.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level).with_context(|| format!("Invalid log level {:?}", self.level))?;

        for quiet in QUIET_CRATES {
            if !self.directives.iter().any(|d| d.starts_with(quiet)) {
                filter = filter.add_directive(format!("{}=warn", quiet).parse()?);
            }
        }
        for directive in &self.directives {
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("Invalid log directive {:?}", directive))?,
            );
        }
        Ok(filter)
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_file(self.with_location)
            .with_line_number(self.with_location);

        if self.json {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = config.filter()?;
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if matches!(config.sink, LogSink::Stderr | LogSink::Both) {
        layers.push(config.layer(std::io::stderr, true));
    }

    if matches!(config.sink, LogSink::File | LogSink::Both) {
        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("Cannot create log directory {}", config.dir.display()))?;
        let appender = RollingFileAppender::new(config.rotation.into(), &config.dir, &config.file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        layers.push(config.layer(writer, false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("A global tracing subscriber is already installed")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(parse_name::<LogSink>("LOG_SINK", "Both").unwrap(), LogSink::Both);
        assert_eq!(parse_name::<LogRotation>("LOG_ROTATION", "hourly").unwrap(), LogRotation::Hourly);
        assert!(parse_name::<LogSink>("LOG_SINK", "syslog").is_err());
    }

    #[test]
    fn test_with_file() {
        let config = LogConfig::default()
            .with_level("debug")
            .with_file("/var/log/granary", "ingest")
            .with_json(true);

        assert_eq!(config.sink, LogSink::File);
        assert_eq!(config.dir, PathBuf::from("/var/log/granary"));
        assert_eq!(config.file_prefix, "ingest");
        assert!(config.json);
    }

    #[test]
    fn test_bad_directive_is_rejected() {
        let config = LogConfig::default().with_directive("granary=notalevel");
        assert!(config.filter().is_err());
        assert!(LogConfig::default().with_directive("russh=debug").filter().is_ok());
    }

    #[test]
    fn test_init_logging_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::default().with_file(dir.path(), "granary-test");

        init_logging(&config).unwrap();
        tracing::info!(step = "test", "logging initialised");
        assert!(init_logging(&config).is_err());
    }
}
