//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` registry with one formatting layer. `RUST_LOG`, when set,
//! takes precedence over the configured level.
//!
//! ```no_run
//! use sweep_daq::{config::EngineConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("engine started");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::EngineConfig;
use crate::error::{DaqError, DaqResult};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, coloured.
    #[default]
    Pretty,
    /// One line per event, no colour.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Logging options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Maximum level emitted.
    pub level: Level,
    /// Output layout.
    pub format: OutputFormat,
    /// Log span open/close events.
    pub with_span_events: bool,
    /// Include source file and line.
    pub with_file_and_line: bool,
    /// Include thread names.
    pub with_thread_names: bool,
    /// Colour output; only honoured by [`OutputFormat::Pretty`].
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level and format from the `application` section.
    pub fn from_config(config: &EngineConfig) -> DaqResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format,
            ..Default::default()
        })
    }

    /// Set the output layout.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Toggle colour output.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize logging from the engine configuration.
pub fn init_from_config(config: &EngineConfig) -> DaqResult<()> {
    init(LoggingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// Calling this again after a subscriber is installed is a no-op, so tests and embedding
/// applications may call it freely.
pub fn init(config: LoggingConfig) -> DaqResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_name(config.level)));
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    match config.format {
        OutputFormat::Pretty => install(
            fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_ansi(config.with_ansi)
                .with_filter(filter),
        ),
        OutputFormat::Compact => install(
            fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_ansi(false)
                .with_filter(filter),
        ),
        OutputFormat::Json => install(
            fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_filter(filter),
        ),
    }
}

fn install<L>(layer: L) -> DaqResult<()>
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(DaqError::Configuration(format!(
                    "failed to initialize logging: {e}"
                )))
            }
        })
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> DaqResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(DaqError::Configuration(format!(
            "invalid log level '{level}', expected one of: trace, debug, info, warn, error"
        ))),
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("INFO").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_from_engine_config() {
        let mut config = EngineConfig::default();
        config.application.log_level = "warn".to_string();
        config.application.log_format = OutputFormat::Json;

        let logging = LoggingConfig::from_config(&config).unwrap();
        assert_eq!(logging.level, Level::WARN);
        assert_eq!(logging.format, OutputFormat::Json);
    }

    #[test]
    fn test_builder() {
        let config = LoggingConfig::new(Level::ERROR)
            .with_format(OutputFormat::Compact)
            .with_span_events(true)
            .with_ansi(false);
        assert_eq!(config.level, Level::ERROR);
        assert_eq!(config.format, OutputFormat::Compact);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }

    #[test]
    fn test_init_is_idempotent() {
        init(LoggingConfig::new(Level::INFO).with_format(OutputFormat::Compact)).unwrap();
        init(LoggingConfig::new(Level::DEBUG)).unwrap();
    }

    #[test]
    fn test_output_format_names() {
        let format: OutputFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, OutputFormat::Json);
        assert_eq!(serde_json::to_string(&OutputFormat::Pretty).unwrap(), "\"pretty\"");
    }
}
