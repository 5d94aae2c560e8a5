//! Engine configuration using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `SWEEPDAQ_` (`__` separates nesting)
//!
//! The engine only reads configuration; it never writes it back.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SWEEPDAQ_APPLICATION__LOG_LEVEL=debug
//! SWEEPDAQ_SESSION__TIMEOUT_MS=2000
//! SWEEPDAQ_RECOVERY__ATTEMPT_BUDGET=5
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "Cryostat bench"
//! log_level = "info"
//!
//! [[instruments]]
//! id = "smu"
//! kind = "keithley_2636b"
//! resource = "GPIB0::26::INSTR"
//! channel = "a"
//!
//! [[instruments]]
//! id = "cryo"
//! kind = "lakeshore_335"
//! resource = "GPIB0::12::INSTR"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::dialect::{InstrumentFamily, InstrumentKind, SmuDialect};
use crate::logging::OutputFormat;
use crate::validator::{RecoveryPolicy, DEFAULT_BANNER_KEYWORDS};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A layer failed to parse or extract.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values loaded but are inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument session settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Reply recovery settings
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Temperature gate settings
    #[serde(default)]
    pub stabilizer: StabilizerConfig,
    /// Background telemetry settings
    #[serde(default)]
    pub poller: PollerConfig,
    /// Lock-in settings
    #[serde(default)]
    pub lockin: LockInConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "sweep_daq".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Instrument session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Reply timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Line terminator appended to commands
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
    /// How long a run waits for a busy session, in milliseconds.
    ///
    /// Must exceed `timeout_ms` so a holder blocked on one query can finish.
    #[serde(default = "default_acquire_wait")]
    pub acquire_wait_ms: u64,
    /// Wait after an instrument reset, in milliseconds
    #[serde(default = "default_reset_settle")]
    pub reset_settle_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout(),
            line_terminator: default_line_terminator(),
            acquire_wait_ms: default_acquire_wait(),
            reset_settle_ms: default_reset_settle(),
        }
    }
}

/// Stale-banner recovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Maximum number of times a measurement query is issued
    #[serde(default = "default_attempt_budget")]
    pub attempt_budget: u32,
    /// Wait after discarding a stale banner, in milliseconds
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Wait before the first attempt of a measurement query, in milliseconds
    #[serde(default = "default_pre_query_delay")]
    pub pre_query_delay_ms: u64,
    /// Case-insensitive keywords marking a reply as a stale banner
    #[serde(default = "default_banner_keywords")]
    pub banner_keywords: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            attempt_budget: default_attempt_budget(),
            settle_delay_ms: default_settle_delay(),
            pre_query_delay_ms: default_pre_query_delay(),
            banner_keywords: default_banner_keywords(),
        }
    }
}

/// Temperature gate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilizerConfig {
    /// Sensor poll interval in milliseconds
    #[serde(default = "default_stabilizer_poll")]
    pub poll_interval_ms: u64,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_stabilizer_poll(),
        }
    }
}

/// Background telemetry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_poller_interval")]
    pub interval_ms: u64,
    /// Sensor input to display
    #[serde(default = "default_poller_input")]
    pub input: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poller_interval(),
            input: default_poller_input(),
        }
    }
}

/// Lock-in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInConfig {
    /// Settle time between a source step and the lock-in read, in milliseconds
    #[serde(default = "default_lockin_settle")]
    pub settle_ms: u64,
}

impl Default for LockInConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_lockin_settle(),
        }
    }
}

/// Instrument definition in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Instrument type
    pub kind: InstrumentKind,
    /// VISA resource string (e.g., "GPIB0::24::INSTR")
    pub resource: String,
    /// Source-measure channel (`a` or `b`, 2636B only)
    #[serde(default)]
    pub channel: Option<String>,
    /// Whether this instrument is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_timeout() -> u64 {
    5000
}

fn default_line_terminator() -> String {
    "\n".to_string()
}

fn default_acquire_wait() -> u64 {
    15000
}

fn default_reset_settle() -> u64 {
    1000
}

fn default_attempt_budget() -> u32 {
    3
}

fn default_settle_delay() -> u64 {
    200
}

fn default_pre_query_delay() -> u64 {
    300
}

fn default_banner_keywords() -> Vec<String> {
    DEFAULT_BANNER_KEYWORDS
        .iter()
        .map(|k| k.to_string())
        .collect()
}

fn default_stabilizer_poll() -> u64 {
    1000
}

fn default_poller_interval() -> u64 {
    1000
}

fn default_poller_input() -> String {
    "A".to_string()
}

fn default_lockin_settle() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl EngineConfig {
    /// Load defaults overlaid with `SWEEPDAQ_` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::extract(Self::figment())
    }

    /// Load defaults, then the TOML file at `path`, then environment variables.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SWEEPDAQ_").split("__"));
        Self::extract(figment)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Env::prefixed("SWEEPDAQ_").split("__"))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Timeouts, budgets and intervals are non-zero
    /// - The session acquire wait outlasts one query timeout
    /// - Instrument IDs are unique and resources non-empty
    /// - 2636B channels are `a` or `b`
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.session.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "session.timeout_ms must be > 0".to_string(),
            ));
        }
        if self.session.acquire_wait_ms <= self.session.timeout_ms {
            return Err(ConfigError::ValidationError(format!(
                "session.acquire_wait_ms ({}) must exceed session.timeout_ms ({})",
                self.session.acquire_wait_ms, self.session.timeout_ms
            )));
        }
        if self.recovery.attempt_budget == 0 {
            return Err(ConfigError::ValidationError(
                "recovery.attempt_budget must be >= 1".to_string(),
            ));
        }
        if self.stabilizer.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "stabilizer.poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.poller.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poller.interval_ms must be > 0".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(&instrument.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate instrument ID: '{}'",
                    instrument.id
                )));
            }
            self.validate_instrument(instrument)?;
        }

        Ok(())
    }

    fn validate_instrument(&self, instrument: &InstrumentDefinition) -> Result<(), ConfigError> {
        if instrument.id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Instrument ID cannot be empty".to_string(),
            ));
        }
        if instrument.resource.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Instrument '{}': 'resource' cannot be empty",
                instrument.id
            )));
        }
        if instrument.channel.is_some() {
            if instrument.kind.family() != InstrumentFamily::SourceMeter {
                return Err(ConfigError::ValidationError(format!(
                    "Instrument '{}': 'channel' only applies to source-measure units",
                    instrument.id
                )));
            }
            SmuDialect::for_kind(instrument.kind, instrument.channel.as_deref()).map_err(|e| {
                ConfigError::ValidationError(format!("Instrument '{}': {e}", instrument.id))
            })?;
        }
        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentDefinition> {
        self.instruments
            .iter()
            .filter(|inst| inst.enabled)
            .collect()
    }

    /// Get enabled instruments of a specific type
    pub fn instruments_by_kind(&self, kind: InstrumentKind) -> Vec<&InstrumentDefinition> {
        self.instruments
            .iter()
            .filter(|inst| inst.kind == kind && inst.enabled)
            .collect()
    }

    /// Reply timeout.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session.timeout_ms)
    }

    /// Recovery policy described by the `recovery` section.
    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            attempt_budget: self.recovery.attempt_budget,
            settle_delay: Duration::from_millis(self.recovery.settle_delay_ms),
            pre_query_delay: Duration::from_millis(self.recovery.pre_query_delay_ms),
            banner_keywords: self.recovery.banner_keywords.clone(),
        }
    }
}
