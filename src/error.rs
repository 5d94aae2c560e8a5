//! Custom error types for the engine.
//!
//! This module defines the primary error type, `DaqError`, used by every layer from the
//! transport adapters up to the experiment orchestrator. Using the `thiserror` crate, it
//! gives each failure a distinct kind so callers can decide whether to continue or abort
//! instead of matching on message strings.
//!
//! ## Error Kinds
//!
//! - **`Connection`** / **`Timeout`**: the command channel is closed or a reply did not
//!   arrive in time. Fatal to a run; the session handle moves to `Faulted`.
//! - **`Configuration`**: an invalid parameter or instrument type. Always raised before
//!   anything is written to hardware.
//! - **`Parse`** / **`ResponseExhausted`**: a reply could not be read as a number. Inside a
//!   sweep these produce an absent sample and the sweep continues
//!   (see [`DaqError::is_point_recoverable`]).
//! - **`StabilizationTimeout`** / **`SensorFault`**: the temperature gate failed; the run
//!   ends before any electrical step.
//! - **`SessionBusy`**: another owner held the instrument session past the wait limit.
//! - **`Config`**, **`Io`**, **`Csv`**: wrapped errors from figment, std I/O and the csv
//!   writer, created through `#[from]` so `?` works at every boundary.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the engine error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Connection error on {address}: {reason}")]
    Connection { address: String, reason: String },

    #[error("Timed out after {timeout:?} waiting for a reply to '{command}' on {address}")]
    Timeout {
        address: String,
        command: String,
        timeout: Duration,
    },

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Non-numeric response to '{command}': {response:?}")]
    Parse { command: String, response: String },

    #[error("No valid response to '{command}' after {attempts} attempts (last: {last:?})")]
    ResponseExhausted {
        command: String,
        attempts: u32,
        last: String,
    },

    #[error(
        "Temperature did not settle at {target} ± {tolerance} within {timeout:?} (last reading: {last_reading})"
    )]
    StabilizationTimeout {
        target: f64,
        tolerance: f64,
        timeout: Duration,
        last_reading: f64,
    },

    #[error("Temperature sensor fault on input {channel}: {reason}")]
    SensorFault { channel: String, reason: String },

    #[error("Session {address} is in use by '{holder}', requested by '{requester}'")]
    SessionBusy {
        address: String,
        holder: String,
        requester: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV export error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl DaqError {
    /// True for failures that only invalidate the current measurement point.
    ///
    /// Sweeps and loggers record an absent sample for these and keep going; every other
    /// kind aborts the run.
    pub fn is_point_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::Parse { .. } | DaqError::ResponseExhausted { .. }
        )
    }

    /// True for failures that mean the command channel itself is unusable.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, DaqError::Connection { .. } | DaqError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Configuration("sensitivity index 31 out of range".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration validation error: sensitivity index 31 out of range"
        );
    }

    #[test]
    fn test_session_busy_names_both_owners() {
        let err = DaqError::SessionBusy {
            address: "GPIB0::12::INSTR".into(),
            holder: "run-1".into(),
            requester: "telemetry-poller".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("run-1"));
        assert!(msg.contains("telemetry-poller"));
    }

    #[test]
    fn test_point_recoverable_kinds() {
        assert!(DaqError::Parse {
            command: "MEAS:CURR?".into(),
            response: "garbage".into()
        }
        .is_point_recoverable());
        assert!(DaqError::ResponseExhausted {
            command: "MEAS:CURR?".into(),
            attempts: 3,
            last: "KEITHLEY".into()
        }
        .is_point_recoverable());
        assert!(!DaqError::Timeout {
            address: "mock".into(),
            command: "MEAS:CURR?".into(),
            timeout: Duration::from_secs(1)
        }
        .is_point_recoverable());
        assert!(!DaqError::Configuration("bad".into()).is_point_recoverable());
    }

    #[test]
    fn test_link_failure_kinds() {
        assert!(DaqError::Connection {
            address: "mock".into(),
            reason: "closed".into()
        }
        .is_link_failure());
        assert!(!DaqError::Configuration("x".into()).is_link_failure());
    }
}
