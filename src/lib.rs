//! Instrument session and sweep orchestration engine.
//!
//! Drives Keithley source-measure units, LakeShore temperature controllers and an SR830
//! lock-in amplifier over line-oriented command channels, and sequences sweeps, timed
//! logging and temperature-gated experiments against them.
//!
//! Layers, leaves first: [`adapters`] (transport), [`session`] (timeouts, ownership),
//! [`validator`] (reply recovery), [`dialect`] and [`instrument`] (command sets and
//! drivers), the [`sweep`], [`timed_logger`] and [`stabilizer`] engines, and
//! [`experiment`] on top. [`poller`] is the independent background telemetry task.

pub mod adapters;
pub mod config;
pub mod dialect;
pub mod error;
pub mod experiment;
pub mod export;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod poller;
pub mod run;
pub mod session;
pub mod stabilizer;
pub mod sweep;
pub mod timed_logger;
pub mod validator;

pub use error::{DaqError, DaqResult};
pub use experiment::{Experiment, ExperimentOrchestrator, ExperimentRequest};
pub use run::{CancellationFlag, RunEvent, RunStatus};
