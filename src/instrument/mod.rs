//! Instrument drivers.
//!
//! Drivers pair a [`CommandChannel`](crate::session::CommandChannel) with a command
//! dialect and the response validator. They are generic over the channel so the same
//! driver runs on a bare [`InstrumentSession`](crate::session::InstrumentSession) in tests
//! and on a [`SessionGuard`](crate::session::SessionGuard) during a run.

use async_trait::async_trait;

use crate::error::DaqResult;

pub mod lock_in;
pub mod source_meter;
pub mod temperature_controller;

pub use lock_in::{LockInAmplifier, LockInSettings};
pub use source_meter::SourceMeter;
pub use temperature_controller::TemperatureController;

/// Capability for instruments that report a temperature in °C.
#[async_trait]
pub trait TemperatureSensor: Send {
    /// Read sensor `input` once. No retry: any failure is returned as is.
    async fn read_temperature(&mut self, input: &str) -> DaqResult<f64>;
}
