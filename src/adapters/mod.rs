//! Transport adapters.
//!
//! An adapter is a bidirectional, line-oriented text channel to one instrument. It knows
//! nothing about command dialects or reply formats; [`crate::session::InstrumentSession`]
//! layers timeouts, state tracking and logging on top of it.

use async_trait::async_trait;

use crate::error::DaqResult;

pub mod mock_adapter;
pub use mock_adapter::{MockAdapter, MockReply};

pub mod simulated;
pub use simulated::{simulated_instrument, SIMULATED_LOAD_OHMS};

pub mod visa_adapter;
pub use visa_adapter::VisaAdapter;

/// Generic async adapter trait for a half-duplex text command channel.
#[async_trait]
pub trait Adapter: Send {
    /// Write one command line. The adapter appends its line terminator.
    async fn write_line(&mut self, line: &str) -> DaqResult<()>;

    /// Read one reply line with the terminator stripped.
    ///
    /// May wait indefinitely; callers bound it with their own timeout.
    async fn read_line(&mut self) -> DaqResult<String>;

    /// Drop any input buffered but not yet read.
    async fn discard_input(&mut self) -> DaqResult<()>;

    /// Close the channel. Later reads and writes fail with a connection error.
    async fn close(&mut self) -> DaqResult<()>;

    /// Whether the channel is open.
    fn is_connected(&self) -> bool;

    /// Human-readable description of the underlying resource.
    fn info(&self) -> String;
}
