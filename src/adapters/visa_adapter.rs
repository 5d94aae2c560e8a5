//! VISA transport adapter for GPIB/USB/Ethernet instruments
//!
//! Wraps the `visa-rs` bindings behind the [`Adapter`] trait. VISA calls are blocking, so
//! every operation runs on Tokio's blocking pool. Without the `instrument_visa` feature the
//! adapter still exists but refuses to connect, so configuration and CLI code paths stay
//! identical across builds.

use async_trait::async_trait;
use std::time::Duration;

use super::Adapter;
use crate::error::{DaqError, DaqResult};

#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// VISA adapter for instrument communication
///
/// Supports resource strings like:
/// - "GPIB0::12::INSTR" (GPIB interface)
/// - "USB0::0x05E6::0x2450::04096331::INSTR" (USB-TMC)
/// - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
pub struct VisaAdapter {
    /// VISA resource string (e.g., "GPIB0::12::INSTR")
    resource_string: String,

    /// Timeout used when opening the resource
    open_timeout: Duration,

    /// Line terminator appended to commands (typically "\n")
    line_terminator: String,

    #[cfg(feature = "instrument_visa")]
    instrument: Option<Arc<std::sync::Mutex<Instrument>>>,

    #[cfg(feature = "instrument_visa")]
    _rm: Option<DefaultRM>,
}

impl VisaAdapter {
    /// Create an unconnected VISA adapter with default settings
    pub fn new(resource_string: impl Into<String>) -> Self {
        Self {
            resource_string: resource_string.into(),
            open_timeout: Duration::from_secs(2),
            line_terminator: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            instrument: None,
            #[cfg(feature = "instrument_visa")]
            _rm: None,
        }
    }

    /// Set the timeout used when opening the resource
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// The resource string this adapter talks to
    pub fn resource(&self) -> &str {
        &self.resource_string
    }

    fn connection_error(&self, reason: impl Into<String>) -> DaqError {
        DaqError::Connection {
            address: self.resource_string.clone(),
            reason: reason.into(),
        }
    }

    /// Open the VISA resource.
    #[cfg(feature = "instrument_visa")]
    pub async fn connect(mut self) -> DaqResult<Self> {
        let resource = self.resource_string.clone();
        let open_timeout = self.open_timeout;

        let opened = tokio::task::spawn_blocking(move || -> Result<_, String> {
            let rm = DefaultRM::new().map_err(|e| format!("resource manager: {e}"))?;
            let name = std::ffi::CString::new(resource.as_str())
                .map_err(|e| format!("invalid resource string: {e}"))?;
            let instr = rm
                .open(&name.into(), AccessMode::NO_LOCK, open_timeout)
                .map_err(|e| format!("open failed: {e}"))?;
            Ok((rm, instr))
        })
        .await
        .map_err(|e| self.connection_error(format!("VISA open task failed: {e}")))?
        .map_err(|reason| self.connection_error(reason))?;

        debug!(resource = %self.resource_string, "VISA resource opened");
        self._rm = Some(opened.0);
        self.instrument = Some(Arc::new(std::sync::Mutex::new(opened.1)));
        Ok(self)
    }

    /// Open the VISA resource.
    #[cfg(not(feature = "instrument_visa"))]
    pub async fn connect(self) -> DaqResult<Self> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    #[cfg(feature = "instrument_visa")]
    async fn with_instrument<T, F>(&self, op: F) -> DaqResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Instrument) -> std::io::Result<T> + Send + 'static,
    {
        let instrument = self
            .instrument
            .clone()
            .ok_or_else(|| self.connection_error("VISA instrument not connected"))?;

        tokio::task::spawn_blocking(move || {
            let mut guard = instrument
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            op(&mut guard)
        })
        .await
        .map_err(|e| self.connection_error(format!("VISA I/O task failed: {e}")))?
        .map_err(|e| self.connection_error(e.to_string()))
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl Adapter for VisaAdapter {
    async fn write_line(&mut self, line: &str) -> DaqResult<()> {
        use std::io::Write;

        let payload = format!("{}{}", line, self.line_terminator).into_bytes();
        self.with_instrument(move |instr| instr.write_all(&payload))
            .await
    }

    async fn read_line(&mut self) -> DaqResult<String> {
        use std::io::{BufRead, BufReader};

        self.with_instrument(|instr| {
            let mut response = String::new();
            BufReader::new(&*instr).read_line(&mut response)?;
            Ok(response.trim_end_matches(['\r', '\n']).to_string())
        })
        .await
    }

    async fn discard_input(&mut self) -> DaqResult<()> {
        self.with_instrument(|instr| {
            instr
                .visa_flush(visa_rs::flags::FlushMode::READ_BUF_DISCARD)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })
        .await
    }

    async fn close(&mut self) -> DaqResult<()> {
        self.instrument = None;
        self._rm = None;
        debug!(resource = %self.resource_string, "VISA resource closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.instrument.is_some()
    }

    fn info(&self) -> String {
        format!("VISA {}", self.resource_string)
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl Adapter for VisaAdapter {
    async fn write_line(&mut self, _line: &str) -> DaqResult<()> {
        Err(self.connection_error("VISA support not enabled. Rebuild with --features instrument_visa"))
    }

    async fn read_line(&mut self) -> DaqResult<String> {
        Err(self.connection_error("VISA support not enabled. Rebuild with --features instrument_visa"))
    }

    async fn discard_input(&mut self) -> DaqResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> DaqResult<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn info(&self) -> String {
        format!("VISA {} (disabled)", self.resource_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_settings() {
        let adapter = VisaAdapter::new("GPIB0::12::INSTR")
            .with_timeout(Duration::from_millis(500))
            .with_line_terminator("\r\n");
        assert_eq!(adapter.resource(), "GPIB0::12::INSTR");
        assert_eq!(adapter.open_timeout, Duration::from_millis(500));
        assert_eq!(adapter.line_terminator, "\r\n");
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_connect_without_feature_is_rejected() {
        let err = VisaAdapter::new("GPIB0::12::INSTR")
            .connect()
            .await
            .err()
            .map(|e| e.to_string());
        assert_eq!(
            err.as_deref(),
            Some("Feature 'instrument_visa' is not enabled. Please build with --features instrument_visa")
        );
    }
}
