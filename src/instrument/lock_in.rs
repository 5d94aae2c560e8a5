//! SR830 lock-in amplifier driver.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dialect::Sr830;
use crate::error::DaqResult;
use crate::measurement::LockInOutput;
use crate::session::CommandChannel;
use crate::validator::ResponseValidator;

/// Reference and input settings applied before every lock-in experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInSettings {
    /// Internal reference frequency in Hz.
    pub frequency_hz: f64,
    /// Sine output amplitude in V rms.
    pub amplitude_v: f64,
    /// Time-constant index, 0 (10 µs) ..= 19 (30 ks).
    pub time_constant: u8,
    /// Sensitivity index, 0 (2 nV) ..= 26 (1 V).
    pub sensitivity: u8,
}

impl Default for LockInSettings {
    fn default() -> Self {
        Self {
            frequency_hz: 1000.0,
            amplitude_v: 0.1,
            time_constant: 8,
            sensitivity: 20,
        }
    }
}

impl LockInSettings {
    /// Build the configuration commands, failing on the first out-of-range value.
    pub fn commands(&self) -> DaqResult<Vec<String>> {
        let sr830 = Sr830;
        Ok(vec![
            sr830.frequency(self.frequency_hz)?,
            sr830.amplitude(self.amplitude_v)?,
            sr830.time_constant(self.time_constant)?,
            sr830.sensitivity(self.sensitivity)?,
        ])
    }
}

/// SR830 driver.
pub struct LockInAmplifier<C> {
    channel: C,
    validator: ResponseValidator,
}

impl<C: CommandChannel> LockInAmplifier<C> {
    /// Creates a driver over `channel`.
    pub fn new(channel: C, validator: ResponseValidator) -> Self {
        Self { channel, validator }
    }

    /// Release the underlying channel.
    pub fn into_inner(self) -> C {
        self.channel
    }

    /// Apply reference frequency, amplitude, time constant and sensitivity.
    ///
    /// Every value is validated before the first write.
    pub async fn configure(&mut self, settings: &LockInSettings) -> DaqResult<()> {
        for command in settings.commands()? {
            self.channel.write_command(&command).await?;
        }
        info!(
            frequency_hz = settings.frequency_hz,
            amplitude_v = settings.amplitude_v,
            time_constant = settings.time_constant,
            sensitivity = settings.sensitivity,
            "lock-in configured"
        );
        Ok(())
    }

    /// Set the reference frequency.
    pub async fn set_frequency(&mut self, hz: f64) -> DaqResult<()> {
        let command = Sr830.frequency(hz)?;
        self.channel.write_command(&command).await
    }

    /// Set the sine output amplitude.
    pub async fn set_amplitude(&mut self, volts: f64) -> DaqResult<()> {
        let command = Sr830.amplitude(volts)?;
        self.channel.write_command(&command).await
    }

    /// Set an auxiliary DC output.
    pub async fn set_aux_output(&mut self, channel: u8, volts: f64) -> DaqResult<()> {
        let command = Sr830.aux_output(channel, volts)?;
        self.channel.write_command(&command).await
    }

    /// Read X and Y in one query.
    pub async fn read_xy(&mut self) -> DaqResult<(f64, f64)> {
        self.validator
            .query_pair(&mut self.channel, Sr830.read_xy())
            .await
    }

    /// Read R and θ.
    pub async fn read_r_theta(&mut self) -> DaqResult<(f64, f64)> {
        let r = self
            .validator
            .query_numeric(&mut self.channel, Sr830.read_r())
            .await?;
        let theta = self
            .validator
            .query_numeric(&mut self.channel, Sr830.read_theta())
            .await?;
        Ok((r, theta))
    }

    /// Read the pair selected by `output`.
    pub async fn read(&mut self, output: LockInOutput) -> DaqResult<(f64, f64)> {
        match output {
            LockInOutput::XY => self.read_xy().await,
            LockInOutput::RTheta => self.read_r_theta().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::dialect::InstrumentKind;
    use crate::error::DaqError;
    use crate::session::{InstrumentHandle, InstrumentSession};
    use crate::validator::RecoveryPolicy;
    use std::time::Duration;

    fn lock_in(adapter: &MockAdapter) -> LockInAmplifier<InstrumentSession> {
        let session = InstrumentSession::new(
            InstrumentHandle::new("mock", InstrumentKind::Sr830),
            Box::new(adapter.clone()),
            Duration::from_secs(1),
        );
        LockInAmplifier::new(
            session,
            ResponseValidator::new(RecoveryPolicy::default()).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_configure_writes_all_settings() {
        let adapter = MockAdapter::new();
        let mut li = lock_in(&adapter);
        li.configure(&LockInSettings::default()).await.unwrap();
        assert_eq!(
            adapter.call_log(),
            vec!["FREQ 1000", "SLVL 0.1", "OFLT 8", "SENS 20"]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_index_writes_nothing() {
        let adapter = MockAdapter::new();
        let mut li = lock_in(&adapter);
        let settings = LockInSettings {
            sensitivity: 27,
            ..LockInSettings::default()
        };
        assert!(matches!(
            li.configure(&settings).await,
            Err(DaqError::Configuration(_))
        ));
        assert!(adapter.call_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_modes() {
        let adapter = MockAdapter::new()
            .on("OUTP? 1,2", "1.0e-6,-2.0e-7")
            .on("OUTP? 3", "1.02e-6")
            .on("OUTP? 4", "-11.3");
        let mut li = lock_in(&adapter);
        assert_eq!(li.read(LockInOutput::XY).await.unwrap(), (1.0e-6, -2.0e-7));
        assert_eq!(
            li.read(LockInOutput::RTheta).await.unwrap(),
            (1.02e-6, -11.3)
        );
    }
}
