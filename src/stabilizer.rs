//! Temperature gate.
//!
//! Polls a sensor until it reads within tolerance of the target. The check happens before
//! any sleep, so a sensor already in band passes with no wait. A failed sensor read ends
//! the wait at once; it is never retried.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::{DaqError, DaqResult};
use crate::instrument::TemperatureSensor;
use crate::run::CancellationFlag;

/// Temperature a run must reach before its electrical phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilizationTarget {
    /// Target temperature in °C.
    pub temperature: f64,
    /// Accepted deviation in °C (> 0).
    pub tolerance: f64,
    /// Give up after this long.
    pub timeout: Duration,
    /// Sensor input to read (`A` or `B`).
    pub sensor_input: String,
    /// Control loop whose setpoint is written before waiting.
    pub control_loop: u8,
}

impl StabilizationTarget {
    /// Target on input `A`, loop 1.
    pub fn new(temperature: f64, tolerance: f64, timeout: Duration) -> Self {
        Self {
            temperature,
            tolerance,
            timeout,
            sensor_input: "A".to_string(),
            control_loop: 1,
        }
    }

    /// Reject non-positive tolerances and non-finite targets.
    pub fn validate(&self) -> DaqResult<()> {
        if !self.temperature.is_finite() {
            return Err(DaqError::Configuration(format!(
                "target temperature must be finite, got {}",
                self.temperature
            )));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(DaqError::Configuration(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }

    /// Whether `reading` is inside the band.
    pub fn is_within(&self, reading: f64) -> bool {
        (reading - self.temperature).abs() <= self.tolerance
    }
}

/// How the wait ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StabilizationOutcome {
    /// The sensor read inside the band.
    Stable {
        /// Reading that passed.
        reading: f64,
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// The run was cancelled while waiting.
    Cancelled,
}

/// Polls a [`TemperatureSensor`] until it is in band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureStabilizer {
    poll_interval: Duration,
}

impl Default for TemperatureStabilizer {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl TemperatureStabilizer {
    /// Stabilizer polling every `poll_interval`.
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Wait until `sensor` reads within tolerance of `target`.
    ///
    /// Fails with [`DaqError::SensorFault`] on the first failed read and with
    /// [`DaqError::StabilizationTimeout`] once the timeout has passed.
    pub async fn wait<S>(
        &self,
        sensor: &mut S,
        target: &StabilizationTarget,
        cancel: &CancellationFlag,
    ) -> DaqResult<StabilizationOutcome>
    where
        S: TemperatureSensor + ?Sized,
    {
        target.validate()?;
        info!(
            target = target.temperature,
            tolerance = target.tolerance,
            timeout = ?target.timeout,
            input = %target.sensor_input,
            "waiting for temperature to stabilize"
        );
        let start = Instant::now();
        loop {
            if cancel.is_cancelled() {
                info!("temperature wait cancelled");
                return Ok(StabilizationOutcome::Cancelled);
            }

            let reading = sensor
                .read_temperature(&target.sensor_input)
                .await
                .map_err(|err| {
                    warn!(input = %target.sensor_input, error = %err, "temperature read failed");
                    DaqError::SensorFault {
                        channel: target.sensor_input.clone(),
                        reason: err.to_string(),
                    }
                })?;

            let elapsed = start.elapsed();
            if target.is_within(reading) {
                info!(reading, elapsed = ?elapsed, "temperature stable");
                return Ok(StabilizationOutcome::Stable { reading, elapsed });
            }
            if elapsed > target.timeout {
                return Err(DaqError::StabilizationTimeout {
                    target: target.temperature,
                    tolerance: target.tolerance,
                    timeout: target.timeout,
                    last_reading: reading,
                });
            }
            debug!(reading, elapsed = ?elapsed, "temperature not yet in band");
            sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Sensor replaying scripted readings; the last one repeats.
    struct ScriptedSensor {
        readings: VecDeque<DaqResult<f64>>,
        reads: usize,
    }

    impl ScriptedSensor {
        fn new(readings: Vec<DaqResult<f64>>) -> Self {
            Self {
                readings: readings.into(),
                reads: 0,
            }
        }
    }

    #[async_trait]
    impl TemperatureSensor for ScriptedSensor {
        async fn read_temperature(&mut self, _input: &str) -> DaqResult<f64> {
            self.reads += 1;
            if self.readings.len() > 1 {
                self.readings.pop_front().unwrap_or(Ok(f64::NAN))
            } else {
                match self.readings.front() {
                    Some(Ok(v)) => Ok(*v),
                    _ => Err(DaqError::Parse {
                        command: "KRDG? A".into(),
                        response: "garbage".into(),
                    }),
                }
            }
        }
    }

    fn target() -> StabilizationTarget {
        StabilizationTarget::new(25.0, 0.5, Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_band_on_first_read_does_not_sleep() {
        let mut sensor = ScriptedSensor::new(vec![Ok(25.2)]);
        let start = Instant::now();
        let outcome = TemperatureStabilizer::default()
            .wait(&mut sensor, &target(), &CancellationFlag::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StabilizationOutcome::Stable {
                reading: 25.2,
                elapsed: Duration::ZERO
            }
        );
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(sensor.reads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_is_immediate() {
        let mut sensor = ScriptedSensor::new(vec![Err(DaqError::Parse {
            command: "KRDG? A".into(),
            response: "garbage".into(),
        })]);
        let start = Instant::now();
        let err = TemperatureStabilizer::default()
            .wait(&mut sensor, &target(), &CancellationFlag::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DaqError::SensorFault { .. }));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(sensor.reads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_in_band() {
        let mut sensor = ScriptedSensor::new(vec![Ok(20.0), Ok(23.0), Ok(24.6)]);
        let outcome = TemperatureStabilizer::default()
            .wait(&mut sensor, &target(), &CancellationFlag::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StabilizationOutcome::Stable {
                reading: 24.6,
                elapsed: Duration::from_secs(2)
            }
        );
        assert_eq!(sensor.reads, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let mut sensor = ScriptedSensor::new(vec![Ok(10.0)]);
        let target = StabilizationTarget::new(25.0, 0.5, Duration::from_secs(3));
        let err = TemperatureStabilizer::default()
            .wait(&mut sensor, &target, &CancellationFlag::new())
            .await
            .unwrap_err();

        match err {
            DaqError::StabilizationTimeout { last_reading, .. } => assert_eq!(last_reading, 10.0),
            other => panic!("unexpected error: {other}"),
        }
        // reads at 0, 1, 2, 3 and 4 s; 4 s is past the timeout
        assert_eq!(sensor.reads, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_tolerance_rejected_before_reading() {
        let mut sensor = ScriptedSensor::new(vec![Ok(25.0)]);
        let target = StabilizationTarget::new(25.0, 0.0, Duration::from_secs(3));
        assert!(matches!(
            TemperatureStabilizer::default()
                .wait(&mut sensor, &target, &CancellationFlag::new())
                .await,
            Err(DaqError::Configuration(_))
        ));
        assert_eq!(sensor.reads, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait() {
        let mut sensor = ScriptedSensor::new(vec![Ok(10.0)]);
        let flag = CancellationFlag::new();
        flag.cancel();
        let outcome = TemperatureStabilizer::default()
            .wait(&mut sensor, &target(), &flag)
            .await
            .unwrap();
        assert_eq!(outcome, StabilizationOutcome::Cancelled);
        assert_eq!(sensor.reads, 0);
    }
}
