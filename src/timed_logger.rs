//! Fixed-interval logging on an absolute schedule.
//!
//! Sample `i` is taken no earlier than `start + i * interval`, measured from one start
//! instant, so measurement latency never accumulates into drift. A measurement slower
//! than the interval pushes the next scheduled time into the past and the next sample is
//! taken immediately; the schedule catches up instead of shifting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::error::{DaqError, DaqResult};
use crate::measurement::{Quantity, Reading};
use crate::run::{ExperimentRun, PhaseOutcome};

/// Unit of the recorded x value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeAxis {
    /// Milliseconds, rounded to 0.1 ms.
    #[default]
    Milliseconds,
    /// Seconds.
    Seconds,
}

/// A measurement the logger calls once per scheduled time.
#[async_trait]
pub trait Probe: Send {
    /// Take one reading.
    async fn sample(&mut self) -> DaqResult<Reading>;
}

/// Schedules `floor(duration / interval)` samples at a fixed interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedLogger {
    interval: Duration,
    duration: Duration,
    axis: TimeAxis,
    points: u32,
}

impl TimedLogger {
    /// Logger for `duration` at `interval`; a zero interval is rejected.
    pub fn new(interval: Duration, duration: Duration, axis: TimeAxis) -> DaqResult<Self> {
        if interval.is_zero() {
            return Err(DaqError::Configuration(
                "logging interval must be greater than zero".to_string(),
            ));
        }
        let points = u32::try_from(duration.as_nanos() / interval.as_nanos()).map_err(|_| {
            DaqError::Configuration(format!(
                "logging {duration:?} at {interval:?} needs too many samples"
            ))
        })?;
        Ok(Self {
            interval,
            duration,
            axis,
            points,
        })
    }

    /// Number of samples a full run records.
    pub fn point_count(&self) -> u32 {
        self.points
    }

    /// Sampling interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Total logging duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Recorded x value of sample `index`.
    pub fn x_value(&self, index: u32) -> f64 {
        let elapsed = self.interval * index;
        match self.axis {
            TimeAxis::Milliseconds => (elapsed.as_secs_f64() * 10_000.0).round() / 10.0,
            TimeAxis::Seconds => elapsed.as_secs_f64(),
        }
    }

    /// Take every scheduled sample, recording each into `run`.
    ///
    /// Whatever the probe returns is recorded as is; a probe error ends the run.
    pub async fn run<P>(
        &self,
        probe: &mut P,
        quantity: Quantity,
        run: &mut ExperimentRun,
    ) -> DaqResult<PhaseOutcome>
    where
        P: Probe + ?Sized,
    {
        info!(
            interval = ?self.interval,
            duration = ?self.duration,
            points = self.points,
            "timed logging started"
        );
        let start = Instant::now();
        for index in 0..self.points {
            if run.is_cancelled() {
                info!(index, "timed logging cancelled");
                return Ok(PhaseOutcome::Cancelled);
            }

            let scheduled = start + self.interval * index;
            let now = Instant::now();
            if now < scheduled {
                sleep_until(scheduled).await;
            } else if index > 0 {
                debug!(index, behind = ?(now - scheduled), "sample is late, not waiting");
            }

            let reading = probe.sample().await?;
            run.record(0, self.x_value(index), reading, quantity);
        }
        Ok(PhaseOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::CancellationFlag;

    /// Probe that takes `latency` per reading and notes when each call started.
    struct SlowProbe {
        latency: Duration,
        origin: Instant,
        started: Vec<Duration>,
    }

    impl SlowProbe {
        fn new(latency_ms: u64) -> Self {
            Self {
                latency: Duration::from_millis(latency_ms),
                origin: Instant::now(),
                started: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Probe for SlowProbe {
        async fn sample(&mut self) -> DaqResult<Reading> {
            self.started.push(self.origin.elapsed());
            tokio::time::sleep(self.latency).await;
            Ok(Reading::single(self.started.len() as f64))
        }
    }

    fn xs(run: &ExperimentRun) -> Vec<f64> {
        run.samples().iter().map(|s| s.x).collect()
    }

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|v| Duration::from_millis(*v)).collect()
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(matches!(
            TimedLogger::new(Duration::ZERO, Duration::from_secs(1), TimeAxis::Milliseconds),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_point_count_floors() {
        let logger = TimedLogger::new(
            Duration::from_millis(300),
            Duration::from_millis(1000),
            TimeAxis::Milliseconds,
        )
        .unwrap();
        assert_eq!(logger.point_count(), 3);
    }

    #[test]
    fn test_seconds_axis() {
        let logger = TimedLogger::new(
            Duration::from_millis(500),
            Duration::from_secs(2),
            TimeAxis::Seconds,
        )
        .unwrap();
        assert_eq!(logger.x_value(3), 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_independent_of_latency() {
        for latency in [0, 30, 60, 100] {
            let logger = TimedLogger::new(
                Duration::from_millis(100),
                Duration::from_millis(500),
                TimeAxis::Milliseconds,
            )
            .unwrap();
            let mut probe = SlowProbe::new(latency);
            let mut run = ExperimentRun::new("time-log", CancellationFlag::new());
            let outcome = logger
                .run(&mut probe, Quantity::Current, &mut run)
                .await
                .unwrap();

            assert_eq!(outcome, PhaseOutcome::Completed);
            assert_eq!(xs(&run), vec![0.0, 100.0, 200.0, 300.0, 400.0]);
            assert_eq!(probe.started, ms(&[0, 100, 200, 300, 400]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_measurement_catches_up_without_waiting() {
        let logger = TimedLogger::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            TimeAxis::Milliseconds,
        )
        .unwrap();
        let mut probe = SlowProbe::new(150);
        let mut run = ExperimentRun::new("time-log", CancellationFlag::new());
        logger
            .run(&mut probe, Quantity::Current, &mut run)
            .await
            .unwrap();

        assert_eq!(probe.started, ms(&[0, 150, 300, 450, 600]));
        assert_eq!(xs(&run), vec![0.0, 100.0, 200.0, 300.0, 400.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_sample() {
        let logger = TimedLogger::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            TimeAxis::Milliseconds,
        )
        .unwrap();
        let flag = CancellationFlag::new();
        flag.cancel();
        let mut probe = SlowProbe::new(0);
        let mut run = ExperimentRun::new("time-log", flag);
        let outcome = logger
            .run(&mut probe, Quantity::Current, &mut run)
            .await
            .unwrap();
        assert_eq!(outcome, PhaseOutcome::Cancelled);
        assert!(probe.started.is_empty());
    }

    struct FailingProbe;

    #[async_trait]
    impl Probe for FailingProbe {
        async fn sample(&mut self) -> DaqResult<Reading> {
            Err(DaqError::Connection {
                address: "mock".into(),
                reason: "closed".into(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_propagates() {
        let logger = TimedLogger::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            TimeAxis::Milliseconds,
        )
        .unwrap();
        let mut run = ExperimentRun::new("time-log", CancellationFlag::new());
        let err = logger
            .run(&mut FailingProbe, Quantity::Current, &mut run)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Connection { .. }));
        assert!(run.samples().is_empty());
    }
}
