//! Sweep plans and the sweep controller.
//!
//! A [`SweepPlan`] describes `cycles` repetitions of `steps` evenly spaced setpoints between
//! `start` and `stop` inclusive. With [`SweepDirection::Bidirectional`] each forward pass is
//! followed immediately by the same values in reverse. [`SweepPlan::points`] yields the
//! setpoints lazily.
//!
//! [`SweepController::run`] drives any [`SweepTarget`] through a point sequence: check
//! cancellation, apply the setpoint, wait the settle time, measure, record. A parse failure
//! records an absent sample and the sweep continues; any other failure aborts. The target
//! is released (output off) on every exit path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::{DaqError, DaqResult};
use crate::measurement::{MeasureType, Quantity, Reading, SourceType};
use crate::run::{ExperimentRun, PhaseOutcome};

/// Order in which a cycle visits the setpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SweepDirection {
    /// start → stop.
    #[default]
    Forward,
    /// start → stop, then stop → start.
    Bidirectional,
}

/// Parameterized sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepPlan {
    /// First setpoint.
    pub start: f64,
    /// Last setpoint of the forward pass.
    pub stop: f64,
    /// Setpoints per forward pass (≥ 1).
    pub steps: usize,
    /// Number of cycles (≥ 1).
    pub cycles: usize,
    /// Forward or bidirectional.
    pub direction: SweepDirection,
    /// Swept quantity.
    pub source_type: SourceType,
    /// Measured quantity.
    pub measure_type: MeasureType,
}

impl SweepPlan {
    /// One forward voltage sweep measuring current.
    pub fn new(start: f64, stop: f64, steps: usize) -> Self {
        Self {
            start,
            stop,
            steps,
            cycles: 1,
            direction: SweepDirection::Forward,
            source_type: SourceType::Voltage,
            measure_type: MeasureType::Current,
        }
    }

    /// Repeat the sweep `cycles` times.
    pub fn with_cycles(mut self, cycles: usize) -> Self {
        self.cycles = cycles;
        self
    }

    /// Set the direction.
    pub fn with_direction(mut self, direction: SweepDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Set source and measure quantities.
    pub fn with_types(mut self, source: SourceType, measure: MeasureType) -> Self {
        self.source_type = source;
        self.measure_type = measure;
        self
    }

    /// Reject empty or non-finite plans.
    pub fn validate(&self) -> DaqResult<()> {
        if self.steps == 0 {
            return Err(DaqError::Configuration(
                "sweep needs at least one step".to_string(),
            ));
        }
        if self.cycles == 0 {
            return Err(DaqError::Configuration(
                "sweep needs at least one cycle".to_string(),
            ));
        }
        if !(self.start.is_finite() && self.stop.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "sweep bounds must be finite, got {}..{}",
                self.start, self.stop
            )));
        }
        if self.checked_total_points().is_none() {
            return Err(DaqError::Configuration(format!(
                "sweep of {} steps x {} cycles ({:?}) has too many points",
                self.steps, self.cycles, self.direction
            )));
        }
        Ok(())
    }

    fn checked_total_points(&self) -> Option<usize> {
        let passes = match self.direction {
            SweepDirection::Forward => 1,
            SweepDirection::Bidirectional => 2,
        };
        self.steps.checked_mul(passes)?.checked_mul(self.cycles)
    }

    /// Points visited per cycle, saturating for plans [`validate`](Self::validate) rejects.
    pub fn points_per_cycle(&self) -> usize {
        match self.direction {
            SweepDirection::Forward => self.steps,
            SweepDirection::Bidirectional => self.steps.saturating_mul(2),
        }
    }

    /// Points visited by the whole plan, saturating for plans `validate` rejects.
    pub fn total_points(&self) -> usize {
        self.points_per_cycle().saturating_mul(self.cycles)
    }

    /// Setpoint `index` of the forward pass.
    pub fn value_at(&self, index: usize) -> f64 {
        if self.steps <= 1 {
            return self.start;
        }
        if index + 1 >= self.steps {
            return self.stop;
        }
        let step = (self.stop - self.start) / (self.steps - 1) as f64;
        self.start + step * index as f64
    }

    /// Lazy, non-restartable point sequence.
    pub fn points(&self) -> SweepPoints {
        generate(self)
    }
}

/// One visit of a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPoint {
    /// Cycle the point belongs to.
    pub cycle: usize,
    /// Position within the cycle.
    pub index: usize,
    /// Value to apply.
    pub setpoint: f64,
}

/// Iterator over the points of a [`SweepPlan`].
#[derive(Debug, Clone)]
pub struct SweepPoints {
    plan: SweepPlan,
    cycle: usize,
    index: usize,
}

/// Produce the point sequence of `plan`.
pub fn generate(plan: &SweepPlan) -> SweepPoints {
    SweepPoints {
        plan: *plan,
        cycle: 0,
        index: 0,
    }
}

impl Iterator for SweepPoints {
    type Item = SweepPoint;

    fn next(&mut self) -> Option<SweepPoint> {
        let per_cycle = self.plan.points_per_cycle();
        if per_cycle == 0 || self.cycle >= self.plan.cycles {
            return None;
        }
        let steps = self.plan.steps;
        let setpoint = if self.index < steps {
            self.plan.value_at(self.index)
        } else {
            self.plan.value_at(steps - 1 - (self.index - steps))
        };
        let point = SweepPoint {
            cycle: self.cycle,
            index: self.index,
            setpoint,
        };
        self.index += 1;
        if self.index >= per_cycle {
            self.index = 0;
            self.cycle += 1;
        }
        Some(point)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let per_cycle = self.plan.points_per_cycle();
        let remaining = if self.cycle >= self.plan.cycles {
            0
        } else {
            (self.plan.cycles - self.cycle)
                .saturating_mul(per_cycle)
                .saturating_sub(self.index)
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SweepPoints {}

/// Most points a fixed-step sweep may visit.
pub const MAX_FIXED_STEP_POINTS: usize = u32::MAX as usize;

/// Points `start, start + interval, …` up to and including `stop`, generated lazily.
///
/// The point count is checked up front; a range that would need more than
/// [`MAX_FIXED_STEP_POINTS`] points is a `Configuration` error.
pub fn fixed_step_points(start: f64, stop: f64, interval: f64) -> DaqResult<FixedStepPoints> {
    if !(interval.is_finite() && interval > 0.0) {
        return Err(DaqError::Configuration(format!(
            "step interval must be positive, got {interval}"
        )));
    }
    if !(start.is_finite() && stop.is_finite()) || stop < start {
        return Err(DaqError::Configuration(format!(
            "invalid range {start}..={stop}"
        )));
    }
    let steps = ((stop - start) / interval + 1e-9).floor();
    let too_many = || {
        DaqError::Configuration(format!(
            "stepping {start}..={stop} by {interval} needs too many points"
        ))
    };
    if !(steps.is_finite() && steps < MAX_FIXED_STEP_POINTS as f64) {
        return Err(too_many());
    }
    let count = (steps as usize).checked_add(1).ok_or_else(too_many)?;
    Ok(FixedStepPoints {
        start,
        interval,
        count,
        index: 0,
    })
}

/// Iterator returned by [`fixed_step_points`].
#[derive(Debug, Clone)]
pub struct FixedStepPoints {
    start: f64,
    interval: f64,
    count: usize,
    index: usize,
}

impl Iterator for FixedStepPoints {
    type Item = SweepPoint;

    fn next(&mut self) -> Option<SweepPoint> {
        if self.index >= self.count {
            return None;
        }
        let index = self.index;
        self.index += 1;
        Some(SweepPoint {
            cycle: 0,
            index,
            setpoint: self.start + self.interval * index as f64,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FixedStepPoints {}

/// Something a sweep can step through: apply a setpoint, measure, release.
#[async_trait]
pub trait SweepTarget: Send {
    /// Drive the output to `setpoint` (writing the level and enabling output as needed).
    async fn apply(&mut self, setpoint: f64) -> DaqResult<()>;

    /// Take one reading at the current setpoint.
    async fn measure(&mut self) -> DaqResult<Reading>;

    /// Return the hardware to a safe state (output off). Called on every exit path.
    async fn release(&mut self) -> DaqResult<()>;
}

/// Drives a [`SweepTarget`] through a point sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepController {
    settle: Duration,
}

impl SweepController {
    /// Controller waiting `settle` between applying a setpoint and measuring.
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }

    /// Settle time between apply and measure.
    pub fn settle(&self) -> Duration {
        self.settle
    }

    /// Visit every point, recording one sample each into `run`.
    ///
    /// Cancellation is checked before each point, so after a cancel no further setpoint
    /// is written. The target is released before this returns, whatever the outcome.
    pub async fn run<T, I>(
        &self,
        points: I,
        target: &mut T,
        quantity: Quantity,
        run: &mut ExperimentRun,
    ) -> DaqResult<PhaseOutcome>
    where
        T: SweepTarget + ?Sized,
        I: IntoIterator<Item = SweepPoint> + Send,
        I::IntoIter: Send,
    {
        let result = self.drive(points, target, quantity, run).await;
        let released = target.release().await;

        match (result, released) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(err)) => {
                error!(error = %err, "failed to release sweep target");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                error!(error = %release_err, "failed to release sweep target after error");
                Err(err)
            }
        }
    }

    async fn drive<T, I>(
        &self,
        points: I,
        target: &mut T,
        quantity: Quantity,
        run: &mut ExperimentRun,
    ) -> DaqResult<PhaseOutcome>
    where
        T: SweepTarget + ?Sized,
        I: IntoIterator<Item = SweepPoint> + Send,
        I::IntoIter: Send,
    {
        for point in points {
            if run.is_cancelled() {
                info!(
                    cycle = point.cycle,
                    index = point.index,
                    "sweep cancelled before point"
                );
                return Ok(PhaseOutcome::Cancelled);
            }

            target.apply(point.setpoint).await?;
            if !self.settle.is_zero() {
                sleep(self.settle).await;
            }

            let reading = match target.measure().await {
                Ok(reading) => reading,
                Err(err) if err.is_point_recoverable() => {
                    warn!(
                        cycle = point.cycle,
                        index = point.index,
                        setpoint = point.setpoint,
                        error = %err,
                        "measurement failed, recording absent value"
                    );
                    Reading::absent()
                }
                Err(err) => return Err(err),
            };
            run.record(point.cycle, point.setpoint, reading, quantity);
        }
        Ok(PhaseOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::CancellationFlag;
    use std::collections::VecDeque;

    fn setpoints(plan: &SweepPlan) -> Vec<f64> {
        plan.points().map(|p| p.setpoint).collect()
    }

    #[test]
    fn test_forward_linear_spacing() {
        let plan = SweepPlan::new(0.0, 1.0, 5);
        assert_eq!(setpoints(&plan), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_point_counts() {
        for steps in 1..6 {
            for cycles in 1..4 {
                let forward = SweepPlan::new(-1.0, 1.0, steps).with_cycles(cycles);
                assert_eq!(forward.points().count(), steps * cycles);
                assert_eq!(forward.points().len(), steps * cycles);

                let both = forward.with_direction(SweepDirection::Bidirectional);
                assert_eq!(both.points().count(), 2 * steps * cycles);
            }
        }
    }

    #[test]
    fn test_bidirectional_mirrors_each_cycle() {
        let plan = SweepPlan::new(0.0, 1.0, 3)
            .with_cycles(2)
            .with_direction(SweepDirection::Bidirectional);
        assert_eq!(
            setpoints(&plan),
            vec![0.0, 0.5, 1.0, 1.0, 0.5, 0.0, 0.0, 0.5, 1.0, 1.0, 0.5, 0.0]
        );
        let cycles: Vec<usize> = plan.points().map(|p| p.cycle).collect();
        assert_eq!(cycles, vec![0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_single_step_yields_start() {
        let plan = SweepPlan::new(0.3, 1.0, 1);
        assert_eq!(setpoints(&plan), vec![0.3]);
    }

    #[test]
    fn test_descending_sweep() {
        let plan = SweepPlan::new(1.0, -1.0, 3);
        assert_eq!(setpoints(&plan), vec![1.0, 0.0, -1.0]);
    }

    #[test]
    fn test_validate() {
        assert!(SweepPlan::new(0.0, 1.0, 0).validate().is_err());
        assert!(SweepPlan::new(0.0, 1.0, 2).with_cycles(0).validate().is_err());
        assert!(SweepPlan::new(0.0, f64::INFINITY, 2).validate().is_err());
        assert!(SweepPlan::new(0.0, 1.0, 2).validate().is_ok());
    }

    #[test]
    fn test_fixed_step_points_include_stop() {
        let freqs: Vec<f64> = fixed_step_points(100.0, 500.0, 100.0)
            .unwrap()
            .into_iter()
            .map(|p| p.setpoint)
            .collect();
        assert_eq!(freqs, vec![100.0, 200.0, 300.0, 400.0, 500.0]);
        assert_eq!(fixed_step_points(100.0, 450.0, 100.0).unwrap().len(), 4);
        assert!(fixed_step_points(100.0, 500.0, 0.0).is_err());
        assert!(fixed_step_points(500.0, 100.0, 10.0).is_err());
    }

    #[test]
    fn test_fixed_step_points_reject_huge_ranges() {
        assert!(matches!(
            fixed_step_points(0.001, 1e300, 1e-300),
            Err(DaqError::Configuration(_))
        ));
        assert!(matches!(
            fixed_step_points(0.0, 1e12, 1e-3),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_fixed_step_points_are_lazy() {
        // about 1e9 points; nothing is allocated up front
        let mut points = fixed_step_points(0.001, 102_000.0, 1e-4).unwrap();
        assert!(points.len() > 1_000_000_000);
        assert_eq!(points.next().map(|p| p.setpoint), Some(0.001));
        assert_eq!(points.next().map(|p| p.index), Some(1));
    }

    #[test]
    fn test_overflowing_plan_rejected() {
        let plan = SweepPlan::new(0.0, 1.0, usize::MAX / 2 + 1)
            .with_direction(SweepDirection::Bidirectional);
        assert!(matches!(plan.validate(), Err(DaqError::Configuration(_))));
        assert_eq!(plan.total_points(), usize::MAX);

        let plan = SweepPlan::new(0.0, 1.0, usize::MAX / 2).with_cycles(3);
        assert!(plan.validate().is_err());

        let plan = SweepPlan::new(0.0, 1.0, 1_000).with_cycles(1_000);
        assert!(plan.validate().is_ok());
    }

    /// Scripted target recording what the controller asked for.
    struct ScriptedTarget {
        applied: Vec<f64>,
        readings: VecDeque<DaqResult<Reading>>,
        released: usize,
        cancel_after: Option<(usize, CancellationFlag)>,
    }

    impl ScriptedTarget {
        fn new(readings: Vec<DaqResult<Reading>>) -> Self {
            Self {
                applied: Vec::new(),
                readings: readings.into(),
                released: 0,
                cancel_after: None,
            }
        }
    }

    #[async_trait]
    impl SweepTarget for ScriptedTarget {
        async fn apply(&mut self, setpoint: f64) -> DaqResult<()> {
            self.applied.push(setpoint);
            Ok(())
        }

        async fn measure(&mut self) -> DaqResult<Reading> {
            if let Some((after, flag)) = &self.cancel_after {
                if self.applied.len() == *after {
                    flag.cancel();
                }
            }
            self.readings
                .pop_front()
                .unwrap_or_else(|| Ok(Reading::single(1.0)))
        }

        async fn release(&mut self) -> DaqResult<()> {
            self.released += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_parse_failure_records_absent_and_continues() {
        let mut target = ScriptedTarget::new(vec![
            Ok(Reading::single(0.1)),
            Err(DaqError::Parse {
                command: "MEAS:CURR?".into(),
                response: "garbage".into(),
            }),
            Ok(Reading::single(0.3)),
        ]);
        let mut run = ExperimentRun::new("iv", CancellationFlag::new());
        let outcome = SweepController::new(Duration::ZERO)
            .run(
                SweepPlan::new(0.0, 1.0, 3).points(),
                &mut target,
                Quantity::Current,
                &mut run,
            )
            .await
            .unwrap();

        assert_eq!(outcome, PhaseOutcome::Completed);
        let ys: Vec<Option<f64>> = run.samples().iter().map(|s| s.y).collect();
        assert_eq!(ys, vec![Some(0.1), None, Some(0.3)]);
        assert_eq!(target.released, 1);
    }

    #[tokio::test]
    async fn test_link_failure_aborts_and_releases() {
        let mut target = ScriptedTarget::new(vec![
            Ok(Reading::single(0.1)),
            Err(DaqError::Timeout {
                address: "mock".into(),
                command: "MEAS:CURR?".into(),
                timeout: Duration::from_secs(1),
            }),
        ]);
        let mut run = ExperimentRun::new("iv", CancellationFlag::new());
        let err = SweepController::new(Duration::ZERO)
            .run(
                SweepPlan::new(0.0, 1.0, 5).points(),
                &mut target,
                Quantity::Current,
                &mut run,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DaqError::Timeout { .. }));
        assert_eq!(target.applied.len(), 2);
        assert_eq!(run.samples().len(), 1);
        assert_eq!(target.released, 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_setpoint() {
        let flag = CancellationFlag::new();
        let mut target = ScriptedTarget::new(Vec::new());
        target.cancel_after = Some((2, flag.clone()));
        let mut run = ExperimentRun::new("iv", flag);
        let outcome = SweepController::new(Duration::ZERO)
            .run(
                SweepPlan::new(0.0, 1.0, 5).points(),
                &mut target,
                Quantity::Current,
                &mut run,
            )
            .await
            .unwrap();

        assert_eq!(outcome, PhaseOutcome::Cancelled);
        assert_eq!(target.applied, vec![0.0, 0.25]);
        assert_eq!(run.samples().len(), 2);
        assert_eq!(target.released, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_between_apply_and_measure() {
        let mut target = ScriptedTarget::new(Vec::new());
        let mut run = ExperimentRun::new("iv", CancellationFlag::new());
        let start = tokio::time::Instant::now();
        SweepController::new(Duration::from_millis(100))
            .run(
                SweepPlan::new(0.0, 1.0, 4).points(),
                &mut target,
                Quantity::Current,
                &mut run,
            )
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }
}
