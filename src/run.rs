//! Per-run context threaded through every engine.
//!
//! An [`ExperimentRun`] holds the instrument handles in use, the active plan, a
//! cooperative cancellation flag and the accumulating sample sequence. Engines receive it
//! explicitly; there is no global run state. Samples and state changes are forwarded to the
//! consumer as they happen, and exactly one terminal status is emitted per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};
use uuid::Uuid;

use crate::measurement::{MeasurementSample, Quantity, Reading};
use crate::session::InstrumentHandle;
use crate::sweep::SweepPlan;

/// Cooperative cancellation flag shared between a run and whoever may cancel it.
///
/// Engines check it only at point boundaries; an in-flight query completes or times out
/// first.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// A flag that is not raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run lifecycle state.
///
/// ```text
/// Idle ──> [TemperatureGating] ──> Measuring ──> Completed
///   │              │                   │
///   └──────────────┴───────────────────┴──────> Cancelled | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Created, nothing sent to hardware yet.
    Idle,
    /// Waiting for the temperature to settle.
    TemperatureGating,
    /// Sourcing and measuring.
    Measuring,
    /// Finished normally.
    Completed,
    /// Stopped at a cancellation check.
    Cancelled,
    /// Stopped by an error.
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::TemperatureGating => write!(f, "TemperatureGating"),
            RunState::Measuring => write!(f, "Measuring"),
            RunState::Completed => write!(f, "Completed"),
            RunState::Cancelled => write!(f, "Cancelled"),
            RunState::Failed => write!(f, "Failed"),
        }
    }
}

impl RunState {
    /// Whether the run has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed
        )
    }

    /// Whether moving to `next` is allowed.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        match self {
            RunState::Idle => next != RunState::Idle,
            RunState::TemperatureGating => {
                !matches!(next, RunState::Idle | RunState::TemperatureGating)
            }
            RunState::Measuring => next.is_terminal(),
            RunState::Completed | RunState::Cancelled | RunState::Failed => false,
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    /// All points were measured.
    Completed,
    /// Stopped at a cancellation check.
    Cancelled,
    /// Stopped by an error.
    Failed {
        /// Human-readable cause.
        cause: String,
    },
}

impl RunStatus {
    /// Matching terminal state.
    pub fn state(&self) -> RunState {
        match self {
            RunStatus::Completed => RunState::Completed,
            RunStatus::Cancelled => RunState::Cancelled,
            RunStatus::Failed { .. } => RunState::Failed,
        }
    }

    /// Whether the run completed.
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

/// How a sweep or logging phase ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Every point was visited.
    Completed,
    /// A cancellation check fired.
    Cancelled,
}

/// Notification streamed to the run's consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    /// The run moved to a new state.
    StateChanged {
        /// Run identifier.
        run_id: Uuid,
        /// New state.
        state: RunState,
    },
    /// A sample was recorded.
    Sample {
        /// Run identifier.
        run_id: Uuid,
        /// The sample.
        sample: MeasurementSample,
    },
    /// The run ended. Sent exactly once.
    Finished {
        /// Run identifier.
        run_id: Uuid,
        /// Terminal status.
        status: RunStatus,
    },
}

/// Mutable context of one experiment run.
pub struct ExperimentRun {
    id: Uuid,
    label: String,
    started_at: DateTime<Utc>,
    state: RunState,
    instruments: Vec<InstrumentHandle>,
    plan: Option<SweepPlan>,
    cancel: CancellationFlag,
    samples: Vec<MeasurementSample>,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl ExperimentRun {
    /// Creates an idle run.
    pub fn new(label: impl Into<String>, cancel: CancellationFlag) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            started_at: Utc::now(),
            state: RunState::Idle,
            instruments: Vec::new(),
            plan: None,
            cancel,
            samples: Vec::new(),
            events: None,
        }
    }

    /// Forward events to `events`.
    pub fn with_events(mut self, events: Option<mpsc::UnboundedSender<RunEvent>>) -> Self {
        self.events = events;
        self
    }

    /// Run identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Experiment label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Creation time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Instruments taken by this run.
    pub fn instruments(&self) -> &[InstrumentHandle] {
        &self.instruments
    }

    /// Active sweep plan.
    pub fn plan(&self) -> Option<&SweepPlan> {
        self.plan.as_ref()
    }

    /// Samples recorded so far, in recording order.
    pub fn samples(&self) -> &[MeasurementSample] {
        &self.samples
    }

    /// Take the recorded samples.
    pub fn into_samples(self) -> Vec<MeasurementSample> {
        self.samples
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The run's cancellation flag.
    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    /// Note an instrument handle taken by this run.
    pub fn add_instrument(&mut self, handle: InstrumentHandle) {
        self.instruments.push(handle);
    }

    /// Set the active plan.
    pub fn set_plan(&mut self, plan: SweepPlan) {
        self.plan = Some(plan);
    }

    /// Move to `next`, emitting a state change. Illegal transitions are ignored.
    pub fn transition(&mut self, next: RunState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(run_id = %self.id, from = %self.state, to = %next, "ignored run state transition");
            return false;
        }
        info!(run_id = %self.id, experiment = %self.label, from = %self.state, to = %next, "run state changed");
        self.state = next;
        self.emit(RunEvent::StateChanged {
            run_id: self.id,
            state: next,
        });
        true
    }

    /// Append a sample in recording order and forward it.
    pub fn record(&mut self, cycle: usize, x: f64, reading: Reading, quantity: Quantity) {
        let sample = MeasurementSample {
            index: self.samples.len(),
            cycle,
            x,
            y: reading.value,
            y2: reading.secondary,
            quantity,
            timestamp: Utc::now(),
        };
        trace!(run_id = %self.id, index = sample.index, x, y = ?sample.y, "sample recorded");
        self.emit(RunEvent::Sample {
            run_id: self.id,
            sample: sample.clone(),
        });
        self.samples.push(sample);
    }

    /// Enter the terminal state for `status` and emit the final event.
    ///
    /// Only the first call has any effect.
    pub fn finish(&mut self, status: &RunStatus) {
        if self.state.is_terminal() {
            return;
        }
        self.transition(status.state());
        self.emit(RunEvent::Finished {
            run_id: self.id,
            status: status.clone(),
        });
    }

    fn emit(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                trace!(run_id = %self.id, "run event consumer gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_flag_is_shared() {
        let flag = CancellationFlag::new();
        let run = ExperimentRun::new("iv", flag.clone());
        assert!(!run.is_cancelled());
        flag.cancel();
        assert!(run.is_cancelled());
    }

    #[test]
    fn test_state_machine() {
        assert!(RunState::Idle.can_transition_to(RunState::TemperatureGating));
        assert!(RunState::Idle.can_transition_to(RunState::Measuring));
        assert!(RunState::TemperatureGating.can_transition_to(RunState::Failed));
        assert!(!RunState::Measuring.can_transition_to(RunState::TemperatureGating));
        assert!(!RunState::Completed.can_transition_to(RunState::Failed));
    }

    #[test]
    fn test_samples_keep_recording_order() {
        let mut run = ExperimentRun::new("iv", CancellationFlag::new());
        run.record(0, 0.5, Reading::single(1.0), Quantity::Current);
        run.record(0, 0.0, Reading::absent(), Quantity::Current);
        run.record(1, 0.25, Reading::single(2.0), Quantity::Current);
        let xs: Vec<f64> = run.samples().iter().map(|s| s.x).collect();
        let indices: Vec<usize> = run.samples().iter().map(|s| s.index).collect();
        assert_eq!(xs, vec![0.5, 0.0, 0.25]);
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(run.samples()[1].y, None);
    }

    #[test]
    fn test_finish_emits_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut run = ExperimentRun::new("iv", CancellationFlag::new()).with_events(Some(tx));
        run.transition(RunState::Measuring);
        run.finish(&RunStatus::Completed);
        run.finish(&RunStatus::Failed {
            cause: "late".into(),
        });

        let mut finished = 0;
        while let Ok(event) = rx.try_recv() {
            if let RunEvent::Finished { status, .. } = event {
                assert_eq!(status, RunStatus::Completed);
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
        assert_eq!(run.state(), RunState::Completed);
    }
}
