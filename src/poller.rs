//! Background temperature telemetry.
//!
//! A low-frequency task that reads one LakeShore input for live display. It is not part of
//! any run. Each tick it tries to take the controller session without waiting; while a run
//! holds the session the poll is skipped, never queued. Readings are published on a
//! `watch` channel so late subscribers always see the latest value.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::dialect::LakeShoreModel;
use crate::error::{DaqError, DaqResult};
use crate::instrument::TemperatureController;
use crate::session::SharedSession;
use crate::validator::ResponseValidator;

/// Owner label the poller acquires sessions under.
pub const POLLER_OWNER: &str = "telemetry-poller";

/// Latest telemetry published by the poller.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    /// No poll has completed yet.
    Pending,
    /// A fresh reading.
    Reading {
        /// Temperature in °C.
        celsius: f64,
        /// When it was read.
        at: DateTime<Utc>,
    },
    /// The read failed.
    Unavailable {
        /// Failure description.
        reason: String,
    },
    /// The session was busy; nothing was read.
    Skipped {
        /// Who held the session.
        owner: Option<String>,
    },
}

/// Counters returned when the poller stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    /// Completed reads.
    pub readings: u64,
    /// Ticks skipped because the session was busy.
    pub skipped: u64,
    /// Failed reads.
    pub failures: u64,
}

/// Periodic reader of one temperature input.
pub struct TemperaturePoller {
    session: SharedSession,
    model: LakeShoreModel,
    validator: ResponseValidator,
    input: String,
    period: Duration,
}

impl TemperaturePoller {
    /// Poller reading `input` from the controller behind `session` every `period`.
    pub fn new(
        session: SharedSession,
        validator: ResponseValidator,
        input: impl Into<String>,
        period: Duration,
    ) -> DaqResult<Self> {
        if period.is_zero() {
            return Err(DaqError::Configuration(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        let model = LakeShoreModel::for_kind(session.kind())?;
        let input = input.into();
        model.validate_input(&input)?;
        Ok(Self {
            session,
            model,
            validator,
            input,
            period,
        })
    }

    /// Start polling on its own task.
    pub fn spawn(self) -> PollerHandle {
        let (tx, rx) = watch::channel(Telemetry::Pending);
        let shutdown = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(self.poll_loop(tx, shutdown.clone(), wake.clone()));
        PollerHandle {
            updates: rx,
            shutdown,
            wake,
            task,
        }
    }

    async fn poll_loop(
        self,
        tx: watch::Sender<Telemetry>,
        shutdown: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) -> PollerStats {
        let mut stats = PollerStats::default();
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(address = %self.session.address(), input = %self.input, period = ?self.period, "telemetry poller started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wake.notified() => {}
            }
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let update = self.poll_once(&mut stats).await;
            tx.send_replace(update);
        }

        info!(
            readings = stats.readings,
            skipped = stats.skipped,
            failures = stats.failures,
            "telemetry poller stopped"
        );
        stats
    }

    async fn poll_once(&self, stats: &mut PollerStats) -> Telemetry {
        let Some(guard) = self.session.try_acquire(POLLER_OWNER) else {
            let owner = self.session.current_owner();
            debug!(owner = ?owner, "session busy, skipping telemetry poll");
            stats.skipped += 1;
            return Telemetry::Skipped { owner };
        };

        let mut controller = TemperatureController::new(guard, self.model, self.validator.clone());
        match controller.read_input(&self.input).await {
            Ok(celsius) => {
                stats.readings += 1;
                Telemetry::Reading {
                    celsius,
                    at: Utc::now(),
                }
            }
            Err(err) => {
                warn!(error = %err, "telemetry read failed");
                stats.failures += 1;
                Telemetry::Unavailable {
                    reason: err.to_string(),
                }
            }
        }
    }
}

/// Handle to a running [`TemperaturePoller`].
pub struct PollerHandle {
    updates: watch::Receiver<Telemetry>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: JoinHandle<PollerStats>,
}

impl PollerHandle {
    /// A receiver of telemetry updates.
    pub fn subscribe(&self) -> watch::Receiver<Telemetry> {
        self.updates.clone()
    }

    /// The most recent telemetry.
    pub fn latest(&self) -> Telemetry {
        self.updates.borrow().clone()
    }

    /// Raise the shutdown flag and wait for the task to exit.
    pub async fn shutdown(self) -> DaqResult<PollerStats> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        self.task
            .await
            .map_err(|e| DaqError::TaskFailed(format!("telemetry poller: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::dialect::InstrumentKind;
    use crate::session::{InstrumentHandle, InstrumentSession};
    use crate::validator::RecoveryPolicy;

    fn shared(adapter: &MockAdapter) -> SharedSession {
        SharedSession::new(InstrumentSession::new(
            InstrumentHandle::new("GPIB0::12::INSTR", InstrumentKind::LakeShore335),
            Box::new(adapter.clone()),
            Duration::from_millis(500),
        ))
    }

    fn poller(session: &SharedSession) -> TemperaturePoller {
        TemperaturePoller::new(
            session.clone(),
            ResponseValidator::new(RecoveryPolicy::default()).unwrap(),
            "A",
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_readings() {
        let adapter = MockAdapter::new().on("KRDG? A", "298.15");
        let session = shared(&adapter);
        let handle = poller(&session).spawn();
        let mut updates = handle.subscribe();

        updates.changed().await.unwrap();
        match updates.borrow().clone() {
            Telemetry::Reading { celsius, .. } => assert!((celsius - 25.0).abs() < 1e-9),
            other => panic!("unexpected telemetry: {other:?}"),
        }

        let stats = handle.shutdown().await.unwrap();
        assert!(stats.readings >= 1);
        assert_eq!(stats.skipped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_while_session_is_held() {
        let adapter = MockAdapter::new().on("KRDG? A", "298.15");
        let session = shared(&adapter);
        let guard = session
            .acquire("run-1", Duration::from_millis(10))
            .await
            .unwrap();

        let handle = poller(&session).spawn();
        let mut updates = handle.subscribe();
        updates.changed().await.unwrap();
        assert_eq!(
            *updates.borrow(),
            Telemetry::Skipped {
                owner: Some("run-1".to_string())
            }
        );
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(adapter.call_log().is_empty());

        drop(guard);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let stats = handle.shutdown().await.unwrap();
        assert!(stats.skipped >= 3);
        assert!(stats.readings >= 1);
        assert!(!adapter.call_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_is_published() {
        let adapter = MockAdapter::new().on("KRDG? A", "garbage");
        let session = shared(&adapter);
        let handle = poller(&session).spawn();
        let mut updates = handle.subscribe();
        updates.changed().await.unwrap();
        assert!(matches!(
            *updates.borrow(),
            Telemetry::Unavailable { .. }
        ));
        let stats = handle.shutdown().await.unwrap();
        assert!(stats.failures >= 1);
    }

    #[test]
    fn test_rejects_non_temperature_controller() {
        let session = SharedSession::new(InstrumentSession::new(
            InstrumentHandle::new("mock", InstrumentKind::Sr830),
            Box::new(MockAdapter::new()),
            Duration::from_millis(500),
        ));
        assert!(TemperaturePoller::new(
            session,
            ResponseValidator::new(RecoveryPolicy::default()).unwrap(),
            "A",
            Duration::from_secs(1),
        )
        .is_err());
    }
}
