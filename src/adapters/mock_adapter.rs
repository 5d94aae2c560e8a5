//! Mock transport adapter for testing
//!
//! This adapter simulates an instrument on the other end of a command channel without
//! requiring physical hardware. It provides:
//! - Scripted replies keyed by command prefix, fixed or as a sequence
//! - A programmable responder for stateful simulations
//! - Stale input injection to exercise the banner recovery path
//! - Simulated reply latency and controllable failure injection
//! - Call logging for command-order assertions

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::Adapter;
use crate::error::{DaqError, DaqResult};

/// What the simulated instrument does after receiving a command.
#[derive(Clone, Debug, PartialEq)]
pub enum MockReply {
    /// Reply with one line of text.
    Text(String),
    /// Never reply. A query answered this way runs into the session timeout.
    Silent,
    /// Drop the link. The pending read fails with a connection error.
    Disconnect,
}

impl From<&str> for MockReply {
    fn from(text: &str) -> Self {
        MockReply::Text(text.to_string())
    }
}

impl From<String> for MockReply {
    fn from(text: String) -> Self {
        MockReply::Text(text)
    }
}

type Responder = Box<dyn FnMut(&str) -> Option<MockReply> + Send>;

struct Rule {
    prefix: String,
    replies: VecDeque<MockReply>,
}

impl Rule {
    /// The last reply of a sequence repeats forever.
    fn next_reply(&mut self) -> Option<MockReply> {
        if self.replies.len() > 1 {
            self.replies.pop_front()
        } else {
            self.replies.front().cloned()
        }
    }
}

struct MockState {
    connected: bool,
    latency: Duration,
    write_latency: Duration,
    fail_next: bool,
    pending: VecDeque<MockReply>,
    rules: Vec<Rule>,
    responder: Option<Responder>,
    call_log: Vec<String>,
    discards: usize,
}

/// Mock transport adapter for testing
///
/// Clones share the same simulated instrument, so a test can keep one clone for
/// assertions while the session owns another.
///
/// # Example
///
/// ```
/// use sweep_daq::adapters::MockAdapter;
///
/// let adapter = MockAdapter::new().on("MEAS:CURR?", "0.00123");
/// assert!(adapter.is_connected());
/// ```
#[derive(Clone)]
pub struct MockAdapter {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Create a connected mock adapter with no scripted replies and no latency
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            state: Arc::new(Mutex::new(MockState {
                connected: true,
                latency: Duration::ZERO,
                write_latency: Duration::ZERO,
                fail_next: false,
                pending: VecDeque::new(),
                rules: Vec::new(),
                responder: None,
                call_log: Vec::new(),
                discards: 0,
            })),
        }
    }

    /// Set the resource name reported by [`Adapter::info`]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set simulated reply latency in milliseconds
    pub fn with_latency(self, ms: u64) -> Self {
        self.state().latency = Duration::from_millis(ms);
        self
    }

    /// Set simulated write latency in milliseconds
    pub fn with_write_latency(self, ms: u64) -> Self {
        self.state().write_latency = Duration::from_millis(ms);
        self
    }

    /// Always answer commands starting with `prefix` with `reply`
    pub fn on(self, prefix: &str, reply: impl Into<MockReply>) -> Self {
        self.on_sequence(prefix, [reply.into()])
    }

    /// Answer commands starting with `prefix` with `replies` in order.
    ///
    /// Once the sequence is down to its last entry, that entry repeats.
    pub fn on_sequence<I>(self, prefix: &str, replies: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<MockReply>,
    {
        self.state().rules.push(Rule {
            prefix: prefix.to_string(),
            replies: replies.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Install a responder consulted for commands no scripted rule matches
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: FnMut(&str) -> Option<MockReply> + Send + 'static,
    {
        self.state().responder = Some(Box::new(responder));
        self
    }

    /// Place a line in the input buffer as if a previous reply was never read
    pub fn push_stale(&self, line: &str) {
        self.state()
            .pending
            .push_back(MockReply::Text(line.to_string()));
    }

    /// Inject a failure for the next write
    pub fn inject_next_failure(&self) {
        self.state().fail_next = true;
    }

    /// Set the connection state manually
    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
    }

    /// Check if currently connected
    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Every line written so far, in order
    pub fn call_log(&self) -> Vec<String> {
        self.state().call_log.clone()
    }

    /// Written lines starting with `prefix`
    pub fn writes_matching(&self, prefix: &str) -> Vec<String> {
        self.state()
            .call_log
            .iter()
            .filter(|line| line.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.state().call_log.clear();
    }

    /// Number of times buffered input was discarded
    pub fn discard_count(&self) -> usize {
        self.state().discards
    }

    /// Number of replies waiting to be read
    pub fn pending_replies(&self) -> usize {
        self.state().pending.len()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self, reason: &str) -> DaqError {
        DaqError::Connection {
            address: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn write_line(&mut self, line: &str) -> DaqResult<()> {
        let write_latency = self.state().write_latency;
        if !write_latency.is_zero() {
            tokio::time::sleep(write_latency).await;
        }
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next) {
            return Err(self.closed_error("injected failure"));
        }
        if !state.connected {
            return Err(self.closed_error("channel closed"));
        }
        state.call_log.push(line.to_string());

        let scripted = state
            .rules
            .iter_mut()
            .find(|rule| line.starts_with(rule.prefix.as_str()))
            .map(Rule::next_reply);
        let reply = match scripted {
            Some(reply) => reply,
            None => state.responder.as_mut().and_then(|respond| respond(line)),
        };
        match reply {
            Some(MockReply::Silent) | None => {}
            Some(reply) => state.pending.push_back(reply),
        }
        Ok(())
    }

    async fn read_line(&mut self) -> DaqResult<String> {
        self.simulate_latency().await;
        let next = {
            let mut state = self.state();
            if !state.connected {
                return Err(self.closed_error("channel closed"));
            }
            state.pending.pop_front()
        };
        match next {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Disconnect) => {
                self.set_connected(false);
                Err(self.closed_error("remote end hung up"))
            }
            Some(MockReply::Silent) | None => Ok(std::future::pending::<String>().await),
        }
    }

    async fn discard_input(&mut self) -> DaqResult<()> {
        let mut state = self.state();
        state.pending.clear();
        state.discards += 1;
        Ok(())
    }

    async fn close(&mut self) -> DaqResult<()> {
        let mut state = self.state();
        state.connected = false;
        state.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        MockAdapter::is_connected(self)
    }

    fn info(&self) -> String {
        self.name.clone()
    }
}
