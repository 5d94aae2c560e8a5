//! Instrument sessions and exclusive session ownership.
//!
//! An [`InstrumentSession`] owns one transport adapter and turns it into a strictly
//! serialized command/response channel: each write+read exchange is bounded by one session timeout, a
//! link failure moves the [`InstrumentHandle`] to `Faulted`, and every command is logged at
//! the boundary.
//!
//! Because the link is half-duplex, a session must have exactly one logical owner at a
//! time. [`SharedSession`] provides that: a cloneable token whose [`SessionGuard`] grants
//! exclusive access and releases it on drop. The foreground experiment waits for the
//! session with [`SharedSession::acquire`]; the background telemetry poller uses
//! [`SharedSession::try_acquire`] and skips its poll instead of queueing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::adapters::Adapter;
use crate::dialect::InstrumentKind;
use crate::error::{DaqError, DaqResult};

/// Link state of an instrument handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Closed, or never opened.
    Disconnected,
    /// Open and answering.
    Connected,
    /// A timeout or link failure was observed. Further I/O is still attempted.
    Faulted,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Faulted => write!(f, "faulted"),
        }
    }
}

/// What an instrument can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Drives a voltage, current, reference or heater output.
    Source,
    /// Returns measured values.
    Measure,
    /// Reads a sensor (remote sense, temperature input).
    Sense,
}

/// Identity and link state of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentHandle {
    /// Opaque resource string, e.g. "GPIB0::24::INSTR".
    pub address: String,
    /// Instrument type tag; selects the command dialect.
    pub kind: InstrumentKind,
    /// Capability set of this instrument type.
    pub capabilities: Vec<Capability>,
    /// Current link state.
    pub state: ConnectionState,
}

impl InstrumentHandle {
    /// Handle for a freshly opened instrument of `kind` at `address`.
    pub fn new(address: impl Into<String>, kind: InstrumentKind) -> Self {
        Self {
            address: address.into(),
            kind,
            capabilities: kind.capabilities().to_vec(),
            state: ConnectionState::Connected,
        }
    }

    /// Whether the capability set contains `capability`.
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Minimal command interface the drivers and the response validator need.
#[async_trait]
pub trait CommandChannel: Send {
    /// Send a command with no expected reply.
    async fn write_command(&mut self, command: &str) -> DaqResult<()>;

    /// Send a command and read exactly one reply line.
    async fn query(&mut self, command: &str) -> DaqResult<String>;

    /// Drop buffered stale input.
    async fn discard_input(&mut self) -> DaqResult<()>;
}

#[async_trait]
impl<T: CommandChannel + ?Sized> CommandChannel for &mut T {
    async fn write_command(&mut self, command: &str) -> DaqResult<()> {
        (**self).write_command(command).await
    }

    async fn query(&mut self, command: &str) -> DaqResult<String> {
        (**self).query(command).await
    }

    async fn discard_input(&mut self) -> DaqResult<()> {
        (**self).discard_input().await
    }
}

/// A serialized, timeout-bounded command channel to one instrument.
pub struct InstrumentSession {
    handle: InstrumentHandle,
    adapter: Box<dyn Adapter>,
    timeout: Duration,
}

impl InstrumentSession {
    /// Wrap an opened adapter.
    pub fn new(handle: InstrumentHandle, adapter: Box<dyn Adapter>, timeout: Duration) -> Self {
        let mut handle = handle;
        handle.state = if adapter.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        debug!(
            address = %handle.address,
            kind = %handle.kind,
            adapter = %adapter.info(),
            state = %handle.state,
            "instrument session opened"
        );
        Self {
            handle,
            adapter,
            timeout,
        }
    }

    /// Identity and link state.
    pub fn handle(&self) -> &InstrumentHandle {
        &self.handle
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        self.handle.state
    }

    /// Reply timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the reply timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Issue `*IDN?` and return the trimmed identity string.
    pub async fn identify(&mut self) -> DaqResult<String> {
        self.query("*IDN?").await
    }

    /// Close the underlying channel. The handle becomes `Disconnected`.
    pub async fn close(&mut self) -> DaqResult<()> {
        self.adapter.close().await?;
        self.handle.state = ConnectionState::Disconnected;
        debug!(address = %self.handle.address, "instrument session closed");
        Ok(())
    }

    fn ensure_open(&self) -> DaqResult<()> {
        if self.handle.state == ConnectionState::Disconnected {
            return Err(DaqError::Connection {
                address: self.handle.address.clone(),
                reason: "session is closed".to_string(),
            });
        }
        Ok(())
    }

    fn mark_faulted(&mut self, err: &DaqError) {
        if err.is_link_failure() && self.handle.state != ConnectionState::Faulted {
            warn!(address = %self.handle.address, error = %err, "instrument link faulted");
            self.handle.state = ConnectionState::Faulted;
        }
    }

    fn timeout_error(&self, command: &str) -> DaqError {
        DaqError::Timeout {
            address: self.handle.address.clone(),
            command: command.to_string(),
            timeout: self.timeout,
        }
    }

    async fn send(&mut self, command: &str) -> DaqResult<()> {
        debug!(address = %self.handle.address, command, "write");
        match timeout(self.timeout, self.adapter.write_line(command)).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(command)),
        }
    }

    /// Write then read under one deadline covering both halves.
    async fn exchange(&mut self, command: &str) -> DaqResult<String> {
        debug!(address = %self.handle.address, command, "query");
        let adapter = &mut self.adapter;
        let exchange = async {
            adapter.write_line(command).await?;
            adapter.read_line().await
        };
        let outcome = timeout(self.timeout, exchange).await;
        let reply = match outcome {
            Ok(result) => result?,
            Err(_) => return Err(self.timeout_error(command)),
        };
        let reply = reply.trim().to_string();
        trace!(address = %self.handle.address, command, reply = %reply, "read");
        Ok(reply)
    }
}

#[async_trait]
impl CommandChannel for InstrumentSession {
    async fn write_command(&mut self, command: &str) -> DaqResult<()> {
        self.ensure_open()?;
        let result = self.send(command).await;
        if let Err(err) = &result {
            self.mark_faulted(err);
        }
        result
    }

    async fn query(&mut self, command: &str) -> DaqResult<String> {
        self.ensure_open()?;
        let reply = self.exchange(command).await;
        if let Err(err) = &reply {
            self.mark_faulted(err);
        }
        reply
    }

    async fn discard_input(&mut self) -> DaqResult<()> {
        self.ensure_open()?;
        trace!(address = %self.handle.address, "discard input");
        self.adapter.discard_input().await
    }
}

/// Cloneable single-owner token around one [`InstrumentSession`].
#[derive(Clone)]
pub struct SharedSession {
    address: String,
    kind: InstrumentKind,
    session: Arc<Mutex<InstrumentSession>>,
    owner: Arc<std::sync::Mutex<Option<String>>>,
}

impl SharedSession {
    /// Make `session` shareable.
    pub fn new(session: InstrumentSession) -> Self {
        Self {
            address: session.handle.address.clone(),
            kind: session.handle.kind,
            session: Arc::new(Mutex::new(session)),
            owner: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Resource string of the wrapped session.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Instrument type of the wrapped session.
    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    /// Acquire exclusive access, waiting at most `wait`.
    ///
    /// Fails with [`DaqError::SessionBusy`] naming the current holder if the session is
    /// still owned when the wait expires.
    pub async fn acquire(&self, owner: &str, wait: Duration) -> DaqResult<SessionGuard> {
        match timeout(wait, self.session.clone().lock_owned()).await {
            Ok(guard) => Ok(self.claim(guard, owner)),
            Err(_) => Err(DaqError::SessionBusy {
                address: self.address.clone(),
                holder: self
                    .current_owner()
                    .unwrap_or_else(|| "<unknown>".to_string()),
                requester: owner.to_string(),
            }),
        }
    }

    /// Acquire exclusive access only if nobody holds the session right now.
    pub fn try_acquire(&self, owner: &str) -> Option<SessionGuard> {
        self.session
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| self.claim(guard, owner))
    }

    /// Check if the session is currently available (not owned)
    pub fn is_available(&self) -> bool {
        self.session.try_lock().is_ok()
    }

    /// Label of the current owner, if any
    pub fn current_owner(&self) -> Option<String> {
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn claim(&self, guard: OwnedMutexGuard<InstrumentSession>, owner: &str) -> SessionGuard {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = Some(owner.to_string());
        debug!(address = %self.address, owner, "session acquired");
        SessionGuard {
            session: guard,
            owner_slot: self.owner.clone(),
            owner: owner.to_string(),
        }
    }
}

/// RAII guard for exclusive session access
///
/// Automatically releases ownership when dropped.
pub struct SessionGuard {
    session: OwnedMutexGuard<InstrumentSession>,
    owner_slot: Arc<std::sync::Mutex<Option<String>>>,
    owner: String,
}

impl SessionGuard {
    /// Label of the owner holding this guard
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Deref for SessionGuard {
    type Target = InstrumentSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        *self
            .owner_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        debug!(address = %self.session.handle.address, owner = %self.owner, "session released");
    }
}

#[async_trait]
impl CommandChannel for SessionGuard {
    async fn write_command(&mut self, command: &str) -> DaqResult<()> {
        self.session.write_command(command).await
    }

    async fn query(&mut self, command: &str) -> DaqResult<String> {
        self.session.query(command).await
    }

    async fn discard_input(&mut self) -> DaqResult<()> {
        self.session.discard_input().await
    }
}
