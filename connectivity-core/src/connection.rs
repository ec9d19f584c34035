//! Per-exchange connection lifecycle
//!
//! ```text
//! Initializing → Connecting → Connected → Stopping → Stopped
//!        └──────────┴────────────┴──→ Error ──→ Connecting (restart)
//! ```

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::types::Symbol;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initializing,
    Connecting,
    Connected,
    Stopping,
    Stopped,
    /// Transport fault; `start` is allowed again from here
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Lifecycle notification
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected,
    Stopped,
    Faulted {
        session: String,
        reason: String,
    },
}

struct StateCell {
    name: String,
    state: RwLock<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Shared view of a connection's state, handed to its sessions
#[derive(Clone)]
pub struct StateHandle {
    cell: Arc<StateCell>,
}

impl StateHandle {
    pub fn new(name: impl Into<String>, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            cell: Arc::new(StateCell {
                name: name.into(),
                state: RwLock::new(ConnectionState::Initializing),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn get(&self) -> ConnectionState {
        *self.cell.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.cell.events.subscribe()
    }

    /// Set the state and announce the change; returns the previous state
    pub(crate) fn transition(&self, to: ConnectionState) -> ConnectionState {
        let from = std::mem::replace(&mut *self.cell.state.write(), to);
        if from != to {
            info!(connection = %self.cell.name, %from, %to, "Connection state changed");
            self.emit(ConnectionEvent::StateChanged { from, to });
        }
        from
    }

    /// Subscribers that lag lose events; producers never wait
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.cell.events.send(event);
    }
}

/// Report from a session whose transport failed on its own
#[derive(Debug, Clone)]
pub struct SessionFault {
    pub session: String,
    pub reason: String,
}

/// What a session gets from the connection that owns it
#[derive(Clone)]
pub struct SessionLink {
    pub state: StateHandle,
    pub faults: mpsc::UnboundedSender<SessionFault>,
}

/// A session whose transport the connection opens and closes
#[async_trait]
pub trait ManagedSession: Send + Sync {
    fn name(&self) -> &str;

    fn attach(&self, link: SessionLink);

    async fn open(&self) -> ConnectivityResult<()>;

    /// Tear the transport down; pending requests fail with `NotConnected`
    async fn close(&self) -> ConnectivityResult<()>;

    fn is_open(&self) -> bool;
}

struct Shared {
    name: String,
    state: StateHandle,
    sessions: Vec<Arc<dyn ManagedSession>>,
    // serializes start/stop and fault handling
    transition: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn close_sessions(&self) {
        for session in &self.sessions {
            if let Err(e) = session.close().await {
                warn!(connection = %self.name, session = session.name(), error = %e, "Session close failed");
            }
        }
    }
}

/// Top-level per-exchange state machine over one or more sessions
pub struct ExchangeConnection {
    shared: Arc<Shared>,
    instruments: Vec<Symbol>,
    faults: Mutex<Option<mpsc::UnboundedReceiver<SessionFault>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ExchangeConnection {
    pub fn new(
        name: impl Into<String>,
        instruments: Vec<Symbol>,
        sessions: Vec<Arc<dyn ManagedSession>>,
        event_buffer: usize,
    ) -> Self {
        let name = name.into();
        let state = StateHandle::new(name.clone(), event_buffer);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        for session in &sessions {
            session.attach(SessionLink {
                state: state.clone(),
                faults: faults_tx.clone(),
            });
        }

        Self {
            shared: Arc::new(Shared {
                name,
                state,
                sessions,
                transition: tokio::sync::Mutex::new(()),
            }),
            instruments,
            faults: Mutex::new(Some(faults_rx)),
            supervisor: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn instruments(&self) -> &[Symbol] {
        &self.instruments
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.state.subscribe()
    }

    /// Open every session.
    ///
    /// No-op while `Connecting` or `Connected`, `InvalidState` while
    /// `Stopping`. A failed handshake leaves the connection in `Error`.
    pub async fn start(&self) -> ConnectivityResult<()> {
        if let Some(result) = Self::start_precheck(self.state()) {
            return result;
        }
        let _transition = self.shared.transition.lock().await;
        let state = self.state();
        if let Some(result) = Self::start_precheck(state) {
            return result;
        }

        self.ensure_supervisor();
        self.shared.state.transition(ConnectionState::Connecting);

        for session in &self.shared.sessions {
            if let Err(e) = session.open().await {
                error!(
                    connection = %self.shared.name,
                    session = session.name(),
                    error = %e,
                    "Session failed to open"
                );
                self.shared.close_sessions().await;
                self.shared.state.transition(ConnectionState::Error);
                self.shared.state.emit(ConnectionEvent::Faulted {
                    session: session.name().to_string(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        }

        self.shared.state.transition(ConnectionState::Connected);
        self.shared.state.emit(ConnectionEvent::Connected);
        Ok(())
    }

    fn start_precheck(state: ConnectionState) -> Option<ConnectivityResult<()>> {
        match state {
            ConnectionState::Connecting | ConnectionState::Connected => Some(Ok(())),
            ConnectionState::Stopping => Some(Err(ConnectivityError::InvalidState {
                operation: "start",
                state,
            })),
            ConnectionState::Initializing | ConnectionState::Stopped | ConnectionState::Error => None,
        }
    }

    /// Close every session. No-op once `Stopped`.
    pub async fn stop(&self) -> ConnectivityResult<()> {
        if self.state() == ConnectionState::Stopped {
            return Ok(());
        }
        let _transition = self.shared.transition.lock().await;
        if self.state() == ConnectionState::Stopped {
            return Ok(());
        }

        self.shared.state.transition(ConnectionState::Stopping);
        self.shared.close_sessions().await;
        self.shared.state.transition(ConnectionState::Stopped);
        self.shared.state.emit(ConnectionEvent::Stopped);
        Ok(())
    }

    /// Spawn the fault supervisor on first start
    fn ensure_supervisor(&self) {
        let Some(mut faults) = self.faults.lock().take() else {
            return;
        };
        let shared = self.shared.clone();

        let handle = tokio::spawn(async move {
            while let Some(fault) = faults.recv().await {
                let _transition = shared.transition.lock().await;
                match shared.state.get() {
                    ConnectionState::Connecting | ConnectionState::Connected => {
                        error!(
                            connection = %shared.name,
                            session = %fault.session,
                            reason = %fault.reason,
                            "Transport fault"
                        );
                        shared.close_sessions().await;
                        shared.state.transition(ConnectionState::Error);
                        shared.state.emit(ConnectionEvent::Faulted {
                            session: fault.session,
                            reason: fault.reason,
                        });
                    }
                    state => {
                        debug!(connection = %shared.name, %state, "Ignoring session fault");
                    }
                }
            }
        });
        *self.supervisor.lock() = Some(handle);
    }
}

impl Drop for ExchangeConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}
