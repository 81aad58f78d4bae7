//! Connection lifecycle state machine
//!
//! ```text
//!                connect()             Connected event
//! Disconnected ────────────► Connecting ───────────────► Connected
//!      ▲                         │                           │
//!      │        Closed event     │ Error event               │ Error event
//!      ├─────────────────────────┤                           │
//!      │                         ▼                           ▼
//!      │ disconnect()          Error ◄───────────────────────┘
//!      ├─────────────────────────┤
//!      │                         │ Closed event
//!      │                         ▼
//!      └──── connect() ── DisconnectedAfterError
//! ```
//!
//! There is exactly one handle slot. A dropped connection stays dropped;
//! reconnecting is always an explicit `connect`.

use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

use super::config::{ConnectionConfig, QoS};
use super::error::SessionError;
use super::subscriptions::SubscriptionRegistry;
use super::transport::{SessionEvent, SessionId, Transport, TransportEvent, TransportHandle};

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
    DisconnectedAfterError(String),
}

impl SessionState {
    /// Pending or established: a new `connect` is rejected
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Error(msg) => write!(f, "error: {}", msg),
            SessionState::DisconnectedAfterError(msg) => {
                write!(f, "disconnected (last error: {})", msg)
            }
        }
    }
}

/// What an accepted transport event means for the rest of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    Failed(String),
    Closed,
}

struct ActiveConnection {
    id: SessionId,
    handle: Box<dyn TransportHandle>,
    config: ConnectionConfig,
}

pub struct ConnectionLifecycle {
    transport: Box<dyn Transport>,
    state: SessionState,
    active: Option<ActiveConnection>,
    next_id: u64,
}

impl ConnectionLifecycle {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        ConnectionLifecycle {
            transport,
            state: SessionState::Disconnected,
            active: None,
            next_id: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Id of the handle currently in the slot
    pub fn session_id(&self) -> Option<SessionId> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Snapshot the current handle was opened with
    pub fn config(&self) -> Option<&ConnectionConfig> {
        self.active.as_ref().map(|a| &a.config)
    }

    /// The handle, but only while the broker has acknowledged the connection
    pub fn live_handle(&self) -> Option<&dyn TransportHandle> {
        if !self.state.is_connected() {
            return None;
        }
        self.active.as_ref().map(|a| a.handle.as_ref())
    }

    pub fn connect(&mut self, config: ConnectionConfig) -> Result<SessionId, SessionError> {
        if self.state.is_active() {
            warn!("Connect rejected, session is {}", self.state);
            return Err(SessionError::Busy(self.state.clone()));
        }

        if let Err(e) = config.validate() {
            warn!("Connect rejected: {}", e);
            self.state = SessionState::Error(e.to_string());
            return Err(e);
        }

        // Left over from an error that was never followed by a close
        if let Some(stale) = self.active.take() {
            debug!("Closing stale handle {}", stale.id);
            stale.handle.close();
        }

        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.state = SessionState::Connecting;
        info!(
            "Connecting {} to {} as {} (MQTT {})",
            id, config.broker_url, config.client_id, config.protocol
        );

        match self.transport.open(id, &config) {
            Ok(handle) => {
                self.active = Some(ActiveConnection { id, handle, config });
                Ok(id)
            }
            Err(e) => {
                let err = SessionError::from(e);
                warn!("Failed to open transport: {}", err);
                self.state = SessionState::Error(err.to_string());
                Err(err)
            }
        }
    }

    /// Returns `true` if a handle was closed.
    pub fn disconnect(&mut self) -> bool {
        match self.active.take() {
            Some(active) => {
                info!("Disconnecting {}", active.id);
                active.handle.close();
                self.state = SessionState::Disconnected;
                true
            }
            None => {
                debug!("Disconnect ignored, no transport handle");
                false
            }
        }
    }

    /// Feeds one transport event through the state machine.
    ///
    /// Returns `None` when the event is dropped: it belongs to a superseded
    /// handle, or it makes no sense in the current state.
    pub fn apply(&mut self, event: SessionEvent) -> Option<Transition> {
        let current = match &self.active {
            Some(active) => active.id,
            None => {
                debug!("Dropping {:?} from {}, no handle", event.event, event.session);
                return None;
            }
        };
        if current != event.session {
            debug!(
                "Dropping {:?} from superseded {} (current {})",
                event.event, event.session, current
            );
            return None;
        }

        match event.event {
            TransportEvent::Connected => {
                if self.state != SessionState::Connecting {
                    warn!("Unexpected connect event while {}", self.state);
                    return None;
                }
                info!("Connected {}", current);
                self.state = SessionState::Connected;
                Some(Transition::Connected)
            }
            TransportEvent::Message { topic, payload } => {
                Some(Transition::Message { topic, payload })
            }
            TransportEvent::Error(msg) => {
                warn!("Transport error on {}: {}", current, msg);
                self.state = SessionState::Error(msg.clone());
                Some(Transition::Failed(msg))
            }
            TransportEvent::Closed => {
                info!("Connection {} closed", current);
                self.active = None;
                self.state = match std::mem::take(&mut self.state) {
                    SessionState::Error(msg) | SessionState::DisconnectedAfterError(msg) => {
                        SessionState::DisconnectedAfterError(msg)
                    }
                    _ => SessionState::Disconnected,
                };
                Some(Transition::Closed)
            }
        }
    }

    /// Issues one subscribe per registry entry with its stored QoS.
    /// Returns how many requests the transport accepted.
    pub fn resubscribe(&self, registry: &SubscriptionRegistry) -> usize {
        let Some(handle) = self.live_handle() else {
            return 0;
        };
        let mut accepted = 0;
        for sub in registry.iter() {
            match handle.subscribe(&sub.topic, sub.qos) {
                Ok(()) => accepted += 1,
                Err(e) => warn!("Re-subscribe to {} failed: {}", sub.topic, e),
            }
        }
        debug!("Re-applied {}/{} subscriptions", accepted, registry.len());
        accepted
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) {
        if let Some(handle) = self.live_handle() {
            if let Err(e) = handle.subscribe(topic, qos) {
                warn!("Subscribe to {} failed: {}", topic, e);
            }
        }
    }

    pub fn unsubscribe(&self, topic: &str) {
        if let Some(handle) = self.live_handle() {
            if let Err(e) = handle.unsubscribe(topic) {
                warn!("Unsubscribe from {} failed: {}", topic, e);
            }
        }
    }
}
