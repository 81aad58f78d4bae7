//! Session worker with statum state machine for the command loop
//!
//! # State Machine
//!
//! ```text
//! Configured ──► Running ──► Stopped
//!                   │
//!            (Shutdown command or
//!             all handles dropped)
//! ```

use statum::{machine, state};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::mqtt::config::{ConnectionConfig, QoS};
use crate::mqtt::error::SessionError;
use crate::mqtt::message_manager::HistoryEntry;
use crate::mqtt::session::{PublishRequest, SessionController, SessionSnapshot};
use crate::mqtt::transport::{SessionEvent, SessionId};

// Snapshot goes out before the reply so callers never read a stale one
macro_rules! respond {
    ($worker:expr, $result:expr, $response_tx:expr) => {{
        let result = $result;
        $worker.publish_updates();
        if $response_tx.send(result).is_err() {
            warn!("Caller dropped before the response was sent");
        }
    }};
}

/// Requests from the presentation layer
#[derive(Debug)]
pub enum SessionCommand {
    Connect {
        config: ConnectionConfig,
        response_tx: oneshot::Sender<Result<SessionId, SessionError>>,
    },
    Disconnect {
        response_tx: oneshot::Sender<bool>,
    },
    AddSubscription {
        topic: String,
        qos: QoS,
        response_tx: oneshot::Sender<bool>,
    },
    RemoveSubscription {
        topic: String,
        response_tx: oneshot::Sender<bool>,
    },
    Publish {
        request: PublishRequest,
        response_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    ClearHistory {
        response_tx: oneshot::Sender<()>,
    },
    History {
        response_tx: oneshot::Sender<Vec<HistoryEntry>>,
    },
    Shutdown,
}

/// How far the log has been forwarded on the history channel
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryCursor {
    generation: u64,
    forwarded: usize,
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionWorkerState {
    Configured, // Channels wired, nothing published yet
    Running,    // Serving commands and transport events
    Stopped,    // Loop left, connection torn down
}

#[machine]
pub struct SessionWorker<S: SessionWorkerState> {
    controller: SessionController,
    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Receiver<SessionEvent>,
    snapshots: watch::Sender<SessionSnapshot>,
    history: broadcast::Sender<HistoryEntry>,
    cursor: HistoryCursor,
}

impl<S: SessionWorkerState> SessionWorker<S> {
    /// Forwards log entries recorded since the last call, then replaces the
    /// snapshot. Called once per command or event.
    fn publish_updates(&mut self) {
        let generation = self.controller.history_generation();
        if generation != self.cursor.generation {
            self.cursor = HistoryCursor {
                generation,
                forwarded: 0,
            };
        }

        let entries = self.controller.history();
        for entry in entries.get(self.cursor.forwarded..).unwrap_or_default() {
            // Err only means nobody is listening
            let _ = self.history.send(entry.clone());
        }
        self.cursor.forwarded = entries.len();

        self.snapshots.send_replace(self.controller.snapshot());
    }
}

impl SessionWorker<Configured> {
    pub fn create(
        controller: SessionController,
        commands: mpsc::Receiver<SessionCommand>,
        events: mpsc::Receiver<SessionEvent>,
        snapshots: watch::Sender<SessionSnapshot>,
        history: broadcast::Sender<HistoryEntry>,
    ) -> Self {
        Self::new(
            controller,
            commands,
            events,
            snapshots,
            history,
            HistoryCursor::default(),
        )
    }

    pub fn start(mut self) -> SessionWorker<Running> {
        info!("Starting session worker");
        self.publish_updates();
        self.transition()
    }
}

impl SessionWorker<Running> {
    fn execute(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect {
                config,
                response_tx,
            } => {
                respond!(self, self.controller.connect(config), response_tx);
            }
            SessionCommand::Disconnect { response_tx } => {
                respond!(self, self.controller.disconnect(), response_tx);
            }
            SessionCommand::AddSubscription {
                topic,
                qos,
                response_tx,
            } => {
                respond!(self, self.controller.add_subscription(&topic, qos), response_tx);
            }
            SessionCommand::RemoveSubscription { topic, response_tx } => {
                respond!(self, self.controller.remove_subscription(&topic), response_tx);
            }
            SessionCommand::Publish {
                request,
                response_tx,
            } => {
                respond!(self, self.controller.publish(&request), response_tx);
            }
            SessionCommand::ClearHistory { response_tx } => {
                respond!(self, self.controller.clear_history(), response_tx);
            }
            SessionCommand::History { response_tx } => {
                respond!(self, self.controller.history().to_vec(), response_tx);
            }
            SessionCommand::Shutdown => {}
        }
    }

    /// Serves commands and events until a shutdown request arrives or every
    /// command sender is gone.
    pub async fn run_until_shutdown(mut self) -> SessionWorker<Stopped> {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => {
                        info!("Session worker shutting down");
                        break;
                    }
                    Some(command) => {
                        debug!("Command: {:?}", command);
                        self.execute(command);
                    }
                },
                Some(event) = self.events.recv() => {
                    self.controller.handle_event(event);
                    self.publish_updates();
                }
            }
        }

        self.controller.disconnect();
        self.publish_updates();
        self.transition()
    }
}

impl SessionWorker<Stopped> {
    /// Hands the controller back, e.g. to inspect the final history
    pub fn into_controller(self) -> SessionController {
        self.controller
    }
}
