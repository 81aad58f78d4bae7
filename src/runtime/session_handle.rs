//! Session Handle - async API over the session worker
//!
//! Every call is a [`SessionCommand`] with a oneshot reply channel. State is
//! read from the latest [`SessionSnapshot`] without a round trip. New message
//! log entries are broadcast one by one; the whole log is only copied when
//! asked for.

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::session_worker::{SessionCommand, SessionWorker};
use crate::mqtt::config::{ConnectionConfig, QoS};
use crate::mqtt::error::SessionError;
use crate::mqtt::message_manager::HistoryEntry;
use crate::mqtt::rumqtt_transport::RumqttTransport;
use crate::mqtt::session::{PublishRequest, SessionController, SessionSnapshot};
use crate::mqtt::transport::{SessionEvent, SessionId, Transport};

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 100;
const HISTORY_CAPACITY: usize = 256;

pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    history: broadcast::Sender<HistoryEntry>,
    task_handle: Option<JoinHandle<SessionController>>,
}

impl SessionHandle {
    /// Spawns a worker around `transport`. `events` must be the receiving end
    /// of the channel the transport reports into.
    pub fn spawn(transport: Box<dyn Transport>, events: mpsc::Receiver<SessionEvent>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshots_tx, snapshots_rx) = watch::channel(SessionSnapshot::default());
        let (history_tx, _) = broadcast::channel(HISTORY_CAPACITY);

        let worker = SessionWorker::create(
            SessionController::new(transport),
            commands_rx,
            events,
            snapshots_tx,
            history_tx.clone(),
        )
        .start();

        let task_handle = tokio::spawn(async move {
            let stopped = worker.run_until_shutdown().await;
            info!("Session worker stopped");
            stopped.into_controller()
        });

        SessionHandle {
            commands: commands_tx,
            snapshots: snapshots_rx,
            history: history_tx,
            task_handle: Some(task_handle),
        }
    }

    /// Worker backed by the `rumqttc` transport
    pub fn spawn_rumqtt() -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Self::spawn(Box::new(RumqttTransport::new(events_tx)), events_rx)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified after every command or event the worker handled
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Entries recorded from now on, inbound and outbound, in log order
    pub fn history_stream(&self) -> broadcast::Receiver<HistoryEntry> {
        self.history.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.commands
            .send(build(response_tx))
            .await
            .map_err(|e| SessionError::WorkerGone(e.to_string()))?;
        response_rx
            .await
            .map_err(|e| SessionError::WorkerGone(e.to_string()))
    }

    pub async fn connect(&self, config: ConnectionConfig) -> Result<SessionId, SessionError> {
        self.request(|response_tx| SessionCommand::Connect {
            config,
            response_tx,
        })
        .await?
    }

    pub async fn disconnect(&self) -> Result<bool, SessionError> {
        self.request(|response_tx| SessionCommand::Disconnect { response_tx })
            .await
    }

    pub async fn add_subscription(&self, topic: &str, qos: QoS) -> Result<bool, SessionError> {
        self.request(|response_tx| SessionCommand::AddSubscription {
            topic: topic.to_string(),
            qos,
            response_tx,
        })
        .await
    }

    pub async fn remove_subscription(&self, topic: &str) -> Result<bool, SessionError> {
        self.request(|response_tx| SessionCommand::RemoveSubscription {
            topic: topic.to_string(),
            response_tx,
        })
        .await
    }

    pub async fn publish(&self, request: PublishRequest) -> Result<(), SessionError> {
        self.request(|response_tx| SessionCommand::Publish {
            request,
            response_tx,
        })
        .await?
    }

    pub async fn clear_history(&self) -> Result<(), SessionError> {
        self.request(|response_tx| SessionCommand::ClearHistory { response_tx })
            .await
    }

    /// Copy of the whole message log
    pub async fn history(&self) -> Result<Vec<HistoryEntry>, SessionError> {
        self.request(|response_tx| SessionCommand::History { response_tx })
            .await
    }

    /// Disconnects, stops the worker and returns the final controller.
    pub async fn shutdown(mut self) -> Result<SessionController, SessionError> {
        debug!("Sending shutdown to session worker");
        if self.commands.send(SessionCommand::Shutdown).await.is_err() {
            warn!("Session worker already terminated");
        }

        let Some(handle) = self.task_handle.take() else {
            return Err(SessionError::WorkerGone("already shut down".to_string()));
        };
        handle.await.map_err(|e| {
            error!("Session worker panicked: {}", e);
            SessionError::WorkerGone(format!("Session worker panicked: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::mqtt_handler::SessionState;
    use crate::mqtt::testing::RecordingTransport;
    use crate::mqtt::transport::TransportEvent;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            broker_url: "mqtt://localhost".to_string(),
            client_id: "handle-test".to_string(),
            ..ConnectionConfig::default()
        }
    }

    async fn changed_until(
        rx: &mut watch::Receiver<SessionSnapshot>,
        pred: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if pred(&snapshot) {
                    return snapshot.clone();
                }
            }
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn commands_and_events_flow_through_worker() {
        let transport = RecordingTransport::new();
        let (events_tx, events_rx) = mpsc::channel(8);
        let handle = SessionHandle::spawn(Box::new(transport.clone()), events_rx);
        let mut snapshots = handle.watch();

        assert!(handle.add_subscription("a/#", QoS::AtLeastOnce).await.unwrap());
        let id = handle.connect(config()).await.unwrap();
        assert_eq!(handle.snapshot().state, SessionState::Connecting);

        events_tx
            .send(SessionEvent {
                session: id,
                event: TransportEvent::Connected,
            })
            .await
            .unwrap();
        changed_until(&mut snapshots, |s| s.state == SessionState::Connected).await;
        assert_eq!(
            transport.subscribe_calls(),
            vec![("a/#".to_string(), QoS::AtLeastOnce)]
        );

        events_tx
            .send(SessionEvent {
                session: id,
                event: TransportEvent::Message {
                    topic: "a/b".to_string(),
                    payload: b"hello".to_vec(),
                },
            })
            .await
            .unwrap();
        changed_until(&mut snapshots, |s| s.history_len == 1).await;
        assert_eq!(handle.history().await.unwrap()[0].payload(), "hello");

        handle
            .publish(PublishRequest::new("a/c", "{\"x\": 2}"))
            .await
            .unwrap();
        assert_eq!(handle.snapshot().messages_sent, 1);

        handle.clear_history().await.unwrap();
        assert_eq!(handle.snapshot().history_len, 0);
        assert!(handle.history().await.unwrap().is_empty());

        let controller = handle.shutdown().await.unwrap();
        assert_eq!(controller.state(), &SessionState::Disconnected);
    }

    fn inbound(session: SessionId, topic: &str) -> SessionEvent {
        SessionEvent {
            session,
            event: TransportEvent::Message {
                topic: topic.to_string(),
                payload: topic.as_bytes().to_vec(),
            },
        }
    }

    #[tokio::test]
    async fn history_stream_survives_clear_between_bursts() {
        let transport = RecordingTransport::new();
        let (events_tx, events_rx) = mpsc::channel(32);
        let handle = SessionHandle::spawn(Box::new(transport), events_rx);
        let mut stream = handle.history_stream();

        let id = handle.connect(config()).await.unwrap();
        events_tx
            .send(SessionEvent {
                session: id,
                event: TransportEvent::Connected,
            })
            .await
            .unwrap();
        for topic in ["a1", "a2"] {
            events_tx.send(inbound(id, topic)).await.unwrap();
        }
        // Make sure the first burst is handled before clearing
        let mut snapshots = handle.watch();
        changed_until(&mut snapshots, |s| s.history_len == 2).await;
        handle.clear_history().await.unwrap();
        for topic in ["b1", "b2", "b3", "b4", "b5"] {
            events_tx.send(inbound(id, topic)).await.unwrap();
        }

        let mut topics = Vec::new();
        while topics.len() < 7 {
            topics.push(stream.recv().await.unwrap().topic().to_string());
        }
        assert_eq!(topics, vec!["a1", "a2", "b1", "b2", "b3", "b4", "b5"]);
        assert_eq!(handle.snapshot().history_generation, 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn second_connect_reports_busy() {
        let transport = RecordingTransport::new();
        let (_events_tx, events_rx) = mpsc::channel(8);
        let handle = SessionHandle::spawn(Box::new(transport.clone()), events_rx);

        handle.connect(config()).await.unwrap();
        assert!(matches!(
            handle.connect(config()).await,
            Err(SessionError::Busy(_))
        ));
        assert_eq!(transport.open_count(), 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn calls_after_shutdown_report_worker_gone() {
        let transport = RecordingTransport::new();
        let (_events_tx, events_rx) = mpsc::channel(8);
        let handle = SessionHandle::spawn(Box::new(transport), events_rx);
        let commands = handle.commands.clone();
        let snapshots = handle.watch();
        handle.shutdown().await.unwrap();

        let orphan = SessionHandle {
            commands,
            snapshots,
            history: broadcast::channel(1).0,
            task_handle: None,
        };
        assert!(matches!(
            orphan.disconnect().await,
            Err(SessionError::WorkerGone(_))
        ));
    }
}
