//! Session controller: the single entry point for the presentation layer
//!
//! Composes the lifecycle state machine, the subscription registry, the
//! payload codec and the message log, and owns all ordering between them:
//! subscriptions are re-applied right after the broker acknowledges a
//! connect, and an outbound message is logged only once the transport has
//! accepted it.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

use super::codec::{self, PayloadMode};
use super::config::{ConnectionConfig, QoS};
use super::error::SessionError;
use super::message_manager::{HistoryEntry, MessageLog};
use super::mqtt_handler::{ConnectionLifecycle, SessionState, Transition};
use super::subscriptions::{Subscription, SubscriptionRegistry};
use super::transport::{PublishOptions, SessionEvent, SessionId, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub message: String,
    pub mode: PayloadMode,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, message: impl Into<String>) -> Self {
        PublishRequest {
            topic: topic.into(),
            message: message.into(),
            mode: PayloadMode::default(),
            qos: QoS::default(),
            retain: false,
        }
    }

    pub fn with_mode(mut self, mode: PayloadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Point-in-time view of the session for the presentation layer.
///
/// The message log itself is not part of it: it grows without bound, so
/// only its size and clear generation are carried here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Broker and client id of the connection in the slot, if any
    pub broker_url: Option<String>,
    pub client_id: Option<String>,
    pub subscriptions: Vec<Subscription>,
    pub history_len: usize,
    pub history_generation: u64,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

pub struct SessionController {
    lifecycle: ConnectionLifecycle,
    subscriptions: SubscriptionRegistry,
    history: MessageLog,
    messages_received: usize,
    messages_sent: usize,
    last_activity: Option<DateTime<Local>>,
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("state", self.state())
            .field("session", &self.session_id())
            .field("subscriptions", &self.subscriptions.len())
            .field("history", &self.history.len())
            .finish()
    }
}

impl SessionController {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        SessionController {
            lifecycle: ConnectionLifecycle::new(transport),
            subscriptions: SubscriptionRegistry::new(),
            history: MessageLog::new(),
            messages_received: 0,
            messages_sent: 0,
            last_activity: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        self.lifecycle.state()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.lifecycle.session_id()
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        self.subscriptions.as_slice()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.history.entries()
    }

    /// Bumped on every `clear_history`
    pub fn history_generation(&self) -> u64 {
        self.history.generation()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let config = self.lifecycle.config();
        SessionSnapshot {
            state: self.state().clone(),
            broker_url: config.map(|c| c.broker_url.clone()),
            client_id: config.map(|c| c.client_id.clone()),
            subscriptions: self.subscriptions.as_slice().to_vec(),
            history_len: self.history.len(),
            history_generation: self.history.generation(),
            messages_received: self.messages_received,
            messages_sent: self.messages_sent,
            last_activity: self.last_activity,
        }
    }

    pub fn connect(&mut self, config: ConnectionConfig) -> Result<SessionId, SessionError> {
        self.lifecycle.connect(config)
    }

    /// Returns `true` if a connection was torn down.
    pub fn disconnect(&mut self) -> bool {
        self.lifecycle.disconnect()
    }

    /// Adds a subscription and, when connected, subscribes right away.
    ///
    /// Empty or already registered topics are ignored and return `false`.
    /// While connecting the entry is only recorded; it goes out with the
    /// re-subscription that follows the connect acknowledgement.
    pub fn add_subscription(&mut self, topic: &str, qos: QoS) -> bool {
        if !self.subscriptions.add(topic, qos) {
            return false;
        }
        info!("Subscription added: {} (QoS {})", topic, qos);
        self.lifecycle.subscribe(topic, qos);
        true
    }

    /// Returns `true` if the topic was registered.
    pub fn remove_subscription(&mut self, topic: &str) -> bool {
        if self.subscriptions.remove(topic).is_none() {
            debug!("No subscription for {}", topic);
            return false;
        }
        info!("Subscription removed: {}", topic);
        self.lifecycle.unsubscribe(topic);
        true
    }

    /// Encodes and sends one message, logging it once the transport accepts it.
    pub fn publish(&mut self, request: &PublishRequest) -> Result<(), SessionError> {
        let handle = self.lifecycle.live_handle().ok_or(SessionError::NotConnected)?;

        if request.topic.is_empty() {
            return Err(SessionError::InvalidRequest(
                "Publish topic must not be empty".to_string(),
            ));
        }
        if request.message.is_empty() {
            return Err(SessionError::InvalidRequest(
                "Publish message must not be empty".to_string(),
            ));
        }

        let payload = codec::encode(&request.topic, &request.message, request.mode)?;
        let options = PublishOptions {
            qos: request.qos,
            retain: request.retain,
        };

        if let Err(e) = handle.publish(&request.topic, payload.into_bytes(), options) {
            warn!("Publish to {} failed: {}", request.topic, e);
            return Err(SessionError::PublishFailed(e.to_string()));
        }

        debug!("Published to {} (QoS {}, retain {})", request.topic, request.qos, request.retain);
        self.record(HistoryEntry::outbound(
            request.topic.clone(),
            request.message.clone(),
        ));
        self.messages_sent += 1;
        Ok(())
    }

    pub fn clear_history(&mut self) {
        info!("Clearing {} history entries", self.history.len());
        self.history.clear();
    }

    /// Re-entry point for everything the transport reports.
    pub fn handle_event(&mut self, event: SessionEvent) {
        match self.lifecycle.apply(event) {
            Some(Transition::Connected) => {
                self.lifecycle.resubscribe(&self.subscriptions);
            }
            Some(Transition::Message { topic, payload }) => {
                debug!("Received {} bytes on {}", payload.len(), topic);
                self.record(HistoryEntry::inbound(topic, &payload));
                self.messages_received += 1;
            }
            Some(Transition::Failed(_)) | Some(Transition::Closed) | None => {}
        }
    }

    fn record(&mut self, entry: HistoryEntry) {
        self.last_activity = Some(Local::now());
        self.history.record(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::codec::encode_dp_frame;
    use crate::mqtt::message_manager::Direction;
    use crate::mqtt::testing::{Call, RecordingTransport};
    use crate::mqtt::transport::TransportEvent;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            broker_url: "mqtt://localhost".to_string(),
            client_id: "session-test".to_string(),
            ..ConnectionConfig::default()
        }
    }

    fn connected() -> (SessionController, RecordingTransport, SessionId) {
        let transport = RecordingTransport::new();
        let mut session = SessionController::new(Box::new(transport.clone()));
        let id = session.connect(config()).unwrap();
        session.handle_event(SessionEvent {
            session: id,
            event: TransportEvent::Connected,
        });
        (session, transport, id)
    }

    fn message(id: SessionId, topic: &str, payload: &[u8]) -> SessionEvent {
        SessionEvent {
            session: id,
            event: TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            },
        }
    }

    #[test]
    fn registry_applied_exactly_once_per_connect() {
        let transport = RecordingTransport::new();
        let mut session = SessionController::new(Box::new(transport.clone()));
        session.add_subscription("a", QoS::AtMostOnce);
        session.add_subscription("b", QoS::ExactlyOnce);
        assert!(transport.subscribe_calls().is_empty());

        let id = session.connect(config()).unwrap();
        session.handle_event(SessionEvent {
            session: id,
            event: TransportEvent::Connected,
        });

        assert_eq!(
            transport.subscribe_calls(),
            vec![
                ("a".to_string(), QoS::AtMostOnce),
                ("b".to_string(), QoS::ExactlyOnce)
            ]
        );
    }

    #[test]
    fn subscriptions_added_while_connecting_go_out_on_connect() {
        let transport = RecordingTransport::new();
        let mut session = SessionController::new(Box::new(transport.clone()));
        let id = session.connect(config()).unwrap();

        assert!(session.add_subscription("queued/#", QoS::AtLeastOnce));
        assert!(session.add_subscription("dropped", QoS::AtMostOnce));
        assert!(session.remove_subscription("dropped"));
        assert!(transport.subscribe_calls().is_empty());

        session.handle_event(SessionEvent {
            session: id,
            event: TransportEvent::Connected,
        });
        assert_eq!(
            transport.subscribe_calls(),
            vec![("queued/#".to_string(), QoS::AtLeastOnce)]
        );
    }

    #[test]
    fn add_and_remove_while_connected_hit_the_transport() {
        let (mut session, transport, id) = connected();

        assert!(session.add_subscription("x", QoS::AtLeastOnce));
        assert!(!session.add_subscription("x", QoS::AtMostOnce));
        assert!(session.remove_subscription("x"));
        assert!(!session.remove_subscription("x"));

        assert_eq!(
            transport.calls()[1..].to_vec(),
            vec![
                Call::Subscribe(id, "x".to_string(), QoS::AtLeastOnce),
                Call::Unsubscribe(id, "x".to_string()),
            ]
        );
    }

    #[test]
    fn publish_json_canonicalises_and_logs_raw_text() {
        let (mut session, transport, _) = connected();

        session
            .publish(&PublishRequest::new("cmd", "{ \"a\": 1 }"))
            .unwrap();

        assert_eq!(
            transport.publish_calls(),
            vec![("cmd".to_string(), b"{\"a\":1}".to_vec())]
        );
        let entry = &session.history()[0];
        assert_eq!(entry.payload(), "{ \"a\": 1 }");
        assert_eq!(entry.direction(), Direction::Outbound);
        assert_eq!(session.snapshot().messages_sent, 1);
    }

    #[test]
    fn publish_invalid_json_sends_raw_text() {
        let (mut session, transport, _) = connected();

        session.publish(&PublishRequest::new("cmd", "{a:1")).unwrap();
        assert_eq!(
            transport.publish_calls(),
            vec![("cmd".to_string(), b"{a:1".to_vec())]
        );
    }

    #[test]
    fn publish_to_dp_sends_frame() {
        let (mut session, transport, _) = connected();

        session
            .publish(&PublishRequest::new("$dp", "hi").with_mode(PayloadMode::Text))
            .unwrap();
        assert_eq!(
            transport.publish_calls(),
            vec![("$dp".to_string(), vec![0x04, 0x00, 0x02, 0x68, 0x69])]
        );
    }

    #[test]
    fn publish_passes_qos_and_retain() {
        let (mut session, transport, id) = connected();

        session
            .publish(
                &PublishRequest::new("t", "v")
                    .with_mode(PayloadMode::Text)
                    .with_qos(QoS::ExactlyOnce)
                    .with_retain(true),
            )
            .unwrap();
        assert_eq!(
            transport.calls().last(),
            Some(&Call::Publish(
                id,
                "t".to_string(),
                b"v".to_vec(),
                PublishOptions {
                    qos: QoS::ExactlyOnce,
                    retain: true
                }
            ))
        );
    }

    #[test]
    fn oversized_dp_payload_is_rejected_and_not_logged() {
        let (mut session, transport, _) = connected();
        let payload = "x".repeat(codec::DP_MAX_PAYLOAD + 1);

        let result = session.publish(&PublishRequest::new("$dp", payload).with_mode(PayloadMode::Text));
        assert!(matches!(result, Err(SessionError::FrameOverflow { .. })));
        assert!(transport.publish_calls().is_empty());
        assert!(session.history().is_empty());
    }

    #[test]
    fn failed_publish_is_not_logged_and_keeps_state() {
        let (mut session, transport, _) = connected();
        transport.fail_publish(Some("queue full"));

        let result = session.publish(&PublishRequest::new("t", "v"));
        assert!(matches!(result, Err(SessionError::PublishFailed(_))));
        assert!(session.history().is_empty());
        assert_eq!(session.state(), &SessionState::Connected);
    }

    #[test]
    fn publish_requires_connection_and_content() {
        let transport = RecordingTransport::new();
        let mut session = SessionController::new(Box::new(transport.clone()));
        assert_eq!(
            session.publish(&PublishRequest::new("t", "v")),
            Err(SessionError::NotConnected)
        );

        let (mut session, transport, _) = connected();
        assert!(matches!(
            session.publish(&PublishRequest::new("", "v")),
            Err(SessionError::InvalidRequest(_))
        ));
        assert!(matches!(
            session.publish(&PublishRequest::new("t", "")),
            Err(SessionError::InvalidRequest(_))
        ));
        assert!(transport.publish_calls().is_empty());
    }

    #[test]
    fn inbound_messages_are_logged() {
        let (mut session, _, id) = connected();
        session.handle_event(message(id, "sensors/t", b"21.5"));

        let entry = &session.history()[0];
        assert_eq!(entry.topic(), "sensors/t");
        assert_eq!(entry.payload(), "21.5");
        assert_eq!(entry.direction(), Direction::Inbound);
        assert_eq!(session.snapshot().messages_received, 1);
        assert!(session.snapshot().last_activity.is_some());
    }

    #[test]
    fn clear_history_then_one_inbound_message() {
        let (mut session, _, id) = connected();
        session.handle_event(message(id, "a", b"1"));
        session.handle_event(message(id, "b", b"2"));

        session.clear_history();
        assert!(session.history().is_empty());
        assert_eq!(session.history_generation(), 1);

        session.handle_event(message(id, "c", b"3"));
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.history()[0].topic(), "c");

        let snapshot = session.snapshot();
        assert_eq!(snapshot.history_len, 1);
        assert_eq!(snapshot.history_generation, 1);
    }

    #[test]
    fn snapshot_reports_the_active_connection() {
        let transport = RecordingTransport::new();
        let mut session = SessionController::new(Box::new(transport.clone()));
        assert_eq!(session.snapshot().broker_url, None);

        session.connect(config()).unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.broker_url.as_deref(), Some("mqtt://localhost"));
        assert_eq!(snapshot.client_id.as_deref(), Some("session-test"));
        assert_eq!(transport.configs(), vec![config()]);

        session.disconnect();
        assert_eq!(session.snapshot().client_id, None);
    }

    #[test]
    fn inbound_dp_frame_is_logged_as_received() {
        let (mut session, _, id) = connected();
        let frame = encode_dp_frame("ok").unwrap();
        session.handle_event(message(id, "$dp", &frame));
        assert_eq!(
            session.history()[0].payload(),
            String::from_utf8_lossy(&frame)
        );
    }

    #[test]
    fn disconnect_when_disconnected_is_noop() {
        let transport = RecordingTransport::new();
        let mut session = SessionController::new(Box::new(transport.clone()));

        assert!(!session.disconnect());
        assert_eq!(session.state(), &SessionState::Disconnected);
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn transport_error_stops_live_calls() {
        let (mut session, transport, id) = connected();
        session.handle_event(SessionEvent {
            session: id,
            event: TransportEvent::Error("connection reset".to_string()),
        });

        assert_eq!(
            session.state(),
            &SessionState::Error("connection reset".to_string())
        );
        assert!(session.add_subscription("late", QoS::AtMostOnce));
        assert_eq!(
            session.publish(&PublishRequest::new("t", "v")),
            Err(SessionError::NotConnected)
        );
        assert!(transport.subscribe_calls().is_empty());
        assert_eq!(session.subscriptions().len(), 1);
    }

    #[test]
    fn reconnect_reapplies_registry_again() {
        let (mut session, transport, id) = connected();
        session.add_subscription("keep", QoS::AtLeastOnce);
        session.handle_event(SessionEvent {
            session: id,
            event: TransportEvent::Closed,
        });
        assert_eq!(session.state(), &SessionState::Disconnected);

        let second = session.connect(config()).unwrap();
        session.handle_event(SessionEvent {
            session: second,
            event: TransportEvent::Connected,
        });

        assert_eq!(
            transport.subscribe_calls(),
            vec![
                ("keep".to_string(), QoS::AtLeastOnce),
                ("keep".to_string(), QoS::AtLeastOnce)
            ]
        );
    }
}
