//! [`Transport`] backed by `rumqttc`
//!
//! Each `open` builds a client/event-loop pair for the requested protocol
//! revision and spawns a pump task that turns engine notifications into
//! [`TransportEvent`]s. The pump stops polling after the first error or
//! close; `rumqttc` would otherwise reconnect on the next poll, and this
//! session never reconnects on its own.
//!
//! ```text
//! SessionController ──try_*──► AsyncClient ──► EventLoop ──poll──► pump task
//!         ▲                                                          │
//!         └──────────────── mpsc<SessionEvent> ◄─────────────────────┘
//! ```

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BrokerUrl, ConnectionConfig, ProtocolVersion, QoS, Scheme};
use super::error::TransportError;
use super::transport::{
    PublishOptions, SessionEvent, SessionId, Transport, TransportEvent, TransportHandle,
};

/// Requests buffered between the client and its event loop
const REQUEST_CAPACITY: usize = 100;
/// How long a closing pump keeps polling to flush the DISCONNECT packet
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

pub struct RumqttTransport {
    events: mpsc::Sender<SessionEvent>,
}

impl RumqttTransport {
    pub fn new(events: mpsc::Sender<SessionEvent>) -> Self {
        RumqttTransport { events }
    }
}

impl Transport for RumqttTransport {
    fn open(
        &mut self,
        session: SessionId,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let url = BrokerUrl::parse(&config.broker_url)
            .map_err(|e| TransportError::Unsupported(e.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Runtime(e.to_string()))?;
        let cancel = CancellationToken::new();

        match config.protocol {
            ProtocolVersion::V31 => Err(TransportError::Unsupported(
                "MQTT 3.1 is not offered by the protocol engine, use 3.1.1 or 5.0".to_string(),
            )),
            ProtocolVersion::V311 => {
                let (client, eventloop) =
                    rumqttc::AsyncClient::new(v311::options(config, &url), REQUEST_CAPACITY);
                runtime.spawn(v311::pump(
                    session,
                    eventloop,
                    self.events.clone(),
                    cancel.clone(),
                ));
                debug!("Spawned MQTT 3.1.1 pump for {} ({})", session, url);
                Ok(Box::new(v311::Handle { client, cancel }))
            }
            ProtocolVersion::V5 => {
                let (client, eventloop) =
                    rumqttc::v5::AsyncClient::new(v5::options(config, &url), REQUEST_CAPACITY);
                runtime.spawn(v5::pump(
                    session,
                    eventloop,
                    self.events.clone(),
                    cancel.clone(),
                ));
                debug!("Spawned MQTT 5.0 pump for {} ({})", session, url);
                Ok(Box::new(v5::Handle { client, cancel }))
            }
        }
    }
}

fn engine_transport(scheme: Scheme) -> rumqttc::Transport {
    match scheme {
        Scheme::Tcp => rumqttc::Transport::Tcp,
        Scheme::Tls => rumqttc::Transport::tls_with_default_config(),
        Scheme::Ws => rumqttc::Transport::Ws,
        Scheme::Wss => rumqttc::Transport::wss_with_default_config(),
    }
}

async fn emit(events: &mpsc::Sender<SessionEvent>, session: SessionId, event: TransportEvent) {
    if events.send(SessionEvent { session, event }).await.is_err() {
        warn!("Session event channel closed, dropping event for {}", session);
    }
}

mod v311 {
    use super::*;
    use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet};

    pub(super) fn qos(qos: QoS) -> rumqttc::QoS {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }

    pub(super) fn options(config: &ConnectionConfig, url: &BrokerUrl) -> MqttOptions {
        let mut options = MqttOptions::new(config.client_id.trim(), url.engine_address(), url.port);
        options
            .set_keep_alive(config.keep_alive())
            .set_clean_session(config.clean_start)
            .set_transport(engine_transport(url.scheme));
        if let Some(creds) = &config.credentials {
            options.set_credentials(creds.username.clone(), creds.password.clone());
        }
        if let Some(will) = &config.last_will {
            options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                qos(will.qos),
                will.retain,
            ));
        }
        options
    }

    pub(super) struct Handle {
        pub(super) client: AsyncClient,
        pub(super) cancel: CancellationToken,
    }

    impl TransportHandle for Handle {
        fn subscribe(&self, topic: &str, level: QoS) -> Result<(), TransportError> {
            self.client
                .try_subscribe(topic, qos(level))
                .map_err(|e| TransportError::Request(e.to_string()))
        }

        fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
            self.client
                .try_unsubscribe(topic)
                .map_err(|e| TransportError::Request(e.to_string()))
        }

        fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            options: PublishOptions,
        ) -> Result<(), TransportError> {
            self.client
                .try_publish(topic, qos(options.qos), options.retain, payload)
                .map_err(|e| TransportError::Request(e.to_string()))
        }

        fn close(&self) {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.client.try_disconnect() {
                debug!("Disconnect request not queued: {}", e);
            }
            self.cancel.cancel();
        }
    }

    impl Drop for Handle {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    pub(super) async fn pump(
        session: SessionId,
        mut eventloop: EventLoop,
        events: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    flush(&mut eventloop).await;
                    break;
                }
                polled = eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!("Broker accepted {} (session present: {})", session, ack.session_present);
                        emit(&events, session, TransportEvent::Connected).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        emit(
                            &events,
                            session,
                            TransportEvent::Message {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            },
                        )
                        .await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        info!("Broker closed {}", session);
                        emit(&events, session, TransportEvent::Closed).await;
                        break;
                    }
                    Ok(other) => debug!("{}: {:?}", session, other),
                    Err(e) => {
                        error!("MQTT connection {} failed: {}", session, e);
                        emit(&events, session, TransportEvent::Error(e.to_string())).await;
                        emit(&events, session, TransportEvent::Closed).await;
                        break;
                    }
                }
            }
        }
        debug!("Pump for {} stopped", session);
    }

    async fn flush(eventloop: &mut EventLoop) {
        let deadline = Instant::now() + FLUSH_TIMEOUT;
        loop {
            match timeout_at(deadline, eventloop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => {
                    debug!("DISCONNECT sent");
                    break;
                }
                Ok(Ok(_)) => continue,
                Ok(Err(_)) | Err(_) => break,
            }
        }
    }
}

mod v5 {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{LastWill, Packet};
    use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};

    pub(super) fn qos(qos: QoS) -> rumqttc::v5::mqttbytes::QoS {
        match qos {
            QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
        }
    }

    pub(super) fn options(config: &ConnectionConfig, url: &BrokerUrl) -> MqttOptions {
        let mut options = MqttOptions::new(config.client_id.trim(), url.engine_address(), url.port);
        options
            .set_keep_alive(config.keep_alive())
            .set_clean_start(config.clean_start)
            .set_transport(engine_transport(url.scheme));
        if let Some(creds) = &config.credentials {
            options.set_credentials(creds.username.clone(), creds.password.clone());
        }
        if let Some(will) = &config.last_will {
            options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                qos(will.qos),
                will.retain,
                None,
            ));
        }
        options
    }

    pub(super) struct Handle {
        pub(super) client: AsyncClient,
        pub(super) cancel: CancellationToken,
    }

    impl TransportHandle for Handle {
        fn subscribe(&self, topic: &str, level: QoS) -> Result<(), TransportError> {
            self.client
                .try_subscribe(topic, qos(level))
                .map_err(|e| TransportError::Request(e.to_string()))
        }

        fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
            self.client
                .try_unsubscribe(topic)
                .map_err(|e| TransportError::Request(e.to_string()))
        }

        fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            options: PublishOptions,
        ) -> Result<(), TransportError> {
            self.client
                .try_publish(topic, qos(options.qos), options.retain, payload)
                .map_err(|e| TransportError::Request(e.to_string()))
        }

        fn close(&self) {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.client.try_disconnect() {
                debug!("Disconnect request not queued: {}", e);
            }
            self.cancel.cancel();
        }
    }

    impl Drop for Handle {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    pub(super) async fn pump(
        session: SessionId,
        mut eventloop: EventLoop,
        events: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    flush(&mut eventloop).await;
                    break;
                }
                polled = eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Broker accepted {}", session);
                        emit(&events, session, TransportEvent::Connected).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        emit(
                            &events,
                            session,
                            TransportEvent::Message {
                                topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                                payload: publish.payload.to_vec(),
                            },
                        )
                        .await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                        info!("Broker closed {}: {:?}", session, disconnect.reason_code);
                        emit(&events, session, TransportEvent::Closed).await;
                        break;
                    }
                    Ok(other) => debug!("{}: {:?}", session, other),
                    Err(e) => {
                        error!("MQTT connection {} failed: {}", session, e);
                        emit(&events, session, TransportEvent::Error(e.to_string())).await;
                        emit(&events, session, TransportEvent::Closed).await;
                        break;
                    }
                }
            }
        }
        debug!("Pump for {} stopped", session);
    }

    async fn flush(eventloop: &mut EventLoop) {
        let deadline = Instant::now() + FLUSH_TIMEOUT;
        while let Ok(Ok(_)) = timeout_at(deadline, eventloop.poll()).await {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::{Credentials, LastWill};

    fn config(url: &str) -> ConnectionConfig {
        ConnectionConfig {
            broker_url: url.to_string(),
            client_id: "adapter-test".to_string(),
            credentials: Some(Credentials {
                username: "user".to_string(),
                password: "pw".to_string(),
            }),
            keep_alive_secs: 30,
            clean_start: false,
            last_will: Some(LastWill {
                topic: "status".to_string(),
                payload: b"offline".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn v311_options_follow_config() {
        let config = config("mqtt://localhost:1884");
        let url = BrokerUrl::parse(&config.broker_url).unwrap();
        let options = v311::options(&config, &url);

        assert_eq!(options.broker_address(), ("localhost".to_string(), 1884));
        assert_eq!(options.client_id(), "adapter-test");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(!options.clean_session());
        assert_eq!(
            options.credentials(),
            Some(("user".to_string(), "pw".to_string()))
        );
        assert!(options.last_will().is_some());
    }

    #[tokio::test]
    async fn protocol_31_is_rejected() {
        let (tx, _rx) = mpsc::channel(4);
        let mut transport = RumqttTransport::new(tx);
        let config = ConnectionConfig {
            protocol: ProtocolVersion::V31,
            ..config("mqtt://localhost")
        };

        let result = transport.open(SessionId(1), &config);
        assert!(matches!(result, Err(TransportError::Unsupported(_))));
    }

    #[test]
    fn open_outside_runtime_fails() {
        let (tx, _rx) = mpsc::channel(4);
        let mut transport = RumqttTransport::new(tx);

        let result = transport.open(SessionId(1), &config("mqtt://localhost"));
        assert!(matches!(result, Err(TransportError::Runtime(_))));
    }

    #[tokio::test]
    async fn refused_connection_reports_error_then_close() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut transport = RumqttTransport::new(tx);
        // Nothing listens on port 1 of the loopback interface
        let config = ConnectionConfig {
            last_will: None,
            credentials: None,
            ..config("mqtt://127.0.0.1:1")
        };

        let _handle = transport.open(SessionId(7), &config).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.session, SessionId(7));
        assert!(matches!(first.event, TransportEvent::Error(_)));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event, TransportEvent::Closed);
    }
}
