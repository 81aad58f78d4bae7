//! In-memory transport that records every request, for tests and dry runs

use std::sync::{Arc, Mutex, MutexGuard};

use super::config::{ConnectionConfig, QoS};
use super::error::TransportError;
use super::transport::{PublishOptions, SessionId, Transport, TransportHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(SessionId),
    Subscribe(SessionId, String, QoS),
    Unsubscribe(SessionId, String),
    Publish(SessionId, String, Vec<u8>, PublishOptions),
    Close(SessionId),
}

#[derive(Debug, Default)]
struct Recorder {
    calls: Vec<Call>,
    configs: Vec<ConnectionConfig>,
    fail_open: Option<String>,
    fail_publish: Option<String>,
}

/// Cloneable: every clone and every handle it opens share one call list.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    recorder: Arc<Mutex<Recorder>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Configs passed to `open`, in order
    pub fn configs(&self) -> Vec<ConnectionConfig> {
        self.lock().configs.clone()
    }

    pub fn open_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Open(_)))
            .count()
    }

    pub fn subscribe_calls(&self) -> Vec<(String, QoS)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Subscribe(_, topic, qos) => Some((topic.clone(), *qos)),
                _ => None,
            })
            .collect()
    }

    pub fn publish_calls(&self) -> Vec<(String, Vec<u8>)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Publish(_, topic, payload, _) => Some((topic.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn fail_open(&self, reason: &str) {
        self.lock().fail_open = Some(reason.to_string());
    }

    /// Every following publish is rejected with `reason`; `None` restores success
    pub fn fail_publish(&self, reason: Option<&str>) {
        self.lock().fail_publish = reason.map(str::to_string);
    }
}

impl Transport for RecordingTransport {
    fn open(
        &mut self,
        session: SessionId,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let mut recorder = self.lock();
        if let Some(reason) = &recorder.fail_open {
            return Err(TransportError::Request(reason.clone()));
        }
        recorder.calls.push(Call::Open(session));
        recorder.configs.push(config.clone());
        drop(recorder);

        Ok(Box::new(RecordingHandle {
            session,
            transport: self.clone(),
        }))
    }
}

struct RecordingHandle {
    session: SessionId,
    transport: RecordingTransport,
}

impl TransportHandle for RecordingHandle {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.transport
            .lock()
            .calls
            .push(Call::Subscribe(self.session, topic.to_string(), qos));
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.transport
            .lock()
            .calls
            .push(Call::Unsubscribe(self.session, topic.to_string()));
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        let mut recorder = self.transport.lock();
        if let Some(reason) = &recorder.fail_publish {
            return Err(TransportError::Request(reason.clone()));
        }
        recorder
            .calls
            .push(Call::Publish(self.session, topic.to_string(), payload, options));
        Ok(())
    }

    fn close(&self) {
        self.transport.lock().calls.push(Call::Close(self.session));
    }
}
