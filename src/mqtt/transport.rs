//! Seam between the session and the protocol engine
//!
//! The session never speaks MQTT itself. It opens one [`TransportHandle`] per
//! connect through a [`Transport`], issues non-blocking requests on it, and
//! receives everything the engine reports back as a [`TransportEvent`] tagged
//! with the [`SessionId`] it was opened under.

use std::fmt;

use super::config::{ConnectionConfig, QoS};
use super::error::TransportError;

/// Identifies one `connect` attempt. Events carrying an older id belong to a
/// superseded handle and are dropped by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

/// Everything the engine reports, as one closed set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broker acknowledged the connection
    Connected,
    Message { topic: String, payload: Vec<u8> },
    /// Connection failed or broke; the handle is no longer usable
    Error(String),
    Closed,
}

/// A transport event together with the session it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: SessionId,
    pub event: TransportEvent,
}

/// Opens connections to a broker.
pub trait Transport: Send + 'static {
    /// Starts connecting with `config`. Returns as soon as the attempt is
    /// underway; the outcome arrives later as events tagged with `session`.
    fn open(
        &mut self,
        session: SessionId,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// One live connection. All calls are non-blocking requests; an `Ok` means the
/// engine accepted the request, not that the broker acted on it.
pub trait TransportHandle: Send {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError>;

    /// Requests termination. Must be safe to call more than once.
    fn close(&self);
}
