//! Error definitions for the MQTT session

use thiserror::Error;

use super::mqtt_handler::SessionState;

/// Errors surfaced by the session controller and its runtime.
///
/// None of these are fatal to the process: every failure is contained in
/// the session and reported to the caller or reflected in [`SessionState`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The connection snapshot failed validation (empty client id, bad URL, ...)
    #[error("Invalid connection config: {0}")]
    ConfigInvalid(String),

    /// The transport refused or dropped the connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// A single publish was rejected by the transport
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Payload too long for the two-byte `$dp` length field
    #[error("Frame overflow: payload of {len} bytes exceeds {max} bytes")]
    FrameOverflow { len: usize, max: usize },

    /// Operation requires an established connection
    #[error("Not connected")]
    NotConnected,

    /// Request rejected before reaching the transport
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// `connect` while a session is pending or established
    #[error("Session busy: {0}")]
    Busy(SessionState),

    /// The session worker task is no longer running
    #[error("Session worker unavailable: {0}")]
    WorkerGone(String),
}

/// Errors raised by a transport adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unsupported option: {0}")]
    Unsupported(String),

    /// Request queue towards the protocol engine is closed or full
    #[error("Request rejected: {0}")]
    Request(String),

    #[error("No async runtime available: {0}")]
    Runtime(String),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unsupported(msg) => SessionError::ConfigInvalid(msg),
            other => SessionError::Transport(other.to_string()),
        }
    }
}
