//! Connection settings and the value types shared across the session

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::{Host, Url};

use super::error::SessionError;

pub const DEFAULT_BROKER_URL: &str = "wss://broker.emqx.io:8084";
pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 120;
pub const DEFAULT_WS_PATH: &str = "/mqtt";

/// MQTT quality-of-service level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(SessionError::InvalidRequest(format!(
                "QoS must be 0, 1 or 2, got {}",
                other
            ))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl FromStr for QoS {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level: u8 = s
            .trim()
            .parse()
            .map_err(|_| SessionError::InvalidRequest(format!("QoS is not a number: {}", s)))?;
        QoS::try_from(level)
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Protocol revision requested from the broker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "3.1")]
    V31,
    #[default]
    #[serde(rename = "3.1.1")]
    V311,
    #[serde(rename = "5.0")]
    V5,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            ProtocolVersion::V31 => "3.1",
            ProtocolVersion::V311 => "3.1.1",
            ProtocolVersion::V5 => "5.0",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Message the broker publishes for us if the connection drops unexpectedly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWill {
    pub topic: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

/// Transport security selected by the broker URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Scheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Some(Scheme::Tcp),
            "mqtts" | "ssl" | "tls" => Some(Scheme::Tls),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "mqtt",
            Scheme::Tls => "mqtts",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }
}

/// Broker address split into its parts.
///
/// Accepts `scheme://host[:port][/path]`; IPv6 hosts go in brackets. WebSocket
/// URLs without a path get [`DEFAULT_WS_PATH`]. Credentials belong in
/// [`Credentials`], so URLs carrying a user or password are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    pub scheme: Scheme,
    /// Bare host, IPv6 addresses without brackets
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl BrokerUrl {
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let raw = raw.trim();
        let url = Url::parse(raw)
            .map_err(|e| SessionError::ConfigInvalid(format!("Invalid broker URL {}: {}", raw, e)))?;
        let scheme = Scheme::parse(url.scheme()).ok_or_else(|| {
            SessionError::ConfigInvalid(format!("Unknown scheme: {}", url.scheme()))
        })?;

        if !url.username().is_empty() || url.password().is_some() {
            return Err(SessionError::ConfigInvalid(format!(
                "Credentials are not allowed in the broker URL (host {})",
                url.host_str().unwrap_or_default()
            )));
        }

        let host = match url.host() {
            Some(Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => String::new(),
        };
        if host.is_empty() {
            return Err(SessionError::ConfigInvalid(format!(
                "Missing host in {}",
                raw
            )));
        }

        let path = url.path();
        let path = if scheme.is_websocket() && (path.is_empty() || path == "/") {
            DEFAULT_WS_PATH.to_string()
        } else {
            path.to_string()
        };

        Ok(BrokerUrl {
            scheme,
            host,
            port: url.port().unwrap_or_else(|| scheme.default_port()),
            path,
        })
    }

    /// Address handed to the protocol engine: bare host for TCP/TLS, the full
    /// URL for WebSocket transports.
    pub fn engine_address(&self) -> String {
        if self.scheme.is_websocket() {
            self.to_string()
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for BrokerUrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = self.scheme.as_str();
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}{}", scheme, self.host, self.port, self.path)
        } else {
            write!(f, "{}://{}:{}{}", scheme, self.host, self.port, self.path)
        }
    }
}

/// Snapshot of everything needed to open a broker session.
///
/// Taken by value at connect time; editing the caller's copy afterwards does
/// not affect the session already in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub broker_url: String,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub protocol: ProtocolVersion,
    pub keep_alive_secs: u16,
    pub clean_start: bool,
    pub last_will: Option<LastWill>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            client_id: generate_client_id(),
            credentials: None,
            protocol: ProtocolVersion::default(),
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            clean_start: true,
            last_will: None,
        }
    }
}

impl ConnectionConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }

    /// Checks the snapshot and returns the parsed broker URL.
    pub fn validate(&self) -> Result<BrokerUrl, SessionError> {
        if self.client_id.trim().is_empty() {
            return Err(SessionError::ConfigInvalid(
                "Client id must not be empty".to_string(),
            ));
        }
        if self.keep_alive_secs == 0 {
            return Err(SessionError::ConfigInvalid(
                "Keep-alive must be at least one second".to_string(),
            ));
        }
        if let Some(will) = &self.last_will {
            if will.topic.is_empty() {
                return Err(SessionError::ConfigInvalid(
                    "Last will topic must not be empty".to_string(),
                ));
            }
        }
        BrokerUrl::parse(&self.broker_url)
    }
}

/// Random client identifier in the form `mqtt_<8 hex digits>`
pub fn generate_client_id() -> String {
    format!("mqtt_{:08x}", rand::rng().random::<u32>())
}
