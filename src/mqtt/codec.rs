//! Outbound payload encoding
//!
//! Turns the text typed by the user into the bytes handed to the transport.
//! `json` mode canonicalises valid JSON and falls back to the raw text
//! otherwise; the remaining modes pass the text through unchanged. Messages
//! for the reserved [`DP_TOPIC`] are wrapped in a small binary envelope:
//!
//! ```text
//! +------+-----------+----------------+
//! | 0x04 | len (u16) | utf-8 payload  |
//! +------+-----------+----------------+
//!   1 B     2 B, BE      len bytes
//! ```
//!
//! Everything in here is pure: no I/O, same input gives the same output.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use super::error::SessionError;

/// Topic whose payloads are framed instead of sent as text
pub const DP_TOPIC: &str = "$dp";
/// Type tag in the first byte of every `$dp` frame
pub const DP_TYPE_TAG: u8 = 0x04;
pub const DP_HEADER_LEN: usize = 3;
pub const DP_MAX_PAYLOAD: usize = u16::MAX as usize;
/// 2^53, the largest integer an IEEE double still counts exactly
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMode {
    #[default]
    Json,
    Text,
    Base64,
    Hex,
}

impl FromStr for PayloadMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(PayloadMode::Json),
            "text" => Ok(PayloadMode::Text),
            "base64" => Ok(PayloadMode::Base64),
            "hex" => Ok(PayloadMode::Hex),
            other => Err(SessionError::InvalidRequest(format!(
                "Unknown payload mode: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for PayloadMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            PayloadMode::Json => "json",
            PayloadMode::Text => "text",
            PayloadMode::Base64 => "base64",
            PayloadMode::Hex => "hex",
        };
        write!(f, "{}", label)
    }
}

/// Bytes ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedPayload {
    Text(Vec<u8>),
    DpFrame(Vec<u8>),
}

impl EncodedPayload {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            EncodedPayload::Text(bytes) | EncodedPayload::DpFrame(bytes) => bytes,
        }
    }
}

/// Applies the payload mode to the raw message text.
///
/// Only `json` changes anything: valid JSON is re-serialised compactly the
/// way a browser's `JSON.stringify(JSON.parse(..))` does it, invalid JSON is
/// logged and returned as typed.
pub fn apply_mode(raw_message: &str, mode: PayloadMode) -> String {
    match mode {
        PayloadMode::Json => match serde_json::from_str::<Value>(raw_message) {
            Ok(value) => canonical_json(value).to_string(),
            Err(e) => {
                warn!("Payload is not valid JSON, sending raw text: {}", e);
                raw_message.to_string()
            }
        },
        // Advisory only, bytes go out as typed
        PayloadMode::Text | PayloadMode::Base64 | PayloadMode::Hex => raw_message.to_string(),
    }
}

/// Whole floats within the safe integer range print as integers (`1.0`,
/// `1e2` and `-0.0` become `1`, `100` and `0`). Object keys that are array
/// indices move to the front in ascending order, other keys keep their order.
fn canonical_json(value: Value) -> Value {
    match value {
        Value::Number(number) => Value::Number(canonical_number(number)),
        Value::Array(items) => Value::Array(items.into_iter().map(canonical_json).collect()),
        Value::Object(map) => {
            let (mut indexed, named): (Vec<_>, Vec<_>) =
                map.into_iter().partition(|(key, _)| array_index(key).is_some());
            indexed.sort_by_key(|(key, _)| array_index(key));
            Value::Object(
                indexed
                    .into_iter()
                    .chain(named)
                    .map(|(key, value)| (key, canonical_json(value)))
                    .collect::<Map<String, Value>>(),
            )
        }
        other => other,
    }
}

fn canonical_number(number: Number) -> Number {
    match number.as_f64() {
        Some(f) if number.is_f64() && f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER => {
            Number::from(f as i64)
        }
        _ => number,
    }
}

/// `Some(n)` for keys like `"0"` or `"42"`; leading zeros and signs don't count.
fn array_index(key: &str) -> Option<u32> {
    let index: u32 = key.parse().ok()?;
    (index != u32::MAX && index.to_string() == key).then_some(index)
}

/// Wraps `payload` in the `$dp` envelope.
pub fn encode_dp_frame(payload: &str) -> Result<Vec<u8>, SessionError> {
    let body = payload.as_bytes();
    let len = u16::try_from(body.len()).map_err(|_| SessionError::FrameOverflow {
        len: body.len(),
        max: DP_MAX_PAYLOAD,
    })?;

    let mut frame = Vec::with_capacity(DP_HEADER_LEN + body.len());
    frame.push(DP_TYPE_TAG);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Full publish-path encoding for one message.
pub fn encode(topic: &str, raw_message: &str, mode: PayloadMode) -> Result<EncodedPayload, SessionError> {
    let payload = apply_mode(raw_message, mode);

    if topic == DP_TOPIC {
        let frame = encode_dp_frame(&payload)?;
        debug!("$dp frame: {}", hex_dump(&frame));
        Ok(EncodedPayload::DpFrame(frame))
    } else {
        Ok(EncodedPayload::Text(payload.into_bytes()))
    }
}

/// Space separated lowercase hex, e.g. `04 00 02 68 69`
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
