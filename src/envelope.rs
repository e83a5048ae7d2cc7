//! The JSON application envelope carried inside WebSocket text messages: subscribe,
//! unsubscribe, and publish requests inbound, fan-out notifications outbound. This
//! module only defines the shapes and wires them to `serde_json`.

use serde::{Deserialize, Serialize};

use crate::frame::{encode_frame, Opcode};

/// One inbound text message: `{"action": "pub"|"sub"|"unsub", "key": <string>, "data"?:
/// <string>}`.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum InboundEnvelope {
    #[serde(rename = "pub")]
    Publish { key: String, data: String },
    #[serde(rename = "sub")]
    Subscribe { key: String },
    #[serde(rename = "unsub")]
    Unsubscribe { key: String },
}

/// Parse one inbound text message. Any error (malformed JSON, missing fields) is
/// reported to the caller as a single error type; the connection engine logs and
/// drops the message rather than closing the connection.
pub fn parse_inbound(text: &str) -> Result<InboundEnvelope, serde_json::Error> {
    serde_json::from_str(text)
}

/// One outbound fan-out message: `{"key": <channel>, "data": <payload>}`.
#[derive(Debug, Serialize)]
pub struct OutboundEnvelope<'a> {
    pub key: &'a str,
    #[serde(with = "serde_bytes_as_str")]
    pub data: &'a [u8],
}

/// Pub/sub payloads are opaque bytes on the broker side but must become a JSON string
/// on the wire; they are treated as UTF-8 text here (the broker carries what publishers
/// hand it, and publishers speak the same envelope, so payloads are text in practice).
mod serde_bytes_as_str {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(data: &&[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let text = String::from_utf8_lossy(data);
        serializer.serialize_str(&text)
    }
}

impl<'a> OutboundEnvelope<'a> {
    /// Serialize to JSON and wrap as a single, unfragmented WebSocket text frame.
    pub fn encode_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(encode_frame(Opcode::Text, &json))
    }
}
