//! Wire envelope shared by inbound and outbound traffic.
//!
//! Every frame is a JSON object `{ "type": ..., "payload": ..., "timestamp": ... }`
//! with an ISO-8601 timestamp string. Inbound frames are validated field by
//! field so that a malformed frame can be reported precisely and dropped.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Event kinds known to the messaging backend.
pub mod kind {
    pub const MESSAGE: &str = "message";
    pub const NOTIFICATION: &str = "notification";
    pub const FRIEND_REQUEST: &str = "friend_request";
    pub const FRIEND_ACCEPTED: &str = "friend_accepted";
    pub const USER_ONLINE: &str = "user_online";
    pub const USER_OFFLINE: &str = "user_offline";
    pub const PRESENCE_UPDATE: &str = "presence_update";
    pub const TYPING: &str = "typing";
    pub const STOP_TYPING: &str = "stop_typing";
    pub const TYPING_START: &str = "typing_start";
    pub const TYPING_STOP: &str = "typing_stop";
    pub const MESSAGE_READ: &str = "message_read";
    pub const CALL_REQUEST: &str = "call_request";
    pub const CALL_RESPONSE: &str = "call_response";
    pub const CALL_END: &str = "call_end";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";

    /// Application event kinds, heartbeat excluded.
    pub const EVENTS: &[&str] = &[
        MESSAGE,
        NOTIFICATION,
        FRIEND_REQUEST,
        FRIEND_ACCEPTED,
        USER_ONLINE,
        USER_OFFLINE,
        PRESENCE_UPDATE,
        TYPING,
        STOP_TYPING,
        TYPING_START,
        TYPING_STOP,
        MESSAGE_READ,
        CALL_REQUEST,
        CALL_RESPONSE,
        CALL_END,
    ];
}

/// One envelope on the realtime transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub timestamp: String,
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedFrame {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("frame has no `payload` field")]
    MissingPayload,

    #[error("frame has no string `timestamp` field")]
    MissingTimestamp,
}

impl Frame {
    /// Build a frame stamped with the current time.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: now_iso8601(),
        }
    }

    /// Parse and validate a raw text frame.
    ///
    /// A `null` payload is accepted; an absent one is not.
    pub fn parse(raw: &str) -> Result<Self, MalformedFrame> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| MalformedFrame::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, MalformedFrame> {
        let Value::Object(mut obj) = value else {
            return Err(MalformedFrame::NotAnObject);
        };

        let kind = match obj.remove("type") {
            Some(Value::String(s)) => s,
            _ => return Err(MalformedFrame::MissingType),
        };
        let payload = obj.remove("payload").ok_or(MalformedFrame::MissingPayload)?;
        let timestamp = match obj.remove("timestamp") {
            Some(Value::String(s)) => s,
            _ => return Err(MalformedFrame::MissingTimestamp),
        };

        Ok(Self {
            kind,
            payload,
            timestamp,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_ping(&self) -> bool {
        self.kind == kind::PING
    }

    pub fn is_pong(&self) -> bool {
        self.kind == kind::PONG
    }

    // ── outbound builders ──────────────────────────────────────────────

    pub fn ping() -> Self {
        Self::new(kind::PING, json!({}))
    }

    pub fn pong() -> Self {
        Self::new(kind::PONG, json!({}))
    }

    pub fn message(message: Value) -> Self {
        Self::new(kind::MESSAGE, json!({ "message": message }))
    }

    pub fn typing_start(conversation_id: &str, user_id: &str) -> Self {
        Self::new(
            kind::TYPING_START,
            json!({ "conversation_id": conversation_id, "user_id": user_id }),
        )
    }

    pub fn typing_stop(conversation_id: &str, user_id: &str) -> Self {
        Self::new(
            kind::TYPING_STOP,
            json!({ "conversation_id": conversation_id, "user_id": user_id }),
        )
    }

    pub fn presence_update(user_id: &str, status: &str) -> Self {
        Self::new(
            kind::PRESENCE_UPDATE,
            json!({ "user_id": user_id, "status": status }),
        )
    }

    pub fn message_read(conversation_id: &str, message_ids: &[String]) -> Self {
        Self::new(
            kind::MESSAGE_READ,
            json!({ "conversation_id": conversation_id, "message_ids": message_ids }),
        )
    }
}

/// Current time as an RFC 3339 / ISO-8601 string with millisecond precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_frame() {
        let raw = r#"{"type":"message","payload":{"message_id":"m1"},"timestamp":"2024-05-01T10:00:00Z"}"#;
        let frame = Frame::parse(raw).unwrap();
        assert_eq!(frame.kind, "message");
        assert_eq!(frame.payload["message_id"], "m1");
        assert_eq!(frame.timestamp, "2024-05-01T10:00:00Z");
    }

    #[test]
    fn parse_accepts_null_payload() {
        let raw = r#"{"type":"ping","payload":null,"timestamp":"2024-05-01T10:00:00Z"}"#;
        let frame = Frame::parse(raw).unwrap();
        assert!(frame.payload.is_null());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            Frame::parse("{not json"),
            Err(MalformedFrame::InvalidJson(_))
        ));
        assert_eq!(Frame::parse("[1,2]"), Err(MalformedFrame::NotAnObject));
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert_eq!(
            Frame::parse(r#"{"payload":{},"timestamp":"t"}"#),
            Err(MalformedFrame::MissingType)
        );
        assert_eq!(
            Frame::parse(r#"{"type":"message","timestamp":"t"}"#),
            Err(MalformedFrame::MissingPayload)
        );
        assert_eq!(
            Frame::parse(r#"{"type":"message","payload":{}}"#),
            Err(MalformedFrame::MissingTimestamp)
        );
    }

    #[test]
    fn parse_rejects_wrong_field_types() {
        assert_eq!(
            Frame::parse(r#"{"type":7,"payload":{},"timestamp":"t"}"#),
            Err(MalformedFrame::MissingType)
        );
        assert_eq!(
            Frame::parse(r#"{"type":"message","payload":{},"timestamp":1714557600}"#),
            Err(MalformedFrame::MissingTimestamp)
        );
    }

    #[test]
    fn outbound_envelope_shape() {
        let frame = Frame::typing_start("c1", "u1");
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "typing_start");
        assert_eq!(value["payload"]["conversation_id"], "c1");
        assert_eq!(value["payload"]["user_id"], "u1");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn outbound_frames_parse_back() {
        let frame = Frame::message_read("c1", &["m1".to_string(), "m2".to_string()]);
        let back = Frame::parse(&frame.to_json().unwrap()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn timestamps_are_rfc3339() {
        let ts = now_iso8601();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn ping_pong_helpers() {
        assert!(Frame::ping().is_ping());
        assert!(Frame::pong().is_pong());
        assert!(!Frame::message(json!({})).is_ping());
    }
}
