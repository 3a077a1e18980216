//! Canonical deduplication keys per event kind.
//!
//! The kind is always folded into the key: the cache is shared across kinds.

use serde_json::Value;

use crate::frame::kind;

/// Derive the deduplication key for an inbound event.
///
/// Pure and total: unknown kinds and missing fields never fail, they only
/// produce a more conservative key.
pub fn derive_key(kind: &str, payload: &Value, timestamp: &str) -> String {
    match kind {
        kind::MESSAGE => match id_field(payload, "message_id") {
            Some(id) => format!("message:{id}"),
            None => format!(
                "message:{}:{}:{timestamp}",
                field(payload, "conversation_id"),
                field(payload, "sender_id"),
            ),
        },
        kind::FRIEND_REQUEST => {
            format!("friend_req:{}:{timestamp}", field(payload, "requester_id"))
        }
        kind::CALL_REQUEST => format!("call_req:{}", field(payload, "call_id")),
        kind::CALL_RESPONSE => format!(
            "call_resp:{}:{}",
            field(payload, "call_id"),
            field(payload, "response")
        ),
        kind::CALL_END => format!("call_end:{}", field(payload, "call_id")),
        kind::NOTIFICATION => match id_field(payload, "notification_id") {
            Some(id) => format!("notif:{id}"),
            None => format!("notif:{kind}:{timestamp}"),
        },
        kind::USER_ONLINE | kind::USER_OFFLINE => {
            format!("presence:{}:{kind}:{timestamp}", field(payload, "user_id"))
        }
        // State, not events: no timestamp, so repeats collapse.
        kind::TYPING | kind::STOP_TYPING | kind::TYPING_START | kind::TYPING_STOP => format!(
            "typing:{}:{}:{kind}",
            field(payload, "conversation_id"),
            field(payload, "user_id")
        ),
        kind::MESSAGE_READ => format!(
            "read:{}:{}:{}",
            field(payload, "conversation_id"),
            field(payload, "user_id"),
            field(payload, "last_read_at")
        ),
        _ => format!("{kind}:{timestamp}:{payload}"),
    }
}

/// Whether the payload carries a server-assigned identity for its kind.
///
/// Frames without one can only be recognized by content, which is what the
/// cache's content path is for.
pub fn has_stable_id(kind: &str, payload: &Value) -> bool {
    match kind {
        kind::MESSAGE => id_field(payload, "message_id").is_some(),
        kind::NOTIFICATION => id_field(payload, "notification_id").is_some(),
        kind::CALL_REQUEST | kind::CALL_RESPONSE | kind::CALL_END => {
            id_field(payload, "call_id").is_some()
        }
        _ => false,
    }
}

/// Render a payload field for key composition. Missing or null renders empty.
pub(crate) fn field(payload: &Value, name: &str) -> String {
    match payload.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn id_field(payload: &Value, name: &str) -> Option<String> {
    Some(field(payload, name)).filter(|s| !s.is_empty())
}
