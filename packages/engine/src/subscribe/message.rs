use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::event::EventOp;

/// Payload of a `change` message. `before`/`after` are omitted when the
/// subscription asked for no state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub op: EventOp,
    pub ns: String,
    pub entity_id: String,
    pub full_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Subscribed,
    Unsubscribed,
    Error,
}

/// Messages the manager writes to connected subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: String },
    #[serde(rename_all = "camelCase")]
    Subscribed { subscription_id: String, ns: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { subscription_id: String },
    Change {
        data: Box<ChangePayload>,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Pong { ts: i64 },
    Ack {
        id: String,
        status: AckStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ServerMessage {
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::Change { .. } => "change",
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
            Self::Ack { .. } => "ack",
        }
    }
}

/// Messages subscribers send to the manager; transports decode these off
/// the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        ns: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<JsonValue>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ops: Vec<String>,
        #[serde(default)]
        include_state: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_after: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { subscription_id: String },
    Ping,
    #[serde(rename_all = "camelCase")]
    Ack { id: String },
}

/// `event: <type>\ndata: <json>\n\n`
pub fn sse_frame(message: &ServerMessage) -> Result<String, crate::ParqueError> {
    let json = serde_json::to_string(message)?;
    Ok(format!("event: {}\ndata: {}\n\n", message.message_type(), json))
}

/// WebSocket text frame: the JSON-serialized message.
pub fn ws_frame(message: &ServerMessage) -> Result<String, crate::ParqueError> {
    Ok(serde_json::to_string(message)?)
}

#[cfg(test)]
mod tests {
    use super::{sse_frame, ws_frame, ServerMessage};

    #[test]
    fn messages_tag_with_lowercase_type() {
        let message = ServerMessage::Connected {
            connection_id: "c-1".to_string(),
        };
        let json = ws_frame(&message).unwrap();
        assert!(json.contains("\"type\":\"connected\""));
        assert!(json.contains("\"connectionId\":\"c-1\""));
    }

    #[test]
    fn sse_frames_carry_event_name_and_data() {
        let message = ServerMessage::Pong { ts: 1709290000000 };
        let frame = sse_frame(&message).unwrap();
        assert!(frame.starts_with("event: pong\ndata: "));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn client_messages_round_trip() {
        let raw = r#"{"type":"subscribe","ns":"posts","filter":{"status":"published"},"includeState":true}"#;
        let message: super::ClientMessage = serde_json::from_str(raw).unwrap();
        match message {
            super::ClientMessage::Subscribe { ns, include_state, .. } => {
                assert_eq!(ns, "posts");
                assert!(include_state);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
