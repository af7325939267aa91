use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound WebSocket frames from client to server
///
/// Unknown `type` tags fail deserialization and are answered with an
/// `error` frame by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "auth")]
    Auth { token: String },

    #[serde(rename = "join", rename_all = "camelCase")]
    Join { conversation_id: Uuid },

    #[serde(rename = "leave")]
    Leave,

    #[serde(rename = "typing")]
    Typing,

    #[serde(rename = "stop_typing")]
    StopTyping,

    #[serde(rename = "mark_read", rename_all = "camelCase")]
    MarkRead { message_ids: Vec<Uuid> },
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Join { .. } => "join",
            Self::Leave => "leave",
            Self::Typing => "typing",
            Self::StopTyping => "stop_typing",
            Self::MarkRead { .. } => "mark_read",
        }
    }
}

/// Outbound WebSocket frames from server to client
///
/// The same type travels inside broker envelopes, so every variant
/// round-trips through serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "authenticated", rename_all = "camelCase")]
    Authenticated { user_id: Uuid },

    #[serde(rename = "error")]
    Error { error: String },

    #[serde(rename = "joined", rename_all = "camelCase")]
    Joined { conversation_id: Uuid },

    #[serde(rename = "left")]
    Left,

    /// Pushed by the CRUD layer after a message is stored; `message` is opaque here.
    #[serde(rename = "new_message", rename_all = "camelCase")]
    NewMessage {
        conversation_id: Uuid,
        message: serde_json::Value,
    },

    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing { user_id: Uuid, username: String },

    #[serde(rename = "stop_typing", rename_all = "camelCase")]
    StopTyping { user_id: Uuid },

    #[serde(rename = "messages_read", rename_all = "camelCase")]
    MessagesRead {
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
        read_by: Uuid,
    },

    #[serde(rename = "user_online", rename_all = "camelCase")]
    UserOnline { user_id: Uuid, username: String },

    #[serde(rename = "user_offline", rename_all = "camelCase")]
    UserOffline {
        user_id: Uuid,
        username: String,
        last_seen_at: DateTime<Utc>,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::Error { .. } => "error",
            Self::Joined { .. } => "joined",
            Self::Left => "left",
            Self::NewMessage { .. } => "new_message",
            Self::Typing { .. } => "typing",
            Self::StopTyping { .. } => "stop_typing",
            Self::MessagesRead { .. } => "messages_read",
            Self::UserOnline { .. } => "user_online",
            Self::UserOffline { .. } => "user_offline",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_frames_with_camel_case_fields() {
        let conversation_id = Uuid::new_v4();
        let join = ClientFrame::parse(&format!(
            r#"{{"type":"join","conversationId":"{conversation_id}"}}"#
        ))
        .unwrap();
        assert_eq!(join, ClientFrame::Join { conversation_id });

        let leave = ClientFrame::parse(r#"{"type":"leave"}"#).unwrap();
        assert_eq!(leave, ClientFrame::Leave);

        let mark = ClientFrame::parse(r#"{"type":"mark_read","messageIds":[]}"#).unwrap();
        assert_eq!(mark, ClientFrame::MarkRead { message_ids: vec![] });
    }

    #[test]
    fn rejects_unknown_frame_types() {
        assert!(ClientFrame::parse(r#"{"type":"subscribe_all"}"#).is_err());
        assert!(ClientFrame::parse(r#"{"token":"abc"}"#).is_err());
        assert!(ClientFrame::parse("not json").is_err());
    }

    #[test]
    fn server_frames_use_wire_names() {
        let user_id = Uuid::new_v4();
        let frame = ServerFrame::UserOffline {
            user_id,
            username: "alice".into(),
            last_seen_at: Utc::now(),
        };
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "user_offline");
        assert_eq!(value["userId"], user_id.to_string());
        assert!(value["lastSeenAt"].is_string());
        assert_eq!(frame.kind(), "user_offline");

        let left: serde_json::Value =
            serde_json::from_str(&ServerFrame::Left.to_json().unwrap()).unwrap();
        assert_eq!(left, serde_json::json!({"type": "left"}));
    }
}
