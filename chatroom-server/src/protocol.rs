//! JSON frames exchanged over the WebSocket.
//!
//! Inbound frames are requests tagged by `op`, optionally carrying a `seq`
//! the reply echoes back. Outbound frames are either replies or events
//! tagged by `event`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::directory::{Account, ProfileUpdate};
use crate::error::ChatError;
use crate::log::{ChatMessage, ReplySnapshot};

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub request: Request,
}

impl Envelope {
    pub fn new(request: Request) -> Self {
        Self { seq: None, request }
    }

    pub fn with_seq(seq: u64, request: Request) -> Self {
        Self {
            seq: Some(seq),
            request,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Signup {
        username: String,
        password: String,
    },
    Login {
        username: String,
        password: String,
    },
    TokenLogin {
        token: String,
    },
    Logout,
    UpdateProfile(ProfileUpdate),
    SendMessage {
        message: String,
        #[serde(default)]
        reply_to: Option<ReplySnapshot>,
    },
    EditMessage {
        id: String,
        message: String,
    },
    DeleteMessage {
        id: String,
    },
    Typing,
    StopTyping,
    Heartbeat,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Signup { .. } => "signup",
            Request::Login { .. } => "login",
            Request::TokenLogin { .. } => "token_login",
            Request::Logout => "logout",
            Request::UpdateProfile(_) => "update_profile",
            Request::SendMessage { .. } => "send_message",
            Request::EditMessage { .. } => "edit_message",
            Request::DeleteMessage { .. } => "delete_message",
            Request::Typing => "typing",
            Request::StopTyping => "stop_typing",
            Request::Heartbeat => "heartbeat",
        }
    }
}

/// Answer to a single request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub reply: Option<u64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Reply {
    pub fn ok(seq: Option<u64>) -> Self {
        Self {
            reply: seq,
            success: true,
            error: None,
            payload: None,
        }
    }

    pub fn ok_with<T: Serialize>(seq: Option<u64>, payload: &T) -> Self {
        Self {
            payload: serde_json::to_value(payload).ok(),
            ..Self::ok(seq)
        }
    }

    pub fn err(seq: Option<u64>, error: &ChatError) -> Self {
        let payload = error
            .diagnostic()
            .map(|d| serde_json::json!({ "diagnostic": d }));
        Self {
            reply: seq,
            success: false,
            error: Some(error.to_string()),
            payload,
        }
    }
}

/// Payload of a successful signup or login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginPayload {
    pub account: Account,
    pub history: Vec<ChatMessage>,
    pub online_users: Vec<String>,
    pub user_statuses: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Join {
        username: String,
        user_count: usize,
        users: Vec<String>,
    },
    Leave {
        username: String,
        user_count: usize,
        users: Vec<String>,
    },
    StatusUpdate {
        username: String,
        status_text: String,
    },
    Message {
        message: ChatMessage,
    },
    MessageEdited {
        message: ChatMessage,
    },
    MessageDeleted {
        id: String,
    },
    AllDeleted,
    TypingStart {
        username: String,
    },
    TypingStop {
        username: String,
    },
    PrivateMessage {
        from: String,
        message: String,
        color: String,
    },
    PrivateMessageSent {
        to: String,
        message: String,
    },
    Banned {
        message: String,
    },
    SystemNotice {
        message: String,
    },
    ProfileUpdated {
        account: Account,
    },
    HeartbeatAck,
}

impl Event {
    pub fn notice(message: impl Into<String>) -> Self {
        Event::SystemNotice {
            message: message.into(),
        }
    }
}

/// What the server pushes into a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Reply(Reply),
    Event(Event),
    /// Flush and close the transport.
    Close,
}

impl Outbound {
    /// Serialized text frame, or `None` for [`Outbound::Close`].
    pub fn to_frame(&self) -> Option<String> {
        let json = match self {
            Outbound::Reply(r) => serde_json::to_string(r),
            Outbound::Event(e) => serde_json::to_string(e),
            Outbound::Close => return None,
        };
        match json {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::error!("Failed to serialize outbound frame: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn parses_requests_with_and_without_seq() {
        let env: Envelope =
            serde_json::from_str(r#"{"op":"login","seq":4,"username":"alice","password":"pw12"}"#)
                .unwrap();
        assert_eq!(env.seq, Some(4));
        assert!(matches!(env.request, Request::Login { ref username, .. } if username == "alice"));

        let env: Envelope = serde_json::from_str(r#"{"op":"heartbeat"}"#).unwrap();
        assert_eq!(env.seq, None);
        assert!(matches!(env.request, Request::Heartbeat));

        let env: Envelope =
            serde_json::from_str(r##"{"op":"update_profile","color":"#fff"}"##).unwrap();
        match env.request {
            Request::UpdateProfile(update) => {
                assert_eq!(update.color.as_deref(), Some("#fff"));
                assert!(update.theme.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_op() {
        assert!(serde_json::from_str::<Envelope>(r#"{"op":"nuke"}"#).is_err());
    }

    #[test]
    fn events_are_tagged() {
        let json = serde_json::to_value(Event::MessageDeleted { id: "x".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"event": "message_deleted", "id": "x"}));

        let json = serde_json::to_value(Event::HeartbeatAck).unwrap();
        assert_eq!(json, serde_json::json!({"event": "heartbeat_ack"}));
    }

    #[test]
    fn error_reply_carries_diagnostic() {
        let err: ChatError = StoreError::not_configured().into();
        let json = serde_json::to_value(Reply::err(Some(2), &err)).unwrap();
        assert_eq!(json["reply"], 2);
        assert_eq!(json["success"], false);
        assert_eq!(json["payload"]["diagnostic"]["kind"], "NO_DATABASE");

        let json = serde_json::to_value(Reply::err(None, &ChatError::validation("bad"))).unwrap();
        assert_eq!(json["error"], "bad");
        assert!(json.get("payload").is_none());
    }
}
