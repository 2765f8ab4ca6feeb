//! JSON wire protocol for the shared editing session.
//!
//! Wire format (one WebSocket text frame per envelope):
//! ```text
//! {
//!   "type":        "edit" | "compile" | ... | <any relay tag>,
//!   "username":    sender username (server-stamped on inbound frames),
//!   "displayName": sender display name (optional),
//!   "timestamp":   unix seconds (server-stamped),
//!   "data":        object whose shape depends on "type"
//! }
//! ```
//!
//! `data` is decoded with a per-type schema into [`Payload`]. Tags the
//! server does not interpret (cursor, chat, ...) survive as
//! [`Payload::Relay`] and are forwarded untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::auth::Identity;

/// Sender name used for envelopes the server originates.
pub const SYSTEM_SENDER: &str = "system";

/// Current server time as unix seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Message types the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Full state pushed to a freshly registered connection
    Init,
    /// Presence roster after a join
    UserJoin,
    /// Presence roster after a leave
    UserLeave,
    /// Administrator removed a user
    UserKicked,
    /// Whole-document replacement
    Edit,
    /// Shared stdin changed
    InputChange,
    /// Shared reference answer changed
    AnswerChange,
    /// Compile-and-run request
    Compile,
    /// Compile-and-run outcome
    CompileResult,
    /// Administrator kick request
    KickUser,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::Init,
        MessageType::UserJoin,
        MessageType::UserLeave,
        MessageType::UserKicked,
        MessageType::Edit,
        MessageType::InputChange,
        MessageType::AnswerChange,
        MessageType::Compile,
        MessageType::CompileResult,
        MessageType::KickUser,
    ];

    /// Wire tag for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::UserJoin => "user_join",
            Self::UserLeave => "user_leave",
            Self::UserKicked => "user_kicked",
            Self::Edit => "edit",
            Self::InputChange => "input_change",
            Self::AnswerChange => "answer_change",
            Self::Compile => "compile",
            Self::CompileResult => "compile_result",
            Self::KickUser => "kick_user",
        }
    }

    /// Look up a wire tag. Unknown tags return `None` and are relayed.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitData {
    pub code: String,
    pub input_data: String,
    pub output_data: String,
    pub compile_log: String,
    pub answer: String,
}

/// Roster carried by `user_join` / `user_leave`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceData {
    pub username: String,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickedData {
    pub username: String,
    pub kicked_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditData {
    pub code: String,
    /// Document version produced by this edit; filled in by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputChangeData {
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerChangeData {
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileRequestData {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResultData {
    pub success: bool,
    pub message: String,
    pub output: String,
    pub compiled_by: String,
    pub compile_log: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickUserData {
    pub username: String,
}

/// Typed `data` of an envelope, one variant per message type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Init(InitData),
    UserJoin(PresenceData),
    UserLeave(PresenceData),
    UserKicked(KickedData),
    Edit(EditData),
    InputChange(InputChangeData),
    AnswerChange(AnswerChangeData),
    Compile(CompileRequestData),
    CompileResult(CompileResultData),
    KickUser(KickUserData),
    /// Any tag the server does not interpret (cursor, chat, ...).
    Relay { kind: String, data: Value },
}

impl Payload {
    /// Wire tag of this payload.
    pub fn kind(&self) -> &str {
        match self {
            Self::Relay { kind, .. } => kind,
            other => other.message_type().map_or("", |t| t.as_str()),
        }
    }

    /// Known message type, `None` for relayed payloads.
    pub fn message_type(&self) -> Option<MessageType> {
        Some(match self {
            Self::Init(_) => MessageType::Init,
            Self::UserJoin(_) => MessageType::UserJoin,
            Self::UserLeave(_) => MessageType::UserLeave,
            Self::UserKicked(_) => MessageType::UserKicked,
            Self::Edit(_) => MessageType::Edit,
            Self::InputChange(_) => MessageType::InputChange,
            Self::AnswerChange(_) => MessageType::AnswerChange,
            Self::Compile(_) => MessageType::Compile,
            Self::CompileResult(_) => MessageType::CompileResult,
            Self::KickUser(_) => MessageType::KickUser,
            Self::Relay { .. } => return None,
        })
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Init(d) => serde_json::to_value(d),
            Self::UserJoin(d) | Self::UserLeave(d) => serde_json::to_value(d),
            Self::UserKicked(d) => serde_json::to_value(d),
            Self::Edit(d) => serde_json::to_value(d),
            Self::InputChange(d) => serde_json::to_value(d),
            Self::AnswerChange(d) => serde_json::to_value(d),
            Self::Compile(d) => serde_json::to_value(d),
            Self::CompileResult(d) => serde_json::to_value(d),
            Self::KickUser(d) => serde_json::to_value(d),
            Self::Relay { data, .. } => Ok(data.clone()),
        }
    }

    fn from_value(kind: String, data: Value) -> Result<Self, ProtocolError> {
        let Some(message_type) = MessageType::from_tag(&kind) else {
            return Ok(Self::Relay { kind, data });
        };

        fn schema<T: serde::de::DeserializeOwned>(
            message_type: MessageType,
            data: Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(data).map_err(|e| ProtocolError::Schema {
                kind: message_type.as_str(),
                reason: e.to_string(),
            })
        }

        Ok(match message_type {
            MessageType::Init => Self::Init(schema(message_type, data)?),
            MessageType::UserJoin => Self::UserJoin(schema(message_type, data)?),
            MessageType::UserLeave => Self::UserLeave(schema(message_type, data)?),
            MessageType::UserKicked => Self::UserKicked(schema(message_type, data)?),
            MessageType::Edit => Self::Edit(schema(message_type, data)?),
            MessageType::InputChange => Self::InputChange(schema(message_type, data)?),
            MessageType::AnswerChange => Self::AnswerChange(schema(message_type, data)?),
            MessageType::Compile => Self::Compile(schema(message_type, data)?),
            MessageType::CompileResult => Self::CompileResult(schema(message_type, data)?),
            MessageType::KickUser => Self::KickUser(schema(message_type, data)?),
        })
    }
}

/// Outbound wire shape (borrows from the envelope).
#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    username: &'a str,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
    timestamp: i64,
    data: Value,
}

/// Inbound wire shape. Sender and timestamp are optional because the
/// server overwrites them anyway.
#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    username: String,
    #[serde(default, rename = "displayName")]
    display_name: Option<String>,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    data: Value,
}

/// One structured message unit exchanged over the socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub username: String,
    pub display_name: Option<String>,
    pub timestamp: i64,
    pub payload: Payload,
}

impl Envelope {
    /// Envelope originated by the server itself.
    pub fn system(payload: Payload) -> Self {
        Self {
            username: SYSTEM_SENDER.to_string(),
            display_name: None,
            timestamp: now_timestamp(),
            payload,
        }
    }

    /// Envelope attributed to an authenticated identity.
    pub fn from_identity(identity: &Identity, payload: Payload) -> Self {
        Self {
            username: identity.username.clone(),
            display_name: Some(identity.display_name.clone()),
            timestamp: now_timestamp(),
            payload,
        }
    }

    /// Overwrite sender and timestamp with server-side values.
    pub fn stamp(mut self, identity: &Identity) -> Self {
        self.username = identity.username.clone();
        self.display_name = Some(identity.display_name.clone());
        self.timestamp = now_timestamp();
        self
    }

    /// Initial state for a newly registered connection.
    pub fn init(data: InitData) -> Self {
        Self::system(Payload::Init(data))
    }

    /// Presence roster after `username` joined.
    pub fn user_join(username: &str, users: Vec<String>) -> Self {
        Self {
            username: username.to_string(),
            display_name: None,
            timestamp: now_timestamp(),
            payload: Payload::UserJoin(PresenceData {
                username: username.to_string(),
                users,
            }),
        }
    }

    /// Presence roster after `username` left.
    pub fn user_leave(username: &str, users: Vec<String>) -> Self {
        Self {
            username: username.to_string(),
            display_name: None,
            timestamp: now_timestamp(),
            payload: Payload::UserLeave(PresenceData {
                username: username.to_string(),
                users,
            }),
        }
    }

    /// Notification that `username` was removed by `kicked_by`.
    pub fn user_kicked(username: &str, kicked_by: &str) -> Self {
        Self::system(Payload::UserKicked(KickedData {
            username: username.to_string(),
            kicked_by: kicked_by.to_string(),
        }))
    }

    /// Wire tag of the payload.
    pub fn kind(&self) -> &str {
        self.payload.kind()
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = self
            .payload
            .to_value()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let wire = WireOut {
            kind: self.payload.kind(),
            username: &self.username,
            display_name: self.display_name.as_deref(),
            timestamp: self.timestamp,
            data,
        };
        serde_json::to_string(&wire).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame, checking `data` against the schema of its type.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireIn =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let payload = Payload::from_value(wire.kind, wire.data)?;
        Ok(Self {
            username: wire.username,
            display_name: wire.display_name,
            timestamp: wire.timestamp,
            payload,
        })
    }
}

/// Protocol errors. A bad inbound frame is logged and skipped; it never
/// tears down the connection.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("invalid `{kind}` payload: {reason}")]
    Schema { kind: &'static str, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}
