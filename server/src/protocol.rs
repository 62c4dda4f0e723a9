//! Wire protocol: outbound frames and the inbound action dispatcher.
//!
//! Outbound frames are JSON objects tagged by a `type` field; inbound
//! frames are JSON objects tagged by an `action` field. Unknown inbound
//! actions are silently ignored (forward compatibility), as are frames
//! missing a required field; neither is a protocol error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::types::ChatMessage;

/// Application close code sent when a session expires or is revoked
/// mid-connection.
pub const CLOSE_SESSION_EXPIRED: u16 = 4001;

/// WebSocket policy-violation close code, used when authentication fails
/// before the connection is accepted.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Username attached to server-originated messages.
pub const SYSTEM_USERNAME: &str = "system";

/// A frame sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Result of a keepalive re-validation; `false` precedes a forced close.
    #[serde(rename = "AUTH_STATUS")]
    AuthStatus {
        /// Whether the session is still honored.
        #[serde(rename = "isAuthenticated")]
        is_authenticated: bool,
    },

    /// The trailing page of the message log, sent once on connect.
    #[serde(rename = "initial_load")]
    InitialLoad {
        /// Messages in chronological order.
        messages: Vec<ChatMessage>,
    },

    /// An older page of the message log, in response to `load_more_messages`.
    #[serde(rename = "more_messages")]
    MoreMessages {
        /// Messages in chronological order.
        messages: Vec<ChatMessage>,
    },

    /// Echo of the sender's own persisted message.
    #[serde(rename = "new_message")]
    NewMessage {
        username: String,
        content: String,
        created_at: DateTime<Utc>,
    },

    /// A peer's chat message.
    #[serde(rename = "broadcast_message")]
    BroadcastMessage {
        username: String,
        content: String,
        created_at: DateTime<Utc>,
    },

    /// A server-originated notice (joins, leaves, failures).
    #[serde(rename = "system_message")]
    SystemMessage {
        username: String,
        content: String,
        created_at: DateTime<Utc>,
    },

    /// The current presence set, rebroadcast on every membership change.
    #[serde(rename = "users_list")]
    UsersList {
        /// Usernames of all live connections.
        users: Vec<String>,
    },

    /// A peer started typing.
    #[serde(rename = "typing")]
    Typing { username: String },

    /// A peer stopped typing.
    #[serde(rename = "stop_typing")]
    StopTyping { username: String },
}

impl ServerFrame {
    /// Builds a `system_message` frame stamped with the current time.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::SystemMessage {
            username: SYSTEM_USERNAME.to_string(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Builds the sender-side echo for a persisted message.
    #[must_use]
    pub fn new_message(message: &ChatMessage) -> Self {
        Self::NewMessage {
            username: message.username.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
        }
    }

    /// Builds the peer-side frame for a persisted message.
    #[must_use]
    pub fn broadcast_message(message: &ChatMessage) -> Self {
        Self::BroadcastMessage {
            username: message.username.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
        }
    }
}

/// An item sent through a connection's outbound channel.
///
/// The writer task serializes [`Outbound::Frame`] items as JSON text and
/// translates [`Outbound::Close`] into a WebSocket close frame before
/// terminating.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A protocol frame.
    Frame(ServerFrame),

    /// Close the connection with the given code and reason.
    Close {
        code: u16,
        reason: String,
    },
}

/// A client request decoded from an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Persist and fan out a chat message.
    SendMessage { content: String },

    /// Notify peers that the sender is typing.
    Typing,

    /// Notify peers that the sender stopped typing.
    StopTyping,

    /// Request the next older page of the message log.
    LoadMoreMessages,
}

impl ClientAction {
    /// Decodes an inbound frame, returning `None` for anything that should
    /// be dropped: malformed JSON, a missing or unknown `action`, or a
    /// `send_message` without string content. Dropping is a forward
    /// compatibility policy, not an error.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                trace!(error = %err, "Dropping unparseable inbound frame");
                return None;
            }
        };

        let action = value.get("action").and_then(|a| a.as_str())?;

        match action {
            "send_message" => {
                let content = value.get("content").and_then(|c| c.as_str())?;
                Some(Self::SendMessage {
                    content: content.to_string(),
                })
            }
            "typing" => Some(Self::Typing),
            "stop_typing" => Some(Self::StopTyping),
            "load_more_messages" => Some(Self::LoadMoreMessages),
            other => {
                trace!(action = %other, "Ignoring unknown action");
                None
            }
        }
    }
}
