//! Shared data types for the Parley server.
//!
//! This module defines the core data structures flowing through the system:
//! authenticated identities, persisted chat messages, and the server-side
//! session record that backs token revocation. All of them are immutable
//! once created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Format used for the human-readable expiry inside a [`SessionRecord`].
pub const EXPIRY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// An authenticated user identity.
///
/// Resolved once from the user directory when a connection is established
/// and never refreshed mid-connection. A rename only becomes visible on the
/// next connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// The unique identifier for the user.
    pub user_id: Uuid,

    /// The display name broadcast to other connected peers.
    pub username: String,
}

impl Identity {
    /// Creates a new identity.
    #[must_use]
    pub fn new(user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// A chat message persisted in the message log.
///
/// The `id` is the log sequence number; total order across all observers
/// equals append order. The log retains only a bounded window of the most
/// recent messages, so old ids disappear over time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Log sequence number, assigned at append time.
    pub id: u64,

    /// The author's user id.
    pub user_id: Uuid,

    /// The author's username at the time of sending.
    pub username: String,

    /// The message body.
    pub content: String,

    /// When the message was appended to the log.
    pub created_at: DateTime<Utc>,
}

/// Server-side proof that a session token is still honored.
///
/// Stored in the session store under a key derived from the subject
/// identity, with a store-level TTL equal to the token lifetime. The store
/// is the authority for revocation: a missing or expired record invalidates
/// the token even if its embedded expiry has not elapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The issued token, kept so a superseded token can be rejected.
    pub token: String,

    /// The subject user id.
    pub user_id: Uuid,

    /// The subject username at issue time.
    pub username: String,

    /// Human-readable expiry, formatted with [`EXPIRY_FORMAT`].
    pub expires_at: String,

    /// Machine-comparable expiry as a unix timestamp (seconds).
    pub expires_at_unix: i64,
}

impl SessionRecord {
    /// Creates a record for a freshly issued token.
    #[must_use]
    pub fn new(token: impl Into<String>, identity: &Identity, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            user_id: identity.user_id,
            username: identity.username.clone(),
            expires_at: expires_at.format(EXPIRY_FORMAT).to_string(),
            expires_at_unix: expires_at.timestamp(),
        }
    }

    /// Returns `true` if the stored expiry has elapsed relative to `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.expires_at_unix
    }

    /// The identity this record vouches for.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(self.user_id, self.username.clone())
    }
}

/// The session-store key for a subject identity.
#[must_use]
pub fn session_key(user_id: Uuid) -> String {
    format!("chat_user:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_identity() -> Identity {
        Identity::new(Uuid::new_v4(), "alice")
    }

    #[test]
    fn identity_new_sets_fields() {
        let id = Uuid::new_v4();
        let identity = Identity::new(id, "bob");
        assert_eq!(identity.user_id, id);
        assert_eq!(identity.username, "bob");
    }

    #[test]
    fn chat_message_round_trips_through_json() {
        let message = ChatMessage {
            id: 7,
            user_id: Uuid::new_v4(),
            username: "alice".to_string(),
            content: "hello".to_string(),
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&message).unwrap();
        let decoded: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn session_record_formats_expiry() {
        let identity = test_identity();
        let expires_at = Utc::now() + Duration::minutes(30);
        let record = SessionRecord::new("tok", &identity, expires_at);

        assert_eq!(
            record.expires_at,
            expires_at.format(EXPIRY_FORMAT).to_string()
        );
        assert_eq!(record.expires_at_unix, expires_at.timestamp());
        assert_eq!(record.user_id, identity.user_id);
        assert_eq!(record.username, "alice");
    }

    #[test]
    fn session_record_expiry_check() {
        let identity = test_identity();
        let expires_at = Utc::now() + Duration::minutes(5);
        let record = SessionRecord::new("tok", &identity, expires_at);

        assert!(!record.is_expired_at(Utc::now()));
        assert!(record.is_expired_at(expires_at + Duration::seconds(1)));
    }

    #[test]
    fn session_record_identity_round_trip() {
        let identity = test_identity();
        let record = SessionRecord::new("tok", &identity, Utc::now());
        assert_eq!(record.identity(), identity);
    }

    #[test]
    fn session_key_is_stable_per_user() {
        let id = Uuid::new_v4();
        assert_eq!(session_key(id), format!("chat_user:{id}"));
        assert_eq!(session_key(id), session_key(id));
    }

    #[test]
    fn session_record_round_trips_through_json() {
        let record = SessionRecord::new("tok", &test_identity(), Utc::now());
        let json = serde_json::to_string(&record).unwrap();
        let decoded: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }
}
