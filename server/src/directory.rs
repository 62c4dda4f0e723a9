//! Identity collaborators: the user directory and connection history.
//!
//! The user directory resolves a user id into an [`Identity`] snapshot at
//! connect time; the surrounding registration/CRUD machinery lives outside
//! this crate. Connection history is a best-effort audit trail of connect
//! and disconnect times; a missing backend entry is never fatal to the
//! connection lifecycle.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

use crate::types::Identity;

/// Errors surfaced by the user directory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// No user exists with the given id.
    #[error("user not found: {0}")]
    NotFound(Uuid),

    /// The directory backend is unreachable.
    #[error("user directory unavailable: {0}")]
    Unavailable(String),
}

/// Lookup of user records by id.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolves `user_id` into an identity snapshot.
    ///
    /// # Errors
    ///
    /// - [`DirectoryError::NotFound`] if no such user exists
    /// - [`DirectoryError::Unavailable`] if the backend is unreachable
    async fn get_by_id(&self, user_id: Uuid) -> Result<Identity, DirectoryError>;
}

/// A single connect/disconnect audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// The user this entry belongs to.
    pub user_id: Uuid,

    /// When the connection was established.
    pub connected_at: DateTime<Utc>,

    /// When the connection ended; `None` while still open.
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// Best-effort recorder of connection lifecycles.
///
/// Callers log failures and move on; history never gates a connect or
/// disconnect.
#[async_trait]
pub trait ConnectionHistory: Send + Sync {
    /// Opens a new history entry for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Unavailable`] if the backend is unreachable.
    async fn record_connect(&self, user_id: Uuid) -> Result<(), DirectoryError>;

    /// Stamps the disconnect time on the most recent open entry for
    /// `user_id`. Absence of an open entry is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Unavailable`] if the backend is unreachable.
    async fn record_disconnect(&self, user_id: Uuid) -> Result<(), DirectoryError>;
}

/// In-memory user directory, seeded at startup.
#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: RwLock<HashMap<Uuid, Identity>>,
}

impl MemoryUserDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a user record.
    pub fn insert(&self, identity: Identity) {
        self.users.write().unwrap().insert(identity.user_id, identity);
    }

    /// Number of known users.
    pub fn len(&self) -> usize {
        self.users.read().unwrap().len()
    }

    /// Returns `true` if no users are registered.
    pub fn is_empty(&self) -> bool {
        self.users.read().unwrap().is_empty()
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn get_by_id(&self, user_id: Uuid) -> Result<Identity, DirectoryError> {
        self.users
            .read()
            .unwrap()
            .get(&user_id)
            .cloned()
            .ok_or(DirectoryError::NotFound(user_id))
    }
}

/// In-memory connection history.
#[derive(Debug, Default)]
pub struct MemoryConnectionHistory {
    entries: RwLock<Vec<HistoryEntry>>,
}

impl MemoryConnectionHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries for a user, oldest first.
    pub fn entries_for(&self, user_id: Uuid) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ConnectionHistory for MemoryConnectionHistory {
    async fn record_connect(&self, user_id: Uuid) -> Result<(), DirectoryError> {
        let mut entries = self.entries.write().unwrap();
        entries.push(HistoryEntry {
            user_id,
            connected_at: Utc::now(),
            disconnected_at: None,
        });
        trace!(user_id = %user_id, "Recorded connection");
        Ok(())
    }

    async fn record_disconnect(&self, user_id: Uuid) -> Result<(), DirectoryError> {
        let mut entries = self.entries.write().unwrap();

        // Most recent open entry for this user, if any.
        if let Some(entry) = entries
            .iter_mut()
            .rev()
            .find(|e| e.user_id == user_id && e.disconnected_at.is_none())
        {
            entry.disconnected_at = Some(Utc::now());
            trace!(user_id = %user_id, "Recorded disconnection");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_resolves_known_user() {
        let directory = MemoryUserDirectory::new();
        let identity = Identity::new(Uuid::new_v4(), "alice");
        directory.insert(identity.clone());

        let resolved = directory.get_by_id(identity.user_id).await.unwrap();
        assert_eq!(resolved, identity);
    }

    #[tokio::test]
    async fn directory_unknown_user_is_not_found() {
        let directory = MemoryUserDirectory::new();
        let missing = Uuid::new_v4();

        let result = directory.get_by_id(missing).await;
        assert_eq!(result, Err(DirectoryError::NotFound(missing)));
    }

    #[tokio::test]
    async fn directory_insert_replaces_existing() {
        let directory = MemoryUserDirectory::new();
        let id = Uuid::new_v4();
        directory.insert(Identity::new(id, "old-name"));
        directory.insert(Identity::new(id, "new-name"));

        let resolved = directory.get_by_id(id).await.unwrap();
        assert_eq!(resolved.username, "new-name");
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn history_connect_opens_entry() {
        let history = MemoryConnectionHistory::new();
        let user_id = Uuid::new_v4();

        history.record_connect(user_id).await.unwrap();

        let entries = history.entries_for(user_id);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].disconnected_at.is_none());
    }

    #[tokio::test]
    async fn history_disconnect_closes_most_recent_open_entry() {
        let history = MemoryConnectionHistory::new();
        let user_id = Uuid::new_v4();

        history.record_connect(user_id).await.unwrap();
        history.record_connect(user_id).await.unwrap();
        history.record_disconnect(user_id).await.unwrap();

        let entries = history.entries_for(user_id);
        assert_eq!(entries.len(), 2);
        // The earlier entry stays open; the latest one is closed.
        assert!(entries[0].disconnected_at.is_none());
        assert!(entries[1].disconnected_at.is_some());
    }

    #[tokio::test]
    async fn history_disconnect_without_open_entry_is_noop() {
        let history = MemoryConnectionHistory::new();
        let user_id = Uuid::new_v4();

        // Absence of a history entry is non-fatal.
        history.record_disconnect(user_id).await.unwrap();
        assert!(history.entries_for(user_id).is_empty());
    }

    #[tokio::test]
    async fn history_is_scoped_per_user() {
        let history = MemoryConnectionHistory::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        history.record_connect(alice).await.unwrap();
        history.record_connect(bob).await.unwrap();
        history.record_disconnect(alice).await.unwrap();

        assert!(history.entries_for(alice)[0].disconnected_at.is_some());
        assert!(history.entries_for(bob)[0].disconnected_at.is_none());
    }
}
