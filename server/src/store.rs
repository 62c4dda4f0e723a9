//! Storage collaborators: the session store and the message log.
//!
//! Both are consumed by the core through object-safe async traits so the
//! backing implementation is an injection decision, not a code change. The
//! in-memory implementations here carry the full external contract:
//! per-key TTL expiry for sessions, append-and-trim-to-window plus range
//! reads for messages.
//!
//! # Contracts
//!
//! - [`SessionStore`]: `set` with TTL, `get`, `delete`, `exists`. Expiry is
//!   enforced lazily on access and by an optional background sweep.
//! - [`MessageLog`]: `append` (auto-trims to the most recent N entries) and
//!   `range` (chronological slices addressed by an offset that may be
//!   negative, counting from the end). Out-of-range reads return an empty
//!   slice rather than erroring.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::types::{ChatMessage, Identity};

/// Errors surfaced by storage collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store is unreachable or failed internally.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete within the bounded timeout.
    #[error("store operation timed out")]
    Timeout,
}

/// Key-value store with per-key expiry, holding serialized session records.
///
/// The store is the authority for revocation: deleting a key invalidates
/// the session it backs regardless of the token's own embedded expiry.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Stores `value` under `key`, expiring after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Returns the value under `key`, or `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Deletes the value under `key`. Deleting an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Returns `true` if a live (non-expired) value exists under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Append-only bounded sequence store for chat messages.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Appends a message authored by `identity`, assigning its sequence id
    /// and timestamp, and trims the log to its configured window.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the log is unreachable.
    async fn append(&self, identity: &Identity, content: &str) -> Result<ChatMessage, StoreError>;

    /// Returns a chronological slice of up to `count` messages starting at
    /// `start`. A negative `start` counts back from the end of the log
    /// (`-1` is the newest entry). Requests entirely before the oldest
    /// retained entry return an empty slice.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the log is unreachable.
    async fn range(&self, start: i64, count: usize) -> Result<Vec<ChatMessage>, StoreError>;

    /// Number of currently retained messages.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the log is unreachable.
    async fn len(&self) -> Result<usize, StoreError>;
}

/// An entry in the in-memory session store.
#[derive(Debug, Clone)]
struct StoreEntry {
    value: String,
    expires_at: Instant,
}

impl StoreEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Thread-safe in-memory session store with per-key TTL.
///
/// Expired entries are dropped lazily on access; a background sweep via
/// [`spawn_cleanup_task`](Self::spawn_cleanup_task) keeps the map from
/// accumulating dead keys under low traffic.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: RwLock<HashMap<String, StoreEntry>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, including not-yet-swept expired ones.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Removes all expired entries, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap();
        let initial_len = entries.len();

        entries.retain(|_, entry| !entry.is_expired());

        let removed = initial_len - entries.len();
        if removed > 0 {
            debug!(
                removed_count = removed,
                remaining_count = entries.len(),
                "Cleaned up expired session entries"
            );
        }
        removed
    }

    /// Spawns a background task that periodically sweeps expired entries.
    ///
    /// The returned handle should be aborted on shutdown.
    pub fn spawn_cleanup_task(
        self: std::sync::Arc<Self>,
        cleanup_interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                interval.tick().await;
                self.cleanup_expired();
            }
        })
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap();
        trace!(key = %key, ttl_secs = ttl.as_secs(), "Storing session entry");
        entries.insert(
            key.to_string(),
            StoreEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        {
            let entries = self.entries.read().unwrap();
            match entries.get(key) {
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Entry exists but is expired - drop it lazily.
        let mut entries = self.entries.write().unwrap();
        entries.remove(key);
        trace!(key = %key, "Removed expired session entry during get");
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let removed = self.entries.write().unwrap().remove(key);
        if removed.is_some() {
            trace!(key = %key, "Deleted session entry");
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Interior state of the in-memory message log.
#[derive(Debug, Default)]
struct LogInner {
    next_id: u64,
    entries: VecDeque<ChatMessage>,
}

/// Thread-safe in-memory message log with a bounded window.
///
/// Appends assign monotonically increasing sequence ids; once the window is
/// full the oldest entries are discarded.
#[derive(Debug)]
pub struct MemoryMessageLog {
    window: usize,
    inner: Mutex<LogInner>,
}

impl MemoryMessageLog {
    /// Creates a log retaining at most `window` messages.
    ///
    /// # Panics
    ///
    /// Panics if `window` is 0.
    #[must_use]
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "message window must be non-zero");
        Self {
            window,
            inner: Mutex::new(LogInner::default()),
        }
    }

    /// The configured window size.
    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    async fn append(&self, identity: &Identity, content: &str) -> Result<ChatMessage, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        inner.next_id += 1;
        let message = ChatMessage {
            id: inner.next_id,
            user_id: identity.user_id,
            username: identity.username.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
        };

        inner.entries.push_back(message.clone());
        while inner.entries.len() > self.window {
            inner.entries.pop_front();
        }

        trace!(
            message_id = message.id,
            retained = inner.entries.len(),
            "Appended chat message"
        );

        Ok(message)
    }

    async fn range(&self, start: i64, count: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let len = inner.entries.len() as i64;

        let resolved_start = if start < 0 { len + start } else { start };
        let resolved_end = resolved_start + count as i64;

        // The requested range lies entirely before the oldest retained
        // entry: empty slice, never an error.
        if resolved_end <= 0 {
            return Ok(Vec::new());
        }

        let begin = resolved_start.max(0) as usize;
        let end = resolved_end.min(len).max(0) as usize;
        if begin >= end {
            return Ok(Vec::new());
        }

        Ok(inner.entries.range(begin..end).cloned().collect())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().unwrap().entries.len())
    }
}
