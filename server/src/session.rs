//! Session validator: the bridge between signed tokens and the session store.
//!
//! A token alone is not enough: the store holds a [`SessionRecord`] that
//! proves the token is still honored. Issuing a session deletes any prior
//! record for the identity (single active session per identity), `check`
//! cross-checks the presented token against the stored record, and `revoke`
//! deletes the record on logout.
//!
//! Every ambiguous outcome (decode failure, missing fields, store timeout,
//! clock anomaly) reads as "invalid", never "valid".

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use subtle::ConstantTimeEq;
use tracing::{debug, trace, warn};

use crate::error::{Result, ServerError};
use crate::store::{SessionStore, StoreError};
use crate::token::{TokenCodec, TokenError};
use crate::types::{session_key, Identity, SessionRecord};

/// Default bound on individual session-store operations.
///
/// A store that hangs reads as an invalid session rather than blocking the
/// caller.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Validates and manages server-side sessions.
///
/// Shared across connection handlers via `Arc`; all methods take `&self`.
pub struct SessionValidator {
    codec: TokenCodec,
    store: Arc<dyn SessionStore>,
    store_timeout: Duration,
}

impl SessionValidator {
    /// Creates a validator over the given codec and store.
    #[must_use]
    pub fn new(codec: TokenCodec, store: Arc<dyn SessionStore>) -> Self {
        Self {
            codec,
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Overrides the bound applied to each store operation.
    #[must_use]
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    /// Issues a new session for `identity`, invalidating any prior one.
    ///
    /// The previous session record is deleted before the new one is written,
    /// so a login on a second device logs the first one out.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Internal`] if token signing or record serialization fails
    /// - [`ServerError::Upstream`] if the store is unreachable
    pub async fn issue_session(&self, identity: &Identity, ttl: Duration) -> Result<String> {
        let issued = self
            .codec
            .issue(identity, ttl)
            .map_err(|e| ServerError::internal(format!("token issue failed: {e}")))?;

        let record = SessionRecord::new(&issued.token, identity, issued.expires_at);
        let value = serde_json::to_string(&record)
            .map_err(|e| ServerError::internal(format!("record serialization failed: {e}")))?;

        let key = session_key(identity.user_id);

        self.bounded(self.store.delete(&key))
            .await
            .map_err(|e| ServerError::upstream(e.to_string()))?;
        self.bounded(self.store.set(&key, value, ttl))
            .await
            .map_err(|e| ServerError::upstream(e.to_string()))?;

        debug!(
            user_id = %identity.user_id,
            ttl_secs = ttl.as_secs(),
            "Session issued"
        );

        Ok(issued.token)
    }

    /// Checks whether `token` is backed by a live session.
    ///
    /// Returns `(Some(identity), true)` only when the token decodes, a
    /// record exists for the subject, the stored token matches the presented
    /// one, and the stored expiry has not elapsed. Lazy expiry: an elapsed
    /// record is deleted on the spot. Every other path, including store
    /// timeouts, returns `(None, false)`.
    pub async fn check(&self, token: &str) -> (Option<Identity>, bool) {
        let identity = match self.codec.verify(token) {
            Ok(identity) => identity,
            Err(TokenError::Expired) => {
                trace!("Token expired");
                return (None, false);
            }
            Err(err) => {
                trace!(error = %err, "Token rejected");
                return (None, false);
            }
        };

        let key = session_key(identity.user_id);

        let stored = match self.bounded(self.store.get(&key)).await {
            Ok(stored) => stored,
            Err(err) => {
                // Fail closed: an unreachable store cannot vouch for a session.
                warn!(error = %err, "Session store lookup failed");
                return (None, false);
            }
        };

        let Some(raw) = stored else {
            trace!(user_id = %identity.user_id, "No session record");
            return (None, false);
        };

        let record: SessionRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "Malformed session record");
                return (None, false);
            }
        };

        // A superseded token decodes fine and finds a record, but the record
        // belongs to the newer login.
        if record.token.as_bytes().ct_eq(token.as_bytes()).unwrap_u8() == 0 {
            debug!(user_id = %identity.user_id, "Token superseded by newer session");
            return (None, false);
        }

        if record.is_expired_at(Utc::now()) {
            // The store TTL is a backstop; enforce expiry here too.
            if let Err(err) = self.bounded(self.store.delete(&key)).await {
                warn!(error = %err, "Failed to delete expired session record");
            }
            debug!(user_id = %identity.user_id, "Session record expired");
            return (None, false);
        }

        (Some(identity), true)
    }

    /// Revokes the session for `identity` (explicit logout).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Upstream`] if the store is unreachable.
    pub async fn revoke(&self, identity: &Identity) -> Result<()> {
        let key = session_key(identity.user_id);
        self.bounded(self.store.delete(&key))
            .await
            .map_err(|e| ServerError::upstream(e.to_string()))?;

        debug!(user_id = %identity.user_id, "Session revoked");
        Ok(())
    }

    /// Applies the configured bound to a store operation.
    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = std::result::Result<T, StoreError>>,
    ) -> std::result::Result<T, StoreError> {
        tokio::time::timeout(self.store_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}

impl std::fmt::Debug for SessionValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionValidator")
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}
