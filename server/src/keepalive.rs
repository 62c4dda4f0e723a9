//! Per-connection session keepalive loop.
//!
//! Each CONNECTED connection runs a background task that periodically
//! re-validates its session against the session store. When the session
//! expires or is revoked, the client receives
//! `AUTH_STATUS{isAuthenticated:false}` followed by a close frame with the
//! distinguished application code, and the loop stops.
//!
//! The returned handle must be aborted when the connection's receive loop
//! exits; the keepalive task never outlives its connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::protocol::{Outbound, ServerFrame, CLOSE_SESSION_EXPIRED};
use crate::session::SessionValidator;

/// Spawns the keepalive loop for one connection.
///
/// Wakes every `interval`, re-checks `token` against the validator, and on
/// an invalid result pushes an auth-status frame and a close instruction
/// into the connection's outbound channel before terminating. The loop also
/// terminates on its own when the outbound channel closes (the writer task
/// is gone), so an aborted or torn-down connection never leaks it.
pub fn spawn_keepalive(
    validator: Arc<SessionValidator>,
    token: String,
    sender: mpsc::UnboundedSender<Outbound>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; the session was validated at
        // connect time, so skip it.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if sender.is_closed() {
                trace!("Keepalive stopping: connection gone");
                break;
            }

            let (_, valid) = validator.check(&token).await;
            if valid {
                trace!("Keepalive: session still valid");
                continue;
            }

            debug!("Keepalive detected invalid session, closing connection");

            let _ = sender.send(Outbound::Frame(ServerFrame::AuthStatus {
                is_authenticated: false,
            }));
            let _ = sender.send(Outbound::Close {
                code: CLOSE_SESSION_EXPIRED,
                reason: "session expired or revoked".to_string(),
            });
            break;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemorySessionStore, SessionStore};
    use crate::token::TokenCodec;
    use crate::types::Identity;
    use jsonwebtoken::Algorithm;
    use uuid::Uuid;

    fn test_validator() -> Arc<SessionValidator> {
        let store = Arc::new(MemorySessionStore::new()) as Arc<dyn SessionStore>;
        let codec = TokenCodec::hmac(b"keepalive-test-secret", Algorithm::HS256);
        Arc::new(SessionValidator::new(codec, store))
    }

    #[tokio::test]
    async fn detects_revocation_and_closes_with_distinguished_code() {
        let validator = test_validator();
        let identity = Identity::new(Uuid::new_v4(), "alice");
        let token = validator
            .issue_session(&identity, Duration::from_secs(3600))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_keepalive(
            Arc::clone(&validator),
            token,
            tx,
            Duration::from_millis(10),
        );

        validator.revoke(&identity).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("keepalive should emit")
            .unwrap();
        assert_eq!(
            first,
            Outbound::Frame(ServerFrame::AuthStatus {
                is_authenticated: false
            })
        );

        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("keepalive should close")
            .unwrap();
        assert!(matches!(
            second,
            Outbound::Close {
                code: CLOSE_SESSION_EXPIRED,
                ..
            }
        ));

        // The loop terminated on its own; nothing follows the close.
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("keepalive should stop")
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stays_quiet_while_session_is_valid() {
        let validator = test_validator();
        let identity = Identity::new(Uuid::new_v4(), "alice");
        let token = validator
            .issue_session(&identity, Duration::from_secs(3600))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_keepalive(
            Arc::clone(&validator),
            token,
            tx,
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(rx.try_recv().is_err());
        handle.abort();
    }

    #[tokio::test]
    async fn stops_when_connection_channel_closes() {
        let validator = test_validator();
        let identity = Identity::new(Uuid::new_v4(), "alice");
        let token = validator
            .issue_session(&identity, Duration::from_secs(3600))
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_keepalive(validator, token, tx, Duration::from_millis(10));

        // Simulate teardown: the writer side is gone.
        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("keepalive should notice the closed channel")
            .unwrap();
    }
}
