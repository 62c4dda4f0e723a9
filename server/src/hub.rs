//! The connection hub: live connections, identity bindings, and fan-out.
//!
//! The hub owns the set of active connections, each bound to an
//! authenticated [`Identity`] and a read cursor into the message log. It is
//! constructed once and injected into connection-handler tasks; there is no
//! ambient global registry.
//!
//! # Ordering
//!
//! All mutating operations (connect, disconnect, append-and-broadcast)
//! execute under a single async mutex, so for any two messages A appended
//! before B, every connection observes A before B. Within
//! [`send_and_persist`](ConnectionHub::send_and_persist) the log append and
//! the sender echo strictly precede the fan-out.
//!
//! # Delivery
//!
//! Delivery is best-effort per connection: frames are pushed into each
//! connection's unbounded outbound channel, and a closed channel is logged
//! and skipped. One dead connection never aborts fan-out to the rest.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::directory::ConnectionHistory;
use crate::error::Result;
use crate::protocol::{Outbound, ServerFrame};
use crate::store::MessageLog;
use crate::types::Identity;

/// Identifies one live connection. Distinct from the user id: one user may
/// hold several connections.
pub type ConnectionId = Uuid;

/// Per-connection state owned by the hub.
struct ConnectionEntry {
    identity: Identity,
    sender: mpsc::UnboundedSender<Outbound>,
    /// Read cursor into the message log: an offset from the end, always
    /// negative once initialized.
    cursor: i64,
}

/// The single-process broadcast hub.
///
/// Cheap to share: wrap in `Arc` and clone the handle into each
/// connection task.
pub struct ConnectionHub {
    log: Arc<dyn MessageLog>,
    history: Arc<dyn ConnectionHistory>,
    page_size: usize,
    broadcast_include_sender: bool,
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionHub {
    /// Creates a hub over the given message log and history recorder.
    ///
    /// `page_size` controls both the initial load and load-more pages.
    #[must_use]
    pub fn new(
        log: Arc<dyn MessageLog>,
        history: Arc<dyn ConnectionHistory>,
        page_size: usize,
    ) -> Self {
        Self {
            log,
            history,
            page_size,
            broadcast_include_sender: false,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Includes the sender in `broadcast_message` fan-out.
    ///
    /// The sender still receives the `new_message` echo first either way.
    #[must_use]
    pub fn with_broadcast_include_sender(mut self, include: bool) -> Self {
        self.broadcast_include_sender = include;
        self
    }

    /// Registers an authenticated connection.
    ///
    /// Sends the trailing page of the log as `initial_load`, records a
    /// connection-history entry (best-effort), and rebroadcasts the
    /// presence set to every connection including the new one.
    ///
    /// # Errors
    ///
    /// Infallible today; the `Result` reserves room for registration limits.
    pub async fn connect(
        &self,
        id: ConnectionId,
        identity: Identity,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Result<()> {
        let mut connections = self.connections.lock().await;

        let cursor = -(self.page_size as i64);
        let initial = match self.log.range(cursor, self.page_size).await {
            Ok(messages) => messages,
            Err(err) => {
                // The connection is still usable without history.
                warn!(error = %err, "Message log unavailable during connect");
                Vec::new()
            }
        };

        deliver(&sender, &identity.username, ServerFrame::InitialLoad { messages: initial });

        info!(
            connection_id = %id,
            user_id = %identity.user_id,
            username = %identity.username,
            "Connection registered"
        );

        let user_id = identity.user_id;
        connections.insert(
            id,
            ConnectionEntry {
                identity,
                sender,
                cursor,
            },
        );

        if let Err(err) = self.history.record_connect(user_id).await {
            warn!(error = %err, "Failed to record connection history");
        }

        Self::broadcast_presence(&connections);
        Ok(())
    }

    /// Removes a connection, closes its history entry (best-effort), and
    /// rebroadcasts the presence set to the remaining connections.
    ///
    /// Returns the identity that was bound to the connection, if it was
    /// registered.
    pub async fn disconnect(&self, id: ConnectionId) -> Option<Identity> {
        let mut connections = self.connections.lock().await;

        let entry = connections.remove(&id)?;

        info!(
            connection_id = %id,
            user_id = %entry.identity.user_id,
            "Connection removed"
        );

        if let Err(err) = self.history.record_disconnect(entry.identity.user_id).await {
            warn!(error = %err, "Failed to record disconnection history");
        }

        Self::broadcast_presence(&connections);
        Some(entry.identity)
    }

    /// Persists a chat message, echoes it to the sender, then fans it out.
    ///
    /// The append and the `new_message` echo happen before any
    /// `broadcast_message` leaves, so the sender's own view is
    /// authoritative. A log failure surfaces as a `system_message` to the
    /// sender only; the hub and the other connections are untouched.
    ///
    /// # Errors
    ///
    /// Infallible today; per-connection failures are absorbed.
    pub async fn send_and_persist(&self, id: ConnectionId, content: &str) -> Result<()> {
        let connections = self.connections.lock().await;

        let Some(entry) = connections.get(&id) else {
            trace!(connection_id = %id, "Ignoring message from unregistered connection");
            return Ok(());
        };

        let message = match self.log.append(&entry.identity, content).await {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    error = %err,
                    user_id = %entry.identity.user_id,
                    "Message log append failed"
                );
                deliver(
                    &entry.sender,
                    &entry.identity.username,
                    ServerFrame::system("message could not be delivered"),
                );
                return Ok(());
            }
        };

        // Echo first: the sender's view is authoritative.
        deliver(
            &entry.sender,
            &entry.identity.username,
            ServerFrame::new_message(&message),
        );

        let fan_out = ServerFrame::broadcast_message(&message);
        for (other_id, other) in connections.iter() {
            if *other_id == id && !self.broadcast_include_sender {
                continue;
            }
            deliver(&other.sender, &other.identity.username, fan_out.clone());
        }

        debug!(
            message_id = message.id,
            recipients = connections.len(),
            "Chat message broadcast"
        );

        Ok(())
    }

    /// Relays a typing notification to every connection except the sender.
    pub async fn typing(&self, id: ConnectionId) {
        self.relay_from(id, ServerFrame::Typing {
            username: String::new(),
        })
        .await;
    }

    /// Relays a stop-typing notification to every connection except the sender.
    pub async fn stop_typing(&self, id: ConnectionId) {
        self.relay_from(id, ServerFrame::StopTyping {
            username: String::new(),
        })
        .await;
    }

    /// Sends a server-originated notice to every connection, optionally
    /// excluding one (e.g. the subject of a join/leave notice).
    pub async fn broadcast_system(&self, content: &str, exclude: Option<ConnectionId>) {
        let connections = self.connections.lock().await;
        let frame = ServerFrame::system(content);

        for (other_id, other) in connections.iter() {
            if Some(*other_id) == exclude {
                continue;
            }
            deliver(&other.sender, &other.identity.username, frame.clone());
        }
    }

    /// Serves the next older page of the message log to a connection.
    ///
    /// The cursor moves back one page per call and clamps at the oldest
    /// retained entry: once a page comes back empty the cursor stays put,
    /// so repeated calls keep returning an empty `more_messages` instead of
    /// running away.
    pub async fn load_more(&self, id: ConnectionId) {
        let mut connections = self.connections.lock().await;

        let Some(entry) = connections.get_mut(&id) else {
            trace!(connection_id = %id, "Ignoring load_more from unregistered connection");
            return;
        };

        let new_start = entry.cursor - self.page_size as i64;
        let messages = match self.log.range(new_start, self.page_size).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, "Message log unavailable during load_more");
                deliver(
                    &entry.sender,
                    &entry.identity.username,
                    ServerFrame::system("message history unavailable"),
                );
                return;
            }
        };

        if !messages.is_empty() {
            entry.cursor = new_start;
        }

        deliver(
            &entry.sender,
            &entry.identity.username,
            ServerFrame::MoreMessages { messages },
        );
    }

    /// Usernames of all live connections, in registration-map order.
    pub async fn active_users(&self) -> Vec<String> {
        let connections = self.connections.lock().await;
        connections
            .values()
            .map(|entry| entry.identity.username.clone())
            .collect()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Fans a frame out to everyone but `from`, stamping the sender's
    /// username into the frame.
    async fn relay_from(&self, from: ConnectionId, frame: ServerFrame) {
        let connections = self.connections.lock().await;

        let Some(sender_entry) = connections.get(&from) else {
            return;
        };
        let username = sender_entry.identity.username.clone();

        let frame = match frame {
            ServerFrame::Typing { .. } => ServerFrame::Typing { username },
            ServerFrame::StopTyping { .. } => ServerFrame::StopTyping { username },
            other => other,
        };

        for (other_id, other) in connections.iter() {
            if *other_id == from {
                continue;
            }
            deliver(&other.sender, &other.identity.username, frame.clone());
        }
    }

    /// Rebroadcasts the presence set to every connection in the map.
    fn broadcast_presence(connections: &HashMap<ConnectionId, ConnectionEntry>) {
        let users: Vec<String> = connections
            .values()
            .map(|entry| entry.identity.username.clone())
            .collect();

        let frame = ServerFrame::UsersList { users };
        for entry in connections.values() {
            deliver(&entry.sender, &entry.identity.username, frame.clone());
        }
    }
}

impl std::fmt::Debug for ConnectionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHub")
            .field("page_size", &self.page_size)
            .field("broadcast_include_sender", &self.broadcast_include_sender)
            .finish()
    }
}

/// Pushes a frame into a connection's outbound channel.
///
/// A closed channel means the writer task is gone; the failure is logged
/// and the connection will be pruned when its receive loop exits.
fn deliver(sender: &mpsc::UnboundedSender<Outbound>, username: &str, frame: ServerFrame) {
    if sender.send(Outbound::Frame(frame)).is_err() {
        warn!(username = %username, "Dropped frame for dead connection");
    }
}
