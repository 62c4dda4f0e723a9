//! Parley Server - Real-time chat hub.
//!
//! This crate provides the Parley chat backend, responsible for:
//! - Issuing and validating token-backed sessions against a session store
//! - Tracking live WebSocket connections and their identity bindings
//! - Ordered, at-most-once fan-out of chat messages and presence events
//!
//! # Architecture
//!
//! The [`hub::ConnectionHub`] owns all live connections. Each connection is
//! authenticated before it is accepted (token codec + session store
//! cross-check), then runs a receive loop and a keepalive loop side by
//! side. Persistence collaborators (the session store, the message log,
//! the user directory, and the connection history) are consumed through
//! traits and injected at startup.

pub mod config;
pub mod directory;
pub mod error;
pub mod hub;
pub mod keepalive;
pub mod protocol;
pub mod routes;
pub mod session;
pub mod store;
pub mod token;
pub mod types;
