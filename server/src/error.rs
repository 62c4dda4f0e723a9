//! Error types for the Parley server.
//!
//! This module defines the error hierarchy used throughout the server,
//! providing type-safe error handling with meaningful error messages.
//!
//! # Error Types
//!
//! - [`ConfigError`] - Configuration-related errors (missing values, parse failures)
//! - [`ServerError`] - Top-level server errors encompassing all failure modes
//!
//! # Taxonomy
//!
//! Authentication failures are split into two distinguished variants because
//! callers react differently: an expired session is a silent re-auth path
//! (close with a reason, client re-logins), while an invalid token is a hard
//! failure (policy-violation close). Transport failures are per-connection
//! and never abort fan-out to other connections; upstream failures read as
//! "invalid" on auth paths and as a failure frame on message paths.

use std::error::Error;
use std::fmt;

use thiserror::Error as ThisError;

/// Errors that occur during configuration loading and validation.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required configuration value is missing.
    #[error("missing required configuration: {0}")]
    Missing(String),

    /// A configuration value failed to parse or is invalid.
    #[error("invalid configuration value for '{key}': {reason}")]
    Invalid {
        /// The configuration key that has an invalid value.
        key: String,
        /// Description of why the value is invalid.
        reason: String,
    },
}

impl ConfigError {
    /// Creates a new missing configuration error.
    pub fn missing(key: impl Into<String>) -> Self {
        Self::Missing(key.into())
    }

    /// Creates a new invalid configuration error.
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error type for the Parley server.
///
/// # Error Categories
///
/// - **Configuration errors**: Problems loading or validating server config
/// - **AuthExpired**: Token or session past its expiry; the client is
///   expected to re-authenticate
/// - **AuthInvalid**: Malformed, unsigned, tampered, or missing credentials
/// - **Transport**: A send to a dead connection; logged and pruned, never
///   fatal to the hub
/// - **Upstream**: Session store or message log unreachable
/// - **Internal**: Unexpected failures that don't fit other categories
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization or runtime.
    Config(ConfigError),

    /// The session or token has expired.
    ///
    /// This is the silent re-auth path: the connection is closed with a
    /// distinguished application code and a reason string.
    AuthExpired(String),

    /// The credentials are malformed, tampered with, or absent.
    ///
    /// This is the hard-failure path: the connection is closed with a
    /// policy-violation code.
    AuthInvalid(String),

    /// A frame could not be delivered to a connection.
    ///
    /// Delivery is best-effort per connection; this error is logged and the
    /// connection pruned on the next disconnect detection.
    Transport(String),

    /// The session store or message log is unreachable.
    ///
    /// Auth paths treat this as `AuthInvalid` (fail closed); message paths
    /// surface a failure frame to the sender without crashing the hub.
    Upstream(String),

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::AuthExpired(msg) => write!(f, "session expired: {msg}"),
            Self::AuthInvalid(msg) => write!(f, "authentication failed: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Upstream(msg) => write!(f, "upstream unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl ServerError {
    /// Creates a new expired-session error.
    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::AuthExpired(message.into())
    }

    /// Creates a new invalid-credentials error.
    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self::AuthInvalid(message.into())
    }

    /// Creates a new transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Creates a new upstream-unavailable error.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` if this error belongs to the authentication taxonomy.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::AuthExpired(_) | Self::AuthInvalid(_))
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::Config(_) | Self::Upstream(_))
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
