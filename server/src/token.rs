//! Token codec: stateless encode/decode of signed, expiring session tokens.
//!
//! A token carries the subject identity (user id and username) and an
//! absolute expiry. The signing algorithm is selected by configuration
//! (HMAC family via a shared secret, or RS256 via an RSA key pair) and can
//! be swapped without a code change.
//!
//! Expired and invalid tokens are distinguished error variants because
//! callers react differently: expired prompts a silent re-auth, invalid is
//! a hard failure.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use uuid::Uuid;
//! use parley_server::token::TokenCodec;
//! use parley_server::types::Identity;
//!
//! let codec = TokenCodec::hmac(b"test-secret", jsonwebtoken::Algorithm::HS256);
//! let identity = Identity::new(Uuid::new_v4(), "alice");
//!
//! let issued = codec.issue(&identity, Duration::from_secs(60)).unwrap();
//! let verified = codec.verify(&issued.token).unwrap();
//! assert_eq!(verified, identity);
//! ```

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{Config, TokenAlgorithm};
use crate::error::ConfigError;
use crate::types::Identity;

/// Errors produced by the token codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The token's embedded expiry has elapsed.
    ///
    /// Callers treat this as a silent re-auth path rather than a hard
    /// failure.
    #[error("token expired")]
    Expired,

    /// The token is malformed, unsigned, tampered with, or carries an
    /// unparseable subject.
    #[error("invalid token: {0}")]
    Invalid(String),

    /// Signing a new token failed.
    #[error("token signing failed: {0}")]
    Signing(String),
}

/// Claims embedded in a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    /// Subject: the user id.
    sub: String,

    /// The subject's username at issue time.
    username: String,

    /// Absolute expiry as a unix timestamp (seconds).
    exp: i64,
}

/// A freshly issued token together with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// The encoded, signed token.
    pub token: String,

    /// The embedded expiry instant.
    pub expires_at: DateTime<Utc>,
}

/// Stateless encoder/decoder for signed session tokens.
///
/// Constructed once at startup from configuration and shared via `Arc`
/// (all methods take `&self`).
#[derive(Clone)]
pub struct TokenCodec {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenCodec {
    /// Builds a codec from the server configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configured key material is missing or
    /// cannot be parsed (e.g. a malformed RSA PEM).
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        match config.algorithm {
            TokenAlgorithm::Hs256 | TokenAlgorithm::Hs384 | TokenAlgorithm::Hs512 => {
                let secret = config
                    .secret_key
                    .as_deref()
                    .ok_or_else(|| ConfigError::missing("PARLEY_SECRET_KEY"))?;
                let algorithm = match config.algorithm {
                    TokenAlgorithm::Hs256 => Algorithm::HS256,
                    TokenAlgorithm::Hs384 => Algorithm::HS384,
                    _ => Algorithm::HS512,
                };
                Ok(Self::hmac(secret.as_bytes(), algorithm))
            }
            TokenAlgorithm::Rs256 => {
                let private_pem = config
                    .rsa_private_key_pem
                    .as_deref()
                    .ok_or_else(|| ConfigError::missing("PARLEY_RSA_PRIVATE_KEY_PEM"))?;
                let public_pem = config
                    .rsa_public_key_pem
                    .as_deref()
                    .ok_or_else(|| ConfigError::missing("PARLEY_RSA_PUBLIC_KEY_PEM"))?;

                let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
                    .map_err(|e| ConfigError::invalid("PARLEY_RSA_PRIVATE_KEY_PEM", e.to_string()))?;
                let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
                    .map_err(|e| ConfigError::invalid("PARLEY_RSA_PUBLIC_KEY_PEM", e.to_string()))?;

                Ok(Self::with_keys(Algorithm::RS256, encoding_key, decoding_key))
            }
        }
    }

    /// Builds an HMAC codec from a shared secret.
    #[must_use]
    pub fn hmac(secret: &[u8], algorithm: Algorithm) -> Self {
        Self::with_keys(
            algorithm,
            EncodingKey::from_secret(secret),
            DecodingKey::from_secret(secret),
        )
    }

    fn with_keys(algorithm: Algorithm, encoding_key: EncodingKey, decoding_key: DecodingKey) -> Self {
        let mut validation = Validation::new(algorithm);
        // No leeway: the store-side expiry check is the grace mechanism.
        validation.leeway = 0;

        Self {
            algorithm,
            encoding_key,
            decoding_key,
            validation,
        }
    }

    /// Issues a signed token for `identity` expiring after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Signing`] if encoding fails.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<IssuedToken, TokenError> {
        let ttl = TimeDelta::from_std(ttl).map_err(|e| TokenError::Signing(e.to_string()))?;
        let expires_at = Utc::now() + ttl;

        let claims = Claims {
            sub: identity.user_id.to_string(),
            username: identity.username.clone(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Verifies a token's signature and expiry and extracts the identity.
    ///
    /// # Errors
    ///
    /// - [`TokenError::Expired`] if the embedded expiry has elapsed
    /// - [`TokenError::Invalid`] for any other failure (bad signature,
    ///   malformed structure, unparseable subject)
    pub fn verify(&self, token: &str) -> Result<Identity, TokenError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            }
        })?;

        let user_id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| TokenError::Invalid("subject is not a valid user id".to_string()))?;

        Ok(Identity::new(user_id, data.claims.username))
    }
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_codec() -> TokenCodec {
        TokenCodec::hmac(b"unit-test-secret", Algorithm::HS256)
    }

    fn test_identity() -> Identity {
        Identity::new(Uuid::new_v4(), "alice")
    }

    /// Encode claims with an arbitrary expiry, bypassing `issue`.
    fn encode_raw(codec: &TokenCodec, sub: &str, username: &str, exp: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            username: username.to_string(),
            exp,
        };
        encode(&Header::new(codec.algorithm), &claims, &codec.encoding_key).unwrap()
    }

    #[test]
    fn issue_then_verify_round_trips_identity() {
        let codec = test_codec();
        let identity = test_identity();

        let issued = codec.issue(&identity, Duration::from_secs(60)).unwrap();
        let verified = codec.verify(&issued.token).unwrap();

        assert_eq!(verified, identity);
    }

    #[test]
    fn issued_expiry_matches_ttl() {
        let codec = test_codec();
        let before = Utc::now().timestamp();
        let issued = codec
            .issue(&test_identity(), Duration::from_secs(300))
            .unwrap();
        let after = Utc::now().timestamp();

        assert!(issued.expires_at.timestamp() >= before + 300);
        assert!(issued.expires_at.timestamp() <= after + 300);
    }

    #[test]
    fn verify_rejects_expired_token() {
        let codec = test_codec();
        let identity = test_identity();
        let past = Utc::now().timestamp() - 120;
        let token = encode_raw(&codec, &identity.user_id.to_string(), "alice", past);

        assert_eq!(codec.verify(&token), Err(TokenError::Expired));
    }

    #[test]
    fn verify_rejects_garbage() {
        let codec = test_codec();
        assert!(matches!(
            codec.verify("not-a-token"),
            Err(TokenError::Invalid(_))
        ));
        assert!(matches!(codec.verify(""), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let codec = test_codec();
        let other = TokenCodec::hmac(b"different-secret", Algorithm::HS256);

        let issued = codec
            .issue(&test_identity(), Duration::from_secs(60))
            .unwrap();

        assert!(matches!(
            other.verify(&issued.token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn verify_rejects_non_uuid_subject() {
        let codec = test_codec();
        let future = Utc::now().timestamp() + 60;
        let token = encode_raw(&codec, "not-a-uuid", "alice", future);

        assert!(matches!(
            codec.verify(&token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn expired_is_distinguished_from_invalid() {
        let codec = test_codec();
        let identity = test_identity();
        let past = Utc::now().timestamp() - 10;
        let expired = encode_raw(&codec, &identity.user_id.to_string(), "alice", past);

        // Expired and invalid produce different variants.
        assert_eq!(codec.verify(&expired), Err(TokenError::Expired));
        assert!(matches!(
            codec.verify("garbage"),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn hmac_algorithms_are_interchangeable_by_construction() {
        let identity = test_identity();
        for algorithm in [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512] {
            let codec = TokenCodec::hmac(b"secret", algorithm);
            let issued = codec.issue(&identity, Duration::from_secs(60)).unwrap();
            assert_eq!(codec.verify(&issued.token).unwrap(), identity);
        }
    }

    #[test]
    fn from_config_rejects_malformed_rsa_pem() {
        let config = Config {
            secret_key: None,
            algorithm: crate::config::TokenAlgorithm::Rs256,
            rsa_private_key_pem: Some("not a pem".to_string()),
            rsa_public_key_pem: Some("not a pem".to_string()),
            token_ttl: Duration::from_secs(60),
            message_window: 100,
            page_size: 20,
            keepalive_interval: Duration::from_secs(10),
            broadcast_include_sender: false,
            users: std::collections::HashMap::new(),
            port: 8080,
        };

        let result = TokenCodec::from_config(&config);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn from_config_builds_hmac_codec() {
        let config = Config {
            secret_key: Some("configured-secret".to_string()),
            algorithm: crate::config::TokenAlgorithm::Hs384,
            rsa_private_key_pem: None,
            rsa_public_key_pem: None,
            token_ttl: Duration::from_secs(60),
            message_window: 100,
            page_size: 20,
            keepalive_interval: Duration::from_secs(10),
            broadcast_include_sender: false,
            users: std::collections::HashMap::new(),
            port: 8080,
        };

        let codec = TokenCodec::from_config(&config).unwrap();
        let identity = test_identity();
        let issued = codec.issue(&identity, Duration::from_secs(60)).unwrap();
        assert_eq!(codec.verify(&issued.token).unwrap(), identity);
    }
}
