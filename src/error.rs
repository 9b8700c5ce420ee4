//! Error types for the Reflex protocol.

use thiserror::Error;

/// Result type alias for Reflex operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during Reflex operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Input did not parse: short handshake, bad length prefix, bad
    /// JSON/base64, oversized policy, frame length out of range.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Authentication failed: unknown user, timestamp out of window,
    /// duplicate handshake nonce, key agreement failure.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Frame ciphertext was already seen this session.
    #[error("replay detected")]
    Replay,

    /// Cryptographic operation failed (AEAD open, HKDF, randomness).
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Underlying read/write error, including EOF mid-frame.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Fallback was invoked but no destination is configured.
    #[error("reflex handshake not matched and fallback not configured")]
    Unconfigured,

    /// The upstream dispatcher could not produce a link.
    #[error("upstream dispatch failed: {0}")]
    Dispatch(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new malformed-input error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    /// Create a new cryptographic error.
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new dispatch error.
    pub fn dispatch(msg: impl Into<String>) -> Self {
        Error::Dispatch(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error indicates an authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Auth(_))
    }

    /// Check if this error indicates a detected replay.
    pub fn is_replay(&self) -> bool {
        matches!(self, Error::Replay)
    }
}
