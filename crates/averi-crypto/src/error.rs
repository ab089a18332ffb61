use std::fmt;

use thiserror::Error;

/// Which prekey table a handshake referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreKeyKind {
    Signed,
    PostQuantum,
    OneTime,
}

impl fmt::Display for PreKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signed => f.write_str("signed"),
            Self::PostQuantum => f.write_str("pqkem"),
            Self::OneTime => f.write_str("one-time"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no identity found")]
    NoIdentity,

    #[error("no session with {0}")]
    NoSession(String),

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("message authentication failed")]
    AuthenticationFailed,

    /// The identity key presented for `handle` differs from the pinned one.
    /// Never resolved automatically; the user has to confirm the new key.
    #[error(
        "identity key mismatch for {handle}: pinned {pinned_fingerprint}, presented {presented_fingerprint}"
    )]
    KeyMismatch {
        handle: String,
        pinned_fingerprint: String,
        presented_fingerprint: String,
    },

    #[error("too many skipped messages: {requested} requested, limit {limit}")]
    TooManySkippedMessages { requested: u64, limit: u32 },

    #[error("unable to find a {kind} prekey with id {id}")]
    MissingPreKey { kind: PreKeyKind, id: u32 },

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key encapsulation failed: {0}")]
    Kem(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("key storage error: {0}")]
    StorageError(String),

    #[error("session error: {0}")]
    SessionError(String),
}

impl CryptoError {
    /// Errors that signal a possible attack or a trust conflict. The caller
    /// decides what to do; nothing in this crate recovers from them.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid(_) | Self::AuthenticationFailed | Self::KeyMismatch { .. }
        )
    }

    /// Missing identity or session: the operation cannot run until the caller
    /// provisions one (or falls back to the handshake path).
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::NoIdentity | Self::NoSession(_))
    }

    /// Local storage hiccups the caller may retry. The ratchet itself has
    /// no transient failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageError(_))
    }
}
