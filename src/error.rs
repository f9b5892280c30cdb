//! # Error Handling
//!
//! Error types for the encryption engine, categorized by the phase of the
//! key lifecycle that produced them.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Lifecycle (100-199)   NotInitialized, AlreadyInitialized          │
//! │  ├── Key state  (200-299)  NoLocalKeys, NoRemotePublicKey,             │
//! │  │                         KeyMismatch, NeedsRestore                    │
//! │  ├── Crypto     (300-399)  AuthFail, DecryptionFailed,                 │
//! │  │                         CounterOverflow, WeakPassword                │
//! │  ├── Storage    (400-499)  DatabaseError, StorageNotFound              │
//! │  ├── Remote     (500-599)  RemoteUnavailable, RotationInProgress       │
//! │  └── Internal   (900-999)  Internal, SerializationError                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `ConstraintViolation` (a duplicate `(user, epoch)` history row) is
//! deliberately **not** a variant here: per the error-handling policy it is
//! treated as success and swallowed at the call site (see
//! [`crate::historical::HistoricalKeys::store`]), never constructed or
//! propagated.

use thiserror::Error;

/// Result type alias for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the encryption engine.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Lifecycle errors (100-199)
    // ========================================================================
    /// An operation was attempted before `initialize_for_user` completed.
    #[error("encryption context has not been initialized for a user")]
    NotInitialized,

    /// `initialize_for_user` was called twice on the same context.
    #[error("encryption context is already initialized")]
    AlreadyInitialized,

    // ========================================================================
    // Key-state errors (200-299)
    // ========================================================================
    /// No identity key pair exists in the local store.
    #[error("no local identity keys for this user")]
    NoLocalKeys,

    /// The peer has not published a public key.
    #[error("peer {0} has no published public key")]
    NoRemotePublicKey(String),

    /// The local public key does not match the remote current public key,
    /// and no backup was available to resolve it.
    #[error("local identity key does not match the remote current key")]
    KeyMismatch,

    /// A backup exists but no local keys do; the caller must restore.
    #[error("no local identity keys; restore from password or recovery key")]
    NeedsRestore {
        /// Set when this state was reached via a detected key mismatch
        /// rather than a brand-new device.
        key_mismatch: bool,
    },

    // ========================================================================
    // Cryptographic errors (300-399)
    // ========================================================================
    /// AEAD tag verification failed while opening a backup.
    #[error("incorrect password or recovery key, or corrupted backup data")]
    AuthFail,

    /// AEAD tag verification failed while opening a message, after the
    /// single auto-repair retry described in the decrypt flow.
    #[error("failed to decrypt message: {0}")]
    DecryptionFailed(String),

    /// The per-session message counter would exceed `MAX_COUNTER`.
    #[error("message counter for this session has reached its maximum")]
    CounterOverflow,

    /// A candidate password failed the minimum strength check.
    #[error("password does not meet the minimum strength requirement (score {score}/6)")]
    WeakPassword {
        /// The score the password actually achieved.
        score: u8,
    },

    // ========================================================================
    // Storage errors (400-499)
    // ========================================================================
    /// The local or reference-remote store reported a failure.
    #[error("database error: {0}")]
    DatabaseError(String),

    /// A lookup by primary key found nothing. Kept distinct from `Option`
    /// returns because a handful of call sites need to distinguish "row
    /// absent" from "row absent and that's a caller bug".
    #[error("not found: {0}")]
    StorageNotFound(String),

    // ========================================================================
    // Remote / concurrency errors (500-599)
    // ========================================================================
    /// A remote operation timed out or the remote tier is otherwise
    /// unreachable. Local operations may still proceed.
    #[error("remote key store unavailable: {0}")]
    RemoteUnavailable(String),

    /// The rotation lease could not be acquired because another rotation
    /// (this device or another) already holds it.
    #[error("a key rotation is already in progress for this user")]
    RotationInProgress,

    // ========================================================================
    // Internal errors (900-999)
    // ========================================================================
    /// An invariant the engine relies on did not hold; should not occur in
    /// normal operation.
    #[error("internal error: {0}")]
    Internal(String),

    /// (De)serialization of an envelope or backup row failed.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Numeric error code, stable across versions, grouped by category:
    /// 100s lifecycle, 200s key state, 300s crypto, 400s storage,
    /// 500s remote/concurrency, 900s internal.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotInitialized => 100,
            Error::AlreadyInitialized => 101,

            Error::NoLocalKeys => 200,
            Error::NoRemotePublicKey(_) => 201,
            Error::KeyMismatch => 202,
            Error::NeedsRestore { .. } => 203,

            Error::AuthFail => 300,
            Error::DecryptionFailed(_) => 301,
            Error::CounterOverflow => 302,
            Error::WeakPassword { .. } => 303,

            Error::DatabaseError(_) => 400,
            Error::StorageNotFound(_) => 401,

            Error::RemoteUnavailable(_) => 500,
            Error::RotationInProgress => 501,

            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
        }
    }

    /// Whether the caller can reasonably retry or take a corrective action
    /// (re-init, restore, retry rotation) rather than treating this as
    /// terminal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotInitialized
                | Error::NoLocalKeys
                | Error::NoRemotePublicKey(_)
                | Error::KeyMismatch
                | Error::NeedsRestore { .. }
                | Error::RotationInProgress
                | Error::WeakPassword { .. }
        )
    }

    /// Whether resolving this error requires the user to act (enter a
    /// password/recovery key, wait for a peer to publish, retry later) as
    /// opposed to something the engine can silently fix itself.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            Error::NeedsRestore { .. } | Error::AuthFail | Error::WeakPassword { .. }
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NotInitialized.code(), 100);
        assert_eq!(Error::NoLocalKeys.code(), 200);
        assert_eq!(Error::AuthFail.code(), 300);
        assert_eq!(Error::DatabaseError("x".into()).code(), 400);
        assert_eq!(Error::RemoteUnavailable("x".into()).code(), 500);
        assert_eq!(Error::Internal("x".into()).code(), 900);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::NeedsRestore { key_mismatch: true }.is_recoverable());
        assert!(Error::RotationInProgress.is_recoverable());
        assert!(!Error::AuthFail.is_recoverable());
        assert!(!Error::CounterOverflow.is_recoverable());
    }

    #[test]
    fn test_requires_user_action() {
        assert!(Error::NeedsRestore { key_mismatch: false }.requires_user_action());
        assert!(Error::AuthFail.requires_user_action());
        assert!(!Error::RotationInProgress.requires_user_action());
    }
}
