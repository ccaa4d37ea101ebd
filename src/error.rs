//! # Error Handling
//!
//! This module provides the error types for the safe key-management core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Session Errors                                                    │
//! │  │   ├── KeyNotLoaded          - Key slot is empty                     │
//! │  │   ├── KeyAlreadyLoaded      - Key slot already holds a key          │
//! │  │   └── SafeMismatch          - Slot holds another safe's key         │
//! │  │                                                                      │
//! │  ├── Password Errors                                                   │
//! │  │   ├── WrongPassword         - Verification marker mismatch          │
//! │  │   ├── PasswordAlreadyUsed   - Password unlocks another safe         │
//! │  │   ├── SafeNotFound          - No crypto record for the safe         │
//! │  │   └── KeyRotationAborted    - Password change rolled back           │
//! │  │                                                                      │
//! │  ├── Crypto Errors                                                     │
//! │  │   ├── CryptoAuthFailure     - AEAD tag mismatch                     │
//! │  │   ├── CryptoIoFailure       - Stream I/O failed                     │
//! │  │   ├── EncryptionFailed      - Encryption operation failed           │
//! │  │   ├── InvalidKey            - Invalid key format/length             │
//! │  │   └── KeyDerivationFailed   - KDF rejected its input                │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                    │
//! │  │   ├── DatabaseError         - SQLite failure                        │
//! │  │   └── CorruptedVault        - Persisted record is malformed         │
//! │  │                                                                      │
//! │  ├── Biometric Errors                                                  │
//! │  │   ├── BiometricUnavailable  - Platform declined to release the key  │
//! │  │   └── BiometricNotEnabled   - Safe has no biometric envelope        │
//! │  │                                                                      │
//! │  └── Bubbles Errors                                                    │
//! │      ├── BadContactKey         - Shared/message key does not decrypt   │
//! │      ├── ConversationCorrupted - Ratchet session has no usable key     │
//! │      └── MessageKeyNotFound    - No stored key for that message        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Error Kinds
//!
//! Callers branch on [`Error::kind`] rather than on individual variants.
//! `WrongPassword` and `PasswordAlreadyUsed` are business outcomes shown
//! inline; every other kind is presented as a generic failure.

use thiserror::Error;

use crate::safe::SafeId;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Password did not unlock the safe
    WrongPassword,
    /// AEAD tag mismatch on a non-verification decrypt
    CryptoAuthFailure,
    /// Stream I/O failed during streaming crypto
    CryptoIoFailure,
    /// Secure key storage declined to release the wrapped key
    BiometricUnavailable,
    /// Password already bound to another safe
    PasswordAlreadyUsed,
    /// Password change failed before commit, nothing was persisted
    KeyRotationAborted,
    /// Persisted crypto record is structurally invalid
    CorruptedVault,
    /// Contact or message key does not decrypt the payload
    BadContactKey,
    /// Key slot state does not allow the operation
    Session,
    /// Storage layer failure
    Storage,
    /// Bug or unexpected condition
    Internal,
}

/// Main error type for the core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Session Errors (100-199)
    // ========================================================================

    /// Key slot is empty
    #[error("{0} is not loaded")]
    KeyNotLoaded(&'static str),

    /// Key slot already holds a key
    #[error("{0} is already loaded")]
    KeyAlreadyLoaded(&'static str),

    /// Slot holds the key of a different safe than the one requested
    #[error("Loaded {0} belongs to another safe")]
    SafeMismatch(&'static str),

    // ========================================================================
    // Password & Safe Errors (200-299)
    // ========================================================================

    /// Password does not unlock the safe
    #[error("Wrong password")]
    WrongPassword,

    /// Password already unlocks another safe
    #[error("Password is already used by another safe")]
    PasswordAlreadyUsed,

    /// No crypto record exists for the safe
    #[error("Safe not found: {0}")]
    SafeNotFound(SafeId),

    /// Password change failed before commit
    #[error("Key rotation aborted: {0}")]
    KeyRotationAborted(Box<Error>),

    // ========================================================================
    // Crypto Errors (300-399)
    // ========================================================================

    /// AEAD authentication failed (tampered data or wrong key)
    #[error("Authentication failed while decrypting {0}")]
    CryptoAuthFailure(String),

    /// Stream I/O failure during streaming encryption or decryption
    #[error("I/O failure during {context}: {source}")]
    CryptoIoFailure {
        /// Operation being performed
        context: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Key has the wrong length or format
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Key derivation failed
    #[error("Failed to derive key: {0}")]
    KeyDerivationFailed(String),

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Persisted record is structurally invalid
    #[error("Corrupted vault data: {0}")]
    CorruptedVault(String),

    // ========================================================================
    // Biometric Errors (500-599)
    // ========================================================================

    /// Secure key storage declined to release the key
    #[error("Biometric unavailable: {0}")]
    BiometricUnavailable(String),

    /// The safe has no biometric envelope
    #[error("Biometric unlock is not enabled for safe {0}")]
    BiometricNotEnabled(SafeId),

    // ========================================================================
    // Bubbles & Messaging Errors (600-699)
    // ========================================================================

    /// Contact or message key does not decrypt the payload
    #[error("Bad contact key: {0}")]
    BadContactKey(String),

    /// Ratchet session has no usable key
    #[error("Conversation {0} is corrupted")]
    ConversationCorrupted(String),

    /// No stored key for the requested message
    #[error("No message key stored for message {0}")]
    MessageKeyNotFound(String),

    /// Contact record does not exist
    #[error("Contact not found: {0}")]
    ContactNotFound(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Session
    /// - 200-299: Password & safe
    /// - 300-399: Crypto
    /// - 400-499: Storage
    /// - 500-599: Biometric
    /// - 600-699: Bubbles & messaging
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Session (100-199)
            Error::KeyNotLoaded(_) => 100,
            Error::KeyAlreadyLoaded(_) => 101,
            Error::SafeMismatch(_) => 102,

            // Password (200-299)
            Error::WrongPassword => 200,
            Error::PasswordAlreadyUsed => 201,
            Error::SafeNotFound(_) => 202,
            Error::KeyRotationAborted(_) => 203,

            // Crypto (300-399)
            Error::CryptoAuthFailure(_) => 300,
            Error::CryptoIoFailure { .. } => 301,
            Error::EncryptionFailed(_) => 302,
            Error::InvalidKey(_) => 303,
            Error::KeyDerivationFailed(_) => 304,

            // Storage (400-499)
            Error::DatabaseError(_) => 400,
            Error::CorruptedVault(_) => 401,

            // Biometric (500-599)
            Error::BiometricUnavailable(_) => 500,
            Error::BiometricNotEnabled(_) => 501,

            // Bubbles (600-699)
            Error::BadContactKey(_) => 600,
            Error::ConversationCorrupted(_) => 601,
            Error::MessageKeyNotFound(_) => 602,
            Error::ContactNotFound(_) => 603,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::InvalidConfig(_) => 901,
            Error::SerializationError(_) => 902,
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WrongPassword => ErrorKind::WrongPassword,
            Error::PasswordAlreadyUsed => ErrorKind::PasswordAlreadyUsed,
            Error::KeyRotationAborted(_) => ErrorKind::KeyRotationAborted,
            Error::CryptoAuthFailure(_) => ErrorKind::CryptoAuthFailure,
            Error::CryptoIoFailure { .. } => ErrorKind::CryptoIoFailure,
            Error::CorruptedVault(_) | Error::InvalidKey(_) => ErrorKind::CorruptedVault,
            Error::BiometricUnavailable(_) | Error::BiometricNotEnabled(_) => {
                ErrorKind::BiometricUnavailable
            }
            Error::BadContactKey(_)
            | Error::ConversationCorrupted(_)
            | Error::MessageKeyNotFound(_) => ErrorKind::BadContactKey,
            Error::KeyNotLoaded(_) | Error::KeyAlreadyLoaded(_) | Error::SafeMismatch(_) => {
                ErrorKind::Session
            }
            Error::SafeNotFound(_) | Error::DatabaseError(_) | Error::ContactNotFound(_) => {
                ErrorKind::Storage
            }
            Error::EncryptionFailed(_)
            | Error::KeyDerivationFailed(_)
            | Error::Internal(_)
            | Error::InvalidConfig(_)
            | Error::SerializationError(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can be resolved by retrying or by falling back
    /// to another unlock path.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::WrongPassword
                | ErrorKind::PasswordAlreadyUsed
                | ErrorKind::BiometricUnavailable
                | ErrorKind::CryptoIoFailure
                | ErrorKind::KeyRotationAborted
        )
    }

    /// Check if this error requires user action
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::WrongPassword | ErrorKind::PasswordAlreadyUsed
        )
    }

    /// Name the key or record a crypto failure happened on
    pub(crate) fn with_context(self, what: &str) -> Self {
        match self {
            Error::CryptoAuthFailure(_) => Error::CryptoAuthFailure(what.to_string()),
            Error::CryptoIoFailure { context, source } => Error::CryptoIoFailure {
                context: format!("{} ({})", context, what),
                source,
            },
            other => other,
        }
    }

    /// Wrap an error raised while rotating keys
    ///
    /// Already-wrapped errors are returned unchanged.
    pub(crate) fn rotation_aborted(err: Error) -> Self {
        match err {
            Error::KeyRotationAborted(_) => err,
            other => Error::KeyRotationAborted(Box::new(other)),
        }
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

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::CryptoIoFailure {
            context: "stream".into(),
            source: err,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("Background task failed: {}", err))
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
        assert_eq!(Error::KeyNotLoaded("master key").code(), 100);
        assert_eq!(Error::WrongPassword.code(), 200);
        assert_eq!(Error::CryptoAuthFailure("test".into()).code(), 300);
        assert_eq!(Error::DatabaseError("test".into()).code(), 400);
        assert_eq!(Error::BiometricUnavailable("test".into()).code(), 500);
        assert_eq!(Error::BadContactKey("test".into()).code(), 600);
        assert_eq!(Error::Internal("test".into()).code(), 900);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::WrongPassword.kind(), ErrorKind::WrongPassword);
        assert_eq!(
            Error::CorruptedVault("short salt".into()).kind(),
            ErrorKind::CorruptedVault
        );
        assert_eq!(
            Error::rotation_aborted(Error::DatabaseError("disk full".into())).kind(),
            ErrorKind::KeyRotationAborted
        );
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(Error::from(io).kind(), ErrorKind::CryptoIoFailure);
    }

    #[test]
    fn test_with_context_names_the_key() {
        let err = Error::CryptoAuthFailure("payload (tag mismatch)".into()).with_context("item key");
        assert_eq!(err.to_string(), "Authentication failed while decrypting item key");
        assert!(matches!(Error::WrongPassword.with_context("x"), Error::WrongPassword));
    }

    #[test]
    fn test_rotation_aborted_is_not_nested() {
        let once = Error::rotation_aborted(Error::WrongPassword);
        let twice = Error::rotation_aborted(once);
        match twice {
            Error::KeyRotationAborted(inner) => assert!(matches!(*inner, Error::WrongPassword)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::WrongPassword.is_recoverable());
        assert!(Error::BiometricUnavailable("denied".into()).is_recoverable());
        assert!(!Error::CryptoAuthFailure("item key".into()).is_recoverable());
        assert!(!Error::CorruptedVault("bad".into()).is_recoverable());
    }

    #[test]
    fn test_user_action_errors() {
        assert!(Error::PasswordAlreadyUsed.requires_user_action());
        assert!(!Error::Internal("bug".into()).requires_user_action());
    }
}
