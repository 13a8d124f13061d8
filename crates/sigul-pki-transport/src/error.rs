//! Error types for sealing and transport artifacts.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while sealing, opening or moving transport artifacts.
#[derive(Debug, Error)]
pub enum SealError {
    /// Encryption error.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// Wrong password or tampered ciphertext. The two are indistinguishable.
    #[error("decryption failed (wrong password or corrupt data)")]
    DecryptionFailed,

    /// Key derivation error.
    #[error("key derivation error: {0}")]
    KeyDerivationError(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// A decrypted bundle does not have the expected shape.
    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    /// A password that must never be reused was reused.
    #[error("password reuse: {0}")]
    PasswordReuse(String),

    /// Filesystem error on an artifact path.
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Core error.
    #[error("core error: {0}")]
    CoreError(#[from] sigul_pki_core::CoreError),
}

impl SealError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SealError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the artifact is simply not there yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SealError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, SealError>;
