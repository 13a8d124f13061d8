//! Error types for credential stores.

use std::path::PathBuf;

use sigul_pki_core::Nickname;
use thiserror::Error;

/// Errors that can occur during credential store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The store does not exist at the given location.
    #[error("no credential store at {0}")]
    Missing(PathBuf),

    /// Another process holds the store open for writing.
    #[error("credential store {0} is locked by another process")]
    Locked(PathBuf),

    /// The open password does not match the store.
    #[error("wrong password for credential store")]
    WrongPassword,

    /// No certificate under this nickname.
    #[error("certificate not found: {0}")]
    NotFound(Nickname),

    /// A different certificate is already filed under this nickname.
    #[error("certificate already exists: {0}")]
    AlreadyExists(Nickname),

    /// The operation needs a private key the store does not hold.
    #[error("no private key for {0}")]
    MissingPrivateKey(Nickname),

    /// The requested issuer cannot sign.
    #[error("issuer {issuer} unavailable: {reason}")]
    IssuerUnavailable { issuer: Nickname, reason: String },

    /// The store refuses the operation outright.
    #[error("refused: {0}")]
    Refused(String),

    /// Sealing or opening key material failed.
    #[error(transparent)]
    Seal(#[from] sigul_pki_transport::SealError),

    /// Certificate construction failed.
    #[error(transparent)]
    Core(#[from] sigul_pki_core::CoreError),

    /// Certificate chain check failed.
    #[error(transparent)]
    Certificate(#[from] sigul_pki_core::CertificateError),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Background task failed.
    #[error("store task failed: {0}")]
    Task(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether retrying later can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Locked(_))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
