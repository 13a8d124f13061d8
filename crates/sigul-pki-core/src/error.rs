//! Error types for the Sigul PKI core.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Nickname, Serial};

/// Core errors that can occur while issuing or parsing certificates.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("key error: {0}")]
    KeyError(String),

    #[error("invalid FQDN {value:?}: {reason}")]
    InvalidFqdn { value: String, reason: &'static str },

    #[error("invalid nickname {0:?}")]
    InvalidNickname(String),

    #[error("invalid trust attributes {0:?}")]
    InvalidTrust(String),

    #[error("invalid validity period: {0}")]
    InvalidValidity(String),

    #[error("unsupported certificate version: {0}")]
    UnsupportedVersion(u32),

    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),

    #[error("issuance failed: {0}")]
    IssuanceError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Validation errors for certificate structure, chains and validity windows.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("signature verification failed for serial {0}")]
    SignatureFailed(Serial),

    #[error("issuer mismatch: certificate names {named:?}, candidate issuer is {candidate:?}")]
    IssuerMismatch { named: String, candidate: String },

    #[error("candidate issuer {0:?} is not a certificate authority")]
    NotAnAuthority(String),

    #[error("certificate {nickname} is not valid before {not_before}")]
    NotYetValid {
        nickname: Nickname,
        not_before: DateTime<Utc>,
    },

    #[error("certificate {nickname} expired at {not_after}")]
    Expired {
        nickname: Nickname,
        not_after: DateTime<Utc>,
    },

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("structural error: {0}")]
    StructuralError(String),
}

impl From<CoreError> for CertificateError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::UnsupportedVersion(v) => CertificateError::UnsupportedVersion(v),
            other => CertificateError::StructuralError(other.to_string()),
        }
    }
}
