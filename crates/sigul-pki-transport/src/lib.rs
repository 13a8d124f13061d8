//! # Sigul PKI Transport
//!
//! Moving leaf credentials from the authority to the principals that own them.
//!
//! ## Overview
//!
//! The authority generates every leaf key. Each key leaves the authority
//! exactly once, inside a sealed bundle protected by a random password that
//! is used for that one bundle and deleted by the consumer after import.
//! The authority's own private key is never bundled.
//!
//! ## Encryption Model
//!
//! - **Transport**: a random 256-bit password per bundle; the sealing key is
//!   derived from it with keyed Blake3 and a per-bundle salt.
//! - **At rest**: credential stores derive a key from their open password
//!   with Argon2id and seal private keys with it directly.
//!
//! Both use ChaCha20-Poly1305 through [`SealedBlob`].

pub mod artifacts;
pub mod bundle;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod password;

pub use artifacts::{
    ArtifactLayout, AUTHORITY_CERTIFICATE_FILE, REEXPORT_REQUEST_FILE, TRANSPORT_PASSWORD_FILE,
};
pub use bundle::{KeyBundle, SealedBundle};
pub use crypto::{EncryptionKey, EncryptionNonce, Salt};
pub use envelope::{KeySource, SealFormat, SealedBlob};
pub use error::{Result, SealError};
pub use password::{StorePassword, TransportPassword};
