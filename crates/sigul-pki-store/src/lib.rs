//! # Sigul PKI Store
//!
//! Credential store abstraction for Sigul PKI. Every principal owns exactly
//! one store holding its certificates, their trust attributes and whichever
//! private keys belong to that principal.
//!
//! ## Overview
//!
//! The orchestration layer is written against the [`CredentialStore`] trait.
//! The persistent implementation is [`SqliteCredentialStore`], with
//! [`MemoryCredentialStore`] for testing.
//!
//! ## Key Types
//!
//! - [`CredentialStore`] - The async trait for all store operations
//! - [`SqliteCredentialStore`] - SQLite-based persistent store, keys sealed at rest
//! - [`MemoryCredentialStore`] - In-memory store for tests
//! - [`SelfSignedRequest`] / [`LeafRequest`] - Certificate generation requests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sigul_pki_store::{CredentialStore, SqliteCredentialStore};
//! use sigul_pki_transport::StorePassword;
//!
//! async fn example() {
//!     let password = StorePassword::new("from-the-environment");
//!     let store = SqliteCredentialStore::open_or_create("/var/sigul/nss/bridge", &password).unwrap();
//!
//!     for record in store.list_certificates().await.unwrap() {
//!         println!("{} {}", record.nickname, record.trust_attributes);
//!     }
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Single writer**: the SQLite store holds an exclusive lock while open
//! - **No silent overwrite**: a nickname is never replaced by a different certificate
//! - **CA keys never leave**: bundles cannot be exported for CA certificates

pub mod error;
mod issue;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryCredentialStore;
pub use sqlite::{SqliteCredentialStore, STORE_FILE};
pub use traits::{CredentialStore, LeafRequest, SelfSignedRequest};
