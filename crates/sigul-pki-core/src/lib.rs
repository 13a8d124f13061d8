//! # Sigul PKI Core
//!
//! Pure primitives for provisioning the Sigul signing stack: principals,
//! certificates, trust attributes and the policy that derives them.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over certificate data structures.
//!
//! ## Key Types
//!
//! - [`Principal`] - One deployed role (authority, server, client) and its FQDN
//! - [`Certificate`] - A signed identity certificate issued by the authority
//! - [`CertificateRecord`] - The inspectable view of a certificate inside a store
//! - [`TrustAttributes`] - NSS-style trust flags derived by [`TrustPolicy`]
//!
//! ## Certificates
//!
//! Certificates are standard X.509 v3, issued with `rcgen` and read back with
//! `x509-parser`. See [`certificate`] module.

pub mod certificate;
pub mod crypto;
pub mod error;
pub mod principal;
pub mod record;
pub mod trust;
pub mod types;
pub mod validation;

pub use certificate::{
    Certificate, CertificateBuilder, DistinguishedName, ExtendedKeyUsage, CERTIFICATE_PEM_TAG,
};
pub use crypto::{Blake3Hash, Keypair, PublicKey};
pub use error::{CertificateError, CoreError};
pub use principal::{
    Principal, Role, AUTHORITY_COMMON_NAME, AUTHORITY_NICKNAME, AUTHORITY_ORGANIZATION,
};
pub use record::CertificateRecord;
pub use trust::{TrustAttributes, TrustFlag, TrustFlags, TrustPolicy, TrustProfile, TrustSubject};
pub use types::{Fqdn, Nickname, Serial, ValidityMonths};
pub use validation::{check_validity, validate_certificate, verify_issued_by};
