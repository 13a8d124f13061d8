//! CredentialStore trait: the abstract interface to a principal's keystore.
//!
//! One store belongs to exactly one principal. The orchestration layer only
//! talks to this trait; backends decide how certificates, trust attributes
//! and private keys are persisted.

use async_trait::async_trait;
use sigul_pki_core::{
    Certificate, CertificateRecord, DistinguishedName, ExtendedKeyUsage, Keypair, Nickname,
    TrustAttributes, ValidityMonths,
};
use sigul_pki_transport::{SealedBundle, TransportPassword};

use crate::error::Result;

/// Request for a self-signed certificate authority.
#[derive(Debug, Clone)]
pub struct SelfSignedRequest {
    pub nickname: Nickname,
    pub subject: DistinguishedName,
    pub validity: ValidityMonths,
    pub trust: TrustAttributes,
}

/// Request for a leaf certificate signed by a CA held in the same store.
#[derive(Debug, Clone)]
pub struct LeafRequest {
    pub nickname: Nickname,
    pub issuer: Nickname,
    pub subject: DistinguishedName,
    pub subject_alt_names: Vec<String>,
    pub extended_key_usage: Vec<ExtendedKeyUsage>,
    pub validity: ValidityMonths,
    pub trust: TrustAttributes,
}

/// The CredentialStore trait: async interface to one principal's keystore.
///
/// All methods are async to support both blocking (SQLite) and in-memory
/// backends. For SQLite, blocking work runs on `spawn_blocking`.
///
/// # Design Notes
///
/// - **No silent overwrite**: generating or importing under a nickname that
///   already holds a different certificate fails with `AlreadyExists`.
///   Re-importing the identical certificate only updates its trust.
/// - **CA keys stay put**: `export_bundle` refuses CA certificates, so an
///   authority key can never leave its store through this interface.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Where the store lives, for messages.
    fn location(&self) -> String;

    // ─────────────────────────────────────────────────────────────────────────
    // Generation
    // ─────────────────────────────────────────────────────────────────────────

    /// Generate a key pair and a self-signed CA certificate.
    async fn generate_self_signed(&self, request: SelfSignedRequest) -> Result<CertificateRecord>;

    /// Generate a key pair and a leaf certificate signed by `request.issuer`.
    ///
    /// The issuer must be a CA certificate in this store with its private key.
    async fn generate_signed_leaf(&self, request: LeafRequest) -> Result<CertificateRecord>;

    // ─────────────────────────────────────────────────────────────────────────
    // Trust
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace the trust attributes of a stored certificate.
    async fn set_trust(&self, nickname: &Nickname, trust: TrustAttributes) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Export / import
    // ─────────────────────────────────────────────────────────────────────────

    /// Export the public certificate only.
    async fn export_certificate(&self, nickname: &Nickname) -> Result<Certificate>;

    /// Export a leaf certificate with its private key, sealed under `password`.
    async fn export_bundle(
        &self,
        nickname: &Nickname,
        password: &TransportPassword,
    ) -> Result<SealedBundle>;

    /// Import a public certificate with the given trust.
    async fn import_certificate(
        &self,
        nickname: &Nickname,
        certificate: &Certificate,
        trust: TrustAttributes,
    ) -> Result<CertificateRecord>;

    /// Import a sealed bundle (certificate and key) under the bundle's nickname.
    async fn import_bundle(
        &self,
        bundle: &SealedBundle,
        password: &TransportPassword,
        trust: TrustAttributes,
    ) -> Result<CertificateRecord>;

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────

    /// All stored certificates, ordered by nickname.
    async fn list_certificates(&self) -> Result<Vec<CertificateRecord>>;

    /// Whether the store holds the private key for `nickname`.
    async fn has_private_key(&self, nickname: &Nickname) -> Result<bool>;

    /// The stored certificate, if any.
    async fn certificate(&self, nickname: &Nickname) -> Result<Option<Certificate>>;

    /// The record for one nickname, if any.
    async fn record(&self, nickname: &Nickname) -> Result<Option<CertificateRecord>> {
        Ok(self
            .list_certificates()
            .await?
            .into_iter()
            .find(|r| &r.nickname == nickname))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach a private key to an existing certificate.
    ///
    /// Used to migrate keys between backends, and by tests that plant a key
    /// where none belongs.
    async fn insert_private_key(&self, nickname: &Nickname, keypair: &Keypair) -> Result<()>;

    /// Delete every certificate and key. The store itself stays usable.
    async fn reset(&self) -> Result<()>;
}
