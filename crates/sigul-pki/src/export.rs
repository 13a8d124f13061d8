//! Export bundles: what the authority hands to each consumer.
//!
//! A consumer receives the authority's public certificate, its own leaf
//! certificate, and its leaf key sealed under a fresh transport password.
//! The authority certificate travels as [`AuthorityCertificate`], a type
//! that has nowhere to put a private key.

use std::collections::HashSet;

use sigul_pki_core::{Certificate, Nickname, Principal, CERTIFICATE_PEM_TAG};
use sigul_pki_store::CredentialStore;
use sigul_pki_transport::artifacts::{clear_reexport_request, write_password, write_public};
use sigul_pki_transport::{ArtifactLayout, SealedBundle, StorePassword, TransportPassword};

use crate::error::{ErrorKind, ProvisionError, Result, Step};

/// The authority's public certificate, checked to carry nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityCertificate {
    certificate: Certificate,
    pem: String,
}

impl AuthorityCertificate {
    /// Wrap a certificate exported from the authority store.
    pub fn new(certificate: Certificate) -> std::result::Result<Self, String> {
        if !certificate.is_ca() || !certificate.is_self_signed() {
            return Err(format!(
                "{} is not a self-signed certificate authority",
                certificate.common_name()
            ));
        }
        let pem = certificate.to_pem();
        Self::check_public_pem(&pem)?;
        Ok(Self { certificate, pem })
    }

    /// Parse the published artifact.
    pub fn from_pem(text: &str) -> std::result::Result<Self, String> {
        Self::check_public_pem(text)?;
        let certificate = Certificate::from_pem(text).map_err(|e| e.to_string())?;
        Self::new(certificate)
    }

    /// Every armored block must be a certificate; a key block is refused.
    fn check_public_pem(text: &str) -> std::result::Result<(), String> {
        let blocks = pem::parse_many(text).map_err(|e| e.to_string())?;
        if blocks.is_empty() {
            return Err("no certificate in authority artifact".into());
        }
        if let Some(block) = blocks.iter().find(|b| b.tag() != CERTIFICATE_PEM_TAG) {
            return Err(format!("unexpected {:?} block in authority artifact", block.tag()));
        }
        Ok(())
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }
}

/// A consumer's leaf, ready for transport.
#[derive(Debug, Clone)]
pub struct LeafTransport {
    pub nickname: Nickname,
    pub certificate_pem: String,
    pub sealed_bundle: SealedBundle,
    pub transport_password: TransportPassword,
}

#[derive(Debug, Clone)]
pub enum Payload {
    /// The authority principal keeps its leaf in its own store.
    PublicOnly,
    Leaf(LeafTransport),
}

/// Everything exported for one principal.
#[derive(Debug, Clone)]
pub struct ExportBundle {
    pub target_principal: String,
    pub authority_certificate: AuthorityCertificate,
    pub payload: Payload,
}

impl ExportBundle {
    pub fn leaf(&self) -> Option<&LeafTransport> {
        match &self.payload {
            Payload::Leaf(leaf) => Some(leaf),
            Payload::PublicOnly => None,
        }
    }
}

/// Builds export bundles from the authority store.
pub struct ExportBundler<'a> {
    open_password: &'a StorePassword,
}

impl<'a> ExportBundler<'a> {
    /// `open_password` is only compared against, so no transport password
    /// can ever equal it.
    pub fn new(open_password: &'a StorePassword) -> Self {
        Self { open_password }
    }

    pub async fn export(
        &self,
        store: &dyn CredentialStore,
        principal: &Principal,
    ) -> Result<ExportBundle> {
        let fail = |kind: ErrorKind| ProvisionError::new(principal.name.clone(), Step::Export, kind);
        let authority_certificate = self.authority_certificate(store, principal).await?;

        if principal.is_authority() {
            return Ok(ExportBundle {
                target_principal: principal.name.clone(),
                authority_certificate,
                payload: Payload::PublicOnly,
            });
        }

        let nickname = principal.leaf_nickname();
        let certificate = store
            .export_certificate(&nickname)
            .await
            .map_err(|e| fail(ErrorKind::from_store(e, ErrorKind::Export)))?;
        let has_key = store
            .has_private_key(&nickname)
            .await
            .map_err(|e| fail(ErrorKind::from_store(e, ErrorKind::Export)))?;
        if !has_key {
            return Err(fail(ErrorKind::Export(format!(
                "authority store holds no private key for {nickname}"
            ))));
        }

        let transport_password = TransportPassword::generate();
        transport_password
            .ensure_distinct_from(self.open_password)
            .map_err(|e| fail(ErrorKind::Export(e.to_string())))?;
        let sealed_bundle = store
            .export_bundle(&nickname, &transport_password)
            .await
            .map_err(|e| fail(ErrorKind::from_store(e, ErrorKind::Export)))?;
        let certificate_pem = certificate.to_pem();

        tracing::info!(
            principal = %principal.name,
            %nickname,
            serial = %certificate.serial(),
            "leaf exported"
        );
        Ok(ExportBundle {
            target_principal: principal.name.clone(),
            authority_certificate,
            payload: Payload::Leaf(LeafTransport {
                nickname,
                certificate_pem,
                sealed_bundle,
                transport_password,
            }),
        })
    }

    async fn authority_certificate(
        &self,
        store: &dyn CredentialStore,
        principal: &Principal,
    ) -> Result<AuthorityCertificate> {
        let fail = |kind: ErrorKind| ProvisionError::new(principal.name.clone(), Step::Export, kind);
        let certificate = store
            .export_certificate(&Principal::authority_nickname())
            .await
            .map_err(|e| fail(ErrorKind::from_store(e, ErrorKind::Export)))?;
        AuthorityCertificate::new(certificate).map_err(|e| fail(ErrorKind::Export(e)))
    }

    /// Export for every principal in `principals`.
    ///
    /// Transport passwords are checked for pairwise uniqueness before any
    /// bundle is returned, so a caller writing the result never publishes a
    /// reused password.
    pub async fn export_all(
        &self,
        store: &dyn CredentialStore,
        principals: &[Principal],
    ) -> Result<Vec<ExportBundle>> {
        let mut bundles = Vec::with_capacity(principals.len());
        for principal in principals {
            bundles.push(self.export(store, principal).await?);
        }

        let mut seen = HashSet::with_capacity(bundles.len());
        for bundle in &bundles {
            if let Some(leaf) = bundle.leaf() {
                if !seen.insert(leaf.transport_password.expose()) {
                    return Err(ProvisionError::new(
                        bundle.target_principal.clone(),
                        Step::Export,
                        ErrorKind::Export("transport password reused across bundles".into()),
                    ));
                }
            }
        }
        Ok(bundles)
    }

    /// Write one bundle's artifacts. The password file is written last.
    pub fn write(&self, bundle: &ExportBundle, layout: &ArtifactLayout) -> Result<()> {
        let principal = bundle.target_principal.as_str();
        let fail = |e: sigul_pki_transport::SealError| {
            ProvisionError::new(principal, Step::WriteArtifacts, ErrorKind::Export(e.to_string()))
        };
        let authority_pem = bundle.authority_certificate.pem().as_bytes();

        write_public(&layout.shared_authority_certificate_path(), authority_pem).map_err(fail)?;

        let Payload::Leaf(leaf) = &bundle.payload else {
            tracing::info!(principal, "authority certificate published");
            return Ok(());
        };

        write_public(&layout.authority_certificate_path(principal), authority_pem).map_err(fail)?;
        write_public(
            &layout.certificate_path(principal, &leaf.nickname),
            leaf.certificate_pem.as_bytes(),
        )
        .map_err(fail)?;
        write_public(
            &layout.bundle_path(principal, &leaf.nickname),
            leaf.sealed_bundle.as_bytes(),
        )
        .map_err(fail)?;
        write_password(&layout.password_path(principal), &leaf.transport_password).map_err(fail)?;
        clear_reexport_request(&layout.reexport_request_path(principal)).map_err(fail)?;

        tracing::info!(
            principal,
            nickname = %leaf.nickname,
            dir = %layout.principal_dir(principal).display(),
            "export artifacts written"
        );
        Ok(())
    }

    pub fn write_all(&self, bundles: &[ExportBundle], layout: &ArtifactLayout) -> Result<()> {
        bundles.iter().try_for_each(|b| self.write(b, layout))
    }
}
