//! Certificate issuance and import checks shared by all backends.

use sigul_pki_core::{
    validate_certificate, verify_issued_by, Certificate, CertificateBuilder, Keypair, Nickname,
};

use crate::error::{Result, StoreError};
use crate::traits::{LeafRequest, SelfSignedRequest};

pub(crate) fn issue_self_signed(request: &SelfSignedRequest) -> Result<(Certificate, Keypair)> {
    let keypair = Keypair::generate()?;
    let certificate = CertificateBuilder::new(request.subject.clone())
        .validity(request.validity)
        .certificate_authority(true)
        .self_sign(&keypair)?;
    validate_certificate(&certificate)?;
    Ok((certificate, keypair))
}

pub(crate) fn issue_leaf(
    request: &LeafRequest,
    issuer: &Certificate,
    issuer_key: &Keypair,
) -> Result<(Certificate, Keypair)> {
    if !issuer.is_ca() {
        return Err(StoreError::IssuerUnavailable {
            issuer: request.issuer.clone(),
            reason: "not a certificate authority".into(),
        });
    }
    ensure_key_matches(&request.issuer, issuer, issuer_key)?;

    let keypair = Keypair::generate()?;
    let mut builder = CertificateBuilder::new(request.subject.clone())
        .validity(request.validity)
        .extended_key_usage(request.extended_key_usage.iter().copied());
    for san in &request.subject_alt_names {
        builder = builder.subject_alt_name(san.clone());
    }
    let certificate = builder.sign(&keypair, issuer, issuer_key)?;

    validate_certificate(&certificate)?;
    verify_issued_by(&certificate, issuer)?;
    Ok((certificate, keypair))
}

pub(crate) fn ensure_key_matches(
    nickname: &Nickname,
    certificate: &Certificate,
    keypair: &Keypair,
) -> Result<()> {
    if keypair.public_key() != certificate.public_key() {
        return Err(StoreError::Refused(format!(
            "private key does not match certificate {nickname}"
        )));
    }
    Ok(())
}

/// Decide whether an import may proceed.
///
/// Returns `true` when the identical certificate is already filed, in which
/// case only trust is updated.
pub(crate) fn check_import(
    nickname: &Nickname,
    existing: Option<&Certificate>,
    incoming: &Certificate,
) -> Result<bool> {
    validate_certificate(incoming)?;
    match existing {
        None => Ok(false),
        Some(current) if current == incoming => Ok(true),
        Some(_) => Err(StoreError::AlreadyExists(nickname.clone())),
    }
}

/// A CA key must never leave its store.
pub(crate) fn ensure_exportable(nickname: &Nickname, certificate: &Certificate) -> Result<()> {
    if certificate.is_ca() {
        return Err(StoreError::Refused(format!(
            "private key of certificate authority {nickname} cannot be exported"
        )));
    }
    Ok(())
}
