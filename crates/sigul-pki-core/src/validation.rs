//! Certificate validation: structure, issuance chain and validity window.

use chrono::{DateTime, Utc};

use crate::certificate::Certificate;
use crate::error::CertificateError;
use crate::types::Nickname;

/// Validate a certificate's structure (without checking its issuer).
///
/// This performs:
/// - Validity window ordering
/// - Non-empty subject and issuer names
/// - Leaf certificates must name at least one SAN and one usage
pub fn validate_certificate(cert: &Certificate) -> Result<(), CertificateError> {
    if cert.not_after() <= cert.not_before() {
        return Err(CertificateError::StructuralError(
            "not_after must be later than not_before".into(),
        ));
    }

    if cert.common_name().is_empty() || cert.issuer_common_name().is_empty() {
        return Err(CertificateError::StructuralError("empty common name".into()));
    }

    if !cert.is_ca() {
        if cert.subject_alt_names().is_empty() {
            return Err(CertificateError::StructuralError(
                "leaf certificate has no subject alternative name".into(),
            ));
        }
        if cert.extended_key_usage().is_empty() {
            return Err(CertificateError::StructuralError(
                "leaf certificate has no extended key usage".into(),
            ));
        }
    }

    Ok(())
}

/// Verify that `cert` was issued by `issuer`.
///
/// The issuer must be a CA whose subject matches the certificate's issuer
/// name, and the signature must verify under the issuer's key.
pub fn verify_issued_by(cert: &Certificate, issuer: &Certificate) -> Result<(), CertificateError> {
    if !issuer.is_ca() {
        return Err(CertificateError::NotAnAuthority(issuer.common_name().to_string()));
    }

    if cert.issuer() != issuer.subject() {
        return Err(CertificateError::IssuerMismatch {
            named: cert.issuer().to_string(),
            candidate: issuer.subject().to_string(),
        });
    }

    cert.verify_signature(issuer)
        .map_err(|_| CertificateError::SignatureFailed(cert.serial()))
}

/// Check that `now` falls inside the certificate's validity window.
pub fn check_validity(
    nickname: &Nickname,
    cert: &Certificate,
    now: DateTime<Utc>,
) -> Result<(), CertificateError> {
    if now < cert.not_before() {
        return Err(CertificateError::NotYetValid {
            nickname: nickname.clone(),
            not_before: cert.not_before(),
        });
    }
    if now >= cert.not_after() {
        return Err(CertificateError::Expired {
            nickname: nickname.clone(),
            not_after: cert.not_after(),
        });
    }
    Ok(())
}
