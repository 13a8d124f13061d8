//! Certificate records: what a credential store reports about one entry.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::certificate::{Certificate, ExtendedKeyUsage};
use crate::crypto::Blake3Hash;
use crate::trust::TrustAttributes;
use crate::types::{Nickname, Serial};

/// A certificate as filed in a credential store.
///
/// Records are views: they are derived from the stored certificate plus the
/// store's trust attributes and key presence, never edited directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub nickname: Nickname,
    pub subject_cn: String,
    pub subject_alt_names: Vec<String>,
    pub extended_key_usage: Vec<ExtendedKeyUsage>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub trust_attributes: TrustAttributes,
    pub has_private_key: bool,
    pub serial: Serial,
    pub issuer_cn: String,
    pub is_ca: bool,
    pub fingerprint: Blake3Hash,
}

impl CertificateRecord {
    pub fn from_certificate(
        nickname: Nickname,
        certificate: &Certificate,
        trust_attributes: TrustAttributes,
        has_private_key: bool,
    ) -> Self {
        Self {
            nickname,
            subject_cn: certificate.common_name().to_string(),
            subject_alt_names: certificate.subject_alt_names().to_vec(),
            extended_key_usage: certificate.extended_key_usage().to_vec(),
            not_before: certificate.not_before(),
            not_after: certificate.not_after(),
            trust_attributes,
            has_private_key,
            serial: certificate.serial(),
            issuer_cn: certificate.issuer_common_name().to_string(),
            is_ca: certificate.is_ca(),
            fingerprint: certificate.fingerprint(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// Still valid at `now` but expiring before `now + window`.
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        !self.is_expired_at(now) && now + window >= self.not_after
    }
}
