//! X.509 certificates issued by the deployment's private authority.
//!
//! Issuance goes through `rcgen`; every certificate, whether freshly issued
//! or read back from a store or an export directory, is parsed with
//! `x509-parser` into an owned [`Certificate`] that keeps its DER bytes.

use chrono::{DateTime, Months, TimeZone, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose,
    SerialNumber,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::x509::{X509Name, X509Version};

use crate::crypto::{Blake3Hash, Keypair, PublicKey};
use crate::error::CoreError;
use crate::types::{Serial, ValidityMonths};

/// PEM label used for armored certificates.
pub const CERTIFICATE_PEM_TAG: &str = "CERTIFICATE";

/// Extended key usage granted to a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendedKeyUsage {
    /// TLS server authentication.
    ServerAuth,
    /// TLS client authentication.
    ClientAuth,
}

impl ExtendedKeyUsage {
    fn purpose(self) -> ExtendedKeyUsagePurpose {
        match self {
            ExtendedKeyUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
        }
    }
}

/// Subject or issuer name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistinguishedName {
    pub common_name: String,
    pub organization: Option<String>,
}

impl DistinguishedName {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    fn to_rcgen(&self) -> rcgen::DistinguishedName {
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.as_str());
        if let Some(org) = &self.organization {
            dn.push(DnType::OrganizationName, org.as_str());
        }
        dn
    }

    fn from_x509(name: &X509Name<'_>) -> Result<Self, CoreError> {
        let common_name = name
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .ok_or_else(|| CoreError::MalformedCertificate("name has no common name".into()))?;
        let organization = name
            .iter_organization()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string);
        Ok(Self {
            common_name: common_name.to_string(),
            organization,
        })
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CN={}", self.common_name)?;
        if let Some(org) = &self.organization {
            write!(f, ",O={org}")?;
        }
        Ok(())
    }
}

/// A parsed X.509 v3 certificate together with its DER encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    serial: Serial,
    subject: DistinguishedName,
    issuer: DistinguishedName,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    subject_alt_names: Vec<String>,
    extended_key_usage: Vec<ExtendedKeyUsage>,
    is_ca: bool,
    public_key: PublicKey,
}

pub(crate) fn parse_der(der: &[u8]) -> Result<X509Certificate<'_>, CoreError> {
    let (rest, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| CoreError::DecodingError(e.to_string()))?;
    if !rest.is_empty() {
        return Err(CoreError::DecodingError(format!(
            "{} trailing bytes after certificate",
            rest.len()
        )));
    }
    Ok(cert)
}

fn unix_to_datetime(secs: i64) -> Result<DateTime<Utc>, CoreError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| CoreError::MalformedCertificate(format!("time {secs} out of range")))
}

impl Certificate {
    /// Parse a DER-encoded certificate.
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self, CoreError> {
        let der = der.into();
        let parsed = parse_der(&der)?;

        if parsed.version() != X509Version::V3 {
            return Err(CoreError::UnsupportedVersion(parsed.version().0 + 1));
        }

        let serial = Serial::from_der_integer(parsed.raw_serial()).ok_or_else(|| {
            CoreError::MalformedCertificate("serial longer than 16 bytes".into())
        })?;

        let ext_error = |e: x509_parser::error::X509Error| CoreError::MalformedCertificate(e.to_string());

        let is_ca = parsed
            .basic_constraints()
            .map_err(ext_error)?
            .map(|bc| bc.value.ca)
            .unwrap_or(false);

        let subject_alt_names = parsed
            .subject_alternative_name()
            .map_err(ext_error)?
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(dns.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut extended_key_usage = Vec::new();
        if let Some(eku) = parsed.extended_key_usage().map_err(ext_error)? {
            if eku.value.server_auth {
                extended_key_usage.push(ExtendedKeyUsage::ServerAuth);
            }
            if eku.value.client_auth {
                extended_key_usage.push(ExtendedKeyUsage::ClientAuth);
            }
        }

        let validity = parsed.validity();
        Ok(Self {
            der: der.clone(),
            serial,
            subject: DistinguishedName::from_x509(parsed.subject())?,
            issuer: DistinguishedName::from_x509(parsed.issuer())?,
            not_before: unix_to_datetime(validity.not_before.timestamp())?,
            not_after: unix_to_datetime(validity.not_after.timestamp())?,
            subject_alt_names,
            extended_key_usage,
            is_ca,
            public_key: PublicKey::from_bytes(parsed.public_key().subject_public_key.data.to_vec()),
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Armor as PEM (`-----BEGIN CERTIFICATE-----`, LF line endings).
    pub fn to_pem(&self) -> String {
        let block = pem::Pem::new(CERTIFICATE_PEM_TAG, self.der.clone());
        pem::encode_config(
            &block,
            pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        )
    }

    /// Parse a single PEM-armored certificate.
    pub fn from_pem(text: &str) -> Result<Self, CoreError> {
        let block = pem::parse(text).map_err(|e| CoreError::DecodingError(e.to_string()))?;
        if block.tag() != CERTIFICATE_PEM_TAG {
            return Err(CoreError::MalformedCertificate(format!(
                "unexpected PEM label {:?}",
                block.tag()
            )));
        }
        Self::from_der(block.contents())
    }

    /// Blake3 fingerprint of the DER encoding.
    pub fn fingerprint(&self) -> Blake3Hash {
        Blake3Hash::hash(&self.der)
    }

    /// Verify this certificate's signature under `issuer`'s public key.
    pub fn verify_signature(&self, issuer: &Certificate) -> Result<(), CoreError> {
        let cert = parse_der(&self.der)?;
        let parent = parse_der(&issuer.der)?;
        cert.verify_signature(Some(parent.public_key()))
            .map_err(|_| CoreError::InvalidSignature)
    }

    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    pub fn issuer(&self) -> &DistinguishedName {
        &self.issuer
    }

    pub fn common_name(&self) -> &str {
        &self.subject.common_name
    }

    pub fn issuer_common_name(&self) -> &str {
        &self.issuer.common_name
    }

    pub fn subject_alt_names(&self) -> &[String] {
        &self.subject_alt_names
    }

    pub fn extended_key_usage(&self) -> &[ExtendedKeyUsage] {
        &self.extended_key_usage
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    /// Issued by itself, with a signature made by its own key.
    pub fn is_self_signed(&self) -> bool {
        self.subject == self.issuer && self.verify_signature(self).is_ok()
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }
}

fn issuance(e: rcgen::Error) -> CoreError {
    CoreError::IssuanceError(e.to_string())
}

fn to_offset(at: DateTime<Utc>) -> Result<time::OffsetDateTime, CoreError> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| CoreError::InvalidValidity(e.to_string()))
}

/// Builder for issuing certificates.
pub struct CertificateBuilder {
    subject: DistinguishedName,
    serial: Option<Serial>,
    not_before: Option<DateTime<Utc>>,
    validity: Option<ValidityMonths>,
    subject_alt_names: Vec<String>,
    extended_key_usage: Vec<ExtendedKeyUsage>,
    is_ca: bool,
}

impl CertificateBuilder {
    pub fn new(subject: DistinguishedName) -> Self {
        Self {
            subject,
            serial: None,
            not_before: None,
            validity: None,
            subject_alt_names: Vec::new(),
            extended_key_usage: Vec::new(),
            is_ca: false,
        }
    }

    /// Use a fixed serial instead of a random one.
    pub fn serial(mut self, serial: Serial) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Set the start of validity. Defaults to now.
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn validity(mut self, months: ValidityMonths) -> Self {
        self.validity = Some(months);
        self
    }

    pub fn subject_alt_name(mut self, name: impl Into<String>) -> Self {
        self.subject_alt_names.push(name.into());
        self
    }

    pub fn extended_key_usage(mut self, usages: impl IntoIterator<Item = ExtendedKeyUsage>) -> Self {
        self.extended_key_usage.extend(usages);
        self
    }

    pub fn certificate_authority(mut self, is_ca: bool) -> Self {
        self.is_ca = is_ca;
        self
    }

    fn params(self) -> Result<CertificateParams, CoreError> {
        let validity = self
            .validity
            .ok_or_else(|| CoreError::InvalidValidity("validity period not set".into()))?;
        let not_before = self.not_before.unwrap_or_else(Utc::now);
        let not_after = not_before
            .checked_add_months(Months::new(validity.get()))
            .ok_or_else(|| {
                CoreError::InvalidValidity(format!("{} months overflows the calendar", validity.get()))
            })?;

        let mut params = CertificateParams::new(self.subject_alt_names).map_err(issuance)?;
        params.distinguished_name = self.subject.to_rcgen();
        let serial = self.serial.unwrap_or_else(Serial::generate);
        params.serial_number = Some(SerialNumber::from(serial.as_bytes().to_vec()));
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;

        if self.is_ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
        } else {
            let mut usages = self.extended_key_usage;
            usages.sort();
            usages.dedup();
            params.is_ca = IsCa::ExplicitNoCa;
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
            params.extended_key_usages = usages.into_iter().map(ExtendedKeyUsage::purpose).collect();
        }
        Ok(params)
    }

    /// Sign with the subject's own key.
    pub fn self_sign(self, keypair: &Keypair) -> Result<Certificate, CoreError> {
        let key = keypair.signing_key()?;
        let cert = self.params()?.self_signed(&key).map_err(issuance)?;
        Certificate::from_der(cert.der().to_vec())
    }

    /// Sign `subject_key`'s certificate with the issuing authority's key.
    pub fn sign(
        self,
        subject_key: &Keypair,
        issuer: &Certificate,
        issuer_key: &Keypair,
    ) -> Result<Certificate, CoreError> {
        if !issuer.is_ca() {
            return Err(CoreError::IssuanceError(format!(
                "{} is not a certificate authority",
                issuer.subject()
            )));
        }
        if issuer_key.public_key() != issuer.public_key() {
            return Err(CoreError::IssuanceError(
                "issuer key does not match issuer certificate".into(),
            ));
        }

        // rcgen signs against an issuer `Certificate`; rebuilding one from
        // the issuer's name and key yields the same issuer DN and key id.
        let issuer_signing = issuer_key.signing_key()?;
        let mut issuer_params = CertificateParams::default();
        issuer_params.distinguished_name = issuer.subject().to_rcgen();
        issuer_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let issuer_cert = issuer_params.self_signed(&issuer_signing).map_err(issuance)?;

        let subject_signing = subject_key.signing_key()?;
        let cert = self
            .params()?
            .signed_by(&subject_signing, &issuer_cert, &issuer_signing)
            .map_err(issuance)?;
        Certificate::from_der(cert.der().to_vec())
    }
}
