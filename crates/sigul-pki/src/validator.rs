//! Invariant validation of credential stores.
//!
//! Runs after every provisioning step and on demand. A store is checked
//! against an [`Expectation`] built from the deployment: which certificates
//! must be there, with which trust, and where a private key is required or
//! forbidden. [`audit`] additionally checks the deployment-wide rule that
//! exactly one store holds the authority key.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use sigul_pki_core::{
    verify_issued_by, Certificate, CertificateRecord, Fqdn, Nickname, Principal, TrustAttributes,
    TrustPolicy, TrustSubject, AUTHORITY_COMMON_NAME,
};
use sigul_pki_store::{CredentialStore, StoreError};

use crate::error::{ErrorKind, ProvisionError, Step};

/// Default warning window before a certificate expires.
pub const DEFAULT_EXPIRY_WARNING_DAYS: i64 = 30;

/// Whether a store must or must not hold the key of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRule {
    Required,
    Forbidden,
}

/// One certificate a store must contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedEntry {
    pub nickname: Nickname,
    pub subject: TrustSubject,
    /// Subject CN and only SAN, for leaves.
    pub fqdn: Option<Fqdn>,
    pub trust: TrustAttributes,
    pub key: KeyRule,
}

impl ExpectedEntry {
    fn authority(in_authority_store: bool) -> Self {
        Self {
            nickname: Principal::authority_nickname(),
            subject: TrustSubject::AuthorityRoot,
            fqdn: None,
            trust: TrustPolicy::attributes_for(TrustSubject::AuthorityRoot, in_authority_store),
            key: if in_authority_store {
                KeyRule::Required
            } else {
                KeyRule::Forbidden
            },
        }
    }

    fn leaf(principal: &Principal, in_authority_store: bool) -> Self {
        Self {
            nickname: principal.leaf_nickname(),
            subject: principal.leaf_subject(),
            fqdn: Some(principal.fqdn.clone()),
            trust: TrustPolicy::attributes_for(principal.leaf_subject(), in_authority_store),
            key: KeyRule::Required,
        }
    }
}

/// What one principal's store should look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub principal: String,
    pub authority_store: bool,
    pub entries: Vec<ExpectedEntry>,
}

impl Expectation {
    /// The authority store: root with key plus a leaf with key per principal.
    pub fn for_authority(authority: &Principal, principals: &[Principal]) -> Self {
        let mut entries = vec![ExpectedEntry::authority(true)];
        entries.extend(principals.iter().map(|p| ExpectedEntry::leaf(p, true)));
        Self {
            principal: authority.name.clone(),
            authority_store: true,
            entries,
        }
    }

    /// A consumer store: the root without key and the principal's own leaf.
    pub fn for_principal(principal: &Principal) -> Self {
        Self {
            principal: principal.name.clone(),
            authority_store: false,
            entries: vec![ExpectedEntry::authority(false), ExpectedEntry::leaf(principal, false)],
        }
    }

    /// The expectation for any member of a deployment.
    pub fn for_member(principal: &Principal, principals: &[Principal]) -> Self {
        if principal.is_authority() {
            Self::for_authority(principal, principals)
        } else {
            Self::for_principal(principal)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Violation,
}

/// A discrepancy between a store and its expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    MissingCertificate {
        nickname: Nickname,
    },
    MissingPrivateKey {
        nickname: Nickname,
    },
    WrongTrustAttributes {
        nickname: Nickname,
        expected: TrustAttributes,
        actual: TrustAttributes,
    },
    /// A key where none may exist. Always fatal on its own.
    ForbiddenPrivateKeyPresent {
        nickname: Nickname,
    },
    SubjectMismatch {
        nickname: Nickname,
        expected: String,
        actual: String,
    },
    Expired {
        nickname: Nickname,
        not_after: DateTime<Utc>,
    },
    /// The certificate does not verify against the authority certificate.
    ChainInvalid {
        nickname: Nickname,
        reason: String,
    },
    /// Valid, but expires inside the warning window.
    ExpiringSoon {
        nickname: Nickname,
        not_after: DateTime<Utc>,
    },
}

impl Finding {
    pub fn nickname(&self) -> &Nickname {
        match self {
            Finding::MissingCertificate { nickname }
            | Finding::MissingPrivateKey { nickname }
            | Finding::WrongTrustAttributes { nickname, .. }
            | Finding::ForbiddenPrivateKeyPresent { nickname }
            | Finding::SubjectMismatch { nickname, .. }
            | Finding::Expired { nickname, .. }
            | Finding::ChainInvalid { nickname, .. }
            | Finding::ExpiringSoon { nickname, .. } => nickname,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Finding::ExpiringSoon { .. } => Severity::Warning,
            _ => Severity::Violation,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Finding::MissingCertificate { .. } => "MissingCertificate",
            Finding::MissingPrivateKey { .. } => "MissingPrivateKey",
            Finding::WrongTrustAttributes { .. } => "WrongTrustAttributes",
            Finding::ForbiddenPrivateKeyPresent { .. } => "ForbiddenPrivateKeyPresent",
            Finding::SubjectMismatch { .. } => "SubjectMismatch",
            Finding::Expired { .. } => "Expired",
            Finding::ChainInvalid { .. } => "ChainInvalid",
            Finding::ExpiringSoon { .. } => "ExpiringSoon",
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.nickname())?;
        match self {
            Finding::WrongTrustAttributes { expected, actual, .. } => {
                write!(f, ": expected {expected}, found {actual}")
            }
            Finding::SubjectMismatch { expected, actual, .. } => {
                write!(f, ": expected {expected}, found {actual}")
            }
            Finding::Expired { not_after, .. } => write!(f, ": expired {not_after}"),
            Finding::ExpiringSoon { not_after, .. } => write!(f, ": expires {not_after}"),
            Finding::ChainInvalid { reason, .. } => write!(f, ": {reason}"),
            _ => Ok(()),
        }
    }
}

/// Outcome of verifying one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Violation(Vec<Finding>),
}

/// All findings for one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub principal: String,
    pub findings: Vec<Finding>,
}

impl Report {
    pub fn violations(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity() == Severity::Violation)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity() == Severity::Warning)
    }

    pub fn is_ok(&self) -> bool {
        self.violations().next().is_none()
    }

    pub fn verdict(&self) -> Verdict {
        let violations: Vec<_> = self.violations().cloned().collect();
        if violations.is_empty() {
            Verdict::Ok
        } else {
            Verdict::Violation(violations)
        }
    }

    pub fn has_forbidden_key(&self) -> bool {
        self.findings
            .iter()
            .any(|f| matches!(f, Finding::ForbiddenPrivateKeyPresent { .. }))
    }

    /// Turn violations into the matching error kind.
    ///
    /// A forbidden key wins over everything else, then expiry; any other
    /// violation means the store must be reprovisioned with force.
    pub fn into_result(self, step: Step) -> Result<Report, ProvisionError> {
        fn join<'a>(findings: impl Iterator<Item = &'a Finding>) -> String {
            findings.map(ToString::to_string).collect::<Vec<_>>().join("; ")
        }

        let kind = if self.has_forbidden_key() {
            ErrorKind::SecurityInvariantViolation(join(
                self.findings
                    .iter()
                    .filter(|f| matches!(f, Finding::ForbiddenPrivateKeyPresent { .. })),
            ))
        } else if self.findings.iter().any(|f| matches!(f, Finding::Expired { .. })) {
            ErrorKind::Expiry(join(self.violations()))
        } else if !self.is_ok() {
            ErrorKind::store_access(format!(
                "store does not match the deployment ({}); rerun with mode=force",
                join(self.violations())
            ))
        } else {
            return Ok(self);
        };

        Err(ProvisionError::new(self.principal, step, kind))
    }
}

/// Checks stores against their expectation.
#[derive(Debug, Clone)]
pub struct InvariantValidator {
    now: Option<DateTime<Utc>>,
    warning_window: Duration,
    trusted_authority: Option<Certificate>,
}

impl Default for InvariantValidator {
    fn default() -> Self {
        Self {
            now: None,
            warning_window: Duration::days(DEFAULT_EXPIRY_WARNING_DAYS),
            trusted_authority: None,
        }
    }
}

fn find<'a>(records: &'a [CertificateRecord], nickname: &Nickname) -> Option<&'a CertificateRecord> {
    records.iter().find(|r| r.nickname == *nickname)
}

impl InvariantValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate expiry at a fixed instant instead of the current time.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn warning_window(mut self, window: Duration) -> Self {
        self.warning_window = window;
        self
    }

    /// Check chains against this authority certificate instead of the one
    /// in the store, and require the store's copy to be identical to it.
    pub fn trusting(mut self, authority: Certificate) -> Self {
        self.trusted_authority = Some(authority);
        self
    }

    pub async fn verify(
        &self,
        store: &dyn CredentialStore,
        expected: &Expectation,
    ) -> Result<Report, StoreError> {
        let now = self.now.unwrap_or_else(Utc::now);
        let records = store.list_certificates().await?;
        let authority = Principal::authority_nickname();
        let stored_authority = store.certificate(&authority).await?;
        let mut findings = Vec::new();

        if let (Some(trusted), Some(stored)) = (&self.trusted_authority, &stored_authority) {
            if trusted != stored {
                findings.push(Finding::ChainInvalid {
                    nickname: authority.clone(),
                    reason: format!(
                        "serial {} differs from the published authority serial {}",
                        stored.serial(),
                        trusted.serial()
                    ),
                });
            }
        }
        let anchor = self.trusted_authority.as_ref().or(stored_authority.as_ref());

        for entry in &expected.entries {
            let Some(record) = find(&records, &entry.nickname) else {
                findings.push(Finding::MissingCertificate {
                    nickname: entry.nickname.clone(),
                });
                continue;
            };

            match (entry.key, record.has_private_key) {
                (KeyRule::Required, false) => findings.push(Finding::MissingPrivateKey {
                    nickname: entry.nickname.clone(),
                }),
                (KeyRule::Forbidden, true) => findings.push(Finding::ForbiddenPrivateKeyPresent {
                    nickname: entry.nickname.clone(),
                }),
                _ => {}
            }

            if record.trust_attributes != entry.trust {
                findings.push(Finding::WrongTrustAttributes {
                    nickname: entry.nickname.clone(),
                    expected: entry.trust,
                    actual: record.trust_attributes,
                });
            }

            findings.extend(check_subject(entry, record));

            if record.is_expired_at(now) {
                findings.push(Finding::Expired {
                    nickname: entry.nickname.clone(),
                    not_after: record.not_after,
                });
            } else if record.expires_within(now, self.warning_window) {
                findings.push(Finding::ExpiringSoon {
                    nickname: entry.nickname.clone(),
                    not_after: record.not_after,
                });
            }

            if let Some(certificate) = store.certificate(&entry.nickname).await? {
                let issuer = match entry.subject {
                    TrustSubject::AuthorityRoot => Some(&certificate),
                    TrustSubject::Leaf(_) => anchor,
                };
                if let Some(issuer) = issuer {
                    if let Err(e) = verify_issued_by(&certificate, issuer) {
                        findings.push(Finding::ChainInvalid {
                            nickname: entry.nickname.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        // Any CA key outside the authority store, whatever its nickname.
        if !expected.authority_store {
            for record in &records {
                if record.is_ca && record.has_private_key && record.nickname != authority {
                    findings.push(Finding::ForbiddenPrivateKeyPresent {
                        nickname: record.nickname.clone(),
                    });
                }
            }
        }

        let report = Report {
            principal: expected.principal.clone(),
            findings,
        };
        log_report(&report);
        Ok(report)
    }
}

fn check_subject(entry: &ExpectedEntry, record: &CertificateRecord) -> Option<Finding> {
    let mismatch = |expected: String, actual: String| Finding::SubjectMismatch {
        nickname: entry.nickname.clone(),
        expected,
        actual,
    };

    match &entry.fqdn {
        None => {
            if record.subject_cn != AUTHORITY_COMMON_NAME || !record.is_ca {
                return Some(mismatch(
                    format!("CA {AUTHORITY_COMMON_NAME}"),
                    format!("{}{}", if record.is_ca { "CA " } else { "" }, record.subject_cn),
                ));
            }
        }
        Some(fqdn) => {
            if record.subject_cn != fqdn.as_str() {
                return Some(mismatch(fqdn.to_string(), record.subject_cn.clone()));
            }
            if record.subject_alt_names.len() != 1 || record.subject_alt_names[0] != fqdn.as_str() {
                return Some(mismatch(
                    format!("SAN {fqdn}"),
                    format!("SAN {}", record.subject_alt_names.join(",")),
                ));
            }
        }
    }
    None
}

fn log_report(report: &Report) {
    for finding in &report.findings {
        match finding.severity() {
            Severity::Warning => tracing::warn!(
                principal = %report.principal,
                nickname = %finding.nickname(),
                finding = finding.kind(),
                "{finding}"
            ),
            Severity::Violation => tracing::error!(
                principal = %report.principal,
                nickname = %finding.nickname(),
                finding = finding.kind(),
                "{finding}"
            ),
        }
    }
    if report.is_ok() {
        tracing::info!(principal = %report.principal, "store verified");
    }
}

/// Result of auditing a whole deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub reports: Vec<Report>,
    /// Principals whose store holds the authority private key.
    pub authority_key_holders: Vec<String>,
    pub authority: String,
}

impl AuditReport {
    /// Exactly the authority holds the authority key.
    pub fn key_is_unique(&self) -> bool {
        self.authority_key_holders == [self.authority.clone()]
    }

    pub fn is_ok(&self) -> bool {
        self.key_is_unique() && self.reports.iter().all(Report::is_ok)
    }

    pub fn into_result(self) -> Result<AuditReport, ProvisionError> {
        let stray: Vec<_> = self
            .authority_key_holders
            .iter()
            .filter(|h| **h != self.authority)
            .cloned()
            .collect();
        if !stray.is_empty() {
            return Err(ProvisionError::new(
                stray.join(","),
                Step::Audit,
                ErrorKind::SecurityInvariantViolation(format!(
                    "authority private key held outside {}",
                    self.authority
                )),
            ));
        }
        if !self.authority_key_holders.contains(&self.authority) {
            return Err(ProvisionError::new(
                self.authority.clone(),
                Step::Audit,
                ErrorKind::store_access("authority private key not held by the authority store"),
            ));
        }
        for report in &self.reports {
            report.clone().into_result(Step::Audit)?;
        }
        Ok(self)
    }
}

/// Audit every store of a deployment.
pub async fn audit(
    validator: &InvariantValidator,
    principals: &[Principal],
    stores: &[(&Principal, &dyn CredentialStore)],
) -> Result<AuditReport, StoreError> {
    let authority_nickname = Principal::authority_nickname();
    let mut reports = Vec::with_capacity(stores.len());
    let mut holders = Vec::new();
    let mut authority = String::new();

    for (principal, store) in stores {
        if principal.is_authority() {
            authority = principal.name.clone();
        }
        if store.has_private_key(&authority_nickname).await? {
            holders.push(principal.name.clone());
        }
        let expected = Expectation::for_member(principal, principals);
        reports.push(validator.verify(*store, &expected).await?);
    }

    if holders.len() != 1 {
        tracing::error!(holders = ?holders, "authority key is not held by exactly one store");
    }

    Ok(AuditReport {
        reports,
        authority_key_holders: holders,
        authority,
    })
}
