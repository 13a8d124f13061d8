//! Error taxonomy for provisioning runs.
//!
//! Every error names the principal, the step and the kind that failed, which
//! is enough to decide between "rerun" and "rerun with force".

use std::fmt;

use sigul_pki_store::StoreError;
use thiserror::Error;

/// Process exit codes.
pub mod exit {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    /// Upstream not ready yet (EX_TEMPFAIL).
    pub const RETRY: u8 = 75;
    /// Dependent services must not start.
    pub const SECURITY_VIOLATION: u8 = 78;
}

/// The step of a run that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Configure,
    OpenStore,
    Reconcile,
    Reset,
    GenerateAuthority,
    GenerateLeaf,
    Export,
    WriteArtifacts,
    ReadArtifacts,
    ImportAuthority,
    ImportLeaf,
    Verify,
    Audit,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Configure => "configure",
            Step::OpenStore => "open-store",
            Step::Reconcile => "reconcile",
            Step::Reset => "reset",
            Step::GenerateAuthority => "generate-authority",
            Step::GenerateLeaf => "generate-leaf",
            Step::Export => "export",
            Step::WriteArtifacts => "write-artifacts",
            Step::ReadArtifacts => "read-artifacts",
            Step::ImportAuthority => "import-authority",
            Step::ImportLeaf => "import-leaf",
            Step::Verify => "verify",
            Step::Audit => "audit",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong, by taxonomy kind.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A store cannot be opened or used, or upstream is not ready.
    #[error("store access error: {message}")]
    StoreAccess { message: String, retryable: bool },

    /// Key generation or signing failed.
    #[error("generation error: {0}")]
    Generation(String),

    #[error("export error: {0}")]
    Export(String),

    /// Bad transport password, corrupt bundle or unexpected bundle content.
    #[error("import error: {0}")]
    Import(String),

    /// A private key where it must never be.
    #[error("security invariant violation: {0}")]
    SecurityInvariantViolation(String),

    #[error("expiry error: {0}")]
    Expiry(String),
}

impl ErrorKind {
    /// Non-retryable store access failure.
    pub fn store_access(message: impl Into<String>) -> Self {
        ErrorKind::StoreAccess {
            message: message.into(),
            retryable: false,
        }
    }

    /// The authority has not produced what this principal needs yet.
    pub fn not_ready(message: impl Into<String>) -> Self {
        ErrorKind::StoreAccess {
            message: message.into(),
            retryable: true,
        }
    }

    /// A published bundle whose transport password is gone. Retrying the
    /// consumer cannot help; the authority has to export again.
    pub fn password_consumed(path: &std::path::Path) -> Self {
        ErrorKind::Import(format!(
            "transport password {} was already consumed; rerun the authority to re-export the bundle",
            path.display()
        ))
    }

    /// Classify a store error.
    ///
    /// Errors about reaching the store itself become `StoreAccess`; anything
    /// else is attributed to the step through `fallback`.
    pub fn from_store(e: StoreError, fallback: impl FnOnce(String) -> ErrorKind) -> Self {
        match &e {
            StoreError::Locked(_) => ErrorKind::StoreAccess {
                message: e.to_string(),
                retryable: true,
            },
            StoreError::Missing(_)
            | StoreError::WrongPassword
            | StoreError::Database(_)
            | StoreError::Migration(_)
            | StoreError::Task(_)
            | StoreError::Io(_) => ErrorKind::store_access(e.to_string()),
            _ => fallback(e.to_string()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Configuration(_) => "ConfigurationError",
            ErrorKind::StoreAccess { .. } => "StoreAccessError",
            ErrorKind::Generation(_) => "GenerationError",
            ErrorKind::Export(_) => "ExportError",
            ErrorKind::Import(_) => "ImportError",
            ErrorKind::SecurityInvariantViolation(_) => "SecurityInvariantViolation",
            ErrorKind::Expiry(_) => "ExpiryError",
        }
    }
}

/// A failed provisioning step.
#[derive(Debug, Error)]
#[error("principal {principal}: step {step} failed: {kind}")]
pub struct ProvisionError {
    pub principal: String,
    pub step: Step,
    pub kind: ErrorKind,
}

impl ProvisionError {
    pub fn new(principal: impl Into<String>, step: Step, kind: ErrorKind) -> Self {
        Self {
            principal: principal.into(),
            step,
            kind,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::StoreAccess { retryable: true, .. })
    }

    pub fn is_security_violation(&self) -> bool {
        matches!(self.kind, ErrorKind::SecurityInvariantViolation(_))
    }

    /// Whether rerunning with `mode = force` is the expected remedy.
    pub fn needs_force(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::StoreAccess { retryable: false, .. }
                | ErrorKind::Generation(_)
                | ErrorKind::Expiry(_)
        )
    }

    pub fn exit_code(&self) -> u8 {
        match self.kind {
            ErrorKind::Configuration(_) => exit::CONFIGURATION,
            ErrorKind::StoreAccess { retryable: true, .. } => exit::RETRY,
            ErrorKind::SecurityInvariantViolation(_) => exit::SECURITY_VIOLATION,
            _ => exit::FAILURE,
        }
    }
}

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
