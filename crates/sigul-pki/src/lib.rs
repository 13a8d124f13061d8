//! # Sigul PKI
//!
//! Certificate lifecycle orchestration for the Sigul signing stack.
//!
//! ## Overview
//!
//! One principal, the bridge, is the certificate authority. It generates the
//! root and every leaf inside its own credential store. Each consumer (server,
//! client) then imports its leaf from a sealed bundle. The root private key
//! never leaves the authority store, and every run ends by checking that.
//!
//! - **Authority**: root and leaf generation ([`AuthorityProvisioner`])
//! - **Export**: per-consumer bundles under single-use passwords ([`ExportBundler`])
//! - **Import**: consumer provisioning from the artifacts ([`PrincipalProvisioner`])
//! - **Audit**: per-store and deployment-wide invariants ([`InvariantValidator`])
//!
//! ## Modes
//!
//! - `auto`: generate or import only what is missing; never overwrite.
//! - `force`: destroy and recreate the store, then provision from scratch.
//! - `skip`: verify only.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sigul_pki::{deploy, DeploymentConfig, Mode};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let deployment = DeploymentConfig::load("/etc/sigul/pki.toml".as_ref())?.validate()?;
//!     let password = deployment.password.resolve()?;
//!
//!     let report = deploy(&deployment, &password, Mode::Auto).await?;
//!     assert!(report.audit.key_is_unique());
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `sigul_pki::core` - Principals, certificates, trust policy
//! - `sigul_pki::store` - Credential store trait and backends
//! - `sigul_pki::transport` - Sealed bundles and artifact layout

pub mod authority;
pub mod config;
pub mod deployment;
pub mod error;
pub mod export;
pub mod plan;
pub mod principal;
pub mod state;
pub mod validator;

// Re-export component crates
pub use sigul_pki_core as core;
pub use sigul_pki_store as store;
pub use sigul_pki_transport as transport;

// Re-export main types for convenience
pub use authority::AuthorityProvisioner;
pub use config::{Deployment, DeploymentConfig, Mode, PasswordSource};
pub use deployment::{
    audit_stores, deploy, open_store, run_authority, run_principal, AuthorityRun, DeploymentPlan,
    DeploymentReport, Readiness,
};
pub use error::{exit, ErrorKind, ProvisionError, Result, Step};
pub use export::{AuthorityCertificate, ExportBundle, ExportBundler, LeafTransport, Payload};
pub use plan::{Action, Conflict, Plan};
pub use principal::PrincipalProvisioner;
pub use state::{ProvisionOutcome, ProvisioningState, StateMachine, Transition};
pub use validator::{
    audit, AuditReport, Expectation, Finding, InvariantValidator, Report, Severity, Verdict,
};

// Re-export commonly used core types
pub use sigul_pki_core::{Fqdn, Nickname, Principal, Role, TrustAttributes, TrustPolicy};
pub use sigul_pki_transport::StorePassword;
