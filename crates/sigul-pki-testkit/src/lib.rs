//! # Sigul PKI Testkit
//!
//! Testing utilities for Sigul PKI.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a complete deployment in a temporary directory, with
//!   SQLite stores and real export artifacts
//! - **Generators**: Proptest strategies for principals and deployments
//! - **Scenarios**: end-to-end tests under `tests/`
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use sigul_pki::Mode;
//! use sigul_pki_testkit::DeploymentFixture;
//!
//! async fn example() {
//!     let fixture = DeploymentFixture::new();
//!     fixture.provision_all(Mode::Auto).await.unwrap();
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use sigul_pki_testkit::generators::DeploymentParams;
//!
//! proptest! {
//!     #[test]
//!     fn deployment_validates(params: DeploymentParams) {
//!         prop_assert!(params.config().validate().is_ok());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{fqdn_for, principal, standard_principals, DeploymentFixture, OPEN_PASSWORD};
pub use generators::DeploymentParams;
