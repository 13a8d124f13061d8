//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: a throwaway deployment rooted in
//! a temporary directory, with SQLite stores and real export artifacts.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use sigul_pki::config::PrincipalConfig;
use sigul_pki::{
    open_store, run_authority, run_principal, AuthorityRun, Deployment, DeploymentConfig,
    DeploymentPlan, Mode, ProvisionOutcome, Result,
};
use sigul_pki_core::{Fqdn, Principal, Role, ValidityMonths};
use sigul_pki_store::SqliteCredentialStore;
use sigul_pki_transport::{ArtifactLayout, StorePassword};
use tempfile::TempDir;

/// Open password shared by every store of a fixture.
pub const OPEN_PASSWORD: &str = "sigul-testkit-open-password";

/// FQDN used for a principal name in fixtures.
pub fn fqdn_for(name: &str) -> String {
    format!("sigul-{name}.example.org")
}

/// A principal with the fixture FQDN and a 24 month leaf.
pub fn principal(name: &str, role: Role) -> Principal {
    Principal::new(
        name,
        role,
        Fqdn::new(fqdn_for(name)).expect("fixture fqdn is valid"),
        ValidityMonths::new(24).expect("fixture validity is valid"),
    )
}

/// The bridge, server and client of a standard deployment.
pub fn standard_principals() -> Vec<Principal> {
    vec![
        principal("bridge", Role::Authority),
        principal("server", Role::Server),
        principal("client", Role::Client),
    ]
}

/// A complete deployment in a temporary directory.
///
/// Stores are opened per call and closed when dropped, the way separate
/// principal processes would use them.
pub struct DeploymentFixture {
    dir: TempDir,
    pub deployment: Deployment,
    pub password: StorePassword,
}

impl DeploymentFixture {
    /// Standard three-principal deployment.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Standard deployment, adjusted by `configure` before validation.
    pub fn with_config(configure: impl FnOnce(&mut DeploymentConfig)) -> Self {
        let dir = tempfile::tempdir().expect("create fixture dir");
        let mut config = DeploymentConfig {
            store_root: dir.path().join("nss"),
            export_root: dir.path().join("ca-export"),
            secrets_root: dir.path().join("secrets"),
            principals: standard_principals()
                .into_iter()
                .map(|p| PrincipalConfig {
                    name: p.name,
                    role: p.role,
                    fqdn: p.fqdn.to_string(),
                    validity_months: None,
                })
                .collect(),
            ..DeploymentConfig::default()
        };
        configure(&mut config);

        Self {
            dir,
            deployment: config.validate().expect("fixture config is valid"),
            password: StorePassword::new(OPEN_PASSWORD),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.deployment.layout
    }

    pub fn principal(&self, name: &str) -> &Principal {
        self.deployment.principal(name).expect("fixture principal")
    }

    /// Open a principal's store as `mode` would.
    pub fn store(&self, name: &str, mode: Mode) -> Result<SqliteCredentialStore> {
        open_store(&self.deployment, self.principal(name), &self.password, mode)
    }

    /// Run the authority process once: provision, then export.
    pub async fn provision_authority(&self, mode: Mode) -> Result<AuthorityRun> {
        let store = self.store(&self.deployment.authority().name, mode)?;
        run_authority(&self.deployment, &store, &self.password, mode).await
    }

    /// Run one consumer process once.
    pub async fn provision_principal(&self, name: &str, mode: Mode) -> Result<ProvisionOutcome> {
        let store = self.store(name, mode)?;
        let plan = DeploymentPlan::new(&self.deployment);
        run_principal(&self.deployment, &plan, self.principal(name), &store, mode).await
    }

    /// Run every principal in order, as separate processes would.
    pub async fn provision_all(&self, mode: Mode) -> Result<Vec<ProvisionOutcome>> {
        let mut outcomes = vec![self.provision_authority(mode).await?.outcome];
        for principal in self.deployment.consumers() {
            outcomes.push(self.provision_principal(&principal.name, mode).await?);
        }
        Ok(outcomes)
    }

    /// Every file under the export and secrets roots.
    pub fn artifact_files(&self) -> BTreeSet<PathBuf> {
        let mut files = BTreeSet::new();
        collect_files(self.layout().export_root(), &mut files);
        collect_files(self.layout().secrets_root(), &mut files);
        files
    }
}

impl Default for DeploymentFixture {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_files(dir: &Path, files: &mut BTreeSet<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, files);
        } else {
            files.insert(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_layout_is_inside_tempdir() {
        let fixture = DeploymentFixture::new();
        assert!(fixture.layout().export_root().starts_with(fixture.root()));
        assert!(fixture.deployment.store_dir(fixture.principal("server")).starts_with(fixture.root()));
        assert_eq!(fixture.deployment.authority().name, "bridge");
        assert!(fixture.artifact_files().is_empty());
    }

    #[test]
    fn test_with_config_overrides() {
        let fixture = DeploymentFixture::with_config(|c| c.leaf_validity_months = 6);
        assert_eq!(fixture.principal("client").validity.get(), 6);
    }

    #[tokio::test]
    async fn test_provision_all() {
        let fixture = DeploymentFixture::new();
        let outcomes = fixture.provision_all(Mode::Auto).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(!fixture.artifact_files().is_empty());
    }
}
