//! Whole-deployment runs: ordering, authority export and the final audit.
//!
//! Principals normally provision as separate processes. `deploy` runs them
//! all from one process in dependency order, which is what tests and
//! single-host installs want.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use sigul_pki_core::Principal;
use sigul_pki_store::{CredentialStore, SqliteCredentialStore};
use sigul_pki_transport::{ArtifactLayout, StorePassword};

use crate::authority::AuthorityProvisioner;
use crate::config::{Deployment, Mode};
use crate::error::{ErrorKind, ProvisionError, Result, Step};
use crate::export::ExportBundler;
use crate::plan::Action;
use crate::principal::PrincipalProvisioner;
use crate::state::ProvisionOutcome;
use crate::validator::{audit, AuditReport, InvariantValidator};

/// Whether a principal's prerequisites have published their artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady { missing: Vec<PathBuf> },
    /// The bundle is published but its transport password was already
    /// consumed. Only a new export from the authority can fix this.
    Consumed { password: PathBuf },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Dependency graph of a deployment: every consumer depends on the authority.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    principals: Vec<Principal>,
    prerequisites: BTreeMap<String, Vec<String>>,
}

impl DeploymentPlan {
    pub fn new(deployment: &Deployment) -> Self {
        let authority = deployment.authority().name.clone();
        let prerequisites = deployment
            .principals
            .iter()
            .map(|p| {
                let deps = if p.is_authority() {
                    Vec::new()
                } else {
                    vec![authority.clone()]
                };
                (p.name.clone(), deps)
            })
            .collect();
        Self {
            principals: deployment.principals.clone(),
            prerequisites,
        }
    }

    pub fn prerequisites(&self, principal: &str) -> &[String] {
        self.prerequisites
            .get(principal)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Topological order; ties keep configuration order.
    pub fn order(&self) -> Result<Vec<&Principal>> {
        let mut pending: BTreeMap<&str, usize> = self
            .prerequisites
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();
        let mut ready: VecDeque<&Principal> = self
            .principals
            .iter()
            .filter(|p| pending.get(p.name.as_str()) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.principals.len());

        while let Some(next) = ready.pop_front() {
            order.push(next);
            for p in &self.principals {
                if self.prerequisites(&p.name).contains(&next.name) {
                    if let Some(count) = pending.get_mut(p.name.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push_back(p);
                        }
                    }
                }
            }
        }

        if order.len() != self.principals.len() {
            return Err(ProvisionError::new(
                crate::config::DEPLOYMENT,
                Step::Configure,
                ErrorKind::Configuration("principal dependencies form a cycle".into()),
            ));
        }
        Ok(order)
    }

    /// Check that the artifacts `principal` imports have been published.
    pub fn readiness(&self, principal: &Principal, layout: &ArtifactLayout) -> Readiness {
        if self.prerequisites(&principal.name).is_empty() {
            return Readiness::Ready;
        }
        let nickname = principal.leaf_nickname();
        let missing: Vec<PathBuf> = [
            layout.authority_certificate_path(&principal.name),
            layout.bundle_path(&principal.name, &nickname),
        ]
        .into_iter()
        .filter(|path| !path.exists())
        .collect();
        let password = layout.password_path(&principal.name);

        if !missing.is_empty() {
            Readiness::NotReady { missing }
        } else if !password.exists() {
            Readiness::Consumed { password }
        } else {
            Readiness::Ready
        }
    }
}

/// Open a principal's store the way `mode` needs it: skip never creates,
/// force throws the old store away without opening it.
pub fn open_store(
    deployment: &Deployment,
    principal: &Principal,
    password: &StorePassword,
    mode: Mode,
) -> Result<SqliteCredentialStore> {
    let dir = deployment.store_dir(principal);
    let opened = match mode {
        Mode::Skip => SqliteCredentialStore::open(&dir, password),
        Mode::Auto => SqliteCredentialStore::open_or_create(&dir, password),
        Mode::Force => SqliteCredentialStore::recreate(&dir, password),
    };
    opened.map_err(|e| {
        ProvisionError::new(
            principal.name.clone(),
            Step::OpenStore,
            ErrorKind::from_store(e, ErrorKind::store_access),
        )
    })
}

/// Outcome of the authority side of a run.
#[derive(Debug, Clone)]
pub struct AuthorityRun {
    pub outcome: ProvisionOutcome,
    /// Principals whose artifacts were (re)written.
    pub exported: Vec<String>,
}

/// Provision the authority store, then export for every consumer whose
/// leaf changed, whose artifacts are missing, or who asked for a new bundle
/// after its transport password was consumed.
///
/// An auto run that changed nothing writes nothing, so consumers that
/// already imported see no new bundle.
pub async fn run_authority(
    deployment: &Deployment,
    store: &dyn CredentialStore,
    password: &StorePassword,
    mode: Mode,
) -> Result<AuthorityRun> {
    let outcome = AuthorityProvisioner::from_deployment(deployment)
        .provision(store, mode)
        .await?;
    if mode == Mode::Skip {
        return Ok(AuthorityRun {
            outcome,
            exported: Vec::new(),
        });
    }

    let layout = &deployment.layout;
    let rotated = outcome.plan.contains(&Action::GenerateAuthority);
    let selected: Vec<Principal> = deployment
        .principals
        .iter()
        .filter(|p| {
            if rotated {
                return true;
            }
            if p.is_authority() {
                return !layout.shared_authority_certificate_path().exists();
            }
            outcome.plan.contains(&Action::GenerateLeaf {
                principal: p.name.clone(),
                nickname: p.leaf_nickname(),
            }) || !layout.bundle_path(&p.name, &p.leaf_nickname()).exists()
                || (!layout.password_path(&p.name).exists()
                    && layout.reexport_request_path(&p.name).exists())
        })
        .cloned()
        .collect();

    let bundler = ExportBundler::new(password);
    let bundles = bundler.export_all(store, &selected).await?;
    bundler.write_all(&bundles, layout)?;

    let exported: Vec<String> = selected.into_iter().map(|p| p.name).collect();
    if exported.is_empty() {
        tracing::info!(principal = %outcome.principal, "export artifacts up to date");
    } else {
        tracing::info!(principal = %outcome.principal, exported = ?exported, "export complete");
    }
    Ok(AuthorityRun { outcome, exported })
}

/// Provision one consumer after checking that its prerequisites are ready.
pub async fn run_principal(
    deployment: &Deployment,
    plan: &DeploymentPlan,
    principal: &Principal,
    store: &dyn CredentialStore,
    mode: Mode,
) -> Result<ProvisionOutcome> {
    let provisioner = PrincipalProvisioner::from_deployment(deployment, principal);
    let readiness = plan.readiness(principal, &deployment.layout);
    if mode != Mode::Skip && !readiness.is_ready() {
        // Already provisioned stores do not need the artifacts again.
        let records = store.list_certificates().await.map_err(|e| {
            ProvisionError::new(
                principal.name.clone(),
                Step::ReadArtifacts,
                ErrorKind::from_store(e, ErrorKind::store_access),
            )
        })?;
        if mode == Mode::Force || records.is_empty() {
            if let Readiness::NotReady { missing } = readiness {
                let missing: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
                return Err(ProvisionError::new(
                    principal.name.clone(),
                    Step::ReadArtifacts,
                    ErrorKind::not_ready(format!("authority not ready: missing {}", missing.join(", "))),
                ));
            }
            return Err(provisioner.password_consumed());
        }
    }

    provisioner.provision(store, mode).await
}

/// Audit every store of the deployment.
pub async fn audit_stores(
    deployment: &Deployment,
    stores: &[(&Principal, &dyn CredentialStore)],
) -> Result<AuditReport> {
    let authority = deployment.authority();
    let mut validator = InvariantValidator::new();
    if let Some((_, store)) = stores.iter().find(|(p, _)| p.is_authority()) {
        if let Some(certificate) = store
            .certificate(&Principal::authority_nickname())
            .await
            .map_err(|e| {
                ProvisionError::new(authority.name.clone(), Step::Audit, ErrorKind::from_store(e, ErrorKind::store_access))
            })?
        {
            validator = validator.trusting(certificate);
        }
    }

    audit(&validator, &deployment.principals, stores)
        .await
        .map_err(|e| ProvisionError::new(crate::config::DEPLOYMENT, Step::Audit, ErrorKind::from_store(e, ErrorKind::store_access)))?
        .into_result()
}

/// Everything a full deployment run did.
#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub outcomes: Vec<ProvisionOutcome>,
    pub exported: Vec<String>,
    pub audit: AuditReport,
}

/// Provision every principal in dependency order, then audit.
pub async fn deploy(
    deployment: &Deployment,
    password: &StorePassword,
    mode: Mode,
) -> Result<DeploymentReport> {
    let plan = DeploymentPlan::new(deployment);
    let order = plan.order()?;

    let mut stores = Vec::with_capacity(order.len());
    for principal in &order {
        stores.push((*principal, open_store(deployment, principal, password, mode)?));
    }

    let mut outcomes = Vec::with_capacity(stores.len());
    let mut exported = Vec::new();
    for (principal, store) in &stores {
        if principal.is_authority() {
            let run = run_authority(deployment, store, password, mode).await?;
            exported = run.exported;
            outcomes.push(run.outcome);
        } else {
            outcomes.push(run_principal(deployment, &plan, principal, store, mode).await?);
        }
    }

    let handles: Vec<(&Principal, &dyn CredentialStore)> = stores
        .iter()
        .map(|(p, s)| (*p, s as &dyn CredentialStore))
        .collect();
    let audit = audit_stores(deployment, &handles).await?;
    tracing::info!(principals = outcomes.len(), "deployment verified");

    Ok(DeploymentReport {
        outcomes,
        exported,
        audit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentConfig;

    fn deployment(root: &std::path::Path) -> Deployment {
        let text = format!(
            r#"
store_root = "{root}/nss"
export_root = "{root}/export"
secrets_root = "{root}/secrets"

[[principals]]
name = "server"
role = "server"
fqdn = "sigul-server.example.org"

[[principals]]
name = "bridge"
role = "authority"
fqdn = "sigul-bridge.example.org"

[[principals]]
name = "client"
role = "client"
fqdn = "sigul-client.example.org"
"#,
            root = root.display()
        );
        DeploymentConfig::from_toml_str(&text).unwrap().validate().unwrap()
    }

    #[test]
    fn test_authority_comes_first() {
        let dir = tempfile::tempdir().unwrap();
        let d = deployment(dir.path());
        let plan = DeploymentPlan::new(&d);

        let order: Vec<_> = plan.order().unwrap().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(order, vec!["bridge", "server", "client"]);
        assert_eq!(plan.prerequisites("client"), ["bridge".to_string()]);
        assert!(plan.prerequisites("bridge").is_empty());
    }

    #[test]
    fn test_consumer_not_ready_before_export() {
        let dir = tempfile::tempdir().unwrap();
        let d = deployment(dir.path());
        let plan = DeploymentPlan::new(&d);

        let server = d.principal("server").unwrap();
        match plan.readiness(server, &d.layout) {
            Readiness::NotReady { missing } => assert_eq!(missing.len(), 2),
            Readiness::Ready => panic!("nothing has been exported"),
            Readiness::Consumed { .. } => panic!("nothing has been exported"),
        }
        assert!(plan.readiness(d.authority(), &d.layout).is_ready());
    }

    #[tokio::test]
    async fn test_deploy_then_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let d = deployment(dir.path());
        let password = StorePassword::new("open sesame");

        let report = deploy(&d, &password, Mode::Auto).await.unwrap();
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.exported.len(), 3);
        assert!(report.audit.key_is_unique());
        assert!(!d.layout.password_path("server").exists());

        let report = deploy(&d, &password, Mode::Auto).await.unwrap();
        assert!(report.exported.is_empty());
        assert!(report.outcomes.iter().all(ProvisionOutcome::unchanged));
    }

    #[test]
    fn test_consumed_password_is_reported_separately() {
        let dir = tempfile::tempdir().unwrap();
        let d = deployment(dir.path());
        let plan = DeploymentPlan::new(&d);
        let server = d.principal("server").unwrap();

        for path in [
            d.layout.authority_certificate_path("server"),
            d.layout.bundle_path("server", &server.leaf_nickname()),
        ] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"published").unwrap();
        }

        assert_eq!(
            plan.readiness(server, &d.layout),
            Readiness::Consumed {
                password: d.layout.password_path("server")
            }
        );
    }

    #[tokio::test]
    async fn test_force_recreates_store_with_unknown_password() {
        let dir = tempfile::tempdir().unwrap();
        let d = deployment(dir.path());
        deploy(&d, &StorePassword::new("open sesame"), Mode::Auto).await.unwrap();

        let other = StorePassword::new("rotated password");
        let err = open_store(&d, d.authority(), &other, Mode::Auto).err().unwrap();
        assert_eq!(err.step, Step::OpenStore);

        let store = open_store(&d, d.authority(), &other, Mode::Force).unwrap();
        assert!(store.list_certificates().await.unwrap().is_empty());
        drop(store);

        let report = deploy(&d, &other, Mode::Force).await.unwrap();
        assert_eq!(report.exported.len(), 3);
        assert!(report.audit.key_is_unique());
    }

    #[tokio::test]
    async fn test_force_recovers_corrupt_store() {
        let dir = tempfile::tempdir().unwrap();
        let d = deployment(dir.path());
        let password = StorePassword::new("open sesame");
        deploy(&d, &password, Mode::Auto).await.unwrap();

        let client = d.principal("client").unwrap();
        std::fs::write(d.store_dir(client).join(sigul_pki_store::STORE_FILE), b"garbage").unwrap();
        assert!(open_store(&d, client, &password, Mode::Auto).is_err());

        deploy(&d, &password, Mode::Force).await.unwrap();
        let store = open_store(&d, client, &password, Mode::Auto).unwrap();
        assert!(store.has_private_key(&client.leaf_nickname()).await.unwrap());
    }

    #[tokio::test]
    async fn test_skip_without_stores_fails() {
        let dir = tempfile::tempdir().unwrap();
        let d = deployment(dir.path());
        let password = StorePassword::new("open sesame");

        let err = deploy(&d, &password, Mode::Skip).await.unwrap_err();
        assert_eq!(err.step, Step::OpenStore);
        assert!(!d.store_dir(d.authority()).exists());
    }
}
