//! Authority provisioning: the root certificate and every leaf, generated in
//! the authority's own store.
//!
//! The root key is generated inside the store and never leaves it. Leaves for
//! every principal, the authority's own included, are signed there and only
//! later packaged by the export bundler.

use sigul_pki_core::{
    DistinguishedName, Principal, TrustPolicy, TrustSubject, ValidityMonths,
    AUTHORITY_COMMON_NAME, AUTHORITY_ORGANIZATION,
};
use sigul_pki_store::{CredentialStore, LeafRequest, SelfSignedRequest};

use crate::config::{Deployment, Mode};
use crate::error::{ErrorKind, ProvisionError, Result, Step};
use crate::plan::{reconcile_authority, Action};
use crate::state::{ProvisionOutcome, StateMachine, Transition};
use crate::validator::{Expectation, InvariantValidator};

/// Provisions the authority store.
#[derive(Debug, Clone)]
pub struct AuthorityProvisioner {
    authority: Principal,
    principals: Vec<Principal>,
    authority_validity: ValidityMonths,
    validator: InvariantValidator,
}

impl AuthorityProvisioner {
    /// `principals` is the whole deployment, the authority included.
    pub fn new(
        authority: Principal,
        principals: Vec<Principal>,
        authority_validity: ValidityMonths,
    ) -> Self {
        Self {
            authority,
            principals,
            authority_validity,
            validator: InvariantValidator::new(),
        }
    }

    pub fn from_deployment(deployment: &Deployment) -> Self {
        Self::new(
            deployment.authority().clone(),
            deployment.principals.clone(),
            deployment.authority_validity,
        )
    }

    pub fn with_validator(mut self, validator: InvariantValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn authority(&self) -> &Principal {
        &self.authority
    }

    pub fn principals(&self) -> &[Principal] {
        &self.principals
    }

    /// Bring the authority store to the state `mode` asks for, then verify it.
    ///
    /// A failure leaves the store as it is; the next run must use `force`
    /// if the store ended up inconsistent.
    pub async fn provision(
        &self,
        store: &dyn CredentialStore,
        mode: Mode,
    ) -> Result<ProvisionOutcome> {
        let mut machine = StateMachine::new(&self.authority.name);
        tracing::info!(
            principal = %self.authority.name,
            %mode,
            store = %store.location(),
            "provisioning authority"
        );

        match self.run(store, mode, &mut machine).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                machine.fail();
                tracing::error!(
                    principal = %e.principal,
                    step = %e.step,
                    kind = e.kind.name(),
                    "{}",
                    e.kind
                );
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        store: &dyn CredentialStore,
        mode: Mode,
        machine: &mut StateMachine,
    ) -> Result<ProvisionOutcome> {
        if mode == Mode::Force {
            machine.advance(Transition::Reset, Step::Reset)?;
        }
        machine.advance(Transition::Begin, Step::Reconcile)?;

        let records = store
            .list_certificates()
            .await
            .map_err(|e| self.error(Step::Reconcile, ErrorKind::from_store(e, ErrorKind::store_access)))?;
        let plan = reconcile_authority(&records, &self.principals, mode).map_err(|c| {
            self.error(
                Step::Reconcile,
                ErrorKind::store_access(format!("{c}; rerun with mode=force")),
            )
        })?;

        if plan.is_noop() {
            tracing::info!(principal = %self.authority.name, "authority store already provisioned");
        }
        for action in plan.mutations() {
            self.apply(store, action).await?;
        }
        machine.advance(Transition::Succeed, Step::Verify)?;

        let expected = Expectation::for_authority(&self.authority, &self.principals);
        let report = self
            .validator
            .verify(store, &expected)
            .await
            .map_err(|e| self.error(Step::Verify, ErrorKind::from_store(e, ErrorKind::store_access)))?
            .into_result(Step::Verify)?;
        let state = machine.advance(Transition::Verify, Step::Verify)?;

        Ok(ProvisionOutcome {
            principal: self.authority.name.clone(),
            state,
            plan,
            report,
        })
    }

    async fn apply(&self, store: &dyn CredentialStore, action: &Action) -> Result<()> {
        tracing::info!(principal = %self.authority.name, %action, "applying");

        match action {
            Action::ResetStore => {
                store
                    .reset()
                    .await
                    .map_err(|e| self.error(Step::Reset, ErrorKind::from_store(e, ErrorKind::store_access)))?;
            }
            Action::GenerateAuthority => {
                let request = SelfSignedRequest {
                    nickname: Principal::authority_nickname(),
                    subject: DistinguishedName::new(AUTHORITY_COMMON_NAME)
                        .with_organization(AUTHORITY_ORGANIZATION),
                    validity: self.authority_validity,
                    trust: TrustPolicy::attributes_for(TrustSubject::AuthorityRoot, true),
                };
                let record = store
                    .generate_self_signed(request)
                    .await
                    .map_err(|e| self.error(Step::GenerateAuthority, ErrorKind::from_store(e, ErrorKind::Generation)))?;
                tracing::info!(
                    principal = %self.authority.name,
                    nickname = %record.nickname,
                    serial = %record.serial,
                    not_after = %record.not_after,
                    "authority certificate generated"
                );
            }
            Action::GenerateLeaf { principal, nickname } => {
                let principal = self
                    .principals
                    .iter()
                    .find(|p| p.name == *principal)
                    .ok_or_else(|| {
                        self.error(
                            Step::GenerateLeaf,
                            ErrorKind::Generation(format!("unknown principal {principal}")),
                        )
                    })?;
                let request = LeafRequest {
                    nickname: nickname.clone(),
                    issuer: Principal::authority_nickname(),
                    subject: DistinguishedName::new(principal.fqdn.as_str())
                        .with_organization(AUTHORITY_ORGANIZATION),
                    subject_alt_names: vec![principal.fqdn.to_string()],
                    extended_key_usage: principal.role.extended_key_usage(),
                    validity: principal.validity,
                    trust: TrustPolicy::attributes_for(principal.leaf_subject(), true),
                };
                let record = store
                    .generate_signed_leaf(request)
                    .await
                    .map_err(|e| self.error(Step::GenerateLeaf, ErrorKind::from_store(e, ErrorKind::Generation)))?;
                tracing::info!(
                    principal = %principal.name,
                    nickname = %record.nickname,
                    serial = %record.serial,
                    "leaf certificate generated"
                );
            }
            Action::ImportAuthorityCertificate | Action::ImportLeafBundle { .. } => {
                return Err(self.error(
                    Step::Reconcile,
                    ErrorKind::Generation(format!("{action} is not an authority action")),
                ));
            }
            Action::Skip { .. } => {}
        }
        Ok(())
    }

    fn error(&self, step: Step, kind: ErrorKind) -> ProvisionError {
        ProvisionError::new(self.authority.name.clone(), step, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProvisioningState;
    use sigul_pki_core::{ExtendedKeyUsage, Fqdn, Role};
    use sigul_pki_store::MemoryCredentialStore;

    fn principal(name: &str, role: Role) -> Principal {
        Principal::new(
            name,
            role,
            Fqdn::new(format!("sigul-{name}.example.org")).unwrap(),
            ValidityMonths::new(24).unwrap(),
        )
    }

    fn provisioner() -> AuthorityProvisioner {
        let principals = vec![
            principal("bridge", Role::Authority),
            principal("server", Role::Server),
            principal("client", Role::Client),
        ];
        AuthorityProvisioner::new(principals[0].clone(), principals, ValidityMonths::new(120).unwrap())
    }

    #[tokio::test]
    async fn test_full_generation() {
        let store = MemoryCredentialStore::new("bridge");
        let outcome = provisioner().provision(&store, Mode::Auto).await.unwrap();

        assert_eq!(outcome.state, ProvisioningState::Verified);
        assert!(store.has_private_key(&Principal::authority_nickname()).await.unwrap());

        let records = store.list_certificates().await.unwrap();
        assert_eq!(records.len(), 4);

        let server = store
            .record(&Role::Server.leaf_nickname())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.subject_cn, "sigul-server.example.org");
        assert_eq!(server.subject_alt_names, vec!["sigul-server.example.org".to_string()]);
        assert_eq!(server.issuer_cn, AUTHORITY_COMMON_NAME);
        assert_eq!(server.trust_attributes.to_string(), "Pu,Pu,Pu");

        let client = store
            .record(&Role::Client.leaf_nickname())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.extended_key_usage, vec![ExtendedKeyUsage::ClientAuth]);
        assert_eq!(client.trust_attributes.to_string(), "u,u,u");

        let root = store
            .record(&Principal::authority_nickname())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(root.trust_attributes.to_string(), "CTu,Cu,Cu");
    }

    #[tokio::test]
    async fn test_auto_rerun_changes_nothing() {
        let store = MemoryCredentialStore::new("bridge");
        let p = provisioner();
        p.provision(&store, Mode::Auto).await.unwrap();
        let before = store.list_certificates().await.unwrap();

        let outcome = p.provision(&store, Mode::Auto).await.unwrap();
        assert!(outcome.unchanged());
        assert_eq!(store.list_certificates().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_force_rotates_authority() {
        let store = MemoryCredentialStore::new("bridge");
        let p = provisioner();
        p.provision(&store, Mode::Auto).await.unwrap();
        let old = store.record(&Principal::authority_nickname()).await.unwrap().unwrap();

        let outcome = p.provision(&store, Mode::Force).await.unwrap();
        assert_eq!(outcome.plan.actions[0], Action::ResetStore);
        let new = store.record(&Principal::authority_nickname()).await.unwrap().unwrap();
        assert_ne!(old.serial, new.serial);
        assert_eq!(store.list_certificates().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_skip_on_empty_store_fails_without_mutation() {
        let store = MemoryCredentialStore::new("bridge");
        let err = provisioner().provision(&store, Mode::Skip).await.unwrap_err();

        assert!(matches!(err.kind, ErrorKind::StoreAccess { retryable: false, .. }));
        assert_eq!(err.principal, "bridge");
        assert!(store.list_certificates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_never_replaces_missing_authority_under_existing_leaves() {
        let store = MemoryCredentialStore::new("bridge");
        let p = provisioner();
        p.provision(&store, Mode::Auto).await.unwrap();

        // Simulate a store that lost its root: rebuild it with leaves only.
        let other = MemoryCredentialStore::new("bridge");
        let leaf = store.export_certificate(&Role::Client.leaf_nickname()).await.unwrap();
        other
            .import_certificate(
                &Role::Client.leaf_nickname(),
                &leaf,
                TrustPolicy::attributes_for(TrustSubject::Leaf(Role::Client), true),
            )
            .await
            .unwrap();

        let err = p.provision(&other, Mode::Auto).await.unwrap_err();
        assert_eq!(err.step, Step::Reconcile);
        assert!(err.needs_force());
        assert!(other.certificate(&Principal::authority_nickname()).await.unwrap().is_none());
    }
}
