//! Consumer provisioning: import what the authority exported.
//!
//! Artifacts are read and checked before the store is touched. A missing
//! artifact means the authority has not run yet and is retryable; anything
//! present but wrong is an import error. So is a bundle whose transport
//! password was already consumed, since only a new export can fix it.

use sigul_pki_core::{verify_issued_by, Principal, TrustPolicy, TrustSubject};
use sigul_pki_store::CredentialStore;
use sigul_pki_transport::artifacts::{
    consume_password, read_bundle, read_password, read_text, request_reexport,
};
use sigul_pki_transport::{ArtifactLayout, SealError, SealedBundle, TransportPassword};

use crate::config::{Deployment, Mode};
use crate::error::{ErrorKind, ProvisionError, Result, Step};
use crate::export::AuthorityCertificate;
use crate::plan::{reconcile_principal, Action, Plan};
use crate::state::{ProvisionOutcome, StateMachine, Transition};
use crate::validator::{Expectation, InvariantValidator};

/// The leaf bundle and the password that opens it.
struct LeafArtifacts {
    bundle: SealedBundle,
    password: TransportPassword,
}

/// Provisions one non-authority principal's store.
#[derive(Debug, Clone)]
pub struct PrincipalProvisioner {
    principal: Principal,
    layout: ArtifactLayout,
    validator: InvariantValidator,
}

impl PrincipalProvisioner {
    pub fn new(principal: Principal, layout: ArtifactLayout) -> Self {
        Self {
            principal,
            layout,
            validator: InvariantValidator::new(),
        }
    }

    pub fn from_deployment(deployment: &Deployment, principal: &Principal) -> Self {
        Self::new(principal.clone(), deployment.layout.clone())
    }

    pub fn with_validator(mut self, validator: InvariantValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub async fn provision(
        &self,
        store: &dyn CredentialStore,
        mode: Mode,
    ) -> Result<ProvisionOutcome> {
        let mut machine = StateMachine::new(&self.principal.name);
        tracing::info!(
            principal = %self.principal.name,
            %mode,
            store = %store.location(),
            "provisioning principal"
        );

        match self.run(store, mode, &mut machine).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                machine.fail();
                if e.is_retryable() {
                    tracing::warn!(principal = %e.principal, step = %e.step, "{}", e.kind);
                } else {
                    tracing::error!(
                        principal = %e.principal,
                        step = %e.step,
                        kind = e.kind.name(),
                        "{}",
                        e.kind
                    );
                }
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

        let published = self.published_authority()?;
        let records = store
            .list_certificates()
            .await
            .map_err(|e| self.error(Step::Reconcile, ErrorKind::from_store(e, ErrorKind::store_access)))?;
        let plan = reconcile_principal(&records, &self.principal, mode).map_err(|c| {
            self.error(
                Step::Reconcile,
                ErrorKind::store_access(format!("{c}; rerun with mode=force")),
            )
        })?;

        if plan.is_noop() {
            tracing::info!(principal = %self.principal.name, "store already provisioned");
        } else {
            let authority = published.as_ref().ok_or_else(|| {
                self.error(
                    Step::ReadArtifacts,
                    ErrorKind::not_ready(format!(
                        "authority not ready: {} missing",
                        self.layout.authority_certificate_path(&self.principal.name).display()
                    )),
                )
            })?;
            let leaf = self.load_leaf(&plan, authority)?;
            self.apply(store, &plan, authority, leaf.as_ref()).await?;
        }
        machine.advance(Transition::Succeed, Step::Verify)?;

        let validator = match &published {
            Some(authority) => self.validator.clone().trusting(authority.certificate().clone()),
            None => self.validator.clone(),
        };
        let report = validator
            .verify(store, &Expectation::for_principal(&self.principal))
            .await
            .map_err(|e| self.error(Step::Verify, ErrorKind::from_store(e, ErrorKind::store_access)))?
            .into_result(Step::Verify)?;
        let state = machine.advance(Transition::Verify, Step::Verify)?;

        Ok(ProvisionOutcome {
            principal: self.principal.name.clone(),
            state,
            plan,
            report,
        })
    }

    /// The authority certificate published for this principal, if any.
    fn published_authority(&self) -> Result<Option<AuthorityCertificate>> {
        let path = self.layout.authority_certificate_path(&self.principal.name);
        let text = match read_text(&path) {
            Ok(text) => text,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(self.error(Step::ReadArtifacts, ErrorKind::store_access(e.to_string()))),
        };
        AuthorityCertificate::from_pem(&text)
            .map(Some)
            .map_err(|e| self.error(Step::ReadArtifacts, ErrorKind::Import(format!("{}: {e}", path.display()))))
    }

    /// Read and check the leaf bundle if the plan imports it.
    fn load_leaf(
        &self,
        plan: &Plan,
        authority: &AuthorityCertificate,
    ) -> Result<Option<LeafArtifacts>> {
        let nickname = self.principal.leaf_nickname();
        if !plan.contains(&Action::ImportLeafBundle { nickname: nickname.clone() }) {
            return Ok(None);
        }

        let not_ready = |e: SealError| {
            if e.is_not_found() {
                self.error(Step::ReadArtifacts, ErrorKind::not_ready(format!("authority not ready: {e}")))
            } else {
                self.error(Step::ReadArtifacts, ErrorKind::Import(e.to_string()))
            }
        };
        let bundle = read_bundle(&self.layout.bundle_path(&self.principal.name, &nickname)).map_err(not_ready)?;
        let password = read_password(&self.layout.password_path(&self.principal.name)).map_err(|e| {
            if e.is_not_found() {
                self.password_consumed()
            } else {
                self.error(Step::ReadArtifacts, ErrorKind::Import(e.to_string()))
            }
        })?;

        let import_error = |message: String| self.error(Step::ImportLeaf, ErrorKind::Import(message));
        let opened = bundle.open(&password).map_err(|e| import_error(e.to_string()))?;
        if *opened.nickname() != nickname {
            return Err(import_error(format!(
                "bundle holds {} instead of {nickname}",
                opened.nickname()
            )));
        }

        let certificate = opened.certificate();
        let fqdn = self.principal.fqdn.as_str();
        if certificate.common_name() != fqdn || certificate.subject_alt_names() != [fqdn] {
            return Err(import_error(format!(
                "bundle subject {} does not match fqdn {fqdn}",
                certificate.common_name()
            )));
        }
        verify_issued_by(certificate, authority.certificate()).map_err(|e| import_error(e.to_string()))?;

        Ok(Some(LeafArtifacts { bundle, password }))
    }

    async fn apply(
        &self,
        store: &dyn CredentialStore,
        plan: &Plan,
        authority: &AuthorityCertificate,
        leaf: Option<&LeafArtifacts>,
    ) -> Result<()> {
        for action in plan.mutations() {
            tracing::info!(principal = %self.principal.name, %action, "applying");
            match action {
                Action::ResetStore => {
                    store
                        .reset()
                        .await
                        .map_err(|e| self.error(Step::Reset, ErrorKind::from_store(e, ErrorKind::store_access)))?;
                }
                Action::ImportAuthorityCertificate => {
                    let record = store
                        .import_certificate(
                            &Principal::authority_nickname(),
                            authority.certificate(),
                            TrustPolicy::attributes_for(TrustSubject::AuthorityRoot, false),
                        )
                        .await
                        .map_err(|e| self.error(Step::ImportAuthority, ErrorKind::from_store(e, ErrorKind::Import)))?;
                    tracing::info!(
                        principal = %self.principal.name,
                        serial = %record.serial,
                        trust = %record.trust_attributes,
                        "authority certificate imported"
                    );
                }
                Action::ImportLeafBundle { nickname } => {
                    let leaf = leaf.ok_or_else(|| {
                        self.error(Step::ImportLeaf, ErrorKind::Import(format!("no bundle loaded for {nickname}")))
                    })?;
                    let record = store
                        .import_bundle(
                            &leaf.bundle,
                            &leaf.password,
                            TrustPolicy::attributes_for(self.principal.leaf_subject(), false),
                        )
                        .await
                        .map_err(|e| self.error(Step::ImportLeaf, ErrorKind::from_store(e, ErrorKind::Import)))?;
                    tracing::info!(
                        principal = %self.principal.name,
                        %nickname,
                        serial = %record.serial,
                        "leaf bundle imported"
                    );

                    consume_password(&self.layout.password_path(&self.principal.name))
                        .map_err(|e| self.error(Step::ImportLeaf, ErrorKind::Import(e.to_string())))?;
                }
                Action::GenerateAuthority | Action::GenerateLeaf { .. } => {
                    return Err(self.error(
                        Step::Reconcile,
                        ErrorKind::Import(format!("{action} is not a principal action")),
                    ));
                }
                Action::Skip { .. } => {}
            }
        }
        Ok(())
    }

    /// The bundle is published but its password was used up by an earlier
    /// import. Leave a re-export request for the authority and fail for good.
    pub(crate) fn password_consumed(&self) -> ProvisionError {
        let request = self.layout.reexport_request_path(&self.principal.name);
        if let Err(e) = request_reexport(&request) {
            tracing::warn!(principal = %self.principal.name, "cannot request re-export: {e}");
        }
        self.error(
            Step::ReadArtifacts,
            ErrorKind::password_consumed(&self.layout.password_path(&self.principal.name)),
        )
    }

    fn error(&self, step: Step, kind: ErrorKind) -> ProvisionError {
        ProvisionError::new(self.principal.name.clone(), step, kind)
    }
}
