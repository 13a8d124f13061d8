//! Reconciliation: diff a store's certificate set against the desired set.
//!
//! Each run reads the store once, then derives every generate, import and
//! skip decision here. Nothing else in the crate asks "is this done yet".

use std::fmt;

use sigul_pki_core::{CertificateRecord, Nickname, Principal};
use thiserror::Error;

use crate::config::Mode;

/// One step of a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Destroy the store contents (force only).
    ResetStore,
    GenerateAuthority,
    GenerateLeaf { principal: String, nickname: Nickname },
    ImportAuthorityCertificate,
    ImportLeafBundle { nickname: Nickname },
    /// Already in the desired state.
    Skip { nickname: Nickname },
}

impl Action {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Action::Skip { .. })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::ResetStore => f.write_str("reset store"),
            Action::GenerateAuthority => write!(f, "generate {}", Principal::authority_nickname()),
            Action::GenerateLeaf { principal, nickname } => {
                write!(f, "generate {nickname} for {principal}")
            }
            Action::ImportAuthorityCertificate => {
                write!(f, "import {}", Principal::authority_nickname())
            }
            Action::ImportLeafBundle { nickname } => write!(f, "import bundle {nickname}"),
            Action::Skip { nickname } => write!(f, "skip {nickname}"),
        }
    }
}

/// The ordered actions of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub actions: Vec<Action>,
}

impl Plan {
    /// True when the run changes nothing.
    pub fn is_noop(&self) -> bool {
        !self.actions.iter().any(Action::is_mutation)
    }

    pub fn mutations(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| a.is_mutation())
    }

    pub fn contains(&self, action: &Action) -> bool {
        self.actions.contains(action)
    }
}

/// The store holds something auto mode must not touch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{nickname}: {reason}")]
pub struct Conflict {
    pub nickname: Nickname,
    pub reason: String,
}

impl Conflict {
    fn new(nickname: &Nickname, reason: impl Into<String>) -> Self {
        Self {
            nickname: nickname.clone(),
            reason: reason.into(),
        }
    }
}

fn find<'a>(records: &'a [CertificateRecord], nickname: &Nickname) -> Option<&'a CertificateRecord> {
    records.iter().find(|r| r.nickname == *nickname)
}

/// Existing leaf for `principal`: fine to keep, or a conflict.
fn check_leaf(record: &CertificateRecord, principal: &Principal) -> Result<(), Conflict> {
    if record.subject_cn != principal.fqdn.as_str() {
        return Err(Conflict::new(
            &record.nickname,
            format!(
                "subject {} differs from configured fqdn {}",
                record.subject_cn, principal.fqdn
            ),
        ));
    }
    Ok(())
}

/// In skip mode every mutation is a conflict.
fn verify_only(plan: Plan) -> Result<Plan, Conflict> {
    if let Some(action) = plan.mutations().next() {
        let nickname = match action {
            Action::GenerateLeaf { nickname, .. } | Action::ImportLeafBundle { nickname } => {
                nickname.clone()
            }
            _ => Principal::authority_nickname(),
        };
        return Err(Conflict::new(&nickname, "not provisioned and mode is skip"));
    }
    Ok(plan)
}

/// Plan the authority store.
///
/// `principals` is every principal in the deployment; the authority store
/// holds the root plus one leaf per principal, its own included.
pub fn reconcile_authority(
    records: &[CertificateRecord],
    principals: &[Principal],
    mode: Mode,
) -> Result<Plan, Conflict> {
    let authority = Principal::authority_nickname();

    if mode == Mode::Force {
        let mut actions = vec![Action::ResetStore, Action::GenerateAuthority];
        actions.extend(principals.iter().map(|p| Action::GenerateLeaf {
            principal: p.name.clone(),
            nickname: p.leaf_nickname(),
        }));
        return Ok(Plan { actions });
    }

    let mut actions = Vec::with_capacity(principals.len() + 1);
    match find(records, &authority) {
        Some(r) if !r.is_ca => {
            return Err(Conflict::new(&authority, "present but not a certificate authority"));
        }
        Some(r) if !r.has_private_key => {
            return Err(Conflict::new(&authority, "present without its private key"));
        }
        Some(_) => actions.push(Action::Skip { nickname: authority.clone() }),
        None => {
            if let Some(leaf) = principals
                .iter()
                .find_map(|p| find(records, &p.leaf_nickname()))
            {
                return Err(Conflict::new(
                    &authority,
                    format!("missing while leaf {} exists", leaf.nickname),
                ));
            }
            actions.push(Action::GenerateAuthority);
        }
    }

    for principal in principals {
        let nickname = principal.leaf_nickname();
        match find(records, &nickname) {
            None => actions.push(Action::GenerateLeaf {
                principal: principal.name.clone(),
                nickname,
            }),
            Some(r) if !r.has_private_key => {
                return Err(Conflict::new(&nickname, "present without its private key"));
            }
            Some(r) => {
                check_leaf(r, principal)?;
                actions.push(Action::Skip { nickname });
            }
        }
    }

    let plan = Plan { actions };
    if mode == Mode::Skip {
        return verify_only(plan);
    }
    Ok(plan)
}

/// Plan a non-authority store.
pub fn reconcile_principal(
    records: &[CertificateRecord],
    principal: &Principal,
    mode: Mode,
) -> Result<Plan, Conflict> {
    let authority = Principal::authority_nickname();
    let nickname = principal.leaf_nickname();

    if mode == Mode::Force {
        return Ok(Plan {
            actions: vec![
                Action::ResetStore,
                Action::ImportAuthorityCertificate,
                Action::ImportLeafBundle { nickname },
            ],
        });
    }

    let mut actions = Vec::with_capacity(2);
    match find(records, &authority) {
        // Key presence is the validator's call; it is fatal there.
        Some(_) => actions.push(Action::Skip { nickname: authority }),
        None => actions.push(Action::ImportAuthorityCertificate),
    }

    match find(records, &nickname) {
        None => actions.push(Action::ImportLeafBundle { nickname }),
        Some(r) => {
            check_leaf(r, principal)?;
            if r.has_private_key {
                actions.push(Action::Skip { nickname });
            } else {
                actions.push(Action::ImportLeafBundle { nickname });
            }
        }
    }

    let plan = Plan { actions };
    if mode == Mode::Skip {
        return verify_only(plan);
    }
    Ok(plan)
}
