//! Per-principal provisioning state machine.
//!
//! ```text
//! NotProvisioned --begin--> Provisioning --succeed--> Provisioned --verify--> Verified
//! Provisioning | Provisioned | Verified --fail--> Failed
//! any --reset--> NotProvisioned
//! ```

use std::fmt;

use thiserror::Error;

use crate::error::{ErrorKind, ProvisionError, Step};
use crate::plan::Plan;
use crate::validator::Report;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisioningState {
    NotProvisioned,
    Provisioning,
    Provisioned,
    Verified,
    Failed,
}

impl ProvisioningState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProvisioningState::NotProvisioned => "not_provisioned",
            ProvisioningState::Provisioning => "provisioning",
            ProvisioningState::Provisioned => "provisioned",
            ProvisioningState::Verified => "verified",
            ProvisioningState::Failed => "failed",
        }
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Begin,
    Succeed,
    Verify,
    Fail,
    Reset,
}

impl ProvisioningState {
    /// The state after `transition`, if it is allowed from `self`.
    pub fn next(self, transition: Transition) -> Option<ProvisioningState> {
        use ProvisioningState::*;

        match (self, transition) {
            (_, Transition::Reset) => Some(NotProvisioned),
            (NotProvisioned, Transition::Begin) => Some(Provisioning),
            (Provisioning, Transition::Succeed) => Some(Provisioned),
            (Provisioned, Transition::Verify) => Some(Verified),
            (Provisioning | Provisioned | Verified, Transition::Fail) => Some(Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal transition {transition:?} from state {from}")]
pub struct IllegalTransition {
    pub from: ProvisioningState,
    pub transition: Transition,
}

/// The state of one principal during one run. Every transition is logged.
#[derive(Debug)]
pub struct StateMachine {
    principal: String,
    state: ProvisioningState,
}

impl StateMachine {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            state: ProvisioningState::NotProvisioned,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn apply(&mut self, transition: Transition) -> Result<ProvisioningState, IllegalTransition> {
        let from = self.state;
        let to = from
            .next(transition)
            .ok_or(IllegalTransition { from, transition })?;

        self.state = to;
        if to == ProvisioningState::Failed {
            tracing::warn!(principal = %self.principal, %from, %to, "provisioning state changed");
        } else {
            tracing::info!(principal = %self.principal, %from, %to, "provisioning state changed");
        }
        Ok(to)
    }

    /// Apply a transition as part of `step` of a run.
    pub fn advance(
        &mut self,
        transition: Transition,
        step: Step,
    ) -> Result<ProvisioningState, ProvisionError> {
        self.apply(transition).map_err(|e| {
            ProvisionError::new(self.principal.clone(), step, ErrorKind::store_access(e.to_string()))
        })
    }

    /// Move to `Failed` if that is still possible; otherwise keep the state.
    pub fn fail(&mut self) {
        let _ = self.apply(Transition::Fail);
    }
}

/// Result of one successful provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub principal: String,
    pub state: ProvisioningState,
    /// What the run decided to do, skips included.
    pub plan: Plan,
    pub report: Report,
}

impl ProvisionOutcome {
    /// True when the run left the store untouched.
    pub fn unchanged(&self) -> bool {
        self.plan.is_noop()
    }
}
