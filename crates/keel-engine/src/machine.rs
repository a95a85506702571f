//! Transition tables for release and deployment status.
//!
//! ```text
//! release:     pending ──► ready
//!                 └──────► failed
//!
//! deployment:  pending ──► in_progress ──► succeeded
//!                 │             └────────► failed ──► rolled_back
//!                 └──────────────────────► failed          (reconciliation)
//! ```
//!
//! Every status lists its successors explicitly. Anything not listed is
//! rejected with [`EngineError::InvalidTransition`].

use keel_state::{DeploymentStatus, ReleaseStatus};

use crate::error::{EngineError, EngineResult};

/// Statuses a deployment may move to from `status`.
pub fn deployment_successors(status: DeploymentStatus) -> &'static [DeploymentStatus] {
    use DeploymentStatus::*;
    match status {
        Pending => &[InProgress, Failed],
        InProgress => &[Succeeded, Failed],
        Failed => &[RolledBack],
        Succeeded => &[],
        RolledBack => &[],
    }
}

/// Statuses a release may move to from `status`.
pub fn release_successors(status: ReleaseStatus) -> &'static [ReleaseStatus] {
    use ReleaseStatus::*;
    match status {
        Pending => &[Ready, Failed],
        Ready => &[],
        Failed => &[],
    }
}

pub fn check_deployment(
    id: &str,
    from: DeploymentStatus,
    to: DeploymentStatus,
) -> EngineResult<()> {
    if deployment_successors(from).contains(&to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition(format!(
            "deployment {id} cannot move from {from} to {to}"
        )))
    }
}

pub fn check_release(id: &str, from: ReleaseStatus, to: ReleaseStatus) -> EngineResult<()> {
    if from.is_terminal() {
        Err(EngineError::InvalidTransition(format!("release {id} is already {from}")))
    } else if release_successors(from).contains(&to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition(format!(
            "release {id} cannot move from {from} to {to}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentStatus::*;

    const ALL: [DeploymentStatus; 5] = [Pending, InProgress, Succeeded, Failed, RolledBack];

    #[test]
    fn terminal_deployment_states_have_no_successors() {
        assert!(deployment_successors(Succeeded).is_empty());
        assert!(deployment_successors(RolledBack).is_empty());
        for to in ALL {
            assert!(check_deployment("d", Succeeded, to).is_err());
            assert!(check_deployment("d", RolledBack, to).is_err());
        }
    }

    #[test]
    fn failed_only_moves_to_rolled_back() {
        for to in ALL {
            assert_eq!(check_deployment("d", Failed, to).is_ok(), to == RolledBack);
        }
    }

    #[test]
    fn no_transition_returns_to_a_non_terminal_state() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in deployment_successors(from) {
                assert!(to.is_terminal(), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn happy_path_is_allowed() {
        assert!(check_deployment("d", Pending, InProgress).is_ok());
        assert!(check_deployment("d", InProgress, Succeeded).is_ok());
        assert!(check_deployment("d", Pending, Succeeded).is_err());
    }

    #[test]
    fn release_transitions_are_one_shot() {
        assert!(check_release("r", ReleaseStatus::Pending, ReleaseStatus::Ready).is_ok());
        assert!(check_release("r", ReleaseStatus::Pending, ReleaseStatus::Failed).is_ok());
        let err = check_release("r", ReleaseStatus::Ready, ReleaseStatus::Failed).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
        assert!(err.to_string().contains("already ready"), "{err}");
        assert!(check_release("r", ReleaseStatus::Failed, ReleaseStatus::Ready).is_err());
        assert!(check_release("r", ReleaseStatus::Ready, ReleaseStatus::Ready).is_err());
    }
}
