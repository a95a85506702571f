//! Deployment orchestrator. Drives an app from one release to another.
//!
//! A deploy commits in phases, each in its own write transaction with its
//! own `deployment.transition` event:
//!
//! 1. insert the deployment `pending`, capturing the current release as `from`
//! 2. move it to `in_progress`
//! 3. check the target is `ready` and run [`DeployHook::prepare`] outside
//!    any transaction
//! 4. promote: compare-and-swap the current release against `from`, replace
//!    the pointer and mark the deployment `succeeded`, atomically
//!
//! Any definitive failure in 3 or 4 marks the deployment `failed` and leaves
//! the current release untouched. A transient store failure leaves the row
//! in its last committed state for the reconciler to close.

use std::sync::Arc;

use keel_state::{
    Deployment, DeploymentStatus, Release, ReleaseStatus, StateStore, StoreTxn, Tables,
    timestamp_now,
};
use tracing::{debug, info, warn};

use crate::current::CurrentReleaseTracker;
use crate::error::{EngineError, EngineResult};
use crate::events::EventRecorder;
use crate::machine;

/// Collaborator hooks around the promote step.
///
/// `prepare` gates promotion (provisioning, health checks). Its failure
/// fails the deployment. `activated` notifies the process supervisor once
/// the new current release is committed. Its failure is only logged.
pub trait DeployHook: Send + Sync {
    fn prepare(&self, _deployment: &Deployment, _release: &Release) -> anyhow::Result<()> {
        Ok(())
    }

    fn activated(&self, _deployment: &Deployment, _release: &Release) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hook that accepts every deployment and notifies nobody.
pub struct NoopHook;

impl DeployHook for NoopHook {}

pub struct DeploymentOrchestrator {
    store: StateStore,
    hook: Arc<dyn DeployHook>,
}

impl DeploymentOrchestrator {
    pub fn new(store: StateStore) -> Self {
        Self::with_hook(store, Arc::new(NoopHook))
    }

    pub fn with_hook(store: StateStore, hook: Arc<dyn DeployHook>) -> Self {
        Self { store, hook }
    }

    /// Deploy `to_release_id` to `app_id`.
    ///
    /// Returns the `succeeded` deployment. On failure the deployment row is
    /// kept (normally as `failed`) and the error is returned.
    pub fn deploy(&self, app_id: &str, to_release_id: &str) -> EngineResult<Deployment> {
        let deployment = self.store.write(|tx| -> EngineResult<_> {
            if tx.get_app(app_id)?.is_none() {
                return Err(EngineError::NotFound(format!("app {app_id}")));
            }
            let release = tx
                .get_release(to_release_id)?
                .ok_or_else(|| EngineError::NotFound(format!("release {to_release_id}")))?;
            if release.app_id != app_id {
                return Err(EngineError::InvalidState(format!(
                    "release {to_release_id} belongs to another app"
                )));
            }
            let now = timestamp_now();
            let deployment = Deployment {
                id: uuid::Uuid::new_v4().to_string(),
                app_id: app_id.to_string(),
                from_release_id: tx.current_release(app_id)?.map(|p| p.release_id),
                to_release_id: to_release_id.to_string(),
                status: DeploymentStatus::Pending,
                error: None,
                created_at: now.clone(),
                updated_at: now,
            };
            tx.put_deployment(&deployment)?;
            EventRecorder::transition(tx, &deployment, None)?;
            Ok(deployment)
        })?;
        info!(
            app = %app_id,
            deployment = %deployment.id,
            from = ?deployment.from_release_id,
            to = %to_release_id,
            "deployment created"
        );

        let deployment = self.advance(&deployment.id, DeploymentStatus::InProgress, None)?;

        match self.prepare_and_promote(&deployment) {
            Ok((deployment, release)) => {
                info!(
                    app = %app_id,
                    deployment = %deployment.id,
                    release = %release.id,
                    "deployment succeeded"
                );
                if let Err(err) = self.hook.activated(&deployment, &release) {
                    warn!(deployment = %deployment.id, error = %err, "activation hook failed");
                }
                Ok(deployment)
            }
            Err(err) if err.is_transient() => {
                warn!(
                    deployment = %deployment.id,
                    error = %err,
                    "deployment interrupted, left for reconciliation"
                );
                Err(err)
            }
            Err(err) => {
                warn!(deployment = %deployment.id, error = %err, "deployment failed");
                if let Err(mark) =
                    self.advance(&deployment.id, DeploymentStatus::Failed, Some(err.to_string()))
                {
                    warn!(deployment = %deployment.id, error = %mark, "could not record failure");
                }
                Err(err)
            }
        }
    }

    fn prepare_and_promote(&self, deployment: &Deployment) -> EngineResult<(Deployment, Release)> {
        let to = &deployment.to_release_id;
        let release = self
            .store
            .read(|v| v.get_release(to))?
            .ok_or_else(|| EngineError::NotFound(format!("release {to}")))?;
        if release.status != ReleaseStatus::Ready {
            return Err(EngineError::InvalidState(format!(
                "release {} is {}, not ready",
                release.id, release.status
            )));
        }

        self.hook
            .prepare(deployment, &release)
            .map_err(|e| EngineError::External(format!("{e:#}")))?;

        let promoted = self.store.write(|tx| -> EngineResult<_> {
            let mut current = load(tx, &deployment.id)?;
            machine::check_deployment(&current.id, current.status, DeploymentStatus::Succeeded)?;
            let active = tx.current_release(&current.app_id)?.map(|p| p.release_id);
            if active != current.from_release_id {
                return Err(EngineError::Conflict(format!(
                    "current release of app {} moved to {} during the deployment",
                    current.app_id,
                    active.as_deref().unwrap_or("none")
                )));
            }
            CurrentReleaseTracker::set_current(tx, &current.app_id, &current.to_release_id)?;
            transition_deployment(tx, &mut current, DeploymentStatus::Succeeded, None)?;
            Ok(current)
        })?;
        Ok((promoted, release))
    }

    /// Move a stored deployment to `to` in its own transaction.
    fn advance(
        &self,
        deployment_id: &str,
        to: DeploymentStatus,
        error: Option<String>,
    ) -> EngineResult<Deployment> {
        self.store.write(|tx| -> EngineResult<_> {
            let mut deployment = load(tx, deployment_id)?;
            transition_deployment(tx, &mut deployment, to, error)?;
            Ok(deployment)
        })
    }

    /// Roll a `failed` deployment back to the release it started from.
    ///
    /// The deployment keeps its original error and becomes `rolled_back`.
    /// Fails `Conflict` when a later deployment has since moved the app off
    /// `from_release_id`, so a stale rollback never reverts a newer success.
    pub fn rollback(&self, deployment_id: &str) -> EngineResult<Deployment> {
        let (deployment, release) = self.store.write(|tx| -> EngineResult<_> {
            let mut deployment = load(tx, deployment_id)?;
            machine::check_deployment(
                &deployment.id,
                deployment.status,
                DeploymentStatus::RolledBack,
            )?;
            let from = deployment.from_release_id.clone().ok_or_else(|| {
                EngineError::InvalidState(format!(
                    "deployment {deployment_id} has no previous release to roll back to"
                ))
            })?;
            let active = tx.current_release(&deployment.app_id)?.map(|p| p.release_id);
            if active.as_deref() != Some(from.as_str()) {
                return Err(EngineError::Conflict(format!(
                    "current release of app {} moved to {} since deployment {deployment_id}",
                    deployment.app_id,
                    active.as_deref().unwrap_or("none")
                )));
            }
            CurrentReleaseTracker::set_current(tx, &deployment.app_id, &from)?;
            transition_deployment(tx, &mut deployment, DeploymentStatus::RolledBack, None)?;
            let release = tx
                .get_release(&from)?
                .ok_or_else(|| EngineError::NotFound(format!("release {from}")))?;
            Ok((deployment, release))
        })?;
        info!(
            app = %deployment.app_id,
            deployment = %deployment.id,
            release = %release.id,
            "deployment rolled back"
        );
        if let Err(err) = self.hook.activated(&deployment, &release) {
            warn!(deployment = %deployment.id, error = %err, "activation hook failed");
        }
        Ok(deployment)
    }

    pub fn get_deployment(&self, deployment_id: &str) -> EngineResult<Deployment> {
        self.store
            .read(|v| v.get_deployment(deployment_id))?
            .ok_or_else(|| EngineError::NotFound(format!("deployment {deployment_id}")))
    }

    /// Deployments of an app, newest first.
    pub fn list_deployments(&self, app_id: &str) -> EngineResult<Vec<Deployment>> {
        Ok(self.store.read(|v| v.list_deployments(app_id))?)
    }
}

fn load(tx: &StoreTxn<'_>, deployment_id: &str) -> EngineResult<Deployment> {
    tx.get_deployment(deployment_id)?
        .ok_or_else(|| EngineError::NotFound(format!("deployment {deployment_id}")))
}

/// Apply one checked status change and record it.
///
/// `error` replaces the stored error when given; otherwise the previous one is kept.
pub(crate) fn transition_deployment(
    tx: &StoreTxn<'_>,
    deployment: &mut Deployment,
    to: DeploymentStatus,
    error: Option<String>,
) -> EngineResult<()> {
    let from = deployment.status;
    machine::check_deployment(&deployment.id, from, to)?;
    deployment.status = to;
    if error.is_some() {
        deployment.error = error;
    }
    deployment.updated_at = timestamp_now();
    tx.put_deployment(deployment)?;
    EventRecorder::transition(tx, deployment, Some(from))?;
    debug!(deployment = %deployment.id, %from, %to, "deployment transition");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::AppRegistry;
    use crate::releases::{BuildArtifact, ReleaseManager};
    use serde_json::Value;

    struct Fixture {
        store: StateStore,
        releases: ReleaseManager,
        app: String,
    }

    fn fixture() -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let app = AppRegistry::new(store.clone()).register("web", "/r").unwrap();
        Fixture {
            releases: ReleaseManager::new(store.clone()),
            store,
            app: app.id,
        }
    }

    fn ready_release(f: &Fixture, digest: &str) -> Release {
        let r = f
            .releases
            .create_release(
                &f.app,
                BuildArtifact {
                    revision: digest.into(),
                    image_ref: format!("img@{digest}"),
                    image_digest: digest.into(),
                },
                Value::Null,
            )
            .unwrap();
        f.releases.mark_ready(&r.id).unwrap()
    }

    struct FailingPrepare;

    impl DeployHook for FailingPrepare {
        fn prepare(&self, _: &Deployment, _: &Release) -> anyhow::Result<()> {
            anyhow::bail!("provisioning timed out")
        }
    }

    struct FailingActivation;

    impl DeployHook for FailingActivation {
        fn activated(&self, _: &Deployment, _: &Release) -> anyhow::Result<()> {
            anyhow::bail!("supervisor unreachable")
        }
    }

    fn deployment_to(o: &DeploymentOrchestrator, app: &str, release: &str) -> Deployment {
        o.list_deployments(app)
            .unwrap()
            .into_iter()
            .find(|d| d.to_release_id == release)
            .unwrap()
    }

    fn current(f: &Fixture) -> Option<String> {
        f.store
            .read(|v| v.current_release(&f.app))
            .unwrap()
            .map(|p| p.release_id)
    }

    #[test]
    fn first_deploy_has_no_from_release() {
        let f = fixture();
        let r1 = ready_release(&f, "d1");
        let d = DeploymentOrchestrator::new(f.store.clone())
            .deploy(&f.app, &r1.id)
            .unwrap();
        assert_eq!(d.status, DeploymentStatus::Succeeded);
        assert_eq!(d.from_release_id, None);
        assert_eq!(current(&f), Some(r1.id));
    }

    #[test]
    fn unknown_release_writes_no_deployment() {
        let f = fixture();
        let orchestrator = DeploymentOrchestrator::new(f.store.clone());
        assert!(matches!(
            orchestrator.deploy(&f.app, "missing"),
            Err(EngineError::NotFound(_))
        ));
        assert!(orchestrator.list_deployments(&f.app).unwrap().is_empty());
    }

    #[test]
    fn prepare_failure_keeps_current_release() {
        let f = fixture();
        let r1 = ready_release(&f, "d1");
        let r2 = ready_release(&f, "d2");
        DeploymentOrchestrator::new(f.store.clone())
            .deploy(&f.app, &r1.id)
            .unwrap();

        let failing = DeploymentOrchestrator::with_hook(f.store.clone(), Arc::new(FailingPrepare));
        let err = failing.deploy(&f.app, &r2.id).unwrap_err();
        assert!(matches!(err, EngineError::External(_)));
        assert_eq!(current(&f), Some(r1.id.clone()));

        let latest = deployment_to(&failing, &f.app, &r2.id);
        assert_eq!(latest.status, DeploymentStatus::Failed);
        assert_eq!(latest.from_release_id.as_deref(), Some(r1.id.as_str()));
        assert!(latest.error.as_deref().unwrap().contains("provisioning timed out"));
    }

    #[test]
    fn activation_failure_does_not_undo_success() {
        let f = fixture();
        let r1 = ready_release(&f, "d1");
        let d = DeploymentOrchestrator::with_hook(f.store.clone(), Arc::new(FailingActivation))
            .deploy(&f.app, &r1.id)
            .unwrap();
        assert_eq!(d.status, DeploymentStatus::Succeeded);
        assert_eq!(current(&f), Some(r1.id));
    }

    #[test]
    fn rollback_requires_failed_deployment() {
        let f = fixture();
        let r1 = ready_release(&f, "d1");
        let orchestrator = DeploymentOrchestrator::new(f.store.clone());
        let d = orchestrator.deploy(&f.app, &r1.id).unwrap();
        assert!(matches!(
            orchestrator.rollback(&d.id),
            Err(EngineError::InvalidTransition(_))
        ));
    }

    #[test]
    fn rollback_without_from_release_is_invalid_state() {
        let f = fixture();
        let r1 = ready_release(&f, "d1");
        let failing = DeploymentOrchestrator::with_hook(f.store.clone(), Arc::new(FailingPrepare));
        failing.deploy(&f.app, &r1.id).unwrap_err();
        let d = &failing.list_deployments(&f.app).unwrap()[0];
        assert!(matches!(
            failing.rollback(&d.id),
            Err(EngineError::InvalidState(_))
        ));
        assert_eq!(failing.get_deployment(&d.id).unwrap().status, DeploymentStatus::Failed);
    }

    #[test]
    fn rollback_restores_from_release_and_keeps_error() {
        let f = fixture();
        let r1 = ready_release(&f, "d1");
        let r2 = ready_release(&f, "d2");
        let orchestrator = DeploymentOrchestrator::new(f.store.clone());
        orchestrator.deploy(&f.app, &r1.id).unwrap();
        let failing = DeploymentOrchestrator::with_hook(f.store.clone(), Arc::new(FailingPrepare));
        failing.deploy(&f.app, &r2.id).unwrap_err();
        let failed = deployment_to(&failing, &f.app, &r2.id);

        let rolled = orchestrator.rollback(&failed.id).unwrap();
        assert_eq!(rolled.status, DeploymentStatus::RolledBack);
        assert_eq!(rolled.error, failed.error);
        assert_eq!(current(&f), Some(r1.id));
        assert!(matches!(
            orchestrator.rollback(&failed.id),
            Err(EngineError::InvalidTransition(_))
        ));
    }

    #[test]
    fn stale_rollback_does_not_revert_later_success() {
        let f = fixture();
        let r1 = ready_release(&f, "d1");
        let r2 = ready_release(&f, "d2");
        let r3 = ready_release(&f, "d3");
        let orchestrator = DeploymentOrchestrator::new(f.store.clone());
        orchestrator.deploy(&f.app, &r1.id).unwrap();
        let failing = DeploymentOrchestrator::with_hook(f.store.clone(), Arc::new(FailingPrepare));
        failing.deploy(&f.app, &r2.id).unwrap_err();
        let failed = deployment_to(&failing, &f.app, &r2.id);
        orchestrator.deploy(&f.app, &r3.id).unwrap();

        let err = orchestrator.rollback(&failed.id).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)), "{err}");
        assert_eq!(current(&f), Some(r3.id));
        assert_eq!(
            orchestrator.get_deployment(&failed.id).unwrap().status,
            DeploymentStatus::Failed
        );
    }
}
