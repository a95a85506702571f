//! Reconciler that closes deployments a crash or timeout left unfinished.
//!
//! A deploy that dies between phases leaves its row `pending` or
//! `in_progress`. The orchestrator never retries it by itself. This pass
//! fails such rows once they have been idle longer than `stale_after`, which
//! leaves the current release exactly where the last committed promote put it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_state::{Deployment, DeploymentStatus, StateStore, Tables};
use tracing::{error, info, warn};

use crate::current::{CurrentReleaseTracker, InvariantViolation};
use crate::deploy::transition_deployment;
use crate::error::EngineResult;
use crate::events::EventRecorder;

#[derive(Clone)]
pub struct Reconciler {
    store: StateStore,
}

/// Result of [`Reconciler::audit`].
#[derive(Debug, Default, PartialEq)]
pub struct AuditReport {
    pub pointer_violations: Vec<InvariantViolation>,
    /// Deployments whose stored status differs from the last logged one.
    pub log_mismatches: Vec<LogMismatch>,
}

#[derive(Debug, PartialEq)]
pub struct LogMismatch {
    pub deployment_id: String,
    pub stored: DeploymentStatus,
    pub logged: Option<DeploymentStatus>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.pointer_violations.is_empty() && self.log_mismatches.is_empty()
    }
}

impl Reconciler {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Fail every unfinished deployment idle for at least `stale_after`.
    pub fn reconcile_once(&self, stale_after: Duration) -> EngineResult<Vec<Deployment>> {
        let now = Utc::now();
        let failed = self.store.write(|tx| -> EngineResult<_> {
            let mut failed = Vec::new();
            for mut deployment in tx.list_unfinished_deployments()? {
                let Some(idle) = idle_for(&deployment, now) else {
                    warn!(deployment = %deployment.id, "unparseable updated_at, skipping");
                    continue;
                };
                if idle < stale_after {
                    continue;
                }
                let reason = format!(
                    "reconciliation: stalled in {} for {}s",
                    deployment.status,
                    idle.as_secs()
                );
                transition_deployment(tx, &mut deployment, DeploymentStatus::Failed, Some(reason))?;
                failed.push(deployment);
            }
            Ok(failed)
        })?;
        for deployment in &failed {
            info!(
                app = %deployment.app_id,
                deployment = %deployment.id,
                "stale deployment failed by reconciliation"
            );
        }
        Ok(failed)
    }

    /// Check current-release pointers and compare deployment rows with the event log.
    pub fn audit(&self) -> EngineResult<AuditReport> {
        let pointer_violations = CurrentReleaseTracker::new(self.store.clone()).check_invariants()?;
        let logged = EventRecorder::replay_deployment_statuses(&self.store)?;
        let deployments = self.store.read(|v| -> EngineResult<_> {
            let mut all = Vec::new();
            for app in v.list_apps()? {
                all.extend(v.list_deployments(&app.id)?);
            }
            Ok(all)
        })?;
        let log_mismatches = deployments
            .into_iter()
            .filter_map(|d| {
                let last = logged.get(&d.id).copied();
                (last != Some(d.status)).then(|| LogMismatch {
                    deployment_id: d.id,
                    stored: d.status,
                    logged: last,
                })
            })
            .collect();
        Ok(AuditReport {
            pointer_violations,
            log_mismatches,
        })
    }

    /// Run reconciliation passes every `interval` until `shutdown` changes.
    pub async fn run(
        &self,
        interval: Duration,
        stale_after: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = interval.as_secs(),
            stale_after_secs = stale_after.as_secs(),
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let this = self.clone();
                    let pass = tokio::task::spawn_blocking(move || this.reconcile_once(stale_after));
                    match pass.await {
                        Ok(Ok(failed)) if !failed.is_empty() => {
                            info!(count = failed.len(), "reconciliation pass closed deployments");
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(error = %e, "reconciliation pass failed"),
                        Err(e) => error!(error = %e, "reconciliation task panicked"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}

fn idle_for(deployment: &Deployment, now: DateTime<Utc>) -> Option<Duration> {
    let updated = DateTime::parse_from_rfc3339(&deployment.updated_at).ok()?;
    Some(
        now.signed_duration_since(updated.with_timezone(&Utc))
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}
