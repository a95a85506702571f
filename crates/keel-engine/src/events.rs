//! Event recorder for the append-only audit trail.
//!
//! Every engine operation that changes state appends exactly one event per
//! change, in the same write transaction as the change. An event therefore
//! exists if and only if the change it describes was committed, and the log
//! can be replayed to reconstruct deployment history after a crash.

use std::collections::HashMap;
use std::fmt;

use keel_state::{Deployment, DeploymentStatus, Event, StateError, StateStore, StoreTxn, Tables};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineResult;

/// Closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AppRegistered,
    AppDeregistered,
    ReleaseCreated,
    ReleaseReady,
    ReleaseFailed,
    DeploymentTransition,
    CurrentReleaseSet,
    AddonCreated,
    AddonDestroyed,
    BindingCreated,
    BindingRemoved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AppRegistered => "app.registered",
            EventKind::AppDeregistered => "app.deregistered",
            EventKind::ReleaseCreated => "release.created",
            EventKind::ReleaseReady => "release.ready",
            EventKind::ReleaseFailed => "release.failed",
            EventKind::DeploymentTransition => "deployment.transition",
            EventKind::CurrentReleaseSet => "current_release.set",
            EventKind::AddonCreated => "addon.created",
            EventKind::AddonDestroyed => "addon.destroyed",
            EventKind::BindingCreated => "binding.created",
            EventKind::BindingRemoved => "binding.removed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `deployment.transition` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRecord {
    pub deployment_id: String,
    pub app_id: String,
    /// `None` when the deployment row was created.
    pub old_status: Option<DeploymentStatus>,
    pub new_status: DeploymentStatus,
    pub from_release_id: Option<String>,
    pub to_release_id: String,
    pub error: Option<String>,
    pub at: String,
}

/// One step of a deployment's history, rebuilt from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub seq: u64,
    pub ts: String,
    pub old_status: Option<DeploymentStatus>,
    pub new_status: DeploymentStatus,
    pub error: Option<String>,
}

/// Page size used when scanning the whole log.
const SCAN_PAGE: usize = 512;

pub struct EventRecorder;

impl EventRecorder {
    /// Append an event inside the caller's transaction.
    pub fn record(tx: &StoreTxn<'_>, kind: EventKind, payload: Value) -> EngineResult<Event> {
        Ok(tx.append_event(kind.as_str(), payload)?)
    }

    /// Append the `deployment.transition` event for `deployment`'s current status.
    pub fn transition(
        tx: &StoreTxn<'_>,
        deployment: &Deployment,
        old_status: Option<DeploymentStatus>,
    ) -> EngineResult<Event> {
        let record = TransitionRecord {
            deployment_id: deployment.id.clone(),
            app_id: deployment.app_id.clone(),
            old_status,
            new_status: deployment.status,
            from_release_id: deployment.from_release_id.clone(),
            to_release_id: deployment.to_release_id.clone(),
            error: deployment.error.clone(),
            at: deployment.updated_at.clone(),
        };
        let payload =
            serde_json::to_value(&record).map_err(|e| StateError::Serialize(e.to_string()))?;
        Self::record(tx, EventKind::DeploymentTransition, payload)
    }

    /// Read up to `limit` events starting at `since_seq`.
    pub fn list(store: &StateStore, since_seq: u64, limit: usize) -> EngineResult<Vec<Event>> {
        Ok(store.read(|v| v.events_since(since_seq, limit))?)
    }

    /// Rebuild one deployment's status history from the log alone.
    pub fn deployment_timeline(
        store: &StateStore,
        deployment_id: &str,
    ) -> EngineResult<Vec<StatusChange>> {
        let mut timeline = Vec::new();
        for_each_transition(store, |event, record| {
            if record.deployment_id == deployment_id {
                timeline.push(StatusChange {
                    seq: event.seq,
                    ts: event.ts.clone(),
                    old_status: record.old_status,
                    new_status: record.new_status,
                    error: record.error,
                });
            }
        })?;
        Ok(timeline)
    }

    /// Last status the log recorded for every deployment.
    pub fn replay_deployment_statuses(
        store: &StateStore,
    ) -> EngineResult<HashMap<String, DeploymentStatus>> {
        let mut statuses = HashMap::new();
        for_each_transition(store, |_, record| {
            statuses.insert(record.deployment_id, record.new_status);
        })?;
        Ok(statuses)
    }
}

fn for_each_transition(
    store: &StateStore,
    mut f: impl FnMut(&Event, TransitionRecord),
) -> EngineResult<()> {
    let kind = EventKind::DeploymentTransition.as_str();
    let mut next = 0;
    loop {
        let page = EventRecorder::list(store, next, SCAN_PAGE)?;
        let Some(last) = page.last() else {
            return Ok(());
        };
        next = last.seq + 1;
        for event in &page {
            if event.kind != kind {
                continue;
            }
            let record: TransitionRecord = serde_json::from_value(event.payload.clone())
                .map_err(|e| StateError::Deserialize(e.to_string()))?;
            f(event, record);
        }
        if page.len() < SCAN_PAGE {
            return Ok(());
        }
    }
}
