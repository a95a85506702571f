//! Current-release tracker: the single active release per app.
//!
//! The pointer is only ever replaced inside a deployment's transaction, so
//! readers observe either the old or the new value and never a pointer that
//! disagrees with deployment history.

use keel_state::{CurrentRelease, Release, ReleaseStatus, StateStore, StoreTxn, Tables};
use serde_json::json;

use crate::error::{EngineError, EngineResult};
use crate::events::{EventKind, EventRecorder};

pub struct CurrentReleaseTracker {
    store: StateStore,
}

/// A broken current-release invariant found by [`CurrentReleaseTracker::check_invariants`].
#[derive(Debug, Clone, PartialEq)]
pub struct InvariantViolation {
    pub app_id: String,
    pub release_id: String,
    pub reason: String,
}

impl CurrentReleaseTracker {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// The release an app is presently meant to run, if any.
    pub fn get_current(&self, app_id: &str) -> EngineResult<Option<Release>> {
        self.store.read(|v| -> EngineResult<_> {
            match v.current_release(app_id)? {
                Some(pointer) => Ok(v.get_release(&pointer.release_id)?),
                None => Ok(None),
            }
        })
    }

    /// Point `app_id` at `release_id` inside the caller's transaction.
    ///
    /// The release must belong to the app and be `ready`.
    pub(crate) fn set_current(
        tx: &StoreTxn<'_>,
        app_id: &str,
        release_id: &str,
    ) -> EngineResult<CurrentRelease> {
        let release = tx
            .get_release(release_id)?
            .ok_or_else(|| EngineError::NotFound(format!("release {release_id}")))?;
        if release.app_id != app_id {
            return Err(EngineError::InvalidState(format!(
                "release {release_id} belongs to another app"
            )));
        }
        if release.status != ReleaseStatus::Ready {
            return Err(EngineError::InvalidState(format!(
                "release {release_id} is {}, not ready",
                release.status
            )));
        }
        let previous = tx.current_release(app_id)?.map(|p| p.release_id);
        let pointer = tx.set_current_release(app_id, release_id)?;
        EventRecorder::record(
            tx,
            EventKind::CurrentReleaseSet,
            json!({
                "app_id": app_id,
                "release_id": release_id,
                "previous_release_id": previous,
            }),
        )?;
        Ok(pointer)
    }

    /// Verify every pointer references a ready release of its own app.
    pub fn check_invariants(&self) -> EngineResult<Vec<InvariantViolation>> {
        self.store.read(|v| -> EngineResult<_> {
            let mut violations = Vec::new();
            for pointer in v.list_current_releases()? {
                let reason = match v.get_release(&pointer.release_id)? {
                    None => Some("release does not exist".to_string()),
                    Some(r) if r.app_id != pointer.app_id => {
                        Some(format!("release belongs to app {}", r.app_id))
                    }
                    Some(r) if r.status != ReleaseStatus::Ready => {
                        Some(format!("release is {}", r.status))
                    }
                    Some(_) => None,
                };
                if let Some(reason) = reason {
                    violations.push(InvariantViolation {
                        app_id: pointer.app_id,
                        release_id: pointer.release_id,
                        reason,
                    });
                }
            }
            Ok(violations)
        })
    }
}
