//! Release manager for immutable build records.
//!
//! A release is written once with status `pending` and afterwards only its
//! status may change, exactly once, to `ready` or `failed`. The digest,
//! image reference and config snapshot are frozen from creation.

use std::collections::BTreeMap;

use keel_state::{Release, ReleaseStatus, StateStore, Tables, timestamp_now};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::events::{EventKind, EventRecorder};
use crate::machine;

/// What the build/registry system hands over for a new release.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildArtifact {
    pub revision: String,
    pub image_ref: String,
    pub image_digest: String,
}

/// Bound addon configuration frozen into a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddonSnapshot {
    pub name: String,
    pub kind: String,
    pub config: Value,
}

/// The configuration a release runs with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSnapshot {
    pub env: BTreeMap<String, String>,
    pub addons: Vec<AddonSnapshot>,
}

impl ConfigSnapshot {
    /// Combine app env with addon snapshots. Addon `env` entries win.
    pub fn new(mut env: BTreeMap<String, String>, addons: Vec<AddonSnapshot>) -> Self {
        for addon in &addons {
            if let Some(vars) = addon.config.get("env").and_then(Value::as_object) {
                for (key, value) in vars {
                    if let Some(value) = value.as_str() {
                        env.insert(key.clone(), value.to_string());
                    }
                }
            }
        }
        Self { env, addons }
    }

    pub fn to_value(&self) -> EngineResult<Value> {
        serde_json::to_value(self)
            .map_err(|e| keel_state::StateError::Serialize(e.to_string()).into())
    }
}

pub struct ReleaseManager {
    store: StateStore,
}

impl ReleaseManager {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Record a new `pending` release.
    ///
    /// Fails `Conflict` when the app already has a non-failed release with
    /// the same image digest, so a duplicate build never yields two releases.
    pub fn create_release(
        &self,
        app_id: &str,
        artifact: BuildArtifact,
        config: Value,
    ) -> EngineResult<Release> {
        if artifact.image_digest.trim().is_empty() {
            return Err(EngineError::InvalidState("image digest is empty".into()));
        }
        if artifact.image_ref.trim().is_empty() {
            return Err(EngineError::InvalidState("image reference is empty".into()));
        }
        let release = self.store.write(|tx| -> EngineResult<_> {
            if tx.get_app(app_id)?.is_none() {
                return Err(EngineError::NotFound(format!("app {app_id}")));
            }
            if let Some(existing) = tx.release_for_digest(app_id, &artifact.image_digest)? {
                if existing.status != ReleaseStatus::Failed {
                    return Err(EngineError::Conflict(format!(
                        "release {} already carries digest {}",
                        existing.id, artifact.image_digest
                    )));
                }
            }
            let release = Release {
                id: uuid::Uuid::new_v4().to_string(),
                app_id: app_id.to_string(),
                revision: artifact.revision,
                image_ref: artifact.image_ref,
                image_digest: artifact.image_digest,
                config,
                status: ReleaseStatus::Pending,
                created_at: timestamp_now(),
            };
            tx.put_release(&release)?;
            EventRecorder::record(
                tx,
                EventKind::ReleaseCreated,
                json!({
                    "release_id": release.id,
                    "app_id": release.app_id,
                    "revision": release.revision,
                    "image_ref": release.image_ref,
                    "image_digest": release.image_digest,
                }),
            )?;
            Ok(release)
        })?;
        info!(
            app = %app_id,
            release = %release.id,
            digest = %release.image_digest,
            "release created"
        );
        Ok(release)
    }

    pub fn mark_ready(&self, release_id: &str) -> EngineResult<Release> {
        self.finish(release_id, ReleaseStatus::Ready, None)
    }

    pub fn mark_failed(&self, release_id: &str, reason: &str) -> EngineResult<Release> {
        self.finish(release_id, ReleaseStatus::Failed, Some(reason))
    }

    fn finish(
        &self,
        release_id: &str,
        to: ReleaseStatus,
        reason: Option<&str>,
    ) -> EngineResult<Release> {
        let release = self.store.write(|tx| -> EngineResult<_> {
            let mut release = tx
                .get_release(release_id)?
                .ok_or_else(|| EngineError::NotFound(format!("release {release_id}")))?;
            machine::check_release(release_id, release.status, to)?;
            release.status = to;
            tx.put_release(&release)?;
            let kind = match to {
                ReleaseStatus::Ready => EventKind::ReleaseReady,
                _ => EventKind::ReleaseFailed,
            };
            EventRecorder::record(
                tx,
                kind,
                json!({ "release_id": release.id, "app_id": release.app_id, "reason": reason }),
            )?;
            Ok(release)
        })?;
        info!(release = %release.id, status = %release.status, "release finished");
        Ok(release)
    }

    pub fn get_release(&self, release_id: &str) -> EngineResult<Release> {
        self.store
            .read(|v| v.get_release(release_id))?
            .ok_or_else(|| EngineError::NotFound(format!("release {release_id}")))
    }

    /// Releases of an app, newest first.
    pub fn list_releases(&self, app_id: &str) -> EngineResult<Vec<Release>> {
        Ok(self.store.read(|v| v.list_releases(app_id))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::AppRegistry;

    fn setup() -> (ReleaseManager, String) {
        let store = StateStore::open_in_memory().unwrap();
        let app = AppRegistry::new(store.clone()).register("web", "/r").unwrap();
        (ReleaseManager::new(store), app.id)
    }

    fn artifact(digest: &str) -> BuildArtifact {
        BuildArtifact {
            revision: "abc123".into(),
            image_ref: format!("registry.local/web@{digest}"),
            image_digest: digest.into(),
        }
    }

    #[test]
    fn new_release_is_pending() {
        let (releases, app) = setup();
        let r = releases
            .create_release(&app, artifact("sha256:01"), json!({"env": {}}))
            .unwrap();
        assert_eq!(r.status, ReleaseStatus::Pending);
        assert_eq!(releases.get_release(&r.id).unwrap(), r);
    }

    #[test]
    fn unknown_app_is_not_found() {
        let (releases, _) = setup();
        let err = releases
            .create_release("nope", artifact("sha256:01"), Value::Null)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn empty_digest_is_rejected() {
        let (releases, app) = setup();
        let err = releases
            .create_release(&app, artifact(" "), Value::Null)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[test]
    fn duplicate_digest_conflicts_unless_previous_failed() {
        let (releases, app) = setup();
        let first = releases
            .create_release(&app, artifact("sha256:01"), Value::Null)
            .unwrap();
        let err = releases
            .create_release(&app, artifact("sha256:01"), Value::Null)
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        releases.mark_failed(&first.id, "build broke").unwrap();
        let retry = releases
            .create_release(&app, artifact("sha256:01"), Value::Null)
            .unwrap();
        assert_ne!(retry.id, first.id);
        assert_eq!(releases.list_releases(&app).unwrap().len(), 2);
    }

    #[test]
    fn terminal_releases_reject_further_transitions() {
        let (releases, app) = setup();
        let r = releases
            .create_release(&app, artifact("sha256:01"), Value::Null)
            .unwrap();
        releases.mark_ready(&r.id).unwrap();
        assert!(matches!(
            releases.mark_failed(&r.id, "late"),
            Err(EngineError::InvalidTransition(_))
        ));
        assert!(matches!(
            releases.mark_ready(&r.id),
            Err(EngineError::InvalidTransition(_))
        ));
        assert_eq!(releases.get_release(&r.id).unwrap().status, ReleaseStatus::Ready);
    }

    #[test]
    fn snapshot_addon_env_overrides_app_env() {
        let env = BTreeMap::from([
            ("PORT".to_string(), "8080".to_string()),
            ("DATABASE_URL".to_string(), "sqlite://local".to_string()),
        ]);
        let addons = vec![AddonSnapshot {
            name: "db".into(),
            kind: "postgres".into(),
            config: json!({"env": {"DATABASE_URL": "postgres://db/web"}}),
        }];
        let snapshot = ConfigSnapshot::new(env, addons);
        assert_eq!(snapshot.env["DATABASE_URL"], "postgres://db/web");
        assert_eq!(snapshot.env["PORT"], "8080");
        let value = snapshot.to_value().unwrap();
        assert_eq!(value["addons"][0]["name"], "db");
    }
}
