//! App registration and cascading deregistration.

use keel_state::{App, StateStore, Tables, timestamp_now};
use serde_json::json;
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::events::{EventKind, EventRecorder};

pub struct AppRegistry {
    store: StateStore,
}

/// App names are DNS-label-like: lowercase alphanumerics and `-`.
pub fn validate_app_name(name: &str) -> EngineResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidState(format!(
            "invalid app name {name:?}: use lowercase letters, digits and '-'"
        )))
    }
}

impl AppRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn register(&self, name: &str, repo_path: &str) -> EngineResult<App> {
        validate_app_name(name)?;
        let app = self.store.write(|tx| -> EngineResult<_> {
            if tx.get_app_by_name(name)?.is_some() {
                return Err(EngineError::Conflict(format!("app {name} already exists")));
            }
            let now = timestamp_now();
            let app = App {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.to_string(),
                repo_path: repo_path.to_string(),
                created_at: now.clone(),
                updated_at: now,
            };
            tx.insert_app(&app)?;
            EventRecorder::record(
                tx,
                EventKind::AppRegistered,
                json!({ "app_id": app.id, "name": app.name, "repo_path": app.repo_path }),
            )?;
            Ok(app)
        })?;
        info!(app = %app.name, id = %app.id, "app registered");
        Ok(app)
    }

    pub fn get(&self, name: &str) -> EngineResult<App> {
        self.store
            .read(|v| v.get_app_by_name(name))?
            .ok_or_else(|| EngineError::NotFound(format!("app {name}")))
    }

    /// All apps, sorted by name.
    pub fn list(&self) -> EngineResult<Vec<App>> {
        Ok(self.store.read(|v| v.list_apps())?)
    }

    /// Remove an app with its releases, current pointer, deployments and bindings.
    pub fn deregister(&self, name: &str) -> EngineResult<App> {
        let app = self.store.write(|tx| -> EngineResult<_> {
            let app = tx
                .get_app_by_name(name)?
                .ok_or_else(|| EngineError::NotFound(format!("app {name}")))?;
            let releases = tx.list_releases(&app.id)?.len();
            let deployments = tx.list_deployments(&app.id)?.len();
            let bindings = tx.list_bindings_for_app(&app.id)?.len();
            tx.delete_app(&app.id)?;
            EventRecorder::record(
                tx,
                EventKind::AppDeregistered,
                json!({
                    "app_id": app.id,
                    "name": app.name,
                    "releases": releases,
                    "deployments": deployments,
                    "bindings": bindings,
                }),
            )?;
            Ok(app)
        })?;
        info!(app = %app.name, "app deregistered");
        Ok(app)
    }
}
