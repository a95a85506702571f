//! Addon lifecycle and app/addon bindings.

use std::collections::HashMap;
use std::sync::Arc;

use keel_state::{Addon, App, Binding, StateStore, Tables, timestamp_now};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::events::{EventKind, EventRecorder};
use crate::releases::AddonSnapshot;
use crate::retry::{RetryPolicy, retry_transient};

/// Provisioning backend for one addon kind.
///
/// The returned JSON becomes the binding's config, typically
/// `{"env": {"DATABASE_URL": "..."}}`.
pub trait AddonProvisioner: Send + Sync {
    fn provision(&self, addon: &Addon, app: &App) -> anyhow::Result<Value>;
}

pub struct AddonBindingManager {
    store: StateStore,
    provisioners: HashMap<String, Arc<dyn AddonProvisioner>>,
    retry: RetryPolicy,
}

impl AddonBindingManager {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            provisioners: HashMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Register the provisioner used when binding addons of `kind`.
    pub fn with_provisioner(
        mut self,
        kind: impl Into<String>,
        provisioner: Arc<dyn AddonProvisioner>,
    ) -> Self {
        self.provisioners.insert(kind.into(), provisioner);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn create_addon(&self, name: &str, kind: &str, config: Value) -> EngineResult<Addon> {
        if name.trim().is_empty() || kind.trim().is_empty() {
            return Err(EngineError::InvalidState(
                "addon name and kind must not be empty".into(),
            ));
        }
        let addon = self.store.write(|tx| -> EngineResult<_> {
            if tx.get_addon_by_name(name)?.is_some() {
                return Err(EngineError::Conflict(format!("addon {name} already exists")));
            }
            let addon = Addon {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.to_string(),
                kind: kind.to_string(),
                config,
                created_at: timestamp_now(),
            };
            tx.insert_addon(&addon)?;
            EventRecorder::record(
                tx,
                EventKind::AddonCreated,
                json!({ "addon_id": addon.id, "name": addon.name, "kind": addon.kind }),
            )?;
            Ok(addon)
        })?;
        info!(addon = %addon.name, kind = %addon.kind, "addon created");
        Ok(addon)
    }

    /// Destroy an addon. Refused while any app is still bound to it.
    pub fn destroy_addon(&self, name: &str) -> EngineResult<Addon> {
        let addon = self.store.write(|tx| -> EngineResult<_> {
            let addon = tx
                .get_addon_by_name(name)?
                .ok_or_else(|| EngineError::NotFound(format!("addon {name}")))?;
            let bound = tx.list_bindings_for_addon(&addon.id)?;
            if !bound.is_empty() {
                return Err(EngineError::Conflict(format!(
                    "addon {name} is still bound to {} app(s)",
                    bound.len()
                )));
            }
            tx.delete_addon(&addon.id)?;
            EventRecorder::record(
                tx,
                EventKind::AddonDestroyed,
                json!({ "addon_id": addon.id, "name": addon.name }),
            )?;
            Ok(addon)
        })?;
        info!(addon = %addon.name, "addon destroyed");
        Ok(addon)
    }

    pub fn get_addon(&self, name: &str) -> EngineResult<Addon> {
        self.store
            .read(|v| v.get_addon_by_name(name))?
            .ok_or_else(|| EngineError::NotFound(format!("addon {name}")))
    }

    /// All addons, sorted by name.
    pub fn list_addons(&self) -> EngineResult<Vec<Addon>> {
        Ok(self.store.read(|v| v.list_addons())?)
    }

    pub fn list_bindings(&self, app_id: &str) -> EngineResult<Vec<Binding>> {
        Ok(self.store.read(|v| v.list_bindings_for_app(app_id))?)
    }

    /// Bind an addon to an app, provisioning it through the kind's backend.
    pub fn bind(&self, app_id: &str, addon_id: &str) -> EngineResult<Binding> {
        let (app, addon) = self.store.read(|v| -> EngineResult<_> {
            let app = v
                .get_app(app_id)?
                .ok_or_else(|| EngineError::NotFound(format!("app {app_id}")))?;
            let addon = v
                .get_addon(addon_id)?
                .ok_or_else(|| EngineError::NotFound(format!("addon {addon_id}")))?;
            if v.get_binding(app_id, addon_id)?.is_some() {
                return Err(already_bound(&app, &addon));
            }
            Ok((app, addon))
        })?;

        let config = match self.provisioners.get(&addon.kind) {
            Some(provisioner) => provisioner.provision(&addon, &app).map_err(|e| {
                EngineError::External(format!(
                    "provisioning {} for {}: {e:#}",
                    addon.name, app.name
                ))
            })?,
            None => {
                debug!(kind = %addon.kind, "no provisioner registered, binding without config");
                Value::Null
            }
        };
        self.bind_with_config(app_id, addon_id, config)
    }

    /// Bind an addon to an app with an explicit binding config.
    pub fn bind_with_config(
        &self,
        app_id: &str,
        addon_id: &str,
        config: Value,
    ) -> EngineResult<Binding> {
        let binding = self.store.write(|tx| -> EngineResult<_> {
            let app = tx
                .get_app(app_id)?
                .ok_or_else(|| EngineError::NotFound(format!("app {app_id}")))?;
            let addon = tx
                .get_addon(addon_id)?
                .ok_or_else(|| EngineError::NotFound(format!("addon {addon_id}")))?;
            if tx.get_binding(app_id, addon_id)?.is_some() {
                return Err(already_bound(&app, &addon));
            }
            let binding = Binding {
                id: uuid::Uuid::new_v4().to_string(),
                app_id: app_id.to_string(),
                addon_id: addon_id.to_string(),
                config,
                created_at: timestamp_now(),
            };
            tx.insert_binding(&binding)?;
            EventRecorder::record(
                tx,
                EventKind::BindingCreated,
                json!({ "binding_id": binding.id, "app_id": app_id, "addon_id": addon_id }),
            )?;
            Ok(binding)
        })?;
        info!(app = %app_id, addon = %addon_id, "addon bound");
        Ok(binding)
    }

    /// Remove a binding. Returns whether one existed; a missing binding is not an error.
    pub fn unbind(&self, app_id: &str, addon_id: &str) -> EngineResult<bool> {
        let removed = self.store.write(|tx| -> EngineResult<_> {
            let removed = tx.delete_binding(app_id, addon_id)?;
            if removed {
                EventRecorder::record(
                    tx,
                    EventKind::BindingRemoved,
                    json!({ "app_id": app_id, "addon_id": addon_id }),
                )?;
            }
            Ok(removed)
        })?;
        if removed {
            info!(app = %app_id, addon = %addon_id, "addon unbound");
        } else {
            debug!(app = %app_id, addon = %addon_id, "nothing to unbind");
        }
        Ok(removed)
    }

    /// [`unbind`](Self::unbind), retried on transient store failures.
    pub fn unbind_with_retry(&self, app_id: &str, addon_id: &str) -> EngineResult<bool> {
        retry_transient(&self.retry, || self.unbind(app_id, addon_id))
    }

    /// Every bound addon's config, with the binding's `env` merged over the addon's.
    pub fn addon_snapshots_for_app(&self, app_id: &str) -> EngineResult<Vec<AddonSnapshot>> {
        let mut snapshots = self.store.read(|v| -> EngineResult<_> {
            let mut snapshots = Vec::new();
            for binding in v.list_bindings_for_app(app_id)? {
                let Some(addon) = v.get_addon(&binding.addon_id)? else {
                    continue;
                };
                snapshots.push(AddonSnapshot {
                    config: merge_binding_env(addon.config, &binding.config),
                    name: addon.name,
                    kind: addon.kind,
                });
            }
            Ok(snapshots)
        })?;
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }
}

fn already_bound(app: &App, addon: &Addon) -> EngineError {
    EngineError::Conflict(format!("addon {} is already bound to {}", addon.name, app.name))
}

fn merge_binding_env(addon_config: Value, binding_config: &Value) -> Value {
    let mut config = match addon_config {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Some(binding_env) = binding_config.get("env").and_then(Value::as_object) {
        let entry = config
            .entry("env")
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(env) = entry {
            for (key, value) in binding_env {
                env.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(config)
}
