//! keel-engine: release and deployment consistency engine.
//!
//! Sits on top of [`keel_state::StateStore`] and owns every rule the data
//! model alone cannot express:
//!
//! - [`releases`]: immutable releases with one-shot `ready`/`failed` transitions
//! - [`current`]: the single current-release pointer per app
//! - [`deploy`]: the deployment state machine and compare-and-swap promotion
//! - [`addons`]: addon lifecycle and app/addon bindings
//! - [`events`]: the audit log written in the same transaction as each change
//! - [`reconcile`]: closing deployments left unfinished by crashes or timeouts
//!
//! [`Engine`] wires all components to one store from an [`EngineConfig`].

pub mod addons;
pub mod apps;
pub mod config;
pub mod current;
pub mod deploy;
pub mod error;
pub mod events;
pub mod machine;
pub mod reconcile;
pub mod releases;
pub mod retry;

use std::sync::Arc;

use keel_state::StateStore;

pub use addons::{AddonBindingManager, AddonProvisioner};
pub use apps::AppRegistry;
pub use config::EngineConfig;
pub use current::{CurrentReleaseTracker, InvariantViolation};
pub use deploy::{DeployHook, DeploymentOrchestrator, NoopHook};
pub use error::{EngineError, EngineResult};
pub use events::{EventKind, EventRecorder, StatusChange};
pub use reconcile::{AuditReport, Reconciler};
pub use releases::{AddonSnapshot, BuildArtifact, ConfigSnapshot, ReleaseManager};
pub use retry::{RetryPolicy, retry_transient};

/// All engine components sharing one store.
pub struct Engine {
    pub store: StateStore,
    pub apps: AppRegistry,
    pub releases: ReleaseManager,
    pub current: CurrentReleaseTracker,
    pub deployments: DeploymentOrchestrator,
    pub addons: AddonBindingManager,
    pub reconciler: Reconciler,
}

impl Engine {
    /// Open the store named by `config` and build every component on it.
    pub fn open(config: &EngineConfig) -> EngineResult<Self> {
        let store =
            StateStore::open(&config.store.path)?.with_write_timeout(config.write_timeout());
        Ok(Self::with_store(store, config, Arc::new(NoopHook)))
    }

    pub fn with_store(store: StateStore, config: &EngineConfig, hook: Arc<dyn DeployHook>) -> Self {
        Self {
            apps: AppRegistry::new(store.clone()),
            releases: ReleaseManager::new(store.clone()),
            current: CurrentReleaseTracker::new(store.clone()),
            deployments: DeploymentOrchestrator::with_hook(store.clone(), hook),
            addons: AddonBindingManager::new(store.clone())
                .with_retry_policy(config.retry_policy()),
            reconciler: Reconciler::new(store.clone()),
            store,
        }
    }

    pub fn with_provisioner(
        mut self,
        kind: impl Into<String>,
        provisioner: Arc<dyn AddonProvisioner>,
    ) -> Self {
        self.addons = self.addons.with_provisioner(kind, provisioner);
        self
    }
}
