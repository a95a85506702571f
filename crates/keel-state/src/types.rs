//! Domain types for the keel state store.
//!
//! These types represent the persisted state of apps, releases,
//! current-release pointers, deployments, addons, bindings and the event
//! log. All types are serializable to/from JSON for storage in redb tables.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for an app.
pub type AppId = String;

/// Unique identifier for a release.
pub type ReleaseId = String;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Unique identifier for an addon.
pub type AddonId = String;

// ── App ───────────────────────────────────────────────────────────

/// A registered application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub id: AppId,
    /// Unique, immutable human-readable name.
    pub name: String,
    /// Location of the source repository.
    pub repo_path: String,
    pub created_at: String,
    pub updated_at: String,
}

// ── Release ───────────────────────────────────────────────────────

/// An immutable, deployable artifact bound to one app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Release {
    pub id: ReleaseId,
    pub app_id: AppId,
    /// Source revision (e.g. a git sha).
    pub revision: String,
    /// Resolved image reference.
    pub image_ref: String,
    /// Content digest of the image.
    pub image_digest: String,
    /// Frozen configuration snapshot.
    pub config: Value,
    pub status: ReleaseStatus,
    pub created_at: String,
}

/// Lifecycle status of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Pending,
    Ready,
    Failed,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Ready => "ready",
            ReleaseStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReleaseStatus::Pending)
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

// ── Current release ───────────────────────────────────────────────

/// The single pointer from an app to its active release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentRelease {
    pub app_id: AppId,
    pub release_id: ReleaseId,
    pub updated_at: String,
}

// ── Deployment ────────────────────────────────────────────────────

/// A recorded attempt to transition an app's current release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub app_id: AppId,
    /// Release that was current when the deployment started. `None` on first deploy.
    pub from_release_id: Option<ReleaseId>,
    pub to_release_id: ReleaseId,
    pub status: DeploymentStatus,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Succeeded => "succeeded",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }

    /// `failed` counts as terminal: it only ever moves on to `rolled_back`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Succeeded | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

// ── Addon ─────────────────────────────────────────────────────────

/// An independently managed auxiliary service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Addon {
    pub id: AddonId,
    pub name: String,
    /// Selects provisioning behavior (e.g. "postgres", "redis").
    pub kind: String,
    pub config: Value,
    pub created_at: String,
}

/// Association of one addon to one app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Binding {
    pub id: String,
    pub app_id: AppId,
    pub addon_id: AddonId,
    /// Per-binding overrides, e.g. `{"env": {"DATABASE_URL": "..."}}`.
    #[serde(default)]
    pub config: Value,
    pub created_at: String,
}

// ── Event ─────────────────────────────────────────────────────────

/// Immutable audit record of a committed state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Global, gap-free ordering position.
    pub seq: u64,
    pub id: String,
    pub ts: String,
    pub kind: String,
    pub payload: Value,
}

impl Binding {
    /// Build the composite key for the bindings table.
    pub fn table_key(&self) -> String {
        binding_key(&self.app_id, &self.addon_id)
    }
}

impl Release {
    /// Build the composite key for the release digest index.
    pub fn digest_key(&self) -> String {
        digest_key(&self.app_id, &self.image_digest)
    }
}

/// Composite binding key `{app_id}:{addon_id}`.
pub fn binding_key(app_id: &str, addon_id: &str) -> String {
    format!("{app_id}:{addon_id}")
}

/// Key of a child row in an owner-scoped index: `{owner_id}:{child_id}`.
pub fn child_key(owner_id: &str, child_id: &str) -> String {
    format!("{owner_id}:{child_id}")
}

/// Composite digest index key `{app_id}:{digest}`.
pub fn digest_key(app_id: &str, digest: &str) -> String {
    format!("{app_id}:{digest}")
}

/// Current UTC time as an RFC 3339 string with millisecond precision.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_serialize_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&DeploymentStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&DeploymentStatus::RolledBack).unwrap(),
            "\"rolled_back\""
        );
        let back: ReleaseStatus = serde_json::from_str("\"ready\"").unwrap();
        assert_eq!(back, ReleaseStatus::Ready);
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert!(serde_json::from_str::<DeploymentStatus>("\"active\"").is_err());
    }

    #[test]
    fn binding_config_defaults_to_null() {
        let json = r#"{"id":"b","app_id":"a","addon_id":"d","created_at":"t"}"#;
        let binding: Binding = serde_json::from_str(json).unwrap();
        assert_eq!(binding.config, Value::Null);
        assert_eq!(binding.table_key(), "a:d");
    }

    #[test]
    fn timestamps_are_utc_millis() {
        let ts = timestamp_now();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
