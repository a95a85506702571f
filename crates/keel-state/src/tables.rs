//! redb table definitions for the keel state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Index tables map a natural key to a record id. Composite keys
//! follow the pattern `{owner_id}:{child}`, so an owner's rows are one
//! prefix range.

use redb::TableDefinition;

/// A table holding JSON-encoded records.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// A table mapping a natural key to a record id.
pub type IndexTable = TableDefinition<'static, &'static str, &'static str>;

/// Apps keyed by `{app_id}`.
pub const APPS: JsonTable = TableDefinition::new("apps");

/// Unique app name index: `{name}` -> `{app_id}`.
pub const APP_NAMES: IndexTable = TableDefinition::new("app_names");

/// Releases keyed by `{release_id}`.
pub const RELEASES: JsonTable = TableDefinition::new("releases");

/// Digest index: `{app_id}:{image_digest}` -> latest `{release_id}` with that digest.
pub const RELEASE_DIGESTS: IndexTable = TableDefinition::new("release_digests");

/// Releases of an app: `{app_id}:{release_id}` -> `{release_id}`. Added by migration 3.
pub const APP_RELEASES: IndexTable = TableDefinition::new("app_releases");

/// Current-release pointers keyed by `{app_id}`.
pub const CURRENT_RELEASES: JsonTable = TableDefinition::new("current_releases");

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: JsonTable = TableDefinition::new("deployments");

/// Deployments of an app: `{app_id}:{deployment_id}` -> `{deployment_id}`. Added by migration 3.
pub const APP_DEPLOYMENTS: IndexTable = TableDefinition::new("app_deployments");

/// Addons keyed by `{addon_id}`.
pub const ADDONS: JsonTable = TableDefinition::new("addons");

/// Unique addon name index: `{name}` -> `{addon_id}`. Added by migration 2.
pub const ADDON_NAMES: IndexTable = TableDefinition::new("addon_names");

/// Bindings keyed by `{app_id}:{addon_id}`.
pub const BINDINGS: JsonTable = TableDefinition::new("bindings");

/// Apps bound to an addon: `{addon_id}:{app_id}` -> `{app_id}`. Added by migration 3.
pub const ADDON_BINDINGS: IndexTable = TableDefinition::new("addon_bindings");

/// Append-only event log keyed by global sequence number.
pub const EVENTS: TableDefinition<'static, u64, &'static [u8]> = TableDefinition::new("events");

/// Applied schema versions: `{version}` -> applied-at timestamp.
pub const SCHEMA_MIGRATIONS: TableDefinition<'static, u32, &'static str> =
    TableDefinition::new("schema_migrations");
