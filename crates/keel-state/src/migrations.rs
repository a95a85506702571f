//! Forward-only schema migrations.
//!
//! Each migration runs at most once and is recorded in `schema_migrations`
//! in the same write transaction that applies it. Migrations are additive:
//! they create tables or backfill indexes, never drop data.

use redb::{Database, ReadableTable, WriteTransaction};
use tracing::info;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::{Addon, Binding, Deployment, Release, child_key, timestamp_now};

/// A single schema step.
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    apply: fn(&WriteTransaction) -> StateResult<()>,
}

/// All migrations, in application order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "core tables",
        apply: create_core_tables,
    },
    Migration {
        version: 2,
        description: "addon name index",
        apply: create_addon_name_index,
    },
    Migration {
        version: 3,
        description: "owner-scoped release, deployment and binding indexes",
        apply: create_owner_indexes,
    },
];

/// Highest version this build knows about.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

fn create_core_tables(txn: &WriteTransaction) -> StateResult<()> {
    // Opening a table in a write transaction creates it if absent.
    txn.open_table(APPS).map_err(map_err!(Table))?;
    txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
    txn.open_table(RELEASES).map_err(map_err!(Table))?;
    txn.open_table(RELEASE_DIGESTS).map_err(map_err!(Table))?;
    txn.open_table(CURRENT_RELEASES).map_err(map_err!(Table))?;
    txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
    txn.open_table(ADDONS).map_err(map_err!(Table))?;
    txn.open_table(BINDINGS).map_err(map_err!(Table))?;
    txn.open_table(EVENTS).map_err(map_err!(Table))?;
    Ok(())
}

fn create_addon_name_index(txn: &WriteTransaction) -> StateResult<()> {
    let addons: Vec<Addon> = decode_table(txn, ADDONS)?;
    let mut names = txn.open_table(ADDON_NAMES).map_err(map_err!(Table))?;
    for addon in &addons {
        names
            .insert(addon.name.as_str(), addon.id.as_str())
            .map_err(map_err!(Write))?;
    }
    Ok(())
}

fn decode_table<T: serde::de::DeserializeOwned>(
    txn: &WriteTransaction,
    table: JsonTable,
) -> StateResult<Vec<T>> {
    let table = txn.open_table(table).map_err(map_err!(Table))?;
    let mut rows = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        rows.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(rows)
}

fn create_owner_indexes(txn: &WriteTransaction) -> StateResult<()> {
    let releases: Vec<Release> = decode_table(txn, RELEASES)?;
    let deployments: Vec<Deployment> = decode_table(txn, DEPLOYMENTS)?;
    let bindings: Vec<Binding> = decode_table(txn, BINDINGS)?;

    let mut index = txn.open_table(APP_RELEASES).map_err(map_err!(Table))?;
    for r in &releases {
        index
            .insert(child_key(&r.app_id, &r.id).as_str(), r.id.as_str())
            .map_err(map_err!(Write))?;
    }
    let mut index = txn.open_table(APP_DEPLOYMENTS).map_err(map_err!(Table))?;
    for d in &deployments {
        index
            .insert(child_key(&d.app_id, &d.id).as_str(), d.id.as_str())
            .map_err(map_err!(Write))?;
    }
    let mut index = txn.open_table(ADDON_BINDINGS).map_err(map_err!(Table))?;
    for b in &bindings {
        index
            .insert(child_key(&b.addon_id, &b.app_id).as_str(), b.app_id.as_str())
            .map_err(map_err!(Write))?;
    }
    Ok(())
}

/// Apply every migration not yet recorded. Returns the resulting version.
pub(crate) fn apply_pending(db: &Database) -> StateResult<u32> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    let applied: Vec<u32> = {
        let table = txn.open_table(SCHEMA_MIGRATIONS).map_err(map_err!(Table))?;
        let mut versions = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            versions.push(key.value());
        }
        versions
    };
    if let Some(newest) = applied.iter().max() {
        if *newest > latest_version() {
            return Err(StateError::Open(format!(
                "database schema version {newest} is newer than supported version {}",
                latest_version()
            )));
        }
    }
    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        (migration.apply)(&txn)?;
        let mut table = txn.open_table(SCHEMA_MIGRATIONS).map_err(map_err!(Table))?;
        let now = timestamp_now();
        table
            .insert(migration.version, now.as_str())
            .map_err(map_err!(Write))?;
        info!(
            version = migration.version,
            description = migration.description,
            "schema migration applied"
        );
    }
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(latest_version())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_increasing() {
        let versions: Vec<u32> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(latest_version(), 3);
    }
}
