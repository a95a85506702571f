//! Transaction handles for typed reads and constrained writes.
//!
//! [`StoreView`] wraps a read snapshot, [`StoreTxn`] wraps the single write
//! transaction. Both implement [`Tables`], so every typed getter is
//! available on either side. Only [`StoreTxn`] can write, and every write
//! checks the referential constraints of the data model before touching a
//! table.

use parking_lot::MutexGuard;
use redb::{ReadTransaction, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Typed read access shared by read snapshots and write transactions.
pub trait Tables {
    /// Raw JSON bytes of one record.
    fn record(&self, table: JsonTable, key: &str) -> StateResult<Option<Vec<u8>>>;

    /// Raw JSON bytes of every record whose key starts with `prefix`.
    fn records(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<Vec<u8>>>;

    /// Record id stored under a natural key.
    fn index(&self, table: IndexTable, key: &str) -> StateResult<Option<String>>;

    /// Ids stored under every index key starting with `prefix`.
    fn indexed(&self, table: IndexTable, prefix: &str) -> StateResult<Vec<String>>;

    /// Events with `seq >= since_seq`, in sequence order.
    fn events_since(&self, since_seq: u64, limit: usize) -> StateResult<Vec<Event>>;

    // ── Apps ───────────────────────────────────────────────────────

    fn get_app(&self, app_id: &str) -> StateResult<Option<App>> {
        decode_opt(self.record(APPS, app_id)?)
    }

    fn get_app_by_name(&self, name: &str) -> StateResult<Option<App>> {
        match self.index(APP_NAMES, name)? {
            Some(id) => self.get_app(&id),
            None => Ok(None),
        }
    }

    /// All apps, sorted by name.
    fn list_apps(&self) -> StateResult<Vec<App>> {
        let mut apps: Vec<App> = decode_all(self.records(APPS, "")?)?;
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(apps)
    }

    // ── Releases ───────────────────────────────────────────────────

    fn get_release(&self, release_id: &str) -> StateResult<Option<Release>> {
        decode_opt(self.record(RELEASES, release_id)?)
    }

    /// Releases of an app, newest first.
    fn list_releases(&self, app_id: &str) -> StateResult<Vec<Release>> {
        let mut releases = Vec::new();
        for id in self.indexed(APP_RELEASES, &format!("{app_id}:"))? {
            releases.extend(self.get_release(&id)?);
        }
        releases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(releases)
    }

    /// Latest release of an app carrying the given digest.
    fn release_for_digest(&self, app_id: &str, digest: &str) -> StateResult<Option<Release>> {
        match self.index(RELEASE_DIGESTS, &digest_key(app_id, digest))? {
            Some(id) => self.get_release(&id),
            None => Ok(None),
        }
    }

    // ── Current release ────────────────────────────────────────────

    fn current_release(&self, app_id: &str) -> StateResult<Option<CurrentRelease>> {
        decode_opt(self.record(CURRENT_RELEASES, app_id)?)
    }

    /// Every current-release pointer in the store.
    fn list_current_releases(&self) -> StateResult<Vec<CurrentRelease>> {
        decode_all(self.records(CURRENT_RELEASES, "")?)
    }

    // ── Deployments ────────────────────────────────────────────────

    fn get_deployment(&self, deployment_id: &str) -> StateResult<Option<Deployment>> {
        decode_opt(self.record(DEPLOYMENTS, deployment_id)?)
    }

    /// Deployments of an app, newest first.
    fn list_deployments(&self, app_id: &str) -> StateResult<Vec<Deployment>> {
        let mut deployments = Vec::new();
        for id in self.indexed(APP_DEPLOYMENTS, &format!("{app_id}:"))? {
            deployments.extend(self.get_deployment(&id)?);
        }
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deployments)
    }

    /// Deployments still in `pending` or `in_progress`, across all apps.
    fn list_unfinished_deployments(&self) -> StateResult<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> = decode_all(self.records(DEPLOYMENTS, "")?)?;
        deployments.retain(|d| !d.status.is_terminal());
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deployments)
    }

    // ── Addons & bindings ──────────────────────────────────────────

    fn get_addon(&self, addon_id: &str) -> StateResult<Option<Addon>> {
        decode_opt(self.record(ADDONS, addon_id)?)
    }

    fn get_addon_by_name(&self, name: &str) -> StateResult<Option<Addon>> {
        match self.index(ADDON_NAMES, name)? {
            Some(id) => self.get_addon(&id),
            None => Ok(None),
        }
    }

    /// All addons, sorted by name.
    fn list_addons(&self) -> StateResult<Vec<Addon>> {
        let mut addons: Vec<Addon> = decode_all(self.records(ADDONS, "")?)?;
        addons.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(addons)
    }

    fn get_binding(&self, app_id: &str, addon_id: &str) -> StateResult<Option<Binding>> {
        decode_opt(self.record(BINDINGS, &binding_key(app_id, addon_id))?)
    }

    fn list_bindings_for_app(&self, app_id: &str) -> StateResult<Vec<Binding>> {
        decode_all(self.records(BINDINGS, &format!("{app_id}:"))?)
    }

    fn list_bindings_for_addon(&self, addon_id: &str) -> StateResult<Vec<Binding>> {
        let mut bindings = Vec::new();
        for app_id in self.indexed(ADDON_BINDINGS, &format!("{addon_id}:"))? {
            bindings.extend(self.get_binding(&app_id, addon_id)?);
        }
        Ok(bindings)
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn decode_opt<T: DeserializeOwned>(bytes: Option<Vec<u8>>) -> StateResult<Option<T>> {
    bytes.map(|b| decode(&b)).transpose()
}

fn decode_all<T: DeserializeOwned>(rows: Vec<Vec<u8>>) -> StateResult<Vec<T>> {
    rows.iter().map(|b| decode(b)).collect()
}

fn read_record(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<Vec<u8>>> {
    Ok(table
        .get(key)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_vec()))
}

fn read_prefix(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<Vec<u8>>> {
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        results.push(value.value().to_vec());
    }
    Ok(results)
}

fn read_index(
    table: &impl ReadableTable<&'static str, &'static str>,
    key: &str,
) -> StateResult<Option<String>> {
    Ok(table
        .get(key)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_string()))
}

fn read_index_prefix(
    table: &impl ReadableTable<&'static str, &'static str>,
    prefix: &str,
) -> StateResult<Vec<String>> {
    let mut ids = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        ids.push(value.value().to_string());
    }
    Ok(ids)
}

fn read_events(
    table: &impl ReadableTable<u64, &'static [u8]>,
    since_seq: u64,
    limit: usize,
) -> StateResult<Vec<Event>> {
    let mut results = Vec::new();
    for entry in table.range(since_seq..).map_err(map_err!(Read))? {
        if results.len() >= limit {
            break;
        }
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

// ── Read snapshot ─────────────────────────────────────────────────

/// A consistent read-only snapshot of the store.
pub struct StoreView {
    txn: ReadTransaction,
}

impl StoreView {
    pub(crate) fn new(txn: ReadTransaction) -> Self {
        Self { txn }
    }
}

impl Tables for StoreView {
    fn record(&self, table: JsonTable, key: &str) -> StateResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        read_record(&table, key)
    }

    fn records(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<Vec<u8>>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        read_prefix(&table, prefix)
    }

    fn index(&self, table: IndexTable, key: &str) -> StateResult<Option<String>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        read_index(&table, key)
    }

    fn indexed(&self, table: IndexTable, prefix: &str) -> StateResult<Vec<String>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        read_index_prefix(&table, prefix)
    }

    fn events_since(&self, since_seq: u64, limit: usize) -> StateResult<Vec<Event>> {
        let table = self.txn.open_table(EVENTS).map_err(map_err!(Table))?;
        read_events(&table, since_seq, limit)
    }
}

// ── Write transaction ─────────────────────────────────────────────

/// The store's single write transaction.
///
/// Holding a `StoreTxn` means holding the writer slot: nothing else can
/// write until it is committed or dropped. Dropping without commit aborts.
pub struct StoreTxn<'a> {
    // Field order matters: the transaction must end before the slot is released.
    txn: WriteTransaction,
    _writer: MutexGuard<'a, ()>,
}

impl<'a> StoreTxn<'a> {
    pub(crate) fn new(txn: WriteTransaction, writer: MutexGuard<'a, ()>) -> Self {
        Self {
            txn,
            _writer: writer,
        }
    }

    pub(crate) fn commit(self) -> StateResult<()> {
        let StoreTxn { txn, _writer } = self;
        txn.commit().map_err(map_err!(Transaction))
    }

    pub(crate) fn abort(self) {
        let StoreTxn { txn, _writer } = self;
        if let Err(e) = txn.abort() {
            debug!(error = %e, "write transaction abort reported an error");
        }
    }

    fn put_record<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table
            .insert(key, bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn remove_record(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    fn put_index(&self, table: IndexTable, key: &str, id: &str) -> StateResult<()> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table.insert(key, id).map_err(map_err!(Write))?;
        Ok(())
    }

    fn remove_index(&self, table: IndexTable, key: &str) -> StateResult<()> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table.remove(key).map_err(map_err!(Write))?;
        Ok(())
    }

    fn require_app(&self, app_id: &str) -> StateResult<App> {
        self.get_app(app_id)?
            .ok_or_else(|| StateError::Constraint(format!("app {app_id} does not exist")))
    }

    fn require_release_of(&self, app_id: &str, release_id: &str) -> StateResult<Release> {
        let release = self
            .get_release(release_id)?
            .ok_or_else(|| StateError::Constraint(format!("release {release_id} does not exist")))?;
        if release.app_id != app_id {
            return Err(StateError::Constraint(format!(
                "release {release_id} belongs to app {}, not {app_id}",
                release.app_id
            )));
        }
        Ok(release)
    }

    // ── Apps ───────────────────────────────────────────────────────

    /// Insert a new app. The name must be unused.
    pub fn insert_app(&self, app: &App) -> StateResult<()> {
        if self.index(APP_NAMES, &app.name)?.is_some() {
            return Err(StateError::Constraint(format!(
                "app name {} already exists",
                app.name
            )));
        }
        self.put_record(APPS, &app.id, app)?;
        self.put_index(APP_NAMES, &app.name, &app.id)?;
        debug!(app = %app.name, id = %app.id, "app stored");
        Ok(())
    }

    /// Delete an app and everything it owns. Returns true if it existed.
    pub fn delete_app(&self, app_id: &str) -> StateResult<bool> {
        let Some(app) = self.get_app(app_id)? else {
            return Ok(false);
        };
        let releases = self.list_releases(app_id)?;
        for release in &releases {
            self.remove_record(RELEASES, &release.id)?;
            self.remove_index(RELEASE_DIGESTS, &release.digest_key())?;
            self.remove_index(APP_RELEASES, &child_key(app_id, &release.id))?;
        }
        self.remove_record(CURRENT_RELEASES, app_id)?;
        let deployments = self.list_deployments(app_id)?;
        for deployment in &deployments {
            self.remove_record(DEPLOYMENTS, &deployment.id)?;
            self.remove_index(APP_DEPLOYMENTS, &child_key(app_id, &deployment.id))?;
        }
        let bindings = self.list_bindings_for_app(app_id)?;
        for binding in &bindings {
            self.remove_record(BINDINGS, &binding.table_key())?;
            self.remove_index(ADDON_BINDINGS, &child_key(&binding.addon_id, app_id))?;
        }
        self.remove_record(APPS, app_id)?;
        self.remove_index(APP_NAMES, &app.name)?;
        debug!(
            app = %app.name,
            releases = releases.len(),
            deployments = deployments.len(),
            bindings = bindings.len(),
            "app deleted with dependents"
        );
        Ok(true)
    }

    // ── Releases ───────────────────────────────────────────────────

    /// Insert or update a release. Its app must exist.
    pub fn put_release(&self, release: &Release) -> StateResult<()> {
        self.require_app(&release.app_id)?;
        self.put_record(RELEASES, &release.id, release)?;
        self.put_index(RELEASE_DIGESTS, &release.digest_key(), &release.id)?;
        self.put_index(APP_RELEASES, &child_key(&release.app_id, &release.id), &release.id)?;
        debug!(release = %release.id, status = %release.status, "release stored");
        Ok(())
    }

    // ── Current release ────────────────────────────────────────────

    /// Replace the app's current-release pointer.
    ///
    /// The release must exist and belong to `app_id`.
    pub fn set_current_release(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> StateResult<CurrentRelease> {
        self.require_app(app_id)?;
        self.require_release_of(app_id, release_id)?;
        let pointer = CurrentRelease {
            app_id: app_id.to_string(),
            release_id: release_id.to_string(),
            updated_at: timestamp_now(),
        };
        self.put_record(CURRENT_RELEASES, app_id, &pointer)?;
        debug!(app = %app_id, release = %release_id, "current release replaced");
        Ok(pointer)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment. Its app and releases must exist and agree.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.require_app(&deployment.app_id)?;
        self.require_release_of(&deployment.app_id, &deployment.to_release_id)?;
        if let Some(from) = &deployment.from_release_id {
            self.require_release_of(&deployment.app_id, from)?;
        }
        self.put_record(DEPLOYMENTS, &deployment.id, deployment)?;
        self.put_index(
            APP_DEPLOYMENTS,
            &child_key(&deployment.app_id, &deployment.id),
            &deployment.id,
        )?;
        debug!(deployment = %deployment.id, status = %deployment.status, "deployment stored");
        Ok(())
    }

    // ── Addons & bindings ──────────────────────────────────────────

    /// Insert a new addon. The name must be unused.
    pub fn insert_addon(&self, addon: &Addon) -> StateResult<()> {
        if self.index(ADDON_NAMES, &addon.name)?.is_some() {
            return Err(StateError::Constraint(format!(
                "addon name {} already exists",
                addon.name
            )));
        }
        self.put_record(ADDONS, &addon.id, addon)?;
        self.put_index(ADDON_NAMES, &addon.name, &addon.id)?;
        Ok(())
    }

    /// Delete an addon. Fails while any binding still references it.
    pub fn delete_addon(&self, addon_id: &str) -> StateResult<bool> {
        let Some(addon) = self.get_addon(addon_id)? else {
            return Ok(false);
        };
        let bound = self.list_bindings_for_addon(addon_id)?;
        if !bound.is_empty() {
            return Err(StateError::Constraint(format!(
                "addon {} is still bound to {} app(s)",
                addon.name,
                bound.len()
            )));
        }
        self.remove_record(ADDONS, addon_id)?;
        self.remove_index(ADDON_NAMES, &addon.name)?;
        Ok(true)
    }

    /// Insert a new binding. Both sides must exist and the pair must be unbound.
    pub fn insert_binding(&self, binding: &Binding) -> StateResult<()> {
        self.require_app(&binding.app_id)?;
        if self.get_addon(&binding.addon_id)?.is_none() {
            return Err(StateError::Constraint(format!(
                "addon {} does not exist",
                binding.addon_id
            )));
        }
        let key = binding.table_key();
        if self.record(BINDINGS, &key)?.is_some() {
            return Err(StateError::Constraint(format!("binding {key} already exists")));
        }
        self.put_record(BINDINGS, &key, binding)?;
        self.put_index(
            ADDON_BINDINGS,
            &child_key(&binding.addon_id, &binding.app_id),
            &binding.app_id,
        )?;
        debug!(%key, "binding stored");
        Ok(())
    }

    /// Delete a binding. Returns true if it existed.
    pub fn delete_binding(&self, app_id: &str, addon_id: &str) -> StateResult<bool> {
        let existed = self.remove_record(BINDINGS, &binding_key(app_id, addon_id))?;
        self.remove_index(ADDON_BINDINGS, &child_key(addon_id, app_id))?;
        Ok(existed)
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append an event with the next sequence number.
    ///
    /// The timestamp never goes backwards relative to the previous event,
    /// so ordering by `ts` and by `seq` agree.
    pub fn append_event(&self, kind: &str, payload: Value) -> StateResult<Event> {
        let mut table = self.txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let (seq, last_ts) = match table.last().map_err(map_err!(Read))? {
            Some((key, value)) => {
                let last: Event = decode(value.value())?;
                (key.value() + 1, Some(last.ts))
            }
            None => (1, None),
        };
        let now = timestamp_now();
        let ts = match last_ts {
            Some(last) if last > now => last,
            _ => now,
        };
        let event = Event {
            seq,
            id: uuid::Uuid::new_v4().to_string(),
            ts,
            kind: kind.to_string(),
            payload,
        };
        let bytes = serde_json::to_vec(&event).map_err(map_err!(Serialize))?;
        table
            .insert(seq, bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(event)
    }
}

impl Tables for StoreTxn<'_> {
    fn record(&self, table: JsonTable, key: &str) -> StateResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        read_record(&table, key)
    }

    fn records(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<Vec<u8>>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        read_prefix(&table, prefix)
    }

    fn index(&self, table: IndexTable, key: &str) -> StateResult<Option<String>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        read_index(&table, key)
    }

    fn indexed(&self, table: IndexTable, prefix: &str) -> StateResult<Vec<String>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        read_index_prefix(&table, prefix)
    }

    fn events_since(&self, since_seq: u64, limit: usize) -> StateResult<Vec<Event>> {
        let table = self.txn.open_table(EVENTS).map_err(map_err!(Table))?;
        read_events(&table, since_seq, limit)
    }
}
