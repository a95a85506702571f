//! StateStore: redb-backed state persistence for keel.
//!
//! Provides scoped transactions over apps, releases, current-release
//! pointers, deployments, addons, bindings and the event log. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::migrations;
use crate::tables::SCHEMA_MIGRATIONS;
use crate::txn::{StoreTxn, StoreView};

/// Default bound on waiting for the writer slot.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe state store backed by redb.
///
/// Write transactions are serialized through a single writer slot, which
/// gives every read-then-write operation serializable isolation.
///
/// The slot is global, matching redb's one-writer model: writes for
/// different apps queue behind each other too. Apps never conflict
/// logically, and no caller holds the slot for more than one short
/// transaction, so the wait is bounded by the write timeout. Deploy hooks
/// run outside any transaction.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    writer: Arc<Mutex<()>>,
    write_timeout: Duration,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let version = migrations::apply_pending(&db)?;
        debug!(version, "schema up to date");
        Ok(Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// Override how long a writer waits for the writer slot.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Run `f` inside one write transaction.
    ///
    /// Commits when `f` returns `Ok`. When `f` returns `Err` (or panics) the
    /// transaction is aborted and none of its writes become visible. Fails
    /// with [`StateError::Timeout`] if the writer slot stays busy longer than
    /// the configured write timeout.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut StoreTxn<'_>) -> Result<T, E>,
        E: From<StateError>,
    {
        let guard = match self.writer.try_lock_for(self.write_timeout) {
            Some(guard) => guard,
            None => {
                warn!(timeout = ?self.write_timeout, "writer slot busy, giving up");
                return Err(StateError::Timeout(self.write_timeout).into());
            }
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut tx = StoreTxn::new(txn, guard);
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.abort();
                Err(err)
            }
        }
    }

    /// Run `f` against a consistent read snapshot.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&StoreView) -> Result<T, E>,
        E: From<StateError>,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        f(&StoreView::new(txn))
    }

    /// Highest applied schema version.
    pub fn schema_version(&self) -> StateResult<u32> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCHEMA_MIGRATIONS).map_err(map_err!(Table))?;
        let version = match table.last().map_err(map_err!(Read))? {
            Some((key, _)) => key.value(),
            None => 0,
        };
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::Tables;
    use crate::types::*;
    use serde_json::json;
    use std::sync::Barrier;

    fn test_app(name: &str) -> App {
        App {
            id: format!("app-{name}"),
            name: name.to_string(),
            repo_path: format!("/srv/git/{name}.git"),
            created_at: timestamp_now(),
            updated_at: timestamp_now(),
        }
    }

    fn test_release(app_id: &str, id: &str, digest: &str) -> Release {
        Release {
            id: id.to_string(),
            app_id: app_id.to_string(),
            revision: "deadbeef".to_string(),
            image_ref: "ghcr.io/acme/web:latest".to_string(),
            image_digest: digest.to_string(),
            config: json!({"env": {"PORT": "8080"}}),
            status: ReleaseStatus::Pending,
            created_at: timestamp_now(),
        }
    }

    fn test_deployment(app_id: &str, id: &str, to: &str) -> Deployment {
        Deployment {
            id: id.to_string(),
            app_id: app_id.to_string(),
            from_release_id: None,
            to_release_id: to.to_string(),
            status: DeploymentStatus::Pending,
            error: None,
            created_at: timestamp_now(),
            updated_at: timestamp_now(),
        }
    }

    fn test_addon(name: &str) -> Addon {
        Addon {
            id: format!("addon-{name}"),
            name: name.to_string(),
            kind: "postgres".to_string(),
            config: json!({"env": {"PGHOST": "db"}}),
            created_at: timestamp_now(),
        }
    }

    fn seeded() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|tx| -> StateResult<()> {
                tx.insert_app(&test_app("web"))?;
                tx.put_release(&test_release("app-web", "r1", "sha256:aaa"))?;
                Ok(())
            })
            .unwrap();
        store
    }

    // ── Apps ───────────────────────────────────────────────────────

    #[test]
    fn app_insert_and_lookup_by_name() {
        let store = seeded();
        let app = store.read(|v| v.get_app_by_name("web")).unwrap();
        assert_eq!(app.map(|a| a.id), Some("app-web".to_string()));
        assert!(store.read(|v| v.get_app_by_name("nope")).unwrap().is_none());
    }

    #[test]
    fn duplicate_app_name_is_a_constraint_violation() {
        let store = seeded();
        let mut dup = test_app("web");
        dup.id = "app-other".to_string();
        let err = store.write(|tx| tx.insert_app(&dup)).unwrap_err();
        assert!(matches!(err, StateError::Constraint(_)));
    }

    #[test]
    fn delete_app_cascades_to_dependents() {
        let store = seeded();
        store
            .write(|tx| -> StateResult<()> {
                tx.set_current_release("app-web", "r1")?;
                tx.put_deployment(&test_deployment("app-web", "d1", "r1"))?;
                tx.insert_addon(&test_addon("db"))?;
                tx.insert_binding(&Binding {
                    id: "b1".to_string(),
                    app_id: "app-web".to_string(),
                    addon_id: "addon-db".to_string(),
                    config: serde_json::Value::Null,
                    created_at: timestamp_now(),
                })?;
                Ok(())
            })
            .unwrap();

        assert!(store.write(|tx| tx.delete_app("app-web")).unwrap());

        store
            .read(|v| -> StateResult<()> {
                assert!(v.get_app("app-web")?.is_none());
                assert!(v.get_release("r1")?.is_none());
                assert!(v.current_release("app-web")?.is_none());
                assert!(v.get_deployment("d1")?.is_none());
                assert!(v.list_bindings_for_addon("addon-db")?.is_empty());
                assert!(v.release_for_digest("app-web", "sha256:aaa")?.is_none());
                // Addons are not owned by apps.
                assert!(v.get_addon("addon-db")?.is_some());
                Ok(())
            })
            .unwrap();
        assert!(!store.write(|tx| tx.delete_app("app-web")).unwrap());
    }

    #[test]
    fn listings_are_scoped_to_their_owner() {
        let store = seeded();
        let binding = |app: &str| Binding {
            id: format!("b-{app}"),
            app_id: app.to_string(),
            addon_id: "addon-db".to_string(),
            config: serde_json::Value::Null,
            created_at: timestamp_now(),
        };
        store
            .write(|tx| -> StateResult<()> {
                tx.insert_app(&test_app("api"))?;
                tx.put_release(&test_release("app-api", "r-api", "sha256:bbb"))?;
                tx.put_deployment(&test_deployment("app-web", "d-web", "r1"))?;
                tx.put_deployment(&test_deployment("app-api", "d-api", "r-api"))?;
                tx.insert_addon(&test_addon("db"))?;
                tx.insert_binding(&binding("app-web"))?;
                tx.insert_binding(&binding("app-api"))
            })
            .unwrap();

        store
            .read(|v| -> StateResult<()> {
                let releases: Vec<String> =
                    v.list_releases("app-web")?.into_iter().map(|r| r.id).collect();
                assert_eq!(releases, vec!["r1".to_string()]);
                let deployments: Vec<String> =
                    v.list_deployments("app-api")?.into_iter().map(|d| d.id).collect();
                assert_eq!(deployments, vec!["d-api".to_string()]);
                assert_eq!(v.list_bindings_for_addon("addon-db")?.len(), 2);
                Ok(())
            })
            .unwrap();

        assert!(store.write(|tx| tx.delete_app("app-api")).unwrap());
        assert!(store.write(|tx| tx.delete_binding("app-web", "addon-db")).unwrap());
        store
            .read(|v| -> StateResult<()> {
                assert!(v.list_releases("app-api")?.is_empty());
                assert!(v.list_deployments("app-api")?.is_empty());
                assert!(v.list_bindings_for_addon("addon-db")?.is_empty());
                assert_eq!(v.list_releases("app-web")?.len(), 1);
                assert_eq!(v.list_deployments("app-web")?.len(), 1);
                Ok(())
            })
            .unwrap();
        assert!(store.write(|tx| tx.delete_addon("addon-db")).unwrap());
    }

    // ── Referential constraints ────────────────────────────────────

    #[test]
    fn release_requires_existing_app() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .write(|tx| tx.put_release(&test_release("ghost", "r1", "sha256:x")))
            .unwrap_err();
        assert!(matches!(err, StateError::Constraint(_)));
    }

    #[test]
    fn current_release_must_belong_to_app() {
        let store = seeded();
        store
            .write(|tx| -> StateResult<()> {
                tx.insert_app(&test_app("api"))?;
                tx.put_release(&test_release("app-api", "r-api", "sha256:bbb"))?;
                Ok(())
            })
            .unwrap();

        let err = store
            .write(|tx| tx.set_current_release("app-web", "r-api"))
            .unwrap_err();
        assert!(matches!(err, StateError::Constraint(_)));
        assert!(store.read(|v| v.current_release("app-web")).unwrap().is_none());
    }

    #[test]
    fn current_release_is_replaced_not_duplicated() {
        let store = seeded();
        store
            .write(|tx| -> StateResult<()> {
                tx.put_release(&test_release("app-web", "r2", "sha256:ccc"))?;
                tx.set_current_release("app-web", "r1")?;
                tx.set_current_release("app-web", "r2")?;
                Ok(())
            })
            .unwrap();
        let pointers = store.read(|v| v.list_current_releases()).unwrap();
        assert_eq!(pointers.len(), 1);
        assert_eq!(pointers[0].release_id, "r2");
    }

    #[test]
    fn deployment_release_must_belong_to_app() {
        let store = seeded();
        let err = store
            .write(|tx| tx.put_deployment(&test_deployment("app-web", "d1", "missing")))
            .unwrap_err();
        assert!(matches!(err, StateError::Constraint(_)));
    }

    #[test]
    fn binding_pair_is_unique_and_addon_delete_is_guarded() {
        let store = seeded();
        let binding = Binding {
            id: "b1".to_string(),
            app_id: "app-web".to_string(),
            addon_id: "addon-db".to_string(),
            config: serde_json::Value::Null,
            created_at: timestamp_now(),
        };
        store
            .write(|tx| -> StateResult<()> {
                tx.insert_addon(&test_addon("db"))?;
                tx.insert_binding(&binding)
            })
            .unwrap();

        let err = store.write(|tx| tx.insert_binding(&binding)).unwrap_err();
        assert!(matches!(err, StateError::Constraint(_)));

        let err = store.write(|tx| tx.delete_addon("addon-db")).unwrap_err();
        assert!(matches!(err, StateError::Constraint(_)));

        assert!(store.write(|tx| tx.delete_binding("app-web", "addon-db")).unwrap());
        assert!(!store.write(|tx| tx.delete_binding("app-web", "addon-db")).unwrap());
        assert!(store.write(|tx| tx.delete_addon("addon-db")).unwrap());
        assert!(store.read(|v| v.get_addon_by_name("db")).unwrap().is_none());
    }

    // ── Transactions ───────────────────────────────────────────────

    #[test]
    fn failed_closure_rolls_back_every_write() {
        let store = seeded();
        let result: StateResult<()> = store.write(|tx| {
            tx.insert_app(&test_app("api"))?;
            tx.append_event("app.registered", json!({"name": "api"}))?;
            Err(StateError::Constraint("forced".to_string()))
        });
        assert!(result.is_err());

        store
            .read(|v| -> StateResult<()> {
                assert!(v.get_app_by_name("api")?.is_none());
                assert!(v.events_since(0, 100)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn busy_writer_slot_times_out() {
        let store = seeded().with_write_timeout(Duration::from_millis(50));
        let held = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let holder = {
            let store = store.clone();
            let held = held.clone();
            let release = release.clone();
            std::thread::spawn(move || {
                store
                    .write(|_tx| -> StateResult<()> {
                        held.wait();
                        release.wait();
                        Ok(())
                    })
                    .unwrap();
            })
        };

        held.wait();
        let err = store
            .write(|tx| tx.insert_app(&test_app("api")))
            .unwrap_err();
        assert!(matches!(err, StateError::Timeout(_)));
        assert!(err.is_transient());
        release.wait();
        holder.join().unwrap();

        store.write(|tx| tx.insert_app(&test_app("api"))).unwrap();
    }

    // ── Events ─────────────────────────────────────────────────────

    #[test]
    fn events_are_sequenced_and_time_ordered() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .write(|tx| tx.append_event("test.tick", json!({"i": i})))
                .unwrap();
        }
        let events = store.read(|v| v.events_since(0, 100)).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert!(events.windows(2).all(|w| w[0].ts <= w[1].ts));

        let tail = store.read(|v| v.events_since(4, 100)).unwrap();
        assert_eq!(tail.len(), 2);
        let limited = store.read(|v| v.events_since(0, 2)).unwrap();
        assert_eq!(limited.len(), 2);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("keel.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.write(|tx| tx.insert_app(&test_app("web"))).unwrap();
            assert_eq!(store.schema_version().unwrap(), 3);
        }

        let store = StateStore::open(&db_path).unwrap();
        let app = store.read(|v| v.get_app_by_name("web")).unwrap();
        assert_eq!(app.unwrap().repo_path, "/srv/git/web.git");
        assert_eq!(store.schema_version().unwrap(), 3);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .read(|v| -> StateResult<()> {
                assert!(v.list_apps()?.is_empty());
                assert!(v.list_addons()?.is_empty());
                assert!(v.list_releases("any")?.is_empty());
                assert!(v.list_deployments("any")?.is_empty());
                assert!(v.list_unfinished_deployments()?.is_empty());
                assert!(v.current_release("any")?.is_none());
                Ok(())
            })
            .unwrap();
        assert!(!store.write(|tx| tx.delete_binding("a", "b")).unwrap());
        assert!(!store.write(|tx| tx.delete_addon("nope")).unwrap());
    }
}
