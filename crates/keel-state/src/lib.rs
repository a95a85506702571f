//! keel-state: embedded state store for keel.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for apps, releases, current-release pointers, deployments,
//! addons, bindings and the append-only event log.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{app_id}:{addon_id}`, `{app_id}:{digest}`) back the
//! uniqueness rules. Index tables map natural names to ids, and owner-scoped
//! indexes (`{app_id}:{release_id}`, `{addon_id}:{app_id}`) turn per-app and
//! per-addon listings into prefix scans.
//!
//! Access goes through scoped transactions:
//!
//! ```text
//! StateStore::write(|tx: &mut StoreTxn| ...)   // commit on Ok, abort on Err
//! StateStore::read(|view: &StoreView| ...)     // consistent snapshot
//! ```
//!
//! Both handles implement [`Tables`] for typed reads. Writes check the
//! foreign-key style constraints of the data model and fail with
//! [`StateError::Constraint`] instead of leaving dangling references.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across threads and async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod migrations;
pub mod store;
pub mod tables;
pub mod txn;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{DEFAULT_WRITE_TIMEOUT, StateStore};
pub use txn::{StoreTxn, StoreView, Tables};
pub use types::*;
