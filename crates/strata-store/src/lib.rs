//! # Strata Store - Object Database Abstraction
//!
//! Provides the abstract object-database operations the repository layer is
//! built on, together with the in-memory reference backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │               strata-repository                  │
//! │      (lifecycle, transactions, polymorphism)     │
//! ├──────────────────────────────────────────────────┤
//! │                 ObjectStore (S)                  │
//! │   ObjectStoreOps: get/put, item CRUD, find,      │
//! │   count - implemented by backends AND by their   │
//! │   transaction handles                            │
//! ├──────────────────────────────────────────────────┤
//! │                 MemoryBackend                    │
//! │   (per-class rows + chain membership index)      │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! A backend stores each item once, under its most-derived class, and keeps
//! a membership index entry for every class of the item's chain so that
//! queries on a base class see derived items. Transaction handles implement
//! the same operation surface; the repository swaps one in behind a
//! transactional view without the operations noticing.

#![deny(unsafe_code)]

use async_trait::async_trait;
use serde_json::Value;
use strata_types::{
    DeleteOptions, FindOptions, GetOptions, PutOptions, StoreEvent, StoreResult, StoredRecord,
};
use tokio::sync::broadcast;

pub mod factory;
pub mod memory;

pub use factory::{BackendType, StorageConfig, StorageFactory};
pub use memory::{MemoryBackend, MemoryTransaction};

/// The operation surface shared by backends and their transaction handles.
///
/// Keys for the raw singleton store are composite string paths (the
/// repository record lives under `[name, "$Repository"]`). Item operations
/// are keyed by class name and primary key; `put_item` takes the item's full
/// class chain so the backend can index membership for every base class.
#[async_trait]
pub trait ObjectStoreOps: Send + Sync {
    /// Read a raw singleton value.
    async fn get(&self, key: &[String], options: &GetOptions) -> StoreResult<Option<Value>>;

    /// Write a raw singleton value.
    async fn put(&self, key: &[String], value: Value, options: &PutOptions) -> StoreResult<()>;

    /// Look up one item through any class of its chain.
    async fn get_item(
        &self,
        class: &str,
        key: &str,
        options: &GetOptions,
    ) -> StoreResult<Option<StoredRecord>>;

    /// Bulk lookup preserving input order. Missing keys raise `NotFound`
    /// under `error_if_missing` and are skipped otherwise.
    async fn get_items(
        &self,
        class: &str,
        keys: &[String],
        options: &GetOptions,
    ) -> StoreResult<Vec<StoredRecord>>;

    /// Write an item under every class of `classes` (most-derived first).
    ///
    /// `error_if_exists` conflicts when any chain class already holds the
    /// key; a put without `create_if_missing` requires the key to exist.
    async fn put_item(
        &self,
        classes: &[String],
        key: &str,
        value: Value,
        options: &PutOptions,
    ) -> StoreResult<()>;

    /// Delete an item through any class of its chain. Returns whether a
    /// record was actually removed.
    async fn delete_item(
        &self,
        class: &str,
        key: &str,
        options: &DeleteOptions,
    ) -> StoreResult<bool>;

    /// Range/query lookup over one class, including derived members.
    async fn find_items(&self, class: &str, options: &FindOptions)
        -> StoreResult<Vec<StoredRecord>>;

    /// Count the records `find_items` would return.
    async fn count_items(&self, class: &str, options: &FindOptions) -> StoreResult<usize>;
}

/// A full object-database backend.
///
/// Cloning a backend yields another handle onto the same database, which is
/// how the repository shares one store across collection handles and
/// transactional views.
#[async_trait]
pub trait ObjectStore: ObjectStoreOps + Clone + Send + Sync + 'static {
    /// The transaction handle type produced by [`ObjectStore::begin`].
    type Transaction: StoreTransaction;

    /// Create the database structure if it does not exist yet. Idempotent;
    /// emits `MigrationDidStart`/`MigrationDidStop` around real work.
    async fn initialize_object_database(&self) -> StoreResult<()>;

    /// Drop the database and all its content.
    async fn destroy_object_database(&self) -> StoreResult<()>;

    /// Take the database-wide advisory lock.
    async fn lock_database(&self) -> StoreResult<()>;

    /// Release the database-wide advisory lock.
    async fn unlock_database(&self) -> StoreResult<()>;

    /// Open a transaction. Operations issued through the handle are atomic:
    /// they all apply on `commit` and none of them on `abort`.
    async fn begin(&self) -> StoreResult<Self::Transaction>;

    /// Subscribe to store maintenance events.
    fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent>;
}

/// A transaction handle: the full operation surface plus an outcome.
#[async_trait]
pub trait StoreTransaction: ObjectStoreOps + Clone + Send + Sync + 'static {
    /// Atomically apply every buffered operation.
    async fn commit(&self) -> StoreResult<()>;

    /// Discard every buffered operation.
    async fn abort(&self) -> StoreResult<()>;
}
