//! In-memory object-database backend for testing and development.
//!
//! Each item is stored once, under its most-derived class, and registered in
//! a membership index for every class of its chain. A query on a base class
//! therefore sees items of all derived classes, and the returned record
//! carries the full chain so callers can materialise the item at its true
//! type.
//!
//! Transactions take the database write lock for their whole lifetime and
//! keep a snapshot of the data taken at `begin`; `abort` restores the
//! snapshot, `commit` simply releases the lock. Operations outside the
//! transaction block until it completes, which is what makes the handle
//! ACID without a write-ahead log.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    mem,
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::Value;
use strata_types::{
    DeleteOptions, FindOptions, GetOptions, PutOptions, StoreError, StoreEvent, StoreResult,
    StoredRecord,
};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock};

use crate::{ObjectStore, ObjectStoreOps, StoreTransaction};

/// Buffer size of the store event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default)]
struct MemoryData {
    /// Raw singleton store, keyed by composite string paths.
    kv: BTreeMap<Vec<String>, Value>,

    /// Canonical rows: most-derived class -> primary key -> record.
    rows: HashMap<String, BTreeMap<String, StoredRecord>>,

    /// Membership index: class -> primary key -> most-derived class.
    /// Every class of an item's chain has an entry here.
    class_index: HashMap<String, BTreeMap<String, String>>,

    /// Whether the database structure has been created.
    initialized: bool,
}

/// In-memory object database with chain-membership indexing.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<MemoryData>>,
    db_lock: Arc<Mutex<()>>,
    held_lock: Arc<std::sync::Mutex<Option<OwnedMutexGuard<()>>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            data: Arc::new(RwLock::new(MemoryData::default())),
            db_lock: Arc::new(Mutex::new(())),
            held_lock: Arc::new(std::sync::Mutex::new(None)),
            events,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Core operations over the data set
// ============================================================================
// Shared between the backend (behind its RwLock) and transaction handles
// (behind the transaction's write guard).

fn kv_key_display(key: &[String]) -> String {
    key.join("/")
}

fn get_raw(data: &MemoryData, key: &[String], options: &GetOptions) -> StoreResult<Option<Value>> {
    match data.kv.get(key) {
        Some(value) => Ok(Some(value.clone())),
        None if options.error_if_missing => Err(StoreError::NotFound(kv_key_display(key))),
        None => Ok(None),
    }
}

fn put_raw(
    data: &mut MemoryData,
    key: &[String],
    value: Value,
    options: &PutOptions,
) -> StoreResult<()> {
    let exists = data.kv.contains_key(key);
    if exists && options.error_if_exists {
        return Err(StoreError::Conflict(kv_key_display(key)));
    }
    // `error_if_exists` is a pure create: the key is known absent, so the
    // write may create it regardless of `create_if_missing`.
    if !exists && !options.create_if_missing && !options.error_if_exists {
        return Err(StoreError::NotFound(kv_key_display(key)));
    }
    data.kv.insert(key.to_vec(), value);
    Ok(())
}

fn get_item_in(
    data: &MemoryData,
    class: &str,
    key: &str,
    options: &GetOptions,
) -> StoreResult<Option<StoredRecord>> {
    let record = data
        .class_index
        .get(class)
        .and_then(|members| members.get(key))
        .and_then(|derived| data.rows.get(derived))
        .and_then(|rows| rows.get(key));

    match record {
        Some(record) => Ok(Some(record.clone())),
        None if options.error_if_missing => Err(StoreError::NotFound(format!("{class}:{key}"))),
        None => Ok(None),
    }
}

fn get_items_in(
    data: &MemoryData,
    class: &str,
    keys: &[String],
    options: &GetOptions,
) -> StoreResult<Vec<StoredRecord>> {
    let mut records = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(record) = get_item_in(data, class, key, options)? {
            records.push(record);
        }
    }
    Ok(records)
}

fn remove_item_in(data: &mut MemoryData, derived: &str, key: &str) -> Option<StoredRecord> {
    let record = data.rows.get_mut(derived)?.remove(key)?;
    for class in &record.classes {
        if let Some(members) = data.class_index.get_mut(class) {
            members.remove(key);
        }
    }
    Some(record)
}

fn put_item_in(
    data: &mut MemoryData,
    classes: &[String],
    key: &str,
    value: Value,
    options: &PutOptions,
) -> StoreResult<()> {
    let Some(derived_class) = classes.first() else {
        return Err(StoreError::Internal("put with an empty class chain".to_string()));
    };

    // The key is taken when any class of the chain already holds it; the
    // existing item may well live under a different derived class.
    let existing = classes.iter().find_map(|class| {
        data.class_index.get(class).and_then(|members| members.get(key)).cloned()
    });

    if existing.is_some() && options.error_if_exists {
        return Err(StoreError::Conflict(format!("{derived_class}:{key}")));
    }
    if existing.is_none() && !options.create_if_missing && !options.error_if_exists {
        return Err(StoreError::NotFound(format!("{derived_class}:{key}")));
    }

    if let Some(old_derived) = existing {
        remove_item_in(data, &old_derived, key);
    }

    let record = StoredRecord::new(classes.to_vec(), value);
    data.rows.entry(derived_class.clone()).or_default().insert(key.to_string(), record);
    for class in classes {
        data.class_index
            .entry(class.clone())
            .or_default()
            .insert(key.to_string(), derived_class.clone());
    }
    Ok(())
}

fn delete_item_in(
    data: &mut MemoryData,
    class: &str,
    key: &str,
    options: &DeleteOptions,
) -> StoreResult<bool> {
    let derived = data.class_index.get(class).and_then(|members| members.get(key)).cloned();
    match derived {
        Some(derived) => {
            remove_item_in(data, &derived, key);
            Ok(true)
        },
        None if options.error_if_missing => Err(StoreError::NotFound(format!("{class}:{key}"))),
        None => Ok(false),
    }
}

/// Total order over JSON scalars, with a stable rank across types.
fn value_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn matches_query(record: &StoredRecord, query: &serde_json::Map<String, Value>) -> bool {
    query.iter().all(|(field, expected)| record.value.get(field) == Some(expected))
}

/// The value a record is ordered (and range-bounded) by: the first `order`
/// field when one is requested, the primary key otherwise.
fn ordering_value(primary_key: &str, record: &StoredRecord, order_fields: &[String]) -> Value {
    match order_fields.first() {
        Some(field) => record.value.get(field).cloned().unwrap_or(Value::Null),
        None => Value::String(primary_key.to_string()),
    }
}

fn within_bounds(value: &Value, options: &FindOptions) -> bool {
    if let Some(start) = &options.start {
        if value_cmp(value, start) == Ordering::Less {
            return false;
        }
    }
    if let Some(start_after) = &options.start_after {
        if value_cmp(value, start_after) != Ordering::Greater {
            return false;
        }
    }
    if let Some(end) = &options.end {
        if value_cmp(value, end) == Ordering::Greater {
            return false;
        }
    }
    if let Some(end_before) = &options.end_before {
        if value_cmp(value, end_before) != Ordering::Less {
            return false;
        }
    }
    true
}

fn compare_by_order(
    a: &(String, StoredRecord),
    b: &(String, StoredRecord),
    order_fields: &[String],
) -> Ordering {
    for field in order_fields {
        let av = a.1.value.get(field).cloned().unwrap_or(Value::Null);
        let bv = b.1.value.get(field).cloned().unwrap_or(Value::Null);
        let ordering = value_cmp(&av, &bv);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.0.cmp(&b.0)
}

fn find_items_in(
    data: &MemoryData,
    class: &str,
    options: &FindOptions,
) -> StoreResult<Vec<StoredRecord>> {
    let Some(members) = data.class_index.get(class) else {
        return Ok(Vec::new());
    };

    let order_fields = options.order.fields();
    let mut selected: Vec<(String, StoredRecord)> = Vec::new();

    // Membership iteration is primary-key ordered; that is already the scan
    // order when no `order` field is requested.
    for (key, derived) in members {
        let record = data
            .rows
            .get(derived)
            .and_then(|rows| rows.get(key))
            .ok_or_else(|| {
                StoreError::Internal(format!(
                    "membership index for `{class}` points at missing row {derived}:{key}"
                ))
            })?;

        if !matches_query(record, &options.query) {
            continue;
        }
        if !within_bounds(&ordering_value(key, record, order_fields), options) {
            continue;
        }
        selected.push((key.clone(), record.clone()));
    }

    if !order_fields.is_empty() {
        selected.sort_by(|a, b| compare_by_order(a, b, order_fields));
    }
    if options.reverse {
        selected.reverse();
    }
    if let Some(limit) = options.limit {
        selected.truncate(limit);
    }

    Ok(selected.into_iter().map(|(_, record)| record).collect())
}

// ============================================================================
// Backend operation surface
// ============================================================================

#[async_trait]
impl ObjectStoreOps for MemoryBackend {
    async fn get(&self, key: &[String], options: &GetOptions) -> StoreResult<Option<Value>> {
        let data = self.data.read().await;
        get_raw(&data, key, options)
    }

    async fn put(&self, key: &[String], value: Value, options: &PutOptions) -> StoreResult<()> {
        let mut data = self.data.write().await;
        put_raw(&mut data, key, value, options)
    }

    async fn get_item(
        &self,
        class: &str,
        key: &str,
        options: &GetOptions,
    ) -> StoreResult<Option<StoredRecord>> {
        let data = self.data.read().await;
        get_item_in(&data, class, key, options)
    }

    async fn get_items(
        &self,
        class: &str,
        keys: &[String],
        options: &GetOptions,
    ) -> StoreResult<Vec<StoredRecord>> {
        let data = self.data.read().await;
        get_items_in(&data, class, keys, options)
    }

    async fn put_item(
        &self,
        classes: &[String],
        key: &str,
        value: Value,
        options: &PutOptions,
    ) -> StoreResult<()> {
        let mut data = self.data.write().await;
        put_item_in(&mut data, classes, key, value, options)
    }

    async fn delete_item(
        &self,
        class: &str,
        key: &str,
        options: &DeleteOptions,
    ) -> StoreResult<bool> {
        let mut data = self.data.write().await;
        delete_item_in(&mut data, class, key, options)
    }

    async fn find_items(
        &self,
        class: &str,
        options: &FindOptions,
    ) -> StoreResult<Vec<StoredRecord>> {
        let data = self.data.read().await;
        find_items_in(&data, class, options)
    }

    async fn count_items(&self, class: &str, options: &FindOptions) -> StoreResult<usize> {
        let data = self.data.read().await;
        Ok(find_items_in(&data, class, options)?.len())
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    type Transaction = MemoryTransaction;

    async fn initialize_object_database(&self) -> StoreResult<()> {
        let mut data = self.data.write().await;
        if !data.initialized {
            let _ = self.events.send(StoreEvent::MigrationDidStart);
            data.initialized = true;
            let _ = self.events.send(StoreEvent::MigrationDidStop);
            tracing::debug!("memory object database initialized");
        }
        Ok(())
    }

    async fn destroy_object_database(&self) -> StoreResult<()> {
        let mut data = self.data.write().await;
        *data = MemoryData::default();
        tracing::debug!("memory object database destroyed");
        Ok(())
    }

    async fn lock_database(&self) -> StoreResult<()> {
        let guard = self.db_lock.clone().lock_owned().await;
        let mut held = self
            .held_lock
            .lock()
            .map_err(|_| StoreError::Internal("database lock state poisoned".to_string()))?;
        *held = Some(guard);
        Ok(())
    }

    async fn unlock_database(&self) -> StoreResult<()> {
        let mut held = self
            .held_lock
            .lock()
            .map_err(|_| StoreError::Internal("database lock state poisoned".to_string()))?;
        match held.take() {
            Some(guard) => {
                drop(guard);
                Ok(())
            },
            None => Err(StoreError::Internal("database is not locked".to_string())),
        }
    }

    async fn begin(&self) -> StoreResult<MemoryTransaction> {
        let guard = self.data.clone().write_owned().await;
        let snapshot = guard.clone();
        Ok(MemoryTransaction {
            state: Arc::new(Mutex::new(TransactionState { guard: Some(guard), snapshot })),
        })
    }

    fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Transactions
// ============================================================================

struct TransactionState {
    /// Write guard over the live data, held until commit or abort.
    guard: Option<OwnedRwLockWriteGuard<MemoryData>>,
    /// Copy of the data taken at `begin`, restored on abort.
    snapshot: MemoryData,
}

impl TransactionState {
    fn data(&self) -> StoreResult<&MemoryData> {
        self.guard
            .as_deref()
            .ok_or_else(|| StoreError::Internal("transaction already completed".to_string()))
    }

    fn data_mut(&mut self) -> StoreResult<&mut MemoryData> {
        self.guard
            .as_deref_mut()
            .ok_or_else(|| StoreError::Internal("transaction already completed".to_string()))
    }
}

/// Transaction handle over a [`MemoryBackend`].
///
/// Mutations apply directly to the locked data set; abort rolls them back by
/// restoring the snapshot taken at `begin`.
#[derive(Clone)]
pub struct MemoryTransaction {
    state: Arc<Mutex<TransactionState>>,
}

#[async_trait]
impl ObjectStoreOps for MemoryTransaction {
    async fn get(&self, key: &[String], options: &GetOptions) -> StoreResult<Option<Value>> {
        let state = self.state.lock().await;
        get_raw(state.data()?, key, options)
    }

    async fn put(&self, key: &[String], value: Value, options: &PutOptions) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        put_raw(state.data_mut()?, key, value, options)
    }

    async fn get_item(
        &self,
        class: &str,
        key: &str,
        options: &GetOptions,
    ) -> StoreResult<Option<StoredRecord>> {
        let state = self.state.lock().await;
        get_item_in(state.data()?, class, key, options)
    }

    async fn get_items(
        &self,
        class: &str,
        keys: &[String],
        options: &GetOptions,
    ) -> StoreResult<Vec<StoredRecord>> {
        let state = self.state.lock().await;
        get_items_in(state.data()?, class, keys, options)
    }

    async fn put_item(
        &self,
        classes: &[String],
        key: &str,
        value: Value,
        options: &PutOptions,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        put_item_in(state.data_mut()?, classes, key, value, options)
    }

    async fn delete_item(
        &self,
        class: &str,
        key: &str,
        options: &DeleteOptions,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        delete_item_in(state.data_mut()?, class, key, options)
    }

    async fn find_items(
        &self,
        class: &str,
        options: &FindOptions,
    ) -> StoreResult<Vec<StoredRecord>> {
        let state = self.state.lock().await;
        find_items_in(state.data()?, class, options)
    }

    async fn count_items(&self, class: &str, options: &FindOptions) -> StoreResult<usize> {
        let state = self.state.lock().await;
        Ok(find_items_in(state.data()?, class, options)?.len())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        match state.guard.take() {
            Some(guard) => {
                drop(guard);
                Ok(())
            },
            None => Err(StoreError::Internal("transaction already completed".to_string())),
        }
    }

    async fn abort(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let snapshot = mem::take(&mut state.snapshot);
        match state.guard.take() {
            Some(mut guard) => {
                *guard = snapshot;
                drop(guard);
                Ok(())
            },
            None => Err(StoreError::Internal("transaction already completed".to_string())),
        }
    }
}
