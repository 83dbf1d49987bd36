//! The repository core: lifecycle, transaction scope, and polymorphic
//! item operations.
//!
//! # Handles and views
//!
//! [`Repository`] is a cheap handle: clones share one underlying state
//! (name, registry, event bus, lifecycle flags) through an `Arc`. The only
//! per-handle field is the optional transaction binding. `transaction`
//! hands its body a *view*: a clone whose binding is the open transaction
//! handle. Every operation issued through the view runs inside the
//! transaction. Whether a handle is transactional is an explicit property
//! of the binding, never an identity comparison, so copying a handle can
//! not confuse the scope detection.
//!
//! # Polymorphism
//!
//! Operations are keyed by one class name but items come back at their
//! most-derived class: the store returns each record's full class chain,
//! and the repository materialises the item through the registry entry of
//! the chain's head. An item stored through a derived collection is
//! therefore found, with its true type, by queries on any base
//! collection it includes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use strata_store::{
    MemoryBackend, ObjectStore, ObjectStoreOps, StorageFactory, StoreTransaction,
};
use strata_types::{
    key_string, ClassDescriptor, DeleteOptions, FindOptions, GetOptions, Item, PutOptions,
    RepositoryRecord, StoredRecord, DEFAULT_BATCH_SIZE, REPOSITORY_ID_LENGTH,
    REPOSITORY_RECORD_KEY, REPOSITORY_VERSION, RESPIRATION_RATE,
};
use tokio::sync::broadcast;

use crate::collection::Collection;
use crate::error::{RepositoryError, RepositoryResult};
use crate::events::{EventBus, RepositoryEvent};
use crate::ident;
use crate::record;
use crate::registry::{ClassCache, ClassRegistry};

struct RepositoryShared<S: ObjectStore> {
    name: String,
    url: String,
    store: S,
    registry: ClassRegistry,
    events: EventBus,

    /// One-shot barrier: the first caller runs initialization, concurrent
    /// callers wait on the lock and observe the completed state.
    init_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    initializing: AtomicBool,
    bridge_started: AtomicBool,

    /// Memoised repository id; cleared again on destroy.
    repository_id: std::sync::Mutex<Option<String>>,
}

/// A typed, polymorphic object repository over an object store.
pub struct Repository<S: ObjectStore> {
    shared: Arc<RepositoryShared<S>>,
    /// Transaction binding; `Some` on views handed to transaction bodies.
    transaction: Option<S::Transaction>,
}

impl<S: ObjectStore> Clone for Repository<S> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone(), transaction: self.transaction.clone() }
    }
}

#[bon::bon]
impl<S: ObjectStore> Repository<S> {
    /// Create a repository handle over the given store.
    ///
    /// The handle is created eagerly; the database structure and the
    /// repository record are created lazily by the first operation.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let repository = Repository::builder()
    ///     .name("crm")
    ///     .url("memory:")
    ///     .store(MemoryBackend::new())
    ///     .classes(vec![ClassDescriptor::new("Account", "id")])
    ///     .build()?;
    /// ```
    #[builder]
    pub fn new(
        #[builder(into)] name: String,
        #[builder(into)] url: String,
        store: S,
        classes: Vec<ClassDescriptor>,
    ) -> RepositoryResult<Self> {
        let registry = ClassRegistry::new(classes)?;
        Ok(Self {
            shared: Arc::new(RepositoryShared {
                name,
                url,
                store,
                registry,
                events: EventBus::new(),
                init_lock: tokio::sync::Mutex::new(()),
                initialized: AtomicBool::new(false),
                initializing: AtomicBool::new(false),
                bridge_started: AtomicBool::new(false),
                repository_id: std::sync::Mutex::new(None),
            }),
            transaction: None,
        })
    }
}

impl Repository<MemoryBackend> {
    /// Open a repository whose backend is selected by the connection URL.
    pub fn open(
        name: impl Into<String>,
        url: impl Into<String>,
        classes: Vec<ClassDescriptor>,
    ) -> RepositoryResult<Self> {
        let url = url.into();
        let store = StorageFactory::from_url(&url)?;
        Repository::builder().name(name.into()).url(url).store(store).classes(classes).build()
    }
}

impl<S: ObjectStore> Repository<S> {
    /// The store handle operations run against: the transaction binding on
    /// a view, the root store otherwise.
    pub(crate) fn ops(&self) -> &dyn ObjectStoreOps {
        match &self.transaction {
            Some(tx) => tx,
            None => &self.shared.store,
        }
    }

    /// The repository's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The connection string the repository was opened with.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// The root object store (never the transaction binding).
    pub fn store(&self) -> &S {
        &self.shared.store
    }

    /// The class registry backing this repository.
    pub fn registry(&self) -> &ClassRegistry {
        &self.shared.registry
    }

    /// True on views handed to transaction bodies.
    pub fn is_inside_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// True once `initialize` has completed.
    pub fn has_been_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    /// True while an initialization is running.
    pub fn is_initializing(&self) -> bool {
        self.shared.initializing.load(Ordering::Acquire)
    }

    /// Subscribe to repository events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RepositoryEvent> {
        self.shared.events.subscribe()
    }

    /// The first registered collection class.
    pub fn root_collection_class(&self) -> Option<Arc<ClassDescriptor>> {
        self.shared.registry.root()
    }

    /// Create a collection handle for a registered class.
    pub fn create_collection(&self, name: &str) -> RepositoryResult<Collection<S>> {
        let class = self.shared.registry.resolve(name)?;
        Ok(Collection::new(class, self.clone()))
    }

    pub(crate) fn publish(&self, event: RepositoryEvent) {
        self.shared.events.publish(event);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Initialize the repository: create the database structure, write the
    /// repository record if missing, upgrade it otherwise.
    ///
    /// Idempotent and safe to call concurrently; exactly one caller does
    /// the work and `DidInitialize` is emitted once. Every operation calls
    /// this before touching the store.
    pub async fn initialize(&self) -> RepositoryResult<()> {
        if self.has_been_initialized() {
            return Ok(());
        }
        if self.is_inside_transaction() {
            return Err(RepositoryError::InitInsideTransaction);
        }

        let _barrier = self.shared.init_lock.lock().await;
        if self.has_been_initialized() {
            return Ok(());
        }

        self.shared.initializing.store(true, Ordering::Release);
        let result = self.initialize_inner().await;
        self.shared.initializing.store(false, Ordering::Release);
        result
    }

    async fn initialize_inner(&self) -> RepositoryResult<()> {
        self.start_event_bridge();
        self.shared.store.initialize_object_database().await?;

        let created = self.create_repository_if_missing().await?;
        if !created {
            // Two processes must not upgrade concurrently; the upgrade runs
            // under the database-wide lock and releases it on every path.
            self.shared.store.lock_database().await?;
            let upgraded = self.upgrade_repository().await;
            let unlocked = self.shared.store.unlock_database().await;
            upgraded?;
            unlocked?;
        }

        self.shared.initialized.store(true, Ordering::Release);
        self.publish(RepositoryEvent::DidInitialize);
        tracing::debug!(repository = %self.shared.name, "repository initialized");
        Ok(())
    }

    /// Write the repository record if none exists yet.
    ///
    /// Runs in a store transaction so the load-check-save is atomic against
    /// a concurrent creator; the record write itself insists on absence.
    async fn create_repository_if_missing(&self) -> RepositoryResult<bool> {
        let tx = self.shared.store.begin().await?;

        let existing = match record::load(&tx, &self.shared.name, false).await {
            Ok(existing) => existing,
            Err(err) => {
                let _ = tx.abort().await;
                return Err(err);
            },
        };
        if existing.is_some() {
            tx.abort().await?;
            return Ok(false);
        }

        let record = RepositoryRecord {
            name: self.shared.name.clone(),
            version: REPOSITORY_VERSION,
            id: ident::generate_id(REPOSITORY_ID_LENGTH),
        };
        if let Err(err) = record::save(&tx, &record, true).await {
            let _ = tx.abort().await;
            return Err(err);
        }
        tx.commit().await?;

        tracing::info!(repository = %record.name, id = %record.id, "created repository record");
        self.publish(RepositoryEvent::DidCreate);
        Ok(true)
    }

    /// Bring an existing repository record up to the current version.
    async fn upgrade_repository(&self) -> RepositoryResult<()> {
        let mut record = record::load(self.ops(), &self.shared.name, true)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(REPOSITORY_RECORD_KEY.to_string()))?;

        if record.version == REPOSITORY_VERSION {
            return Ok(());
        }
        if record.version > REPOSITORY_VERSION {
            return Err(RepositoryError::CannotDowngrade {
                found: record.version,
                supported: REPOSITORY_VERSION,
            });
        }

        let from = record.version;
        self.publish(RepositoryEvent::UpgradeDidStart { from, to: REPOSITORY_VERSION });

        if record.version < 2 {
            // slot for the v1 -> v2 format migration once one exists
        }

        record.version = REPOSITORY_VERSION;
        record::save(self.ops(), &record, false).await?;
        tracing::info!(
            repository = %record.name,
            from,
            to = REPOSITORY_VERSION,
            "upgraded repository record"
        );
        self.publish(RepositoryEvent::UpgradeDidStop);
        Ok(())
    }

    /// Drop the object database and reset the handle to its pristine state.
    ///
    /// The repository must be initialized and quiesced: destruction takes
    /// no lock, so callers are responsible for stopping concurrent
    /// operations first.
    pub async fn destroy(&self) -> RepositoryResult<()> {
        if !self.has_been_initialized() {
            return Err(RepositoryError::NotInitialized);
        }

        self.publish(RepositoryEvent::WillDestroy);
        self.shared.store.destroy_object_database().await?;
        self.shared.initialized.store(false, Ordering::Release);
        if let Ok(mut cached) = self.shared.repository_id.lock() {
            *cached = None;
        }
        self.publish(RepositoryEvent::DidDestroy);
        tracing::info!(repository = %self.shared.name, "repository destroyed");
        Ok(())
    }

    /// The repository's opaque identifier, generated at creation.
    ///
    /// Memoised after the first read; the id never changes for the
    /// lifetime of the persisted repository.
    pub async fn repository_id(&self) -> RepositoryResult<String> {
        self.initialize().await?;

        if let Some(id) = self.shared.repository_id.lock().ok().and_then(|c| c.clone()) {
            return Ok(id);
        }

        let record = record::load(self.ops(), &self.shared.name, true)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(REPOSITORY_RECORD_KEY.to_string()))?;
        if let Ok(mut cached) = self.shared.repository_id.lock() {
            *cached = Some(record.id.clone());
        }
        Ok(record.id)
    }

    /// Forward store maintenance events onto the repository bus.
    fn start_event_bridge(&self) {
        if self.shared.bridge_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut store_events = self.shared.store.subscribe_events();
        let bus = self.shared.events.clone();
        tokio::spawn(async move {
            loop {
                match store_events.recv().await {
                    Ok(event) => {
                        bus.publish(event.into());
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event bridge lagged behind the store");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // ========================================================================
    // Transaction scope
    // ========================================================================

    /// Run `body` inside a transaction.
    ///
    /// The body receives a view of this repository bound to the open
    /// transaction; collections created from the view operate inside it.
    /// The transaction commits when the body returns `Ok`. When the body
    /// returns an error the transaction aborts, rolling back every store
    /// write it performed, and the error is propagated unchanged.
    ///
    /// Nested calls are flat: a view invokes its body directly against the
    /// outermost transaction.
    pub async fn transaction<F, Fut, T>(&self, body: F) -> RepositoryResult<T>
    where
        F: FnOnce(Repository<S>) -> Fut,
        Fut: Future<Output = RepositoryResult<T>>,
    {
        if self.is_inside_transaction() {
            return body(self.clone()).await;
        }

        self.initialize().await?;
        let tx = self.shared.store.begin().await?;
        let view = Repository { shared: self.shared.clone(), transaction: Some(tx.clone()) };

        match body(view).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            },
            Err(err) => {
                if let Err(abort_err) = tx.abort().await {
                    tracing::error!(error = %abort_err, "failed to abort transaction");
                }
                Err(err)
            },
        }
    }

    // ========================================================================
    // Polymorphic operations
    // ========================================================================

    /// Materialise a stored record at its most-derived class.
    pub(crate) fn materialize(
        &self,
        record: StoredRecord,
        cache: &mut ClassCache,
    ) -> RepositoryResult<Item> {
        let class_name = record.most_derived_class().ok_or_else(|| {
            RepositoryError::Serialization("stored record has an empty class chain".to_string())
        })?;
        let class = cache.resolve(&self.shared.registry, class_name)?;
        Item::from_stored(class, record.value).map_err(RepositoryError::from)
    }

    fn primary_key_of(item: &Item) -> RepositoryResult<String> {
        item.primary_key_value()
            .ok_or_else(|| RepositoryError::MissingPrimaryKey(item.class().primary_key.clone()))
    }

    /// Yield to the scheduler every [`RESPIRATION_RATE`] processed items.
    async fn respire(processed: usize) {
        if processed > 0 && processed % RESPIRATION_RATE == 0 {
            tokio::task::yield_now().await;
        }
    }

    /// Refresh an item from the store.
    ///
    /// Returns `false` when the item is absent (under the tolerant missing
    /// policy). When the stored record's class matches the item's, the item
    /// is refreshed in place. When the record belongs to a derived class
    /// (the lookup came through a base collection), the item is rebound to a
    /// materialisation at its true type.
    pub async fn get_item(&self, item: &mut Item, options: &GetOptions) -> RepositoryResult<bool> {
        self.initialize().await?;
        let key = Self::primary_key_of(item)?;

        let Some(record) = self.ops().get_item(item.class_name(), &key, options).await? else {
            return Ok(false);
        };

        if record.most_derived_class() == Some(item.class_name()) {
            item.replace_value(record.value)?;
        } else {
            let mut cache = ClassCache::new();
            *item = self.materialize(record, &mut cache)?;
        }
        Ok(true)
    }

    /// Write an item under every class of its chain.
    ///
    /// A new item is forced onto the create path (`error_if_exists`); the
    /// flag is cleared after the first successful write.
    pub async fn put_item(&self, item: &mut Item, options: &PutOptions) -> RepositoryResult<()> {
        self.initialize().await?;
        let key = Self::primary_key_of(item)?;

        let mut options = options.clone();
        if item.is_new() {
            options.error_if_exists = true;
        }

        self.ops().put_item(&item.class_names(), &key, item.serialize(), &options).await?;
        item.mark_saved();
        self.publish(RepositoryEvent::DidPutItem {
            class: item.class_name().to_string(),
            key,
        });
        Ok(())
    }

    /// Delete an item. Returns whether a record was actually removed;
    /// `DidDeleteItem` is emitted only in that case.
    pub async fn delete_item(&self, item: &Item, options: &DeleteOptions) -> RepositoryResult<bool> {
        let key = Self::primary_key_of(item)?;
        self.delete_item_by_key(item.class_name(), &key, options).await
    }

    pub(crate) async fn delete_item_by_key(
        &self,
        class_name: &str,
        key: &str,
        options: &DeleteOptions,
    ) -> RepositoryResult<bool> {
        self.initialize().await?;
        let deleted = self.ops().delete_item(class_name, key, options).await?;
        if deleted {
            self.publish(RepositoryEvent::DidDeleteItem {
                class: class_name.to_string(),
                key: key.to_string(),
            });
        }
        Ok(deleted)
    }

    /// Bulk lookup of items sharing one collection class.
    ///
    /// Results are materialised at their most-derived classes through a
    /// cache scoped to this call.
    pub async fn get_items(
        &self,
        items: &[Item],
        options: &GetOptions,
    ) -> RepositoryResult<Vec<Item>> {
        let Some(first) = items.first() else {
            return Ok(Vec::new());
        };
        let class_name = first.class_name().to_string();
        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            keys.push(Self::primary_key_of(item)?);
        }
        self.get_items_by_key(&class_name, &keys, options).await
    }

    pub(crate) async fn get_items_by_key(
        &self,
        class_name: &str,
        keys: &[String],
        options: &GetOptions,
    ) -> RepositoryResult<Vec<Item>> {
        self.initialize().await?;
        let records = self.ops().get_items(class_name, keys, options).await?;

        let mut cache = ClassCache::new();
        let mut items = Vec::with_capacity(records.len());
        for record in records {
            items.push(self.materialize(record, &mut cache)?);
            Self::respire(items.len()).await;
        }
        Ok(items)
    }

    pub(crate) async fn find_items_in(
        &self,
        class_name: &str,
        options: &FindOptions,
    ) -> RepositoryResult<Vec<Item>> {
        self.initialize().await?;
        let records = self.ops().find_items(class_name, options).await?;

        let mut cache = ClassCache::new();
        let mut items = Vec::with_capacity(records.len());
        for record in records {
            items.push(self.materialize(record, &mut cache)?);
            Self::respire(items.len()).await;
        }
        Ok(items)
    }

    pub(crate) async fn count_items_in(
        &self,
        class_name: &str,
        options: &FindOptions,
    ) -> RepositoryResult<usize> {
        self.initialize().await?;
        Ok(self.ops().count_items(class_name, options).await?)
    }

    /// Iterate a collection with backpressure: the handler is awaited for
    /// every item before further records are requested from the store.
    pub(crate) async fn for_each_items_in<F, Fut>(
        &self,
        class: &Arc<ClassDescriptor>,
        options: &FindOptions,
        mut handler: F,
    ) -> RepositoryResult<()>
    where
        F: FnMut(Item) -> Fut,
        Fut: Future<Output = RepositoryResult<()>>,
    {
        self.initialize().await?;
        let mut cache = ClassCache::new();
        let mut processed = 0usize;

        if options.order.is_empty() && !options.reverse {
            // Primary-key-paged scan: each batch is fetched only after the
            // handler has drained the previous one, and the cursor makes
            // the scan safe against deletions performed by the handler.
            let batch_size = options.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);
            let mut remaining = options.limit;
            let mut cursor = options.start_after.clone();

            loop {
                let request = match remaining {
                    Some(0) => break,
                    Some(remaining) => batch_size.min(remaining),
                    None => batch_size,
                };

                let mut batch_options = options.clone();
                batch_options.start_after = cursor.clone();
                batch_options.limit = Some(request);
                batch_options.batch_size = None;

                let records = self.ops().find_items(&class.name, &batch_options).await?;
                let fetched = records.len();

                for record in records {
                    // The cursor must be the canonical string rendering of
                    // the key: that is what an unordered scan is ordered
                    // and bounded by.
                    let Some(cursor_key) =
                        record.value.get(&class.primary_key).and_then(key_string)
                    else {
                        return Err(RepositoryError::MissingPrimaryKey(
                            class.primary_key.clone(),
                        ));
                    };
                    let item = self.materialize(record, &mut cache)?;

                    cursor = Some(Value::String(cursor_key));
                    processed += 1;
                    if let Some(remaining) = remaining.as_mut() {
                        *remaining -= 1;
                    }

                    handler(item).await?;
                    Self::respire(processed).await;
                }

                if fetched < request {
                    break;
                }
            }
        } else {
            // Neither an explicit order (values may repeat) nor a reversed
            // scan (the cursor would walk against it) can be paged on an
            // ascending key cursor, so fetch the result set once and
            // stream it.
            let records = self.ops().find_items(&class.name, options).await?;
            for record in records {
                let item = self.materialize(record, &mut cache)?;
                processed += 1;
                handler(item).await?;
                Self::respire(processed).await;
            }
        }

        Ok(())
    }

    /// Delete every item matching the options; returns the number removed.
    ///
    /// Built on the iteration above: each delete is its own store
    /// operation, tolerant of items that vanished since the scan saw them.
    /// Not atomic across items; callers needing that wrap the call in
    /// `transaction`.
    pub(crate) async fn find_and_delete_items_in(
        &self,
        class: &Arc<ClassDescriptor>,
        options: &FindOptions,
    ) -> RepositoryResult<usize> {
        let deleted = Arc::new(AtomicUsize::new(0));
        let repository = self.clone();
        let counter = deleted.clone();

        self.for_each_items_in(class, options, move |item| {
            let repository = repository.clone();
            let counter = counter.clone();
            async move {
                if repository.delete_item(&item, &DeleteOptions::tolerant()).await? {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
        })
        .await?;

        Ok(deleted.load(Ordering::Relaxed))
    }
}
