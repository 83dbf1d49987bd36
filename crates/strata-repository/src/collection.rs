//! Per-collection operation handles.
//!
//! A [`Collection`] binds one registered class to a repository handle and
//! exposes the item operations keyed by that class. Collections created
//! from a transactional view operate inside the transaction; collections
//! are cheap to create and clone, so bulk callers can hold one per class.

use std::sync::Arc;

use serde_json::Value;
use strata_store::ObjectStore;
use strata_types::{
    ClassDescriptor, DeleteOptions, FindOptions, GetOptions, Item, PutOptions,
};

use crate::error::{RepositoryError, RepositoryResult};
use crate::registry::ClassCache;
use crate::repository::Repository;

/// Operation handle for one collection class of a repository.
pub struct Collection<S: ObjectStore> {
    class: Arc<ClassDescriptor>,
    repository: Repository<S>,
}

impl<S: ObjectStore> Clone for Collection<S> {
    fn clone(&self) -> Self {
        Self { class: self.class.clone(), repository: self.repository.clone() }
    }
}

impl<S: ObjectStore> std::fmt::Debug for Collection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("class", &self.class.name).finish()
    }
}

impl<S: ObjectStore> Collection<S> {
    pub(crate) fn new(class: Arc<ClassDescriptor>, repository: Repository<S>) -> Self {
        Self { class, repository }
    }

    /// The collection's class name.
    pub fn name(&self) -> &str {
        &self.class.name
    }

    /// The collection's class descriptor.
    pub fn class(&self) -> &Arc<ClassDescriptor> {
        &self.class
    }

    /// The repository handle this collection is bound to.
    pub fn repository(&self) -> &Repository<S> {
        &self.repository
    }

    /// Create a fresh, not-yet-persisted item of this collection's class.
    ///
    /// The value must be a JSON object; it becomes the item's property bag.
    pub fn create_item(&self, value: Value) -> RepositoryResult<Item> {
        match value {
            Value::Object(values) => Ok(Item::new(self.class.clone(), values)),
            other => Err(RepositoryError::Validation(format!(
                "item value for class `{}` must be an object, got: {other}",
                self.class.name
            ))),
        }
    }

    /// Look up one item by primary key.
    ///
    /// The item comes back at its most-derived class: looking an item up
    /// through a base collection yields the derived item it was stored as.
    /// Returns `None` for a missing key under the tolerant policy.
    pub async fn get_item(
        &self,
        key: &str,
        options: &GetOptions,
    ) -> RepositoryResult<Option<Item>> {
        self.repository.initialize().await?;
        let record = self.repository.ops().get_item(&self.class.name, key, options).await?;
        match record {
            Some(record) => {
                let mut cache = ClassCache::new();
                Ok(Some(self.repository.materialize(record, &mut cache)?))
            },
            None => Ok(None),
        }
    }

    /// Bulk lookup by primary keys, preserving input order.
    pub async fn get_items(
        &self,
        keys: &[&str],
        options: &GetOptions,
    ) -> RepositoryResult<Vec<Item>> {
        let keys: Vec<String> = keys.iter().map(|key| (*key).to_string()).collect();
        self.repository.get_items_by_key(&self.class.name, &keys, options).await
    }

    /// Write an item through the repository.
    pub async fn put_item(&self, item: &mut Item, options: &PutOptions) -> RepositoryResult<()> {
        self.repository.put_item(item, options).await
    }

    /// Delete an item of this collection by primary key.
    pub async fn delete_item(
        &self,
        key: &str,
        options: &DeleteOptions,
    ) -> RepositoryResult<bool> {
        self.repository.delete_item_by_key(&self.class.name, key, options).await
    }

    /// Range/query lookup over this collection, including derived members.
    pub async fn find_items(&self, options: &FindOptions) -> RepositoryResult<Vec<Item>> {
        self.repository.find_items_in(&self.class.name, options).await
    }

    /// Count the items `find_items` would return.
    pub async fn count_items(&self, options: &FindOptions) -> RepositoryResult<usize> {
        self.repository.count_items_in(&self.class.name, options).await
    }

    /// Iterate the collection with backpressure.
    ///
    /// The handler is awaited per item before further records are
    /// requested; an error from the handler stops the iteration and
    /// propagates unchanged.
    pub async fn for_each_items<F, Fut>(
        &self,
        options: &FindOptions,
        handler: F,
    ) -> RepositoryResult<()>
    where
        F: FnMut(Item) -> Fut,
        Fut: std::future::Future<Output = RepositoryResult<()>>,
    {
        self.repository.for_each_items_in(&self.class, options, handler).await
    }

    /// Delete every item matching the options; returns the number removed.
    pub async fn find_and_delete_items(&self, options: &FindOptions) -> RepositoryResult<usize> {
        self.repository.find_and_delete_items_in(&self.class, options).await
    }
}
