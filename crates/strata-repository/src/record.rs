//! Codec for the persisted repository record.
//!
//! The record is a singleton stored under the composite key
//! `[repository.name, "$Repository"]` in the raw key/value surface of the
//! object store. It is written exactly once at creation (`error_if_exists`)
//! and only ever rewritten in place by upgrades (`create_if_missing` off,
//! so an update of a vanished record fails loudly).

use strata_store::ObjectStoreOps;
use strata_types::{
    GetOptions, PutOptions, RepositoryRecord, REPOSITORY_RECORD_KEY,
};

use crate::error::{RepositoryError, RepositoryResult};

/// The composite storage key of a repository's record.
pub fn record_key(repository_name: &str) -> Vec<String> {
    vec![repository_name.to_string(), REPOSITORY_RECORD_KEY.to_string()]
}

/// Load the repository record through the given store handle.
///
/// With `error_if_missing` cleared, an absent record reads back as `None`.
pub async fn load<O: ObjectStoreOps + ?Sized>(
    store: &O,
    repository_name: &str,
    error_if_missing: bool,
) -> RepositoryResult<Option<RepositoryRecord>> {
    let key = record_key(repository_name);
    let value = store.get(&key, &GetOptions { error_if_missing }).await?;
    match value {
        Some(value) => {
            let record = serde_json::from_value(value)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
            Ok(Some(record))
        },
        None => Ok(None),
    }
}

/// Save the repository record through the given store handle.
///
/// `error_if_exists` selects between the create path (the record must not
/// exist yet) and the upgrade path (the record must already exist).
pub async fn save<O: ObjectStoreOps + ?Sized>(
    store: &O,
    record: &RepositoryRecord,
    error_if_exists: bool,
) -> RepositoryResult<()> {
    let key = record_key(&record.name);
    let value = serde_json::to_value(record)
        .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
    let options = PutOptions { error_if_exists, create_if_missing: false };
    store.put(&key, value, &options).await?;
    Ok(())
}
