//! Repository error types.
//!
//! This module provides a [`RepositoryError`] enum that wraps store-level
//! errors and adds domain-specific variants for repository operations.

use strata_types::StoreError;

/// Result type alias for repository operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Errors that can occur during repository operations.
///
/// Store errors are mapped to repository-level semantics on the way up;
/// everything the store raises that has no dedicated variant stays wrapped
/// in [`RepositoryError::Store`].
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// An item with the same key already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The store returned a class name that is not registered.
    #[error("unknown collection class: {0}")]
    UnknownClass(String),

    /// `initialize` was attempted through a transactional view.
    #[error("cannot initialize the repository inside a transaction")]
    InitInsideTransaction,

    /// The persisted repository record belongs to a newer release.
    #[error("repository version {found} is newer than supported version {supported}: cannot downgrade")]
    CannotDowngrade {
        /// Version found in the persisted record.
        found: u32,
        /// Highest version this build understands.
        supported: u32,
    },

    /// A destructive operation was attempted before initialization.
    #[error("repository has not been initialized")]
    NotInitialized,

    /// An item is missing a usable primary key value.
    #[error("item has no value for primary key field `{0}`")]
    MissingPrimaryKey(String),

    /// Validation of input data failed.
    #[error("validation error: {0}")]
    Validation(String),

    /// Encoding or decoding of a persisted value failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A storage failure that maps to no repository-level condition.
    #[error("store error: {0}")]
    Store(StoreError),

    /// An error raised by a user handler, propagated unchanged.
    #[error("user handler error: {0}")]
    User(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl RepositoryError {
    /// Wrap an error raised by a user handler.
    ///
    /// The error aborts the surrounding transaction and reaches the caller
    /// with its source intact.
    pub fn user(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        RepositoryError::User(err.into())
    }
}

impl From<StoreError> for RepositoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => RepositoryError::NotFound(key),
            StoreError::Conflict(key) => RepositoryError::AlreadyExists(key),
            StoreError::Serialization(message) => RepositoryError::Serialization(message),
            err => RepositoryError::Store(err),
        }
    }
}
