//! # Strata Types
//!
//! Shared type definitions for the StrataDB object repository.
//!
//! This crate provides the types used across the StrataDB workspace,
//! ensuring a single source of truth and preventing circular dependencies:
//! stored records, the persisted repository record, operation options,
//! collection-class descriptors and items, and the store-level error and
//! event types.

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod options;
pub mod schema;

pub use options::{DeleteOptions, FindOptions, GetOptions, Order, PutOptions};
pub use schema::{key_string, ClassDescriptor, Item};

// ============================================================================
// Constants
// ============================================================================

/// Current on-disk format version of the repository record.
///
/// A persisted record with a larger version belongs to a newer release and
/// must not be opened (downgrades are fatal).
pub const REPOSITORY_VERSION: u32 = 1;

/// Length of the generated repository identifier.
///
/// Sixteen alphanumeric characters carry well over 80 bits of entropy.
pub const REPOSITORY_ID_LENGTH: usize = 16;

/// Number of items processed between cooperative yields in bulk operations.
///
/// Long materialisation loops hand the scheduler back every this many items
/// so that batch calls do not starve other tasks.
pub const RESPIRATION_RATE: usize = 250;

/// Default scan granularity for iteration when the caller sets no
/// `batch_size`.
pub const DEFAULT_BATCH_SIZE: usize = 250;

/// Reserved collection name under which the repository record is persisted.
pub const REPOSITORY_RECORD_KEY: &str = "$Repository";

// ============================================================================
// Stored Records
// ============================================================================

/// A record as returned by the object store.
///
/// `classes` is the item's class chain, most-derived class first. The chain
/// is never empty; its order is stable for the lifetime of the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Class chain of the stored item, most-derived first.
    pub classes: Vec<String>,
    /// The item's serialized property bag.
    pub value: Value,
}

impl StoredRecord {
    /// Create a record from a class chain and a value.
    pub fn new(classes: Vec<String>, value: Value) -> Self {
        Self { classes, value }
    }

    /// The most-derived class owning this record, if the chain is non-empty.
    pub fn most_derived_class(&self) -> Option<&str> {
        self.classes.first().map(String::as_str)
    }
}

/// The singleton metadata record persisted for each repository.
///
/// Stored under the composite key `[repository.name, "$Repository"]` in the
/// underlying key/value store. Written at most once at creation; upgrades
/// rewrite it in place with a monotonically non-decreasing `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    /// The repository's name.
    pub name: String,
    /// Format version, currently [`REPOSITORY_VERSION`].
    pub version: u32,
    /// Opaque identifier generated at creation, immutable afterwards.
    pub id: String,
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by the object store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The key already exists and the operation demanded absence.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error in the storage layer.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Store Events
// ============================================================================

/// Events emitted by the object store around its own maintenance work.
///
/// The repository forwards these verbatim to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A store-level format upgrade started.
    UpgradeDidStart,
    /// A store-level format upgrade finished.
    UpgradeDidStop,
    /// A store-level data migration started.
    MigrationDidStart,
    /// A store-level data migration finished.
    MigrationDidStop,
}
