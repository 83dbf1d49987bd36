//! Operation options recognised by the repository and the object store.
//!
//! The repository passes these through to the store verbatim; it performs no
//! second check of its own. Missing-key and existing-key policies default to
//! the strict side (`error_if_missing = true`, `error_if_exists = false`).

use serde_json::{Map, Value};

/// Options for point and bulk reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOptions {
    /// Raise `NotFound` for absent keys instead of returning an empty result.
    pub error_if_missing: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self { error_if_missing: true }
    }
}

impl GetOptions {
    /// Options that convert `NotFound` into a typed absent result.
    pub fn tolerant() -> Self {
        Self { error_if_missing: false }
    }
}

/// Options for writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOptions {
    /// Raise `Conflict` when the key already exists.
    ///
    /// A put with this flag set is a pure create; the key must be absent.
    pub error_if_exists: bool,
    /// Allow the write to create the key when it is absent. With the flag
    /// cleared the put is a pure update and an absent key raises `NotFound`.
    pub create_if_missing: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self { error_if_exists: false, create_if_missing: true }
    }
}

impl PutOptions {
    /// Create-only options: the key must not exist yet.
    pub fn create_only() -> Self {
        Self { error_if_exists: true, create_if_missing: true }
    }

    /// Update-only options: the key must already exist.
    pub fn update_only() -> Self {
        Self { error_if_exists: false, create_if_missing: false }
    }
}

/// Options for deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Raise `NotFound` for absent keys instead of reporting `false`.
    pub error_if_missing: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self { error_if_missing: true }
    }
}

impl DeleteOptions {
    /// Options that report a missing key as `false` instead of an error.
    pub fn tolerant() -> Self {
        Self { error_if_missing: false }
    }
}

/// Ordering specification for queries: one or more item fields, compared in
/// sequence. An empty order falls back to the collection's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Order(pub Vec<String>);

impl Order {
    /// Order by a single field.
    pub fn by(field: impl Into<String>) -> Self {
        Self(vec![field.into()])
    }

    /// The ordered list of fields.
    pub fn fields(&self) -> &[String] {
        &self.0
    }

    /// True when no field was requested.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Order {
    fn from(field: &str) -> Self {
        Order::by(field)
    }
}

impl From<Vec<String>> for Order {
    fn from(fields: Vec<String>) -> Self {
        Order(fields)
    }
}

/// Options for range and query lookups.
///
/// `start`/`end` are inclusive bounds and `start_after`/`end_before`
/// exclusive bounds on the ordering value (the `order` field when given, the
/// primary key otherwise). `query` is an equality-only filter over item
/// fields. Semantics beyond that are defined by the underlying store; the
/// repository passes the options through verbatim.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindOptions {
    /// Inclusive lower bound on the ordering value.
    pub start: Option<Value>,
    /// Inclusive upper bound on the ordering value.
    pub end: Option<Value>,
    /// Exclusive lower bound on the ordering value.
    pub start_after: Option<Value>,
    /// Exclusive upper bound on the ordering value.
    pub end_before: Option<Value>,
    /// Ordering fields; empty means primary-key order.
    pub order: Order,
    /// Equality filter: every listed field must match exactly.
    pub query: Map<String, Value>,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
    /// Return records in descending order.
    pub reverse: bool,
    /// Scan granularity hint for iteration.
    pub batch_size: Option<usize>,
}

impl FindOptions {
    /// Options ordering by a single field.
    pub fn ordered_by(field: impl Into<String>) -> Self {
        Self { order: Order::by(field), ..Self::default() }
    }

    /// Options with a single-field equality filter.
    pub fn matching(field: impl Into<String>, value: Value) -> Self {
        let mut query = Map::new();
        query.insert(field.into(), value);
        Self { query, ..Self::default() }
    }

    /// Add an equality condition to the filter.
    pub fn and_matching(mut self, field: impl Into<String>, value: Value) -> Self {
        self.query.insert(field.into(), value);
        self
    }

    /// Cap the number of returned records.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the scan granularity.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}
