//! Collection-class descriptors and items.
//!
//! A [`ClassDescriptor`] names a collection class, its primary key field,
//! the primary-key-bearing base classes it includes, and its secondary
//! indexes. Descriptors form a DAG: a derived class may include several
//! bases (`People` and `Companies` can both include `Accounts`), and an
//! item of a derived class is also an instance of every included base.
//!
//! An [`Item`] is a property bag bound to a descriptor. The repository
//! never interprets the bag beyond the primary key field; properties flow
//! through it opaquely as JSON values.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{StoreError, StoreResult};

/// Render a primary key value in its canonical string form.
///
/// Keys are stored and ordered as strings: string values pass through and
/// numeric values use their decimal rendering. Anything else is not a
/// usable key.
pub fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Schema entry for one collection class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescriptor {
    /// The class name, unique within a repository.
    pub name: String,
    /// Field of the property bag holding the primary key.
    pub primary_key: String,
    /// Included base classes that also own a primary key, nearest first.
    pub parents: Vec<String>,
    /// Secondary indexes declared on the item.
    pub indexes: Vec<String>,
}

impl ClassDescriptor {
    /// A root class with no included bases.
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            parents: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Declare the included base classes, nearest first.
    pub fn including(mut self, parents: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.parents = parents.into_iter().map(Into::into).collect();
        self
    }

    /// Declare secondary indexes on the item.
    pub fn indexed_on(mut self, indexes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.indexes = indexes.into_iter().map(Into::into).collect();
        self
    }

    /// The item's class chain, most-derived class first.
    pub fn class_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(1 + self.parents.len());
        names.push(self.name.clone());
        names.extend(self.parents.iter().cloned());
        names
    }
}

/// An item of a collection class: a JSON property bag plus schema binding.
///
/// `is_new` is true until the first successful put; the repository forces
/// `error_if_exists` on puts of new items and clears the flag afterwards.
#[derive(Debug, Clone)]
pub struct Item {
    class: Arc<ClassDescriptor>,
    values: Map<String, Value>,
    is_new: bool,
}

impl Item {
    /// Create a fresh, not-yet-persisted item.
    pub fn new(class: Arc<ClassDescriptor>, values: Map<String, Value>) -> Self {
        Self { class, values, is_new: true }
    }

    /// Rebuild an item from a value loaded out of the store.
    ///
    /// The value must be a JSON object; anything else is a corrupt record.
    pub fn from_stored(class: Arc<ClassDescriptor>, value: Value) -> StoreResult<Self> {
        match value {
            Value::Object(values) => Ok(Self { class, values, is_new: false }),
            other => Err(StoreError::Serialization(format!(
                "stored value for class `{}` is not an object: {other}",
                class.name
            ))),
        }
    }

    /// The item's own (most-derived) class name.
    pub fn class_name(&self) -> &str {
        &self.class.name
    }

    /// The descriptor this item is bound to.
    pub fn class(&self) -> &Arc<ClassDescriptor> {
        &self.class
    }

    /// The item's class chain, most-derived first.
    pub fn class_names(&self) -> Vec<String> {
        self.class.class_names()
    }

    /// The primary key value, rendered as a string.
    ///
    /// Returns `None` when the primary key field is absent or not a scalar.
    pub fn primary_key_value(&self) -> Option<String> {
        key_string(self.values.get(&self.class.primary_key)?)
    }

    /// True until the item has been written once.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Record that the item has been persisted.
    pub fn mark_saved(&mut self) {
        self.is_new = false;
    }

    /// Serialize the property bag for storage.
    pub fn serialize(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Replace the property bag in place with a freshly loaded value.
    pub fn replace_value(&mut self, value: Value) -> StoreResult<()> {
        match value {
            Value::Object(values) => {
                self.values = values;
                self.is_new = false;
                Ok(())
            },
            other => Err(StoreError::Serialization(format!(
                "replacement value for class `{}` is not an object: {other}",
                self.class.name
            ))),
        }
    }

    /// Read a property.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Write a property.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.values.insert(field.into(), value);
    }

    /// The full property bag.
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}
