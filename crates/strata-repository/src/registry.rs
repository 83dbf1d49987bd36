//! Class registry: resolves class names to collection descriptors.
//!
//! The registry is built once from the repository's collection classes and
//! validated up front: every base class a descriptor includes must itself
//! be registered. Bulk operations resolve through a [`ClassCache`] scoped
//! to the single call, so each class is looked up once per call no matter
//! how many records materialise through it.

use std::collections::HashMap;
use std::sync::Arc;

use strata_types::ClassDescriptor;

use crate::error::{RepositoryError, RepositoryResult};

/// Immutable lookup from class name to descriptor.
#[derive(Debug)]
pub struct ClassRegistry {
    classes: HashMap<String, Arc<ClassDescriptor>>,
    /// Registration order; the first entry is the root collection class.
    order: Vec<String>,
}

impl ClassRegistry {
    /// Build a registry from an ordered set of descriptors.
    ///
    /// # Errors
    ///
    /// Returns `Validation` on duplicate class names and `UnknownClass`
    /// when a descriptor includes a base class that is not in the set.
    pub fn new(descriptors: impl IntoIterator<Item = ClassDescriptor>) -> RepositoryResult<Self> {
        let mut classes = HashMap::new();
        let mut order = Vec::new();

        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if classes.insert(name.clone(), Arc::new(descriptor)).is_some() {
                return Err(RepositoryError::Validation(format!(
                    "collection class `{name}` is registered twice"
                )));
            }
            order.push(name);
        }

        for descriptor in classes.values() {
            for parent in &descriptor.parents {
                if !classes.contains_key(parent) {
                    return Err(RepositoryError::UnknownClass(parent.clone()));
                }
            }
        }

        Ok(Self { classes, order })
    }

    /// Resolve a class name to its descriptor.
    pub fn resolve(&self, name: &str) -> RepositoryResult<Arc<ClassDescriptor>> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| RepositoryError::UnknownClass(name.to_string()))
    }

    /// The root collection class: the first one registered.
    pub fn root(&self) -> Option<Arc<ClassDescriptor>> {
        self.order.first().and_then(|name| self.classes.get(name)).cloned()
    }

    /// Registered class names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no class is registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-call memo for class resolution during bulk materialisation.
#[derive(Debug, Default)]
pub struct ClassCache {
    cache: HashMap<String, Arc<ClassDescriptor>>,
}

impl ClassCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve through the cache, falling back to the registry once per
    /// class name.
    pub fn resolve(
        &mut self,
        registry: &ClassRegistry,
        name: &str,
    ) -> RepositoryResult<Arc<ClassDescriptor>> {
        if let Some(descriptor) = self.cache.get(name) {
            return Ok(descriptor.clone());
        }
        let descriptor = registry.resolve(name)?;
        self.cache.insert(name.to_string(), descriptor.clone());
        Ok(descriptor)
    }
}
