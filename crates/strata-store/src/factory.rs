//! Backend factory: builds object stores from configuration.
//!
//! The repository is handed a connection string it treats as opaque; this
//! module is where the string is actually interpreted.

use std::str::FromStr;

use strata_types::{StoreError, StoreResult};

use crate::memory::MemoryBackend;

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// In-memory storage (for testing and development).
    Memory,
}

impl FromStr for BackendType {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(BackendType::Memory),
            _ => Err(StoreError::Internal(format!("unknown backend type: {s}"))),
        }
    }
}

impl BackendType {
    /// The string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Memory => "memory",
        }
    }
}

/// Configuration for a storage backend.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Backend type to use.
    pub backend: BackendType,
    /// Optional connection string (for database backends).
    pub connection_string: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::memory()
    }
}

impl StorageConfig {
    /// Config for the memory backend.
    pub fn memory() -> Self {
        Self { backend: BackendType::Memory, connection_string: None }
    }

    /// Parse a connection URL such as `memory:` into a config.
    ///
    /// The scheme selects the backend; the remainder is kept as the
    /// backend's connection string.
    pub fn from_url(url: &str) -> StoreResult<Self> {
        let (scheme, rest) = match url.split_once(':') {
            Some((scheme, rest)) => (scheme, rest),
            None => (url, ""),
        };
        let backend = scheme.parse()?;
        let connection_string = if rest.is_empty() { None } else { Some(rest.to_string()) };
        Ok(Self { backend, connection_string })
    }
}

/// Factory for creating backend instances.
pub struct StorageFactory;

impl StorageFactory {
    /// Create a backend from configuration.
    pub fn create(config: &StorageConfig) -> StoreResult<MemoryBackend> {
        match config.backend {
            BackendType::Memory => Ok(MemoryBackend::new()),
        }
    }

    /// Create a backend from a connection URL.
    pub fn from_url(url: &str) -> StoreResult<MemoryBackend> {
        Self::create(&StorageConfig::from_url(url)?)
    }

    /// Create a default memory backend.
    pub fn memory() -> MemoryBackend {
        MemoryBackend::new()
    }
}
