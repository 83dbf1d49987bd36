//! # Strata Repository
//!
//! A typed, polymorphic object repository layered over an object store.
//!
//! Client code registers collection classes whose items carry a primary
//! key, typed properties, secondary indexes, and participate in a
//! class-inclusion hierarchy: an item of a derived collection is *also* an
//! instance of every base collection its class includes, and is found by
//! queries on any of them, materialised at its true, most-derived type.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                Repository<S>                     │
//! │  lifecycle │ transaction scope │ item operations │
//! ├────────────┴─────────┬─────────┴─────────────────┤
//! │ ClassRegistry        │  EventBus                 │
//! │ (name -> descriptor) │  (lifecycle + mutations)  │
//! ├──────────────────────┴───────────────────────────┤
//! │            ObjectStore (strata-store)            │
//! │   raw KV │ item CRUD │ find/count │ transactions │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use strata_repository::{ClassDescriptor, Repository};
//! use serde_json::json;
//!
//! let repository = Repository::open(
//!     "crm",
//!     "memory:",
//!     vec![
//!         ClassDescriptor::new("Account", "id").indexed_on(["country"]),
//!         ClassDescriptor::new("Person", "id").including(["Account"]),
//!     ],
//! )?;
//!
//! let people = repository.create_collection("Person")?;
//! let mut manu = people.create_item(json!({"id": "m", "firstName": "Manu"}))?;
//! people.put_item(&mut manu, &Default::default()).await?;
//!
//! // The person is also an Account, and comes back as a Person.
//! let accounts = repository.create_collection("Account")?;
//! let found = accounts.get_item("m", &Default::default()).await?;
//! ```
//!
//! # Error Handling
//!
//! All operations return [`RepositoryResult<T>`], which maps store errors
//! to repository-level semantics. Operations do not catch: errors
//! propagate to the transaction boundary, which aborts and re-raises them.

#![deny(unsafe_code)]

pub mod collection;
pub mod error;
pub mod events;
pub mod ident;
pub mod record;
pub mod registry;
pub mod repository;

// Re-export main types for convenience
pub use collection::Collection;
pub use error::{RepositoryError, RepositoryResult};
pub use events::{EventBus, RepositoryEvent};
pub use registry::{ClassCache, ClassRegistry};
pub use repository::Repository;

// Re-export the shared data model and the store surface the repository
// builds on, so most users depend on this crate alone.
pub use strata_store::{
    BackendType, MemoryBackend, ObjectStore, ObjectStoreOps, StorageConfig, StorageFactory,
    StoreTransaction,
};
pub use strata_types::{
    ClassDescriptor, DeleteOptions, FindOptions, GetOptions, Item, Order, PutOptions,
    RepositoryRecord, StoreError, StoredRecord, REPOSITORY_VERSION, RESPIRATION_RATE,
};
