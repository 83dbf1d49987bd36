//! Repository event bus.
//!
//! The repository publishes a small fixed set of lifecycle and mutation
//! events over a broadcast channel, and forwards the store's own
//! maintenance events verbatim. Publication is synchronous: the event is
//! buffered in the channel before the emitting operation returns, so
//! within one task subscribers observe events in operation order.

use strata_types::StoreEvent;
use tokio::sync::broadcast;

/// Default buffer size of the repository event channel.
///
/// Subscribers that fall behind by more than this many events observe a
/// lag error and must resynchronise from the repository state.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events emitted by a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryEvent {
    /// The repository record was written for the first time.
    DidCreate,
    /// Initialization completed.
    DidInitialize,
    /// Destruction is about to begin.
    WillDestroy,
    /// Destruction completed.
    DidDestroy,
    /// An item was written.
    DidPutItem {
        /// The item's most-derived class.
        class: String,
        /// The item's primary key.
        key: String,
    },
    /// An item was removed.
    DidDeleteItem {
        /// The class the delete was issued through.
        class: String,
        /// The item's primary key.
        key: String,
    },
    /// A repository record upgrade started.
    UpgradeDidStart {
        /// Version found on disk.
        from: u32,
        /// Version being upgraded to.
        to: u32,
    },
    /// A repository record upgrade finished.
    UpgradeDidStop,
    /// The object store started a data migration.
    MigrationDidStart,
    /// The object store finished a data migration.
    MigrationDidStop,
    /// The object store started a format upgrade.
    StoreUpgradeDidStart,
    /// The object store finished a format upgrade.
    StoreUpgradeDidStop,
}

impl From<StoreEvent> for RepositoryEvent {
    fn from(event: StoreEvent) -> Self {
        match event {
            StoreEvent::UpgradeDidStart => RepositoryEvent::StoreUpgradeDidStart,
            StoreEvent::UpgradeDidStop => RepositoryEvent::StoreUpgradeDidStop,
            StoreEvent::MigrationDidStart => RepositoryEvent::MigrationDidStart,
            StoreEvent::MigrationDidStop => RepositoryEvent::MigrationDidStop,
        }
    }
}

/// Broadcast bus carrying [`RepositoryEvent`]s to all subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RepositoryEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a bus with the given channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of receivers the event was delivered to. A bus
    /// without subscribers swallows the event; that is not an error.
    pub fn publish(&self, event: RepositoryEvent) -> usize {
        tracing::trace!(?event, "publishing repository event");
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RepositoryEvent> {
        self.sender.subscribe()
    }

    /// The number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
