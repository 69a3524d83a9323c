pub mod config;
pub mod coordinator;
pub mod error;
pub mod idgen;
pub mod key;
pub mod queue;
pub mod store;


// Re-export key types for convenience
pub use key::{GlobalPartition, KeyError, ResourceKey};

// Re-export queue types for convenience
pub use idgen::{IdGen, TicketId};
pub use queue::{Lane, QueueError, SerialQueue, Ticket, TicketState};

// Re-export store types for convenience
pub use store::{Document, FileStore, MemStore, Store, StoreError};
#[cfg(feature = "sqlitestore")]
pub use store::SqliteStore;

// Re-export coordinator types
pub use config::{ConfigError, QueueConfig};
pub use coordinator::{Coordinator, Txn};
pub use error::{Error, TxnError};
