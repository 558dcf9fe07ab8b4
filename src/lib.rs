//! # propstore
//!
//! Shared state for a test framework running without a coordination
//! service: a transactional property store kept in one local file, and a
//! resource allocator that leases unique names (ports, device ids, userids)
//! without colliding with names already recorded in that store.
//!
//! - **Flat dotted keys**: `framework.run.U42.status`, first segment is the namespace
//! - **Atomic transactions**: add, update, delete, delete-prefix and swap as one batch
//! - **Watch/notifications**: NEW, MODIFIED and DELETE events per key or prefix
//! - **Multi-process**: edits by other processes are reconciled and reported
//!
//! ## Backends
//!
//! - [`PropertyFileStore`]: `key=value` file guarded by `flock` (default)
//! - [`MemoryStore`]: In-memory store (testing and development)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use propstore::{PropertyFileStore, PropertyStore};
//!
//! #[tokio::main]
//! async fn main() -> propstore::Result<()> {
//!     let store = PropertyFileStore::open_path("/tmp/dss.properties").await?;
//!
//!     store.put("framework.run.U42.status", "running").await?;
//!
//!     if let Some(status) = store.get("framework.run.U42.status").await? {
//!         println!("status: {}", status);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Transactions
//!
//! ```rust,no_run
//! use propstore::{Action, MemoryStore, PropertyStore};
//!
//! #[tokio::main]
//! async fn main() -> propstore::Result<()> {
//!     let store = MemoryStore::new();
//!     store.put("slots.SYSA.free", "3").await?;
//!
//!     // Claim a slot only if nobody else changed the counter meanwhile
//!     let claimed = store
//!         .perform_actions(vec![
//!             Action::swap("slots.SYSA.free", Some("3"), "2"),
//!             Action::add("slots.SYSA.U42", "active"),
//!         ])
//!         .await;
//!
//!     match claimed {
//!         Ok(()) => println!("slot claimed"),
//!         Err(e) if e.is_precondition() => println!("lost the race, retry"),
//!         Err(e) => return Err(e),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Resources
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use propstore::{AllocationRequest, MemoryStore, ResourceAllocator, StoreLookup};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), propstore::ResourceError> {
//!     let store = Arc::new(MemoryStore::new());
//!     let in_use = StoreLookup::new(Arc::clone(&store), "dss.ports.");
//!
//!     let ports = ResourceAllocator::default()
//!         .obtain(
//!             AllocationRequest::new(["{40000-40999}"])
//!                 .minimum(4)
//!                 .consecutive(4)
//!                 .lookup(&in_use),
//!         )
//!         .await?;
//!     println!("{:?}", ports);
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod codec;
pub mod config;
pub mod error;
mod file;
pub mod memory;
pub mod namespace;
pub mod property_file;
pub mod resource;
pub mod store;
pub mod watch;

// Re-export main types
pub use action::{Action, Properties};
pub use config::{AllocatorConfig, Settings, StoreConfig};
pub use error::{ResourceError, Result, StoreError};
pub use memory::MemoryStore;
pub use namespace::NamespacedStore;
pub use property_file::PropertyFileStore;
pub use resource::{
    obtain_resources, AllocationRequest, FnLookup, ResourceAllocator, ResourceLookup,
    ResourcePool, ResourceString, StoreLookup,
};
pub use store::{PropertyStore, MAX_KEY_LENGTH};
pub use watch::{EventType, MatchMode, WatchCallback, WatchEvent, WatchId, WatchStream};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::action::Action;
    pub use crate::error::{ResourceError, Result, StoreError};
    pub use crate::memory::MemoryStore;
    pub use crate::property_file::PropertyFileStore;
    pub use crate::resource::{AllocationRequest, ResourceAllocator, StoreLookup};
    pub use crate::store::PropertyStore;
    pub use crate::watch::{EventType, MatchMode, WatchEvent, WatchStream};
}
