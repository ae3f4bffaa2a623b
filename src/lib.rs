//! Elastic Chain-Replicated Store Client
//!
//! Client library for a partitioned key-value and file store whose partitions are
//! served by replica chains: mutations enter at the head, reads are answered by the
//! tail, and partitions split, merge and move while clients keep running.
//!
//! ## Architecture Modules
//! - **`protocol`**: Wire frames, opcodes, and the `!`-prefixed reply sentinels decoded
//!   into typed replies.
//! - **`routing`**: Key hashing into the slot space and slot-to-partition lookup.
//! - **`directory`**: The directory and lease contracts, plus a static map for fixed
//!   deployments.
//! - **`chain`**: One client per replica chain. Sequencing, pipelining, and recovery
//!   from failed chain members.
//! - **`redirect`**: Following `!exporting` redirects and refreshing after
//!   `!block_moved`, for single commands and batches.
//! - **`hashtable`** / **`file`**: The data-structure façades applications use.
//! - **`background`**: Lease renewal and notification subscriptions.
//! - **`client`**: [`ElasticClient`], which wires everything above together.

pub mod background;
pub mod chain;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod file;
pub mod hashtable;
pub mod protocol;
pub mod redirect;
pub mod routing;

#[cfg(test)]
pub(crate) mod testkit;

pub use background::{LeaseService, Notification, Subscriber};
pub use client::ElasticClient;
pub use config::ClientConfig;
pub use directory::{CreateOptions, DirectoryService, StaticDirectory};
pub use error::{ClientError, Result};
pub use file::{Cursor, FileClient};
pub use hashtable::{HashTableClient, LockedSession};
pub use protocol::Outcome;
pub use routing::{BlockEndpoint, PartitionMap, ReplicaChain};
