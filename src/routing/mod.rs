//! Partition Routing
//!
//! Maps keys onto the replica chains that own them.
//!
//! ## Core Concepts
//! - **Slots**: every key hashes (CRC16/XMODEM) into a fixed space of 65536 slots.
//! - **Partition Map**: an ordered list of partitions, each owning the slots from its
//!   `slot_begin` up to the next partition's `slot_begin`.
//! - **Chains**: a partition is served by a replica chain; the head absorbs mutations
//!   and the tail answers reads.
//! - **Router**: binary search over the sorted slot boundaries, rebuilt whenever the
//!   partition map is refreshed from the directory.

pub mod hash;
pub mod router;
pub mod types;

pub use hash::{MAX_SLOT, slot_of};
pub use router::PartitionRouter;
pub use types::{BlockEndpoint, Partition, PartitionMap, ReplicaChain};
