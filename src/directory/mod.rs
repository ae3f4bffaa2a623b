//! Directory Service Contract
//!
//! The directory owns the namespace of data structures and knows, for each path,
//! which replica chains serve which slot ranges. The client never decides placement;
//! it asks the directory for a partition map on open, on `!block_moved`, and when a
//! chain member stops answering.

pub mod static_map;

use crate::error::Result;
use crate::routing::{PartitionMap, ReplicaChain};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use static_map::StaticDirectory;

/// Parameters for creating a data structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateOptions {
    /// Persistent backing location; empty for memory-only structures.
    pub backing_path: String,
    pub num_partitions: usize,
    pub chain_length: usize,
    pub flags: u32,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            backing_path: String::new(),
            num_partitions: 1,
            chain_length: 1,
            flags: 0,
        }
    }
}

#[async_trait]
pub trait DirectoryService: Send + Sync {
    async fn create(&self, path: &str, options: &CreateOptions) -> Result<PartitionMap>;

    async fn open(&self, path: &str) -> Result<PartitionMap>;

    async fn open_or_create(&self, path: &str, options: &CreateOptions) -> Result<PartitionMap>;

    /// Current partition map of an open path.
    async fn dstatus(&self, path: &str) -> Result<PartitionMap>;

    /// Returns `chain` with dead members replaced by live ones.
    async fn resolve_failures(&self, path: &str, chain: &ReplicaChain) -> Result<ReplicaChain>;

    async fn remove(&self, path: &str) -> Result<()>;

    async fn remove_all(&self, path: &str) -> Result<()>;

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()>;
}
