//! A directory backed by a fixed set of partition maps, typically loaded from a
//! JSON file. It cannot allocate blocks, so `create` only succeeds for paths it
//! already knows.

use super::{CreateOptions, DirectoryService};
use crate::background::{LeaseAck, LeaseService};
use crate::error::{ClientError, Result};
use crate::routing::{PartitionMap, ReplicaChain};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default)]
pub struct StaticDirectory {
    maps: DashMap<String, PartitionMap>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `{ "<path>": <partition map>, ... }`.
    pub fn from_file(file: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(file.as_ref())?;
        let parsed: HashMap<String, PartitionMap> = serde_json::from_str(&raw)?;

        let directory = Self::new();
        for (path, map) in parsed {
            map.validate()?;
            directory.insert(path, map);
        }
        Ok(directory)
    }

    pub fn insert(&self, path: impl Into<String>, map: PartitionMap) {
        self.maps.insert(path.into(), map);
    }

    fn lookup(&self, path: &str) -> Result<PartitionMap> {
        self.maps
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClientError::Directory(format!("no such path: {path}")))
    }
}

#[async_trait]
impl DirectoryService for StaticDirectory {
    async fn create(&self, path: &str, _options: &CreateOptions) -> Result<PartitionMap> {
        if self.maps.contains_key(path) {
            return Err(ClientError::Directory(format!("path already exists: {path}")));
        }
        Err(ClientError::Directory(format!(
            "static directory cannot allocate blocks for {path}"
        )))
    }

    async fn open(&self, path: &str) -> Result<PartitionMap> {
        self.lookup(path)
    }

    async fn open_or_create(&self, path: &str, options: &CreateOptions) -> Result<PartitionMap> {
        match self.lookup(path) {
            Ok(map) => Ok(map),
            Err(_) => self.create(path, options).await,
        }
    }

    async fn dstatus(&self, path: &str) -> Result<PartitionMap> {
        self.lookup(path)
    }

    // No liveness information: the configured chain is the only answer.
    async fn resolve_failures(&self, path: &str, chain: &ReplicaChain) -> Result<ReplicaChain> {
        let map = self.lookup(path)?;
        if map.chains().any(|c| c == chain) {
            Ok(chain.clone())
        } else {
            Err(ClientError::Directory(format!(
                "chain {chain} is not part of {path}"
            )))
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.maps
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| ClientError::Directory(format!("no such path: {path}")))
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.maps
            .retain(|key, _| key != path && !key.starts_with(&prefix));
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        if self.maps.contains_key(new_path) {
            return Err(ClientError::Directory(format!(
                "path already exists: {new_path}"
            )));
        }
        let (_, map) = self
            .maps
            .remove(old_path)
            .ok_or_else(|| ClientError::Directory(format!("no such path: {old_path}")))?;
        self.maps.insert(new_path.to_string(), map);
        Ok(())
    }
}

// Nothing expires here; every known path counts as renewed.
#[async_trait]
impl LeaseService for StaticDirectory {
    async fn renew_leases(&self, paths: &[String]) -> Result<LeaseAck> {
        let renewed = paths.iter().filter(|p| self.maps.contains_key(*p)).count();
        Ok(LeaseAck {
            renewed,
            lease_period_ms: 0,
        })
    }
}
