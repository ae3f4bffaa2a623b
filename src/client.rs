//! Top-level client.
//!
//! Wires one directory, one endpoint cache and one lease worker together and opens
//! data-structure façades on top of them. Every path opened through it has its
//! lease renewed until it is closed or removed.

use crate::background::{LeaseRenewalWorker, LeaseService, Subscriber};
use crate::chain::{ChainContext, EndpointCache};
use crate::config::ClientConfig;
use crate::directory::{CreateOptions, DirectoryService};
use crate::error::Result;
use crate::file::FileClient;
use crate::hashtable::HashTableClient;
use crate::routing::PartitionMap;

use std::sync::Arc;

pub struct ElasticClient {
    directory: Arc<dyn DirectoryService>,
    cache: Arc<EndpointCache>,
    config: Arc<ClientConfig>,
    leases: LeaseRenewalWorker,
}

impl ElasticClient {
    /// Must be called from within a tokio runtime; the lease worker starts
    /// immediately.
    pub fn new(
        directory: Arc<dyn DirectoryService>,
        lease_service: Arc<dyn LeaseService>,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(EndpointCache::new(
            config.connect_attempts,
            config.timeout(),
        ));
        let leases = LeaseRenewalWorker::start(lease_service, config.lease_period());

        Ok(Self {
            directory,
            cache,
            config: Arc::new(config),
            leases,
        })
    }

    pub fn directory(&self) -> &Arc<dyn DirectoryService> {
        &self.directory
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> &EndpointCache {
        &self.cache
    }

    pub fn leases(&self) -> &LeaseRenewalWorker {
        &self.leases
    }

    pub async fn create_hash_table(
        &self,
        path: &str,
        options: &CreateOptions,
    ) -> Result<HashTableClient> {
        let map = self.directory.create(path, options).await?;
        self.open_table_with(path, map).await
    }

    pub async fn open_hash_table(&self, path: &str) -> Result<HashTableClient> {
        let map = self.directory.open(path).await?;
        self.open_table_with(path, map).await
    }

    pub async fn open_or_create_hash_table(
        &self,
        path: &str,
        options: &CreateOptions,
    ) -> Result<HashTableClient> {
        let map = self.directory.open_or_create(path, options).await?;
        self.open_table_with(path, map).await
    }

    pub async fn create_file(&self, path: &str, options: &CreateOptions) -> Result<FileClient> {
        let map = self.directory.create(path, options).await?;
        self.open_file_with(path, map).await
    }

    pub async fn open_file(&self, path: &str) -> Result<FileClient> {
        let map = self.directory.open(path).await?;
        self.open_file_with(path, map).await
    }

    pub async fn open_or_create_file(
        &self,
        path: &str,
        options: &CreateOptions,
    ) -> Result<FileClient> {
        let map = self.directory.open_or_create(path, options).await?;
        self.open_file_with(path, map).await
    }

    /// Stops renewing the path's lease. The data structure itself stays.
    pub fn close(&self, path: &str) {
        if self.leases.remove_path(path) {
            tracing::debug!("Closed {}", path);
        }
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        self.leases.remove_path(path);
        self.directory.remove(path).await
    }

    /// Removes `path` and everything below it.
    pub async fn remove_all(&self, path: &str) -> Result<()> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        for open in self.leases.paths() {
            if open == path || open.starts_with(&prefix) {
                self.leases.remove_path(&open);
            }
        }
        self.directory.remove_all(path).await
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.directory.rename(old_path, new_path).await?;
        if self.leases.remove_path(old_path) {
            self.leases.add_path(new_path);
        }
        Ok(())
    }

    /// Opens a notification listener on every partition of `path`.
    pub async fn listen(&self, path: &str) -> Result<Subscriber> {
        let map = self.directory.dstatus(path).await?;
        Subscriber::connect(&map, &self.config).await
    }

    fn context(&self, path: &str) -> ChainContext {
        ChainContext::new(
            self.directory.clone(),
            path,
            self.cache.clone(),
            self.config.clone(),
        )
    }

    async fn open_table_with(&self, path: &str, map: PartitionMap) -> Result<HashTableClient> {
        let table = HashTableClient::connect(self.context(path), map).await?;
        self.leases.add_path(path);
        tracing::info!("Opened hash table {} ({} partition(s))", path, table.num_partitions());
        Ok(table)
    }

    async fn open_file_with(&self, path: &str, map: PartitionMap) -> Result<FileClient> {
        let file = FileClient::connect(self.context(path), map).await?;
        self.leases.add_path(path);
        tracing::info!("Opened file {} ({} partition(s))", path, file.num_partitions());
        Ok(file)
    }
}
