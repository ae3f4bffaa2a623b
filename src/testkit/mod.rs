//! In-Process Test Cluster
//!
//! A handful of block servers on loopback listeners plus the directory and lease
//! service that know about them. Tests drive the real client stack against it and
//! reach in through [`TestCluster`] to scale partitions or inject faults.
//!
//! ## Simplifications
//! - A chain is one state per partition: a mutator applied at the head is
//!   immediately visible at the tail.
//! - Export moves every key of the exported range up front; the source answers
//!   `!exporting` for them until the export finishes.

mod store;

use server::{Outbox, Outgoing, accept_loop};
use store::{AutoScale, Registry};

use crate::background::{LeaseAck, LeaseService};
use crate::chain::{ChainContext, EndpointCache};
use crate::config::ClientConfig;
use crate::directory::{CreateOptions, DirectoryService};
use crate::error::{ClientError, Result};
use crate::protocol::BlockFrame;
use crate::routing::{PartitionMap, ReplicaChain};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub(crate) struct ClusterOptions {
    pub servers: usize,
    /// Bytes per file partition.
    pub file_capacity: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            servers: 3,
            file_capacity: 64,
        }
    }
}

pub(crate) struct ServerSlot {
    pub port: u16,
    pub alive: AtomicBool,
    pub connections: DashMap<u64, Outbox>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
pub(crate) struct Faults {
    tail_drops: AtomicUsize,
    pub corrupt_next_seq: AtomicBool,
    pub hold_next_response: AtomicBool,
    pub held: Mutex<Option<(Outbox, BlockFrame)>>,
    pub swallow_control: AtomicBool,
    pub delay_control: AtomicBool,
    pub held_controls: Mutex<Vec<(Outbox, BlockFrame)>>,
}

impl Faults {
    pub fn take_tail_drop(&self) -> bool {
        self.tail_drops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub(crate) struct ClusterState {
    pub servers: Vec<ServerSlot>,
    pub registry: Mutex<Registry>,
    pub outboxes: DashMap<i64, Outbox>,
    pub subscriptions: DashMap<i32, Vec<(u64, Outbox, Vec<String>)>>,
    pub next_client: AtomicI64,
    pub next_conn: AtomicU64,
    pub faults: Faults,
    pub file_capacity: usize,
    lease_renewals: DashMap<String, usize>,
    lease_period_ms: AtomicU64,
    partial_leases: AtomicBool,
}

impl ClusterState {
    pub fn live_ports(&self) -> Vec<u16> {
        self.servers
            .iter()
            .filter(|s| s.alive.load(Ordering::SeqCst))
            .map(|s| s.port)
            .collect()
    }

    fn registry(&self) -> Result<std::sync::MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| ClientError::Directory("registry lock poisoned".into()))
    }
}

#[async_trait]
impl DirectoryService for ClusterState {
    async fn create(&self, path: &str, options: &CreateOptions) -> Result<PartitionMap> {
        let live = self.live_ports();
        self.registry()?.create(path, options, &live)
    }

    async fn open(&self, path: &str) -> Result<PartitionMap> {
        self.registry()?.map_of(path)
    }

    async fn open_or_create(&self, path: &str, options: &CreateOptions) -> Result<PartitionMap> {
        let live = self.live_ports();
        let mut registry = self.registry()?;
        if registry.structures.contains_key(path) {
            registry.map_of(path)
        } else {
            registry.create(path, options, &live)
        }
    }

    async fn dstatus(&self, path: &str) -> Result<PartitionMap> {
        self.registry()?.map_of(path)
    }

    async fn resolve_failures(&self, path: &str, chain: &ReplicaChain) -> Result<ReplicaChain> {
        let live = self.live_ports();
        self.registry()?.resolve(path, chain, &live)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.registry()?.remove(path)
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        self.registry()?.remove_all(path)
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.registry()?.rename(old_path, new_path)
    }
}

#[async_trait]
impl LeaseService for ClusterState {
    async fn renew_leases(&self, paths: &[String]) -> Result<LeaseAck> {
        for path in paths {
            *self.lease_renewals.entry(path.clone()).or_default() += 1;
        }
        let renewed = if self.partial_leases.load(Ordering::SeqCst) {
            paths.len().saturating_sub(1)
        } else {
            paths.len()
        };
        Ok(LeaseAck {
            renewed,
            lease_period_ms: self.lease_period_ms.load(Ordering::SeqCst),
        })
    }
}

pub(crate) struct TestCluster {
    state: Arc<ClusterState>,
}

impl TestCluster {
    pub async fn start(options: ClusterOptions) -> Self {
        let mut listeners = Vec::with_capacity(options.servers);
        let mut servers = Vec::with_capacity(options.servers);
        for _ in 0..options.servers {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            servers.push(ServerSlot {
                port: listener.local_addr().unwrap().port(),
                alive: AtomicBool::new(true),
                connections: DashMap::new(),
                acceptor: Mutex::new(None),
            });
            listeners.push(listener);
        }

        let state = Arc::new(ClusterState {
            servers,
            registry: Mutex::new(Registry::default()),
            outboxes: DashMap::new(),
            subscriptions: DashMap::new(),
            next_client: AtomicI64::new(1),
            next_conn: AtomicU64::new(1),
            faults: Faults::default(),
            file_capacity: options.file_capacity,
            lease_renewals: DashMap::new(),
            lease_period_ms: AtomicU64::new(0),
            partial_leases: AtomicBool::new(false),
        });

        for (index, listener) in listeners.into_iter().enumerate() {
            let handle = tokio::spawn(accept_loop(state.clone(), index, listener));
            *state.servers[index].acceptor.lock().unwrap() = Some(handle);
        }

        Self { state }
    }

    pub async fn with_defaults() -> Self {
        Self::start(ClusterOptions::default()).await
    }

    pub fn directory(&self) -> Arc<dyn DirectoryService> {
        self.state.clone()
    }

    pub fn lease_service(&self) -> Arc<dyn LeaseService> {
        self.state.clone()
    }

    /// Short timeouts so failure paths resolve quickly.
    pub fn config() -> ClientConfig {
        ClientConfig {
            timeout_ms: 2_000,
            connect_attempts: 2,
            lease_period_ms: 20,
            ..ClientConfig::default()
        }
    }

    pub fn context(&self, path: &str) -> ChainContext {
        self.context_with(path, Self::config())
    }

    pub fn context_with(&self, path: &str, config: ClientConfig) -> ChainContext {
        let cache = Arc::new(EndpointCache::new(config.connect_attempts, config.timeout()));
        ChainContext::new(self.directory(), path, cache, Arc::new(config))
    }

    pub async fn create(&self, path: &str, partitions: usize, chain_length: usize) -> PartitionMap {
        let options = CreateOptions {
            num_partitions: partitions,
            chain_length,
            ..CreateOptions::default()
        };
        self.state.create(path, &options).await.unwrap()
    }

    pub fn enable_auto_scale(&self, path: &str, split_above: usize, merge_below: usize) {
        self.registry()
            .enable_auto_scale(
                path,
                AutoScale {
                    split_above,
                    merge_below,
                },
            )
            .unwrap();
    }

    pub fn split(&self, path: &str, partition: usize) -> ReplicaChain {
        let live = self.state.live_ports();
        self.registry().split(path, partition, &live).unwrap()
    }

    /// Starts exporting the upper half of `partition`; returns the destination chain.
    pub fn begin_export(&self, path: &str, partition: usize) -> ReplicaChain {
        let live = self.state.live_ports();
        self.registry().begin_export(path, partition, &live).unwrap()
    }

    pub fn finish_export(&self, path: &str, partition: usize) {
        self.registry().finish_export(path, partition).unwrap();
    }

    /// Start of the slot range exported by `partition`.
    pub fn export_start(&self, path: &str, partition: usize) -> u32 {
        let registry = self.registry();
        let structure = registry.structure(path).unwrap();
        let source = &structure.partitions[&structure.order[partition]];
        source.exporting.as_ref().unwrap().range.0
    }

    pub fn num_partitions(&self, path: &str) -> usize {
        self.registry().structure(path).unwrap().order.len()
    }

    /// Keys stored under `path`, export destinations included.
    pub fn key_count(&self, path: &str) -> usize {
        self.registry()
            .structure(path)
            .unwrap()
            .partitions
            .values()
            .map(|p| p.kv.len())
            .sum()
    }

    pub fn value_of(&self, path: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.registry()
            .structure(path)
            .unwrap()
            .partitions
            .values()
            .find_map(|p| p.kv.get(key).cloned())
    }

    pub fn locked_partitions(&self, path: &str) -> usize {
        self.registry()
            .structure(path)
            .unwrap()
            .partitions
            .values()
            .filter(|p| p.locked)
            .count()
    }

    pub fn file_len(&self, path: &str) -> usize {
        self.registry()
            .structure(path)
            .unwrap()
            .partitions
            .values()
            .map(|p| p.file.len())
            .sum()
    }

    /// The next `n` mutators are applied, then their tail connection is closed
    /// instead of answering.
    pub fn drop_tail_after_apply(&self, n: usize) {
        self.state.faults.tail_drops.store(n, Ordering::SeqCst);
    }

    pub fn corrupt_next_seq(&self) {
        self.state.faults.corrupt_next_seq.store(true, Ordering::SeqCst);
    }

    /// Delays the next response until after the one that follows it.
    pub fn hold_next_response(&self) {
        self.state.faults.hold_next_response.store(true, Ordering::SeqCst);
    }

    pub fn swallow_control(&self) {
        self.state.faults.swallow_control.store(true, Ordering::SeqCst);
    }

    /// Stops server `index`: no new connections, and every open one is closed.
    pub fn kill_server(&self, index: usize) {
        let slot = &self.state.servers[index];
        slot.alive.store(false, Ordering::SeqCst);
        if let Some(acceptor) = slot.acceptor.lock().unwrap().take() {
            acceptor.abort();
        }
        for connection in slot.connections.iter() {
            let _ = connection.value().send(Outgoing::Close);
        }
    }

    /// Holds control acks back until [`TestCluster::flush_control`].
    pub fn delay_control(&self, delay: bool) {
        self.state.faults.delay_control.store(delay, Ordering::SeqCst);
    }

    pub fn flush_control(&self) {
        let held = std::mem::take(&mut *self.state.faults.held_controls.lock().unwrap());
        for (outbox, frame) in held {
            let _ = outbox.send(Outgoing::Frame(frame));
        }
    }

    /// Kills whichever server listens on `port`.
    pub fn kill_server_on(&self, port: u16) {
        let index = self
            .state
            .servers
            .iter()
            .position(|slot| slot.port == port)
            .unwrap();
        self.kill_server(index);
    }

    pub fn lease_renewals(&self, path: &str) -> usize {
        self.state
            .lease_renewals
            .get(path)
            .map(|n| *n)
            .unwrap_or(0)
    }

    pub fn set_lease_period(&self, ms: u64) {
        self.state.lease_period_ms.store(ms, Ordering::SeqCst);
    }

    /// Every renewal then reports one lease fewer than requested.
    pub fn set_partial_leases(&self, partial: bool) {
        self.state.partial_leases.store(partial, Ordering::SeqCst);
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.state.registry.lock().unwrap()
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for slot in &self.state.servers {
            if let Ok(mut acceptor) = slot.acceptor.lock()
                && let Some(acceptor) = acceptor.take()
            {
                acceptor.abort();
            }
        }
    }
}
