//! Hash Table Client
//!
//! The application-facing key-value façade over a partitioned, chain-replicated
//! hash table.
//!
//! ## Operation Flow
//! 1. **Route**: the key's slot picks a partition, and with it a chain client.
//! 2. **Run**: the command goes to the chain (head for mutators, tail for reads).
//! 3. **Resolve**: redirects are followed through [`crate::redirect`]; a moved block
//!    reloads the partition map from the directory and the whole call is redone.
//!
//! Batch calls (`*_many`) group their elements by partition, send one request per
//! partition, and return results in the caller's order.
//!
//! A [`LockedSession`] holds the distributed lock on every chain of the table so a
//! sequence of operations applies atomically across partitions.

pub mod locked;

pub use locked::LockedSession;

use crate::chain::{ChainClient, ChainContext};
use crate::error::{ClientError, Result};
use crate::protocol::{CommandSet, HashTableOp, Outcome, Reply, Sentinel};
use crate::redirect::{RedirectScope, Resolution, dispatch_batch};
use crate::routing::{PartitionMap, PartitionRouter};

pub struct HashTableClient {
    ctx: ChainContext,
    map: PartitionMap,
    router: PartitionRouter,
    chains: Vec<ChainClient>,
}

impl HashTableClient {
    pub async fn connect(ctx: ChainContext, map: PartitionMap) -> Result<Self> {
        let router = PartitionRouter::new(&map)?;
        let chains = ChainClient::connect_all(&ctx, &map).await?;

        Ok(Self {
            ctx,
            map,
            router,
            chains,
        })
    }

    pub fn path(&self) -> &str {
        &self.ctx.path
    }

    pub fn partition_map(&self) -> &PartitionMap {
        &self.map
    }

    pub fn num_partitions(&self) -> usize {
        self.router.num_partitions()
    }

    /// Reloads the partition map from the directory and reconnects every chain.
    pub async fn refresh(&mut self) -> Result<()> {
        let map = self.ctx.directory.dstatus(&self.ctx.path).await?;
        let router = PartitionRouter::new(&map)?;
        let chains = ChainClient::connect_all(&self.ctx, &map).await?;

        tracing::info!(
            "Refreshed partition map of {}: {} -> {} partition(s)",
            self.ctx.path,
            self.map.len(),
            map.len()
        );

        self.map = map;
        self.router = router;
        self.chains = chains;
        Ok(())
    }

    pub async fn get(&mut self, key: &[u8]) -> Result<Outcome> {
        self.run_keyed(HashTableOp::Get, vec![key.to_vec()]).await
    }

    /// Inserts a new key; `DuplicateKey` if it already exists.
    pub async fn put(&mut self, key: &[u8], value: &[u8]) -> Result<Outcome> {
        self.run_keyed(HashTableOp::Put, vec![key.to_vec(), value.to_vec()])
            .await
    }

    /// Replaces the value of an existing key; `KeyNotFound` otherwise.
    pub async fn update(&mut self, key: &[u8], value: &[u8]) -> Result<Outcome> {
        self.run_keyed(HashTableOp::Update, vec![key.to_vec(), value.to_vec()])
            .await
    }

    /// Inserts or replaces.
    pub async fn upsert(&mut self, key: &[u8], value: &[u8]) -> Result<Outcome> {
        self.run_keyed(HashTableOp::Upsert, vec![key.to_vec(), value.to_vec()])
            .await
    }

    pub async fn remove(&mut self, key: &[u8]) -> Result<Outcome> {
        self.run_keyed(HashTableOp::Remove, vec![key.to_vec()]).await
    }

    pub async fn exists(&mut self, key: &[u8]) -> Result<bool> {
        parse_exists(self.run_keyed(HashTableOp::Exists, vec![key.to_vec()]).await?)
    }

    /// Total number of keys over all partitions.
    pub async fn num_keys(&mut self) -> Result<u64> {
        let max_redo = self.ctx.config.max_redo;

        for _ in 0..=max_redo {
            self.ensure_connected().await?;
            match sum_num_keys(&mut self.chains).await? {
                Some(total) => return Ok(total),
                None => self.refresh().await?,
            }
        }
        Err(ClientError::RedoLimitExceeded(max_redo))
    }

    pub async fn get_many<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> Result<Vec<Outcome>> {
        self.run_many(HashTableOp::Get, key_groups(keys)).await
    }

    pub async fn put_many<K, V>(&mut self, pairs: &[(K, V)]) -> Result<Vec<Outcome>>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.run_many(HashTableOp::Put, pair_groups(pairs)).await
    }

    pub async fn update_many<K, V>(&mut self, pairs: &[(K, V)]) -> Result<Vec<Outcome>>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.run_many(HashTableOp::Update, pair_groups(pairs)).await
    }

    pub async fn upsert_many<K, V>(&mut self, pairs: &[(K, V)]) -> Result<Vec<Outcome>>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.run_many(HashTableOp::Upsert, pair_groups(pairs)).await
    }

    pub async fn remove_many<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> Result<Vec<Outcome>> {
        self.run_many(HashTableOp::Remove, key_groups(keys)).await
    }

    pub async fn exists_many<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> Result<Vec<bool>> {
        self.run_many(HashTableOp::Exists, key_groups(keys))
            .await?
            .into_iter()
            .map(parse_exists)
            .collect()
    }

    // A dropped locked session leaves the table without chain clients.
    async fn ensure_connected(&mut self) -> Result<()> {
        if self.chains.len() != self.router.num_partitions() {
            self.refresh().await?;
        }
        Ok(())
    }

    async fn run_keyed(&mut self, op: HashTableOp, args: Vec<Vec<u8>>) -> Result<Outcome> {
        let max_redo = self.ctx.config.max_redo;

        for _ in 0..=max_redo {
            self.ensure_connected().await?;
            let partition = self.router.route(&args[0]);

            let resolution = {
                let mut scope = RedirectScope::open(self.ctx.clone(), &mut self.chains);
                scope.run(op, partition, args.clone()).await?
            };

            match resolution {
                Resolution::Done(reply) => return reply.into_outcome(),
                Resolution::Refresh => self.refresh().await?,
                Resolution::Redo => {
                    tracing::debug!("Redoing {} on partition {}", op.name(), partition);
                }
            }
        }
        Err(ClientError::RedoLimitExceeded(max_redo))
    }

    async fn run_many(
        &mut self,
        op: HashTableOp,
        groups: Vec<Vec<Vec<u8>>>,
    ) -> Result<Vec<Outcome>> {
        let max_redo = self.ctx.config.max_redo;
        let mut results: Vec<Option<Outcome>> = vec![None; groups.len()];
        let mut pending: Vec<usize> = (0..groups.len()).collect();
        let mut rounds = 0;

        while !pending.is_empty() {
            if rounds > max_redo {
                return Err(ClientError::RedoLimitExceeded(max_redo));
            }
            rounds += 1;
            self.ensure_connected().await?;

            let resolved = {
                let mut scope = RedirectScope::open(self.ctx.clone(), &mut self.chains);
                dispatch_batch(&mut scope, &self.router, op, &groups, &pending).await?
            };

            let (retry, stale) = collect_resolved(resolved, &mut results)?;
            if stale {
                self.refresh().await?;
            }
            pending = retry;
        }

        finish_results(results)
    }
}

impl std::fmt::Debug for HashTableClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTableClient")
            .field("path", &self.ctx.path)
            .field("partitions", &self.map.len())
            .finish()
    }
}

fn key_groups<K: AsRef<[u8]>>(keys: &[K]) -> Vec<Vec<Vec<u8>>> {
    keys.iter().map(|k| vec![k.as_ref().to_vec()]).collect()
}

fn pair_groups<K: AsRef<[u8]>, V: AsRef<[u8]>>(pairs: &[(K, V)]) -> Vec<Vec<Vec<u8>>> {
    pairs
        .iter()
        .map(|(k, v)| vec![k.as_ref().to_vec(), v.as_ref().to_vec()])
        .collect()
}

/// Files terminal results into `results`; returns the positions to run again
/// and whether the partition map went stale.
fn collect_resolved(
    resolved: Vec<(usize, Resolution)>,
    results: &mut [Option<Outcome>],
) -> Result<(Vec<usize>, bool)> {
    let mut retry = Vec::new();
    let mut stale = false;

    for (position, resolution) in resolved {
        match resolution {
            Resolution::Done(reply) => results[position] = Some(reply.into_outcome()?),
            Resolution::Refresh => {
                stale = true;
                retry.push(position);
            }
            Resolution::Redo => retry.push(position),
        }
    }

    retry.sort_unstable();
    Ok((retry, stale))
}

fn finish_results(results: Vec<Option<Outcome>>) -> Result<Vec<Outcome>> {
    results
        .into_iter()
        .enumerate()
        .map(|(i, r)| {
            r.ok_or_else(|| ClientError::MalformedResponse(format!("no result for element {i}")))
        })
        .collect()
}

fn parse_exists(outcome: Outcome) -> Result<bool> {
    match outcome {
        Outcome::Value(v) if v == b"true" => Ok(true),
        Outcome::Value(v) if v == b"false" => Ok(false),
        Outcome::KeyNotFound => Ok(false),
        other => Err(ClientError::MalformedResponse(format!(
            "unexpected exists result {other:?}"
        ))),
    }
}

/// Sends `num_keys` to every chain before reading any answer. `None` means some
/// chain no longer belongs to the table.
async fn sum_num_keys(chains: &mut [ChainClient]) -> Result<Option<u64>> {
    let mut sent = Vec::with_capacity(chains.len());
    for chain in chains.iter_mut() {
        sent.push(chain.send(HashTableOp::NumKeys, Vec::new()).await);
    }

    let mut answers = Vec::with_capacity(chains.len());
    for (chain, sent) in chains.iter_mut().zip(sent) {
        answers.push(chain.finish_batch(HashTableOp::NumKeys, Vec::new(), sent).await);
    }

    let mut total = 0u64;
    let mut stale = false;
    for replies in answers {
        for reply in replies? {
            match reply {
                Reply::Value(raw) => total += parse_count(&raw)?,
                Reply::Sentinel(Sentinel::BlockMoved) => stale = true,
                other => {
                    return Err(ClientError::MalformedResponse(format!(
                        "unexpected num_keys result {other:?}"
                    )));
                }
            }
        }
    }

    Ok(if stale { None } else { Some(total) })
}

fn parse_count(raw: &[u8]) -> Result<u64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            ClientError::MalformedResponse(format!(
                "num_keys returned {:?}",
                String::from_utf8_lossy(raw)
            ))
        })
}
