//! Locked sessions.
//!
//! Acquiring sends `lock` to every chain of the table. A chain that is exporting part
//! of its slots answers with the destination chain instead of `!ok`; that destination
//! is locked as well unless one of the session's chains already is it. Keys still
//! being exported are then served by the destination through `!redirected` replays.
//!
//! The session owns the table's chain clients while it is open and hands them back on
//! [`LockedSession::release`].

use super::{
    HashTableClient, collect_resolved, finish_results, key_groups, pair_groups, parse_exists,
    sum_num_keys,
};
use crate::chain::ChainClient;
use crate::error::{ClientError, Result};
use crate::protocol::{CommandSet, HashTableOp, Outcome, Reply, Sentinel};
use crate::redirect::{RedirectScope, Resolution, dispatch_batch};
use crate::routing::ReplicaChain;

pub struct LockedSession<'a> {
    table: &'a mut HashTableClient,
    /// The table's chains in partition order, then destinations found while locking.
    clients: Vec<ChainClient>,
    /// Parallel to `clients`: whether that chain acknowledged our lock.
    held: Vec<bool>,
    originals: usize,
    /// For each original chain, the index in `clients` of its export destination.
    redirects: Vec<Option<usize>>,
    released: bool,
}

impl HashTableClient {
    /// Locks every chain of the table.
    pub async fn lock(&mut self) -> Result<LockedSession<'_>> {
        self.ensure_connected().await?;

        let clients = std::mem::take(&mut self.chains);
        let originals = clients.len();
        let mut session = LockedSession {
            table: self,
            clients,
            held: vec![false; originals],
            originals,
            redirects: Vec::with_capacity(originals),
            released: false,
        };
        if let Err(e) = session.acquire().await {
            // Only what this session acquired is given back; the table reconnects
            // on its next call.
            session.unlock_held().await;
            session.released = true;
            return Err(e);
        }
        Ok(session)
    }
}

impl LockedSession<'_> {
    async fn acquire(&mut self) -> Result<()> {
        for index in 0..self.originals {
            let reply = self.clients[index]
                .run_command(HashTableOp::Lock, Vec::new())
                .await?;

            let destination = lock_redirect(reply)?;
            self.held[index] = true;

            let redirect = match destination {
                Some(chain) => Some(self.adopt(chain).await?),
                None => None,
            };
            self.redirects.push(redirect);
        }

        tracing::debug!(
            "Locked {} chain(s) of {} ({} discovered through exports)",
            self.held.iter().filter(|h| **h).count(),
            self.table.ctx.path,
            self.clients.len() - self.originals
        );
        Ok(())
    }

    async fn adopt(&mut self, chain: ReplicaChain) -> Result<usize> {
        if let Some(index) = self.clients.iter().position(|c| c.chain() == &chain) {
            tracing::trace!("Export destination {} is already in the session", chain);
            return Ok(index);
        }

        let mut client = ChainClient::connect(self.table.ctx.clone(), chain).await?;
        let held = match client.run_command(HashTableOp::Lock, Vec::new()).await? {
            Reply::Ok(_) => true,
            other => {
                tracing::warn!(
                    "Export destination {} answered lock with {:?}",
                    client.chain(),
                    other
                );
                false
            }
        };
        self.clients.push(client);
        self.held.push(held);
        Ok(self.clients.len() - 1)
    }

    /// Every chain holding a lock for this session.
    pub fn locked_chains(&self) -> Vec<&ReplicaChain> {
        self.clients
            .iter()
            .zip(&self.held)
            .filter(|(_, held)| **held)
            .map(|(c, _)| c.chain())
            .collect()
    }

    /// Export destination recorded for a partition while locking, if any.
    pub fn redirect_of(&self, partition: usize) -> Option<&ReplicaChain> {
        self.redirects
            .get(partition)
            .copied()
            .flatten()
            .map(|index| self.clients[index].chain())
    }

    pub async fn get(&mut self, key: &[u8]) -> Result<Outcome> {
        self.run_keyed(HashTableOp::LockedGet, vec![key.to_vec()])
            .await
    }

    pub async fn put(&mut self, key: &[u8], value: &[u8]) -> Result<Outcome> {
        self.run_keyed(HashTableOp::LockedPut, vec![key.to_vec(), value.to_vec()])
            .await
    }

    pub async fn update(&mut self, key: &[u8], value: &[u8]) -> Result<Outcome> {
        self.run_keyed(HashTableOp::LockedUpdate, vec![key.to_vec(), value.to_vec()])
            .await
    }

    pub async fn upsert(&mut self, key: &[u8], value: &[u8]) -> Result<Outcome> {
        self.run_keyed(HashTableOp::LockedUpsert, vec![key.to_vec(), value.to_vec()])
            .await
    }

    pub async fn remove(&mut self, key: &[u8]) -> Result<Outcome> {
        self.run_keyed(HashTableOp::LockedRemove, vec![key.to_vec()])
            .await
    }

    pub async fn exists(&mut self, key: &[u8]) -> Result<bool> {
        parse_exists(self.run_keyed(HashTableOp::Exists, vec![key.to_vec()]).await?)
    }

    /// Sum of the key counts of every locked chain, destinations included.
    pub async fn num_keys(&mut self) -> Result<u64> {
        match sum_num_keys(&mut self.clients).await? {
            Some(total) => Ok(total),
            None => Err(self.stale(0)),
        }
    }

    pub async fn get_many<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> Result<Vec<Outcome>> {
        self.run_many(HashTableOp::LockedGet, key_groups(keys))
            .await
    }

    pub async fn put_many<K, V>(&mut self, pairs: &[(K, V)]) -> Result<Vec<Outcome>>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.run_many(HashTableOp::LockedPut, pair_groups(pairs))
            .await
    }

    pub async fn update_many<K, V>(&mut self, pairs: &[(K, V)]) -> Result<Vec<Outcome>>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.run_many(HashTableOp::LockedUpdate, pair_groups(pairs))
            .await
    }

    pub async fn upsert_many<K, V>(&mut self, pairs: &[(K, V)]) -> Result<Vec<Outcome>>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.run_many(HashTableOp::LockedUpsert, pair_groups(pairs))
            .await
    }

    pub async fn remove_many<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> Result<Vec<Outcome>> {
        self.run_many(HashTableOp::LockedRemove, key_groups(keys))
            .await
    }

    /// Unlocks every chain the session locked and returns the table's chain clients.
    /// Unlock failures are logged and otherwise ignored.
    pub async fn release(mut self) {
        self.unlock_held().await;

        let mut clients = std::mem::take(&mut self.clients);
        clients.truncate(self.originals);
        self.table.chains = clients;
        self.released = true;
    }

    // Blocks do not track lock owners, so unlocking a chain this session never
    // locked would release somebody else's lock.
    async fn unlock_held(&mut self) {
        for (client, held) in self.clients.iter_mut().zip(self.held.iter_mut()) {
            if !*held {
                continue;
            }
            if let Err(e) = client.run_command(HashTableOp::Unlock, Vec::new()).await {
                tracing::debug!("Ignoring unlock failure on {}: {}", client.chain(), e);
            }
            *held = false;
        }
    }

    async fn run_keyed(&mut self, op: HashTableOp, args: Vec<Vec<u8>>) -> Result<Outcome> {
        let max_redo = self.table.ctx.config.max_redo;
        let partition = self.table.router.route(&args[0]);

        for _ in 0..=max_redo {
            let resolution = {
                let mut scope = RedirectScope::closed(self.table.ctx.clone(), &mut self.clients);
                scope.run(op, partition, args.clone()).await?
            };

            match resolution {
                Resolution::Done(reply) => return reply.into_outcome(),
                Resolution::Refresh => return Err(self.stale(partition)),
                Resolution::Redo => {
                    tracing::debug!("Redoing {} under lock", op.name());
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
        let max_redo = self.table.ctx.config.max_redo;
        let mut results: Vec<Option<Outcome>> = vec![None; groups.len()];
        let mut pending: Vec<usize> = (0..groups.len()).collect();
        let mut rounds = 0;

        while !pending.is_empty() {
            if rounds > max_redo {
                return Err(ClientError::RedoLimitExceeded(max_redo));
            }
            rounds += 1;

            let resolved = {
                let mut scope = RedirectScope::closed(self.table.ctx.clone(), &mut self.clients);
                dispatch_batch(&mut scope, &self.table.router, op, &groups, &pending).await?
            };

            let (retry, stale) = collect_resolved(resolved, &mut results)?;
            if stale {
                let partition = self.table.router.route(&groups[retry[0]][0]);
                return Err(self.stale(partition));
            }
            pending = retry;
        }

        finish_results(results)
    }

    // Moved blocks cannot be followed without giving up the locks.
    fn stale(&self, partition: usize) -> ClientError {
        let chain = self
            .clients
            .get(partition)
            .map(|c| c.chain().to_string())
            .unwrap_or_default();
        tracing::warn!("Partition map of {} changed under a locked session", self.table.ctx.path);
        ClientError::LockedRoutingStale { chain }
    }
}

impl Drop for LockedSession<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // The table reconnects on its next call.
        let held = std::mem::take(&mut self.held);
        let clients: Vec<ChainClient> = std::mem::take(&mut self.clients)
            .into_iter()
            .zip(held)
            .filter_map(|(client, held)| held.then_some(client))
            .collect();
        tracing::warn!(
            "Locked session on {} dropped without release, unlocking {} chain(s) in the background",
            self.table.ctx.path,
            clients.len()
        );
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                for mut client in clients {
                    let _ = client.run_command(HashTableOp::Unlock, Vec::new()).await;
                }
            });
        }
    }
}

/// Destination chain named by a lock reply, if the chain is exporting.
fn lock_redirect(reply: Reply) -> Result<Option<ReplicaChain>> {
    match reply {
        Reply::Ok(_) => Ok(None),
        Reply::Sentinel(Sentinel::Exporting(chain)) => Ok(Some(chain)),
        // Bare form: `!<endpoint>!<endpoint>...`
        Reply::Value(raw) if raw.first() == Some(&b'!') => {
            let text = std::str::from_utf8(&raw[1..]).map_err(|_| {
                ClientError::MalformedResponse("lock redirect is not UTF-8".into())
            })?;
            Ok(Some(ReplicaChain::from_segments(text.split('!'))?))
        }
        other => Err(ClientError::MalformedResponse(format!(
            "unexpected lock reply {other:?}"
        ))),
    }
}
