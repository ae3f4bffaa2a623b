use super::{Resolution, resolve};
use crate::chain::{ChainClient, ChainContext};
use crate::error::{ClientError, Result};
use crate::protocol::CommandSet;
use crate::routing::ReplicaChain;

use std::collections::HashMap;
use std::collections::hash_map::Entry;

/// The chain clients a redirect may be resolved against.
///
/// `known` holds the caller's own clients, indexed by partition. An open scope also
/// connects to chains it has not seen before and keeps them for the lifetime of the
/// scope. A closed scope (a locked session) only ever talks to chains it already
/// holds, because any other chain would not be locked.
pub struct RedirectScope<'a> {
    ctx: ChainContext,
    known: &'a mut Vec<ChainClient>,
    transient: HashMap<ReplicaChain, ChainClient>,
    open: bool,
}

impl<'a> RedirectScope<'a> {
    pub fn open(ctx: ChainContext, known: &'a mut Vec<ChainClient>) -> Self {
        Self {
            ctx,
            known,
            transient: HashMap::new(),
            open: true,
        }
    }

    pub fn closed(ctx: ChainContext, known: &'a mut Vec<ChainClient>) -> Self {
        Self {
            ctx,
            known,
            transient: HashMap::new(),
            open: false,
        }
    }

    pub fn max_redo(&self) -> usize {
        self.ctx.config.max_redo
    }

    pub fn known(&mut self, index: usize) -> Result<&mut ChainClient> {
        let available = self.known.len();
        self.known.get_mut(index).ok_or_else(|| {
            ClientError::InvalidArguments(format!(
                "partition {index} out of range ({available} known)"
            ))
        })
    }

    /// Client for `chain`, reusing one the scope already holds.
    pub async fn client_for(&mut self, chain: &ReplicaChain) -> Result<&mut ChainClient> {
        if let Some(index) = self.known.iter().position(|c| c.chain() == chain) {
            return Ok(&mut self.known[index]);
        }

        if !self.open {
            return Err(ClientError::LockedRoutingStale {
                chain: chain.to_string(),
            });
        }

        match self.transient.entry(chain.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let client = ChainClient::connect(self.ctx.clone(), chain.clone()).await?;
                Ok(entry.insert(client))
            }
        }
    }

    /// Runs `op` on partition `index` and resolves whatever comes back.
    pub async fn run<Op: CommandSet>(
        &mut self,
        op: Op,
        index: usize,
        args: Vec<Vec<u8>>,
    ) -> Result<Resolution> {
        let reply = self.known(index)?.run_command(op, args.clone()).await?;
        resolve(self, op, &args, reply).await
    }
}
