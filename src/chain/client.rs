use super::connection::BlockConnection;
use super::context::ChainContext;
use crate::error::{ClientError, Result};
use crate::protocol::{
    ClientFrame, CommandRequest, CommandResponse, CommandSet, REDIRECTED_MARKER, Reply, Sentinel,
    SequenceId,
};
use crate::routing::{PartitionMap, ReplicaChain};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Client for one replica chain.
///
/// Mutators go to the head, accessors to the tail, and every response is read
/// from the tail. Up to `pipeline_depth` requests may be in flight; responses that
/// overtake each other are buffered until asked for. A response for a sequence
/// number that is not in flight aborts the client for good.
pub struct ChainClient {
    ctx: ChainContext,
    chain: ReplicaChain,
    head: Arc<BlockConnection>,
    tail: Arc<BlockConnection>,
    client_id: i64,
    next_seq: i64,
    responses: mpsc::UnboundedReceiver<CommandResponse>,
    outstanding: VecDeque<i64>,
    buffered: HashMap<i64, CommandResponse>,
    aborted: bool,
    // Set on transport failure; the next command reconnects first.
    broken: bool,
}

impl ChainClient {
    pub async fn connect(ctx: ChainContext, chain: ReplicaChain) -> Result<Self> {
        let timeout = ctx.config.timeout();

        let head = ctx.cache.get(chain.head()).await?;
        let tail = if chain.len() == 1 {
            head.clone()
        } else {
            ctx.cache.get(chain.tail()).await?
        };

        let client_id = head.get_client_id(timeout).await?;
        let responses = tail
            .register(chain.tail().block_id, client_id, timeout)
            .await?;

        tracing::debug!("Chain client {} connected to {}", client_id, chain);

        Ok(Self {
            ctx,
            chain,
            head,
            tail,
            client_id,
            next_seq: 0,
            responses,
            outstanding: VecDeque::new(),
            buffered: HashMap::new(),
            aborted: false,
            broken: false,
        })
    }

    /// One client per partition of `map`, in partition order.
    pub async fn connect_all(ctx: &ChainContext, map: &PartitionMap) -> Result<Vec<Self>> {
        let mut clients = Vec::with_capacity(map.len());
        for chain in map.chains() {
            clients.push(Self::connect(ctx.clone(), chain.clone()).await?);
        }
        Ok(clients)
    }

    pub fn chain(&self) -> &ReplicaChain {
        &self.chain
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// True after a transport failure until the client reconnects.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    /// Sends one command without waiting for its response and returns its
    /// sequence number.
    pub async fn send<Op: CommandSet>(&mut self, op: Op, args: Vec<Vec<u8>>) -> Result<i64> {
        self.ensure_usable()?;

        let limit = self.ctx.config.pipeline_depth;
        if self.outstanding.len() >= limit {
            return Err(ClientError::InFlightLimit {
                chain: self.chain.to_string(),
                limit,
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let (conn, endpoint) = if op.is_mutator() {
            (&self.head, self.chain.head())
        } else {
            (&self.tail, self.chain.tail())
        };

        let frame = ClientFrame::Command(CommandRequest {
            seq: SequenceId {
                client_id: self.client_id,
                client_seq_no: seq,
            },
            block_id: endpoint.block_id,
            opcode: op.code(),
            args,
        });
        if let Err(e) = conn.send(&frame).await {
            self.broken = true;
            return Err(e);
        }

        tracing::trace!("{} seq {} sent to {}", op.name(), seq, endpoint);
        self.outstanding.push_back(seq);
        Ok(seq)
    }

    /// Waits for the oldest in-flight request.
    pub async fn receive(&mut self) -> Result<CommandResponse> {
        let seq = match self.outstanding.front() {
            Some(seq) => *seq,
            None => {
                return Err(ClientError::NothingInFlight {
                    chain: self.chain.to_string(),
                });
            }
        };
        self.receive_seq(seq).await
    }

    /// Waits for the response to `seq`, buffering responses to other in-flight
    /// requests that arrive first.
    pub async fn receive_seq(&mut self, seq: i64) -> Result<CommandResponse> {
        self.ensure_usable()?;
        if !self.outstanding.contains(&seq) {
            return Err(ClientError::NothingInFlight {
                chain: self.chain.to_string(),
            });
        }

        loop {
            if let Some(response) = self.buffered.remove(&seq) {
                self.retire(seq);
                return Ok(response);
            }

            let timeout = self.ctx.config.timeout();
            let response = match tokio::time::timeout(timeout, self.responses.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    self.broken = true;
                    return Err(ClientError::transport(
                        self.tail.address(),
                        "connection closed while awaiting response",
                    ));
                }
                Err(_) => {
                    self.broken = true;
                    return Err(ClientError::transport(
                        self.tail.address(),
                        format!("no response within {timeout:?}"),
                    ));
                }
            };

            let received = response.client_seq_no;
            if received == seq {
                self.retire(seq);
                return Ok(response);
            }

            if self.outstanding.contains(&received) && !self.buffered.contains_key(&received) {
                tracing::trace!("Buffering seq {} while waiting for {}", received, seq);
                self.buffered.insert(received, response);
                continue;
            }

            self.aborted = true;
            tracing::error!(
                "Protocol desync on chain {}: expected seq {}, received {}",
                self.chain,
                seq,
                received
            );
            return Err(ClientError::ProtocolDesync {
                chain: self.chain.to_string(),
                expected: seq,
                received,
            });
        }
    }

    /// Sends a command and decodes its single reply, reconnecting through the
    /// directory on transport failure.
    pub async fn run_command<Op: CommandSet>(
        &mut self,
        op: Op,
        args: Vec<Vec<u8>>,
    ) -> Result<Reply> {
        let response = self.run_with_retry(op, args, None).await?;
        let reply = Reply::decode(response.result)?;
        Ok(reply)
    }

    /// Replays a command against this chain after an `!exporting` redirect. The
    /// marker tells the block not to redirect it again.
    pub async fn run_redirected<Op: CommandSet>(
        &mut self,
        op: Op,
        mut args: Vec<Vec<u8>>,
    ) -> Result<Reply> {
        if args.last().map(Vec::as_slice) != Some(REDIRECTED_MARKER) {
            args.push(REDIRECTED_MARKER.to_vec());
        }
        self.run_command(op, args).await
    }

    /// Sends a batch command and decodes one reply per result element.
    pub async fn run_batch<Op: CommandSet>(
        &mut self,
        op: Op,
        args: Vec<Vec<u8>>,
    ) -> Result<Vec<Reply>> {
        let response = self.run_with_retry(op, args, None).await?;
        decode_elements(response.result)
    }

    /// Completes a batch request previously started with [`ChainClient::send`].
    /// `sent` carries the sequence number, or the error if sending failed; a
    /// transport failure on either side is retried through the directory.
    pub async fn finish_batch<Op: CommandSet>(
        &mut self,
        op: Op,
        args: Vec<Vec<u8>>,
        sent: Result<i64>,
    ) -> Result<Vec<Reply>> {
        let received = match sent {
            Ok(seq) => self.receive_seq(seq).await,
            Err(e) => Err(e),
        };
        let response = match received {
            Ok(response) => response,
            Err(e) if e.is_transport() => {
                self.broken = true;
                self.run_with_retry(op, args, Some(e)).await?
            }
            Err(e) => return Err(e),
        };
        decode_elements(response.result)
    }

    async fn run_with_retry<Op: CommandSet>(
        &mut self,
        op: Op,
        args: Vec<Vec<u8>>,
        first_failure: Option<ClientError>,
    ) -> Result<CommandResponse> {
        let attempts = self.ctx.config.max_command_attempts;
        let first_attempt = if first_failure.is_some() { 2 } else { 1 };
        let mut retried = first_failure.is_some();
        let mut last_error = first_failure;

        for attempt in first_attempt..=attempts {
            if self.broken {
                tracing::warn!(
                    "Reconnecting chain {} for {} (attempt {} of {})",
                    self.chain,
                    op.name(),
                    attempt,
                    attempts
                );
                match self.recover().await {
                    Ok(()) => {}
                    Err(e) if e.is_transport() => {
                        last_error = Some(e);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            match self.execute(op, args.clone()).await {
                Ok(mut response) => {
                    if retried && op.is_mutator() {
                        mask_duplicate_keys(op, &self.chain, &mut response.result);
                    }
                    return Ok(response);
                }
                Err(e) if e.is_transport() => {
                    tracing::warn!("{} on chain {} failed: {}", op.name(), self.chain, e);
                    self.broken = true;
                    last_error = Some(e);
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClientError::RetriesExhausted {
            chain: self.chain.to_string(),
            attempts,
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn execute<Op: CommandSet>(
        &mut self,
        op: Op,
        args: Vec<Vec<u8>>,
    ) -> Result<CommandResponse> {
        let seq = self.send(op, args).await?;
        self.receive_seq(seq).await
    }

    /// Asks the directory for the chain's live membership, drops the stale
    /// connections from the cache and replaces this client with a fresh one.
    async fn recover(&mut self) -> Result<()> {
        let live = self
            .ctx
            .directory
            .resolve_failures(&self.ctx.path, &self.chain)
            .await?;

        for endpoint in self.chain.endpoints() {
            self.ctx.cache.invalidate(endpoint);
        }

        tracing::info!("Reconnecting chain {} as {}", self.chain, live);
        let fresh = ChainClient::connect(self.ctx.clone(), live).await?;
        *self = fresh;
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.aborted {
            return Err(ClientError::ChainAborted {
                chain: self.chain.to_string(),
            });
        }
        Ok(())
    }

    fn retire(&mut self, seq: i64) {
        self.outstanding.retain(|s| *s != seq);
    }
}

impl Drop for ChainClient {
    fn drop(&mut self) {
        self.tail.unregister(self.client_id);
    }
}

impl std::fmt::Debug for ChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainClient")
            .field("chain", &self.chain.to_string())
            .field("client_id", &self.client_id)
            .field("in_flight", &self.outstanding.len())
            .field("aborted", &self.aborted)
            .finish()
    }
}

fn decode_elements(result: Vec<Vec<u8>>) -> Result<Vec<Reply>> {
    result
        .into_iter()
        .map(|element| Reply::decode(vec![element]))
        .collect()
}

// A mutator retried after a reconnect may already have been applied before the
// connection dropped, in which case the block rejects the replay as a duplicate.
// That rejection is reported as success. A genuine duplicate on the first
// attempt of a retried call is indistinguishable and gets masked too.
fn mask_duplicate_keys<Op: CommandSet>(op: Op, chain: &ReplicaChain, result: &mut [Vec<u8>]) {
    let duplicate = Sentinel::DuplicateKey.encode();
    for element in result.iter_mut() {
        if *element == duplicate {
            tracing::warn!(
                "Treating !duplicate_key from retried {} on {} as an already applied write",
                op.name(),
                chain
            );
            *element = b"!ok".to_vec();
        }
    }
}
