//! File Client
//!
//! A file is a sequence of fixed-capacity partitions, each served by its own chain.
//! Reads and writes advance independent cursors; when one of them runs past the end
//! of a partition the block answers with a split sentinel naming the next chain, and
//! the client carries on there from offset 0 until the whole request is served.

use crate::chain::{ChainClient, ChainContext};
use crate::error::{ClientError, Result};
use crate::protocol::{FileOp, Outcome, Reply, Sentinel};
use crate::redirect::{RedirectScope, Resolution};
use crate::routing::{PartitionMap, ReplicaChain};

use serde::{Deserialize, Serialize};

/// Position of a read or write: partition index and byte offset inside it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub partition: usize,
    pub offset: u64,
}

pub struct FileClient {
    ctx: ChainContext,
    chains: Vec<ChainClient>,
    read: Cursor,
    write: Cursor,
}

impl FileClient {
    pub async fn connect(ctx: ChainContext, map: PartitionMap) -> Result<Self> {
        let chains = ChainClient::connect_all(&ctx, &map).await?;
        Ok(Self {
            ctx,
            chains,
            read: Cursor::default(),
            write: Cursor::default(),
        })
    }

    pub fn path(&self) -> &str {
        &self.ctx.path
    }

    pub fn read_cursor(&self) -> Cursor {
        self.read
    }

    pub fn write_cursor(&self) -> Cursor {
        self.write
    }

    pub fn num_partitions(&self) -> usize {
        self.chains.len()
    }

    pub async fn refresh(&mut self) -> Result<()> {
        let map = self.ctx.directory.dstatus(&self.ctx.path).await?;
        self.chains = ChainClient::connect_all(&self.ctx, &map).await?;
        tracing::info!(
            "Refreshed {}: {} partition(s)",
            self.ctx.path,
            self.chains.len()
        );
        Ok(())
    }

    /// Appends `data` at the write cursor, spilling into following partitions as
    /// needed.
    pub async fn write(&mut self, data: &[u8]) -> Result<Outcome> {
        let mut rest = data;

        loop {
            let args = vec![self.write.offset.to_string().into_bytes(), rest.to_vec()];
            let reply = self.run_at(FileOp::Write, self.write.partition, args).await?;

            match reply {
                Reply::Sentinel(Sentinel::SplitWrite { chain, remaining }) => {
                    if remaining > rest.len() {
                        return Err(ClientError::MalformedResponse(format!(
                            "split_write left {remaining} of {} bytes",
                            rest.len()
                        )));
                    }
                    rest = &rest[rest.len() - remaining..];
                    let next = self.write.partition + 1;
                    self.adopt(next, chain).await?;
                    self.write = Cursor {
                        partition: next,
                        offset: 0,
                    };
                    tracing::trace!("Write continues on partition {} ({} bytes)", next, remaining);

                    if rest.is_empty() {
                        return Ok(Outcome::Ok);
                    }
                }
                other => {
                    let outcome = other.into_outcome()?;
                    if outcome.is_ok() {
                        self.write.offset += rest.len() as u64;
                    }
                    return Ok(outcome);
                }
            }
        }
    }

    /// Reads up to `size` bytes at the read cursor. `MsgNotFound` when nothing has
    /// been written there yet.
    pub async fn read(&mut self, size: usize) -> Result<Outcome> {
        let mut out = Vec::with_capacity(size);

        while out.len() < size {
            let want = size - out.len();
            let args = vec![
                self.read.offset.to_string().into_bytes(),
                want.to_string().into_bytes(),
            ];
            let reply = self.run_at(FileOp::Read, self.read.partition, args).await?;

            match reply {
                Reply::Sentinel(Sentinel::SplitRead { chain, data }) => {
                    out.extend_from_slice(&data[..data.len().min(want)]);
                    let next = self.read.partition + 1;
                    self.adopt(next, chain).await?;
                    self.read = Cursor {
                        partition: next,
                        offset: 0,
                    };
                }
                Reply::Value(data) => {
                    let taken = data.len().min(want);
                    out.extend_from_slice(&data[..taken]);
                    self.read.offset += taken as u64;
                    break;
                }
                Reply::Sentinel(Sentinel::MsgNotFound) => break,
                other => {
                    // Rejections only count when nothing was read yet.
                    let outcome = other.into_outcome()?;
                    if out.is_empty() {
                        return Ok(outcome);
                    }
                    break;
                }
            }
        }

        if out.is_empty() && size > 0 {
            return Ok(Outcome::MsgNotFound);
        }
        Ok(Outcome::Value(out))
    }

    /// Moves both cursors to absolute byte position `pos`. Returns `false`, leaving
    /// the cursors alone, when `pos` lies past the written extent of the file.
    pub async fn seek(&mut self, pos: u64) -> Result<bool> {
        let last = self.chains.len().saturating_sub(1);
        let reply = self.run_at(FileOp::Seek, last, Vec::new()).await?;

        let (size, capacity) = match reply {
            Reply::Ok(fields) if fields.len() >= 2 => (parse_u64(&fields[0])?, parse_u64(&fields[1])?),
            other => {
                return Err(ClientError::MalformedResponse(format!(
                    "unexpected seek reply {other:?}"
                )));
            }
        };
        if capacity == 0 {
            return Err(ClientError::MalformedResponse(
                "partition capacity is zero".into(),
            ));
        }

        let extent = last as u64 * capacity + size;
        if pos > extent {
            return Ok(false);
        }

        let mut cursor = Cursor {
            partition: (pos / capacity) as usize,
            offset: pos % capacity,
        };
        // The end of a full last partition; the next write splits from here.
        if cursor.partition > last {
            cursor = Cursor {
                partition: last,
                offset: capacity,
            };
        }

        self.read = cursor;
        self.write = cursor;
        Ok(true)
    }

    async fn run_at(&mut self, op: FileOp, partition: usize, args: Vec<Vec<u8>>) -> Result<Reply> {
        let max_redo = self.ctx.config.max_redo;

        for _ in 0..=max_redo {
            let resolution = {
                let mut scope = RedirectScope::open(self.ctx.clone(), &mut self.chains);
                scope.run(op, partition, args.clone()).await?
            };

            match resolution {
                Resolution::Done(reply) => return Ok(reply),
                Resolution::Refresh => self.refresh().await?,
                Resolution::Redo => {}
            }
        }
        Err(ClientError::RedoLimitExceeded(max_redo))
    }

    // Makes `chain` the client for partition `index`, appending when the file grew.
    async fn adopt(&mut self, index: usize, chain: ReplicaChain) -> Result<()> {
        if let Some(existing) = self.chains.get(index)
            && existing.chain() == &chain
        {
            return Ok(());
        }

        if index > self.chains.len() {
            return Err(ClientError::MalformedResponse(format!(
                "split to partition {index} but only {} known",
                self.chains.len()
            )));
        }

        let client = ChainClient::connect(self.ctx.clone(), chain).await?;
        if index == self.chains.len() {
            tracing::debug!("File {} grew to partition {} on {}", self.ctx.path, index, client.chain());
            self.chains.push(client);
        } else {
            self.chains[index] = client;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileClient")
            .field("path", &self.ctx.path)
            .field("partitions", &self.chains.len())
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

fn parse_u64(raw: &[u8]) -> Result<u64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ClientError::MalformedResponse(format!(
                "expected a number, got {:?}",
                String::from_utf8_lossy(raw)
            ))
        })
}
