//! One TCP connection to a block server.
//!
//! A connection may be shared by several chain clients (blocks of different chains
//! often live on the same server). A single reader task demultiplexes incoming
//! frames: control replies go to the waiting RPC, command responses go to the chain
//! client that registered the frame's `client_id`, and notifications go to an
//! optional listener. When the stream ends every waiter is dropped, which the
//! waiting side observes as a transport failure.

use crate::error::{ClientError, Result};
use crate::protocol::codec::{read_frame, write_frame};
use crate::protocol::{BlockFrame, ClientFrame, CommandResponse};

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Default)]
struct Shared {
    alive: AtomicBool,
    pending_rpcs: DashMap<u64, oneshot::Sender<BlockFrame>>,
    subscribers: DashMap<i64, mpsc::UnboundedSender<CommandResponse>>,
    listener: std::sync::Mutex<Option<mpsc::UnboundedSender<BlockFrame>>>,
}

impl Shared {
    fn fail_all(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.pending_rpcs.clear();
        self.subscribers.clear();
        if let Ok(mut listener) = self.listener.lock() {
            listener.take();
        }
    }
}

pub struct BlockConnection {
    address: String,
    writer: Mutex<OwnedWriteHalf>,
    shared: Arc<Shared>,
    next_rpc: AtomicU64,
    reader: JoinHandle<()>,
}

impl BlockConnection {
    /// Opens a connection, trying up to `attempts` times with no backoff.
    pub async fn connect(address: &str, attempts: usize, timeout: Duration) -> Result<Arc<Self>> {
        let mut last_error = String::from("no connection attempts made");

        for attempt in 1..=attempts.max(1) {
            match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!("Connected to block server {} (attempt {})", address, attempt);
                    return Ok(Self::from_stream(address, stream));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("connect timed out after {timeout:?}"),
            }
            tracing::debug!(
                "Connection attempt {} to {} failed: {}",
                attempt,
                address,
                last_error
            );
        }

        Err(ClientError::transport(
            address,
            format!("connection failed: {last_error}"),
        ))
    }

    fn from_stream(address: &str, stream: TcpStream) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared::default());
        shared.alive.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(read_loop(address.to_string(), read_half, shared.clone()));

        Arc::new(Self {
            address: address.to_string(),
            writer: Mutex::new(write_half),
            shared,
            next_rpc: AtomicU64::new(1),
            reader,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub async fn send(&self, frame: &ClientFrame) -> Result<()> {
        if !self.is_alive() {
            return Err(ClientError::transport(&self.address, "connection closed"));
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, frame).await {
            self.shared.fail_all();
            return Err(ClientError::transport(&self.address, e));
        }
        Ok(())
    }

    /// Asks the block server for a fresh client id.
    pub async fn get_client_id(&self, timeout: Duration) -> Result<i64> {
        match self
            .rpc(|rpc_id| ClientFrame::GetClientId { rpc_id }, timeout)
            .await?
        {
            BlockFrame::ClientId { client_id, .. } => Ok(client_id),
            other => Err(ClientError::MalformedResponse(format!(
                "expected client id, got {other:?}"
            ))),
        }
    }

    /// Routes every response tagged with `client_id` on this connection to the
    /// returned receiver.
    pub async fn register(
        &self,
        block_id: i32,
        client_id: i64,
        timeout: Duration,
    ) -> Result<mpsc::UnboundedReceiver<CommandResponse>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.insert(client_id, tx);

        let registered = self
            .rpc(
                |rpc_id| ClientFrame::RegisterClientId {
                    rpc_id,
                    block_id,
                    client_id,
                },
                timeout,
            )
            .await;

        match registered {
            Ok(BlockFrame::Registered { .. }) => Ok(rx),
            Ok(other) => {
                self.unregister(client_id);
                Err(ClientError::MalformedResponse(format!(
                    "expected registration ack, got {other:?}"
                )))
            }
            Err(e) => {
                self.unregister(client_id);
                Err(e)
            }
        }
    }

    pub fn unregister(&self, client_id: i64) {
        self.shared.subscribers.remove(&client_id);
    }

    /// Notification and control frames are forwarded here.
    pub fn set_listener(&self, listener: mpsc::UnboundedSender<BlockFrame>) {
        if let Ok(mut slot) = self.shared.listener.lock() {
            *slot = Some(listener);
        }
    }

    pub fn shutdown(&self) {
        self.reader.abort();
        self.shared.fail_all();
    }

    async fn rpc<F>(&self, build: F, timeout: Duration) -> Result<BlockFrame>
    where
        F: FnOnce(u64) -> ClientFrame,
    {
        let rpc_id = self.next_rpc.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending_rpcs.insert(rpc_id, tx);

        if let Err(e) = self.send(&build(rpc_id)).await {
            self.shared.pending_rpcs.remove(&rpc_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ClientError::transport(&self.address, "connection closed")),
            Err(_) => {
                self.shared.pending_rpcs.remove(&rpc_id);
                Err(ClientError::transport(
                    &self.address,
                    format!("no reply within {timeout:?}"),
                ))
            }
        }
    }
}

impl Drop for BlockConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(address: String, mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    loop {
        match read_frame::<_, BlockFrame>(&mut reader).await {
            Ok(Some(frame)) => dispatch(&address, &shared, frame),
            Ok(None) => {
                tracing::debug!("Block server {} closed the connection", address);
                break;
            }
            Err(e) => {
                tracing::warn!("Read from block server {} failed: {}", address, e);
                break;
            }
        }
    }
    shared.fail_all();
}

fn dispatch(address: &str, shared: &Shared, frame: BlockFrame) {
    match frame {
        BlockFrame::ClientId { rpc_id, .. } | BlockFrame::Registered { rpc_id } => {
            if let Some((_, waiter)) = shared.pending_rpcs.remove(&rpc_id) {
                let _ = waiter.send(frame);
            }
        }

        BlockFrame::Response {
            client_id,
            response,
        } => match shared.subscribers.get(&client_id) {
            Some(subscriber) => {
                let _ = subscriber.send(response);
            }
            None => {
                tracing::trace!(
                    "Dropping response for unregistered client {} from {}",
                    client_id,
                    address
                );
            }
        },

        BlockFrame::Notification { .. } | BlockFrame::Control { .. } => {
            if let Ok(listener) = shared.listener.lock()
                && let Some(listener) = listener.as_ref()
            {
                let _ = listener.send(frame);
            }
        }
    }
}
