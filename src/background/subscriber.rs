//! Notification listener.
//!
//! Subscriptions live on the tail of each partition, since the tail is the last
//! block to apply a mutation. The subscriber opens its own connections rather than
//! borrowing cached ones, so its listener never competes with a chain client's.

use super::mailbox::Mailbox;
use crate::chain::BlockConnection;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::protocol::{BlockFrame, ClientFrame, ControlKind};
use crate::routing::PartitionMap;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A mutation applied at some partition: the operation name and its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub op: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct ControlAck {
    kind: ControlKind,
    ops: Vec<String>,
    error: Option<String>,
}

pub struct Subscriber {
    targets: Vec<(Arc<BlockConnection>, i32)>,
    notifications: Arc<Mailbox<Notification>>,
    controls: Arc<Mailbox<ControlAck>>,
    forwarder: JoinHandle<()>,
    timeout: Duration,
}

impl Subscriber {
    pub async fn connect(map: &PartitionMap, config: &ClientConfig) -> Result<Self> {
        let (listener, frames) = mpsc::unbounded_channel();
        let mut connections: HashMap<String, Arc<BlockConnection>> = HashMap::new();
        let mut targets = Vec::with_capacity(map.len());

        for chain in map.chains() {
            let tail = chain.tail();
            let address = tail.address();
            let conn = match connections.get(&address) {
                Some(conn) => conn.clone(),
                None => {
                    let conn =
                        BlockConnection::connect(&address, config.connect_attempts, config.timeout())
                            .await?;
                    conn.set_listener(listener.clone());
                    connections.insert(address, conn.clone());
                    conn
                }
            };
            targets.push((conn, tail.block_id));
        }

        let notifications = Arc::new(Mailbox::new(config.mailbox_capacity));
        let controls = Arc::new(Mailbox::new(config.mailbox_capacity));
        let forwarder = tokio::spawn(forward(frames, notifications.clone(), controls.clone()));

        tracing::debug!("Subscriber listening on {} partition tail(s)", targets.len());

        Ok(Self {
            targets,
            notifications,
            controls,
            forwarder,
            timeout: config.timeout(),
        })
    }

    pub async fn subscribe(&self, ops: &[&str]) -> Result<()> {
        self.control(ControlKind::Subscribe, ops).await
    }

    pub async fn unsubscribe(&self, ops: &[&str]) -> Result<()> {
        self.control(ControlKind::Unsubscribe, ops).await
    }

    /// Waits for the next notification.
    pub async fn get(&self) -> Option<Notification> {
        self.notifications.take().await
    }

    pub async fn poll(&self, timeout: Duration) -> Option<Notification> {
        self.notifications.poll(timeout).await
    }

    pub fn mailbox(&self) -> &Mailbox<Notification> {
        &self.notifications
    }

    // Every targeted block must acknowledge within the timeout. Acks left over
    // from an earlier request that timed out are skipped.
    async fn control(&self, kind: ControlKind, ops: &[&str]) -> Result<()> {
        let ops: Vec<String> = ops.iter().map(|op| op.to_string()).collect();

        while let Some(stale) = self.controls.try_take() {
            tracing::debug!("Discarding late {:?} acknowledgement", stale.kind);
        }

        for (conn, block_id) in &self.targets {
            let frame = match kind {
                ControlKind::Subscribe => ClientFrame::Subscribe {
                    block_id: *block_id,
                    ops: ops.clone(),
                },
                ControlKind::Unsubscribe => ClientFrame::Unsubscribe {
                    block_id: *block_id,
                    ops: ops.clone(),
                },
            };
            conn.send(&frame)
                .await
                .map_err(|e| ClientError::Subscription(e.to_string()))?;
        }

        let deadline = Instant::now() + self.timeout;
        let mut acked = 0;
        while acked < self.targets.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.controls.poll(remaining).await {
                Some(ack) if ack.kind != kind || ack.ops != ops => {
                    tracing::debug!("Discarding late {:?} acknowledgement", ack.kind);
                }
                Some(ControlAck { error: Some(e), .. }) => {
                    return Err(ClientError::Subscription(e));
                }
                Some(ack) => {
                    tracing::trace!("{:?} acknowledged", ack.kind);
                    acked += 1;
                }
                None => {
                    return Err(ClientError::Subscription(format!(
                        "no {kind:?} acknowledgement within {:?}",
                        self.timeout
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.forwarder.abort();
        for (conn, _) in &self.targets {
            conn.shutdown();
        }
    }
}

async fn forward(
    mut frames: mpsc::UnboundedReceiver<BlockFrame>,
    notifications: Arc<Mailbox<Notification>>,
    controls: Arc<Mailbox<ControlAck>>,
) {
    while let Some(frame) = frames.recv().await {
        match frame {
            BlockFrame::Notification { op, data } => {
                if !notifications.offer(Notification { op, data }) {
                    tracing::debug!(
                        "Notification mailbox full ({} overflowed)",
                        notifications.overflow_count()
                    );
                }
            }
            BlockFrame::Control { kind, ops, error } => {
                controls.offer(ControlAck { kind, ops, error });
            }
            other => {
                tracing::trace!("Subscriber ignoring {:?}", other);
            }
        }
    }
}
