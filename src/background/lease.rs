//! Lease renewal.
//!
//! The directory reclaims paths whose leases lapse. The worker renews every path in
//! its set once per lease period, adopting whatever period the service reports.

use crate::error::Result;

use async_trait::async_trait;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseAck {
    /// Number of paths whose lease was actually extended.
    pub renewed: usize,
    /// Lease period the service expects renewals at; 0 keeps the current one.
    pub lease_period_ms: u64,
}

#[async_trait]
pub trait LeaseService: Send + Sync {
    async fn renew_leases(&self, paths: &[String]) -> Result<LeaseAck>;
}

pub struct LeaseRenewalWorker {
    paths: Arc<DashSet<String>>,
    period_ms: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl LeaseRenewalWorker {
    /// Spawns the renewal loop. Must be called from within a tokio runtime.
    pub fn start(service: Arc<dyn LeaseService>, period: Duration) -> Self {
        let paths = Arc::new(DashSet::new());
        let period_ms = Arc::new(AtomicU64::new(period.as_millis().max(1) as u64));

        let handle = tokio::spawn(renewal_loop(service, paths.clone(), period_ms.clone()));

        Self {
            paths,
            period_ms,
            handle,
        }
    }

    pub fn add_path(&self, path: &str) {
        self.paths.insert(path.to_string());
    }

    pub fn remove_path(&self, path: &str) -> bool {
        self.paths.remove(path).is_some()
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.iter().map(|p| p.key().clone()).collect()
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.load(Ordering::Relaxed))
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for LeaseRenewalWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn renewal_loop(
    service: Arc<dyn LeaseService>,
    paths: Arc<DashSet<String>>,
    period_ms: Arc<AtomicU64>,
) {
    tracing::debug!("Lease renewal worker started");

    loop {
        let started = Instant::now();
        let batch: Vec<String> = paths.iter().map(|p| p.key().clone()).collect();

        if !batch.is_empty() {
            match service.renew_leases(&batch).await {
                Ok(ack) => {
                    if ack.renewed < batch.len() {
                        tracing::warn!(
                            "Only {} of {} leases renewed",
                            ack.renewed,
                            batch.len()
                        );
                    } else {
                        tracing::trace!("Renewed {} lease(s)", ack.renewed);
                    }
                    if ack.lease_period_ms > 0 {
                        period_ms.store(ack.lease_period_ms, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    tracing::warn!("Lease renewal failed: {}", e);
                }
            }
        }

        let period = Duration::from_millis(period_ms.load(Ordering::Relaxed));
        tokio::time::sleep(period.saturating_sub(started.elapsed())).await;
    }
}
