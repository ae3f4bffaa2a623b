//! Client Configuration
//!
//! Tunables shared by every chain client opened through one [`crate::ElasticClient`].
//! Missing fields fall back to their defaults so a config file only needs to name
//! what it overrides.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a chain client waits for one response before treating the
    /// connection as failed.
    pub timeout_ms: u64,
    /// Connection attempts per endpoint, with no backoff between them.
    pub connect_attempts: usize,
    /// Attempts per command, counting the first one, before a transport
    /// failure is surfaced.
    pub max_command_attempts: usize,
    /// Maximum requests in flight per chain client. 1 disables pipelining.
    pub pipeline_depth: usize,
    /// Refresh/redo rounds allowed inside one logical call.
    pub max_redo: usize,
    /// Bounded size of notification and control mailboxes.
    pub mailbox_capacity: usize,
    /// Renewal period used until the lease service reports its own.
    pub lease_period_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            connect_attempts: 3,
            max_command_attempts: 3,
            pipeline_depth: 1,
            max_redo: 64,
            mailbox_capacity: 1024,
            lease_period_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ClientConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline_depth == 0 {
            return Err(ClientError::Config("pipeline_depth must be >= 1".into()));
        }
        if self.connect_attempts == 0 || self.max_command_attempts == 0 {
            return Err(ClientError::Config("attempt bounds must be >= 1".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(ClientError::Config("mailbox_capacity must be >= 1".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ClientError::Config("timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn lease_period(&self) -> Duration {
        Duration::from_millis(self.lease_period_ms)
    }
}
