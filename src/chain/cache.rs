use super::connection::BlockConnection;
use crate::error::Result;
use crate::routing::BlockEndpoint;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Open connections keyed by `host:port`, shared by every chain client of one
/// [`crate::ElasticClient`]. Blocks hosted on the same server share a connection.
pub struct EndpointCache {
    connections: DashMap<String, Arc<BlockConnection>>,
    connect_attempts: usize,
    timeout: Duration,
}

impl EndpointCache {
    pub fn new(connect_attempts: usize, timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            connect_attempts,
            timeout,
        }
    }

    /// Returns the cached connection for the endpoint's server, opening a new one
    /// when there is none or the cached one has died.
    pub async fn get(&self, endpoint: &BlockEndpoint) -> Result<Arc<BlockConnection>> {
        let address = endpoint.address();

        if let Some(conn) = self.connections.get(&address)
            && conn.is_alive()
        {
            return Ok(conn.clone());
        }

        let conn = BlockConnection::connect(&address, self.connect_attempts, self.timeout).await?;
        self.connections.insert(address, conn.clone());
        Ok(conn)
    }

    /// Forgets the endpoint's connection. Chain clients still holding it keep
    /// using it until they reconnect.
    pub fn invalidate(&self, endpoint: &BlockEndpoint) {
        if self.connections.remove(&endpoint.address()).is_some() {
            tracing::debug!("Invalidated cached connection to {}", endpoint.address());
        }
    }

    pub fn contains(&self, endpoint: &BlockEndpoint) -> bool {
        self.connections.contains_key(&endpoint.address())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Closes every connection.
    pub fn clear(&self) {
        for entry in self.connections.iter() {
            entry.value().shutdown();
        }
        self.connections.clear();
    }
}
