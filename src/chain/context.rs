use super::cache::EndpointCache;
use crate::config::ClientConfig;
use crate::directory::DirectoryService;

use std::sync::Arc;

/// Everything a chain client needs besides its own chain: where to reconnect
/// from, whom to ask when a member dies, and the tunables.
#[derive(Clone)]
pub struct ChainContext {
    pub directory: Arc<dyn DirectoryService>,
    /// Path of the data structure the chain belongs to.
    pub path: String,
    pub cache: Arc<EndpointCache>,
    pub config: Arc<ClientConfig>,
}

impl ChainContext {
    pub fn new(
        directory: Arc<dyn DirectoryService>,
        path: impl Into<String>,
        cache: Arc<EndpointCache>,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            directory,
            path: path.into(),
            cache,
            config,
        }
    }
}
