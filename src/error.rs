//! Client Error Model
//!
//! Only two kinds of failure ever reach application code: a protocol desync on a
//! chain (client and block disagree about sequence numbers) and a transport failure
//! that survived the bounded reconnect loop. Everything else (stale routing,
//! mid-scale redirects, `!redo`) is resolved inside the façades, and application
//! rejections such as `!key_not_found` are ordinary [`crate::Outcome`] values.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    /// A response arrived with a sequence number that was never outstanding.
    /// The chain client is aborted and must not be retried.
    #[error("protocol desync on chain {chain}: expected seq {expected}, received {received}")]
    ProtocolDesync {
        chain: String,
        expected: i64,
        received: i64,
    },

    #[error("chain client for {chain} was aborted after a protocol desync")]
    ChainAborted { chain: String },

    #[error("chain {chain} already has {limit} request(s) in flight")]
    InFlightLimit { chain: String, limit: usize },

    #[error("no request in flight on chain {chain}")]
    NothingInFlight { chain: String },

    #[error("transport failure talking to {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("gave up on chain {chain} after {attempts} attempts: {last}")]
    RetriesExhausted {
        chain: String,
        attempts: usize,
        last: String,
    },

    #[error("directory service error: {0}")]
    Directory(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("routing changed under a locked session on chain {chain}")]
    LockedRoutingStale { chain: String },

    #[error("operation was redone {0} times without reaching a terminal result")]
    RedoLimitExceeded(usize),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn transport(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        ClientError::Transport {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures the chain client recovers from by asking the directory
    /// for live membership and reconnecting.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport { .. } | ClientError::Io(_))
    }

    /// Fatal for the chain client that produced it.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            ClientError::ProtocolDesync { .. } | ClientError::ChainAborted { .. }
        )
    }
}

impl From<bincode::Error> for ClientError {
    fn from(err: bincode::Error) -> Self {
        ClientError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Config(err.to_string())
    }
}
