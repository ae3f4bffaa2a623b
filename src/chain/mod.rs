//! Replica Chain Clients
//!
//! Talks to one replica chain on behalf of one data structure partition.
//!
//! ## Core Concepts
//! - **Connections**: one TCP connection per block server (`host:port`), shared by all
//!   chain clients of a client instance through the [`EndpointCache`].
//! - **Sequence protocol**: the head hands out a `client_id` at connect time; every
//!   request carries `{client_id, client_seq_no}` and every response is read back from
//!   the tail and matched against the numbers still in flight.
//! - **Routing**: mutators enter at the head and propagate down the chain; accessors are
//!   answered by the tail, which holds the committed state.
//! - **Failure**: when a connection drops or times out, the chain client asks the
//!   directory for the chain's live membership, drops the stale cache entries,
//!   reconnects and retries the command a bounded number of times.

pub mod cache;
pub mod client;
pub mod connection;
pub mod context;

pub use cache::EndpointCache;
pub use client::ChainClient;
pub use connection::BlockConnection;
pub use context::ChainContext;
