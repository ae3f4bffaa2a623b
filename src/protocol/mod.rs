//! Block Wire Protocol
//!
//! Defines what travels between a chain client and a block server, and how the
//! client interprets what comes back.
//!
//! ## Contents
//! - **Frames**: length-prefixed `bincode` messages (`ClientFrame` / `BlockFrame`).
//! - **Sequence ids**: `{client_id, client_seq_no}` correlating a command with its response.
//! - **Opcodes**: command sets classify every opcode as accessor (sent to the tail)
//!   or mutator (sent to the head).
//! - **Sentinels**: response payloads double as control signals (`!exporting`,
//!   `!block_moved`, ...). They are decoded exactly once, here, into a [`Reply`].

pub mod codec;
pub mod ops;
pub mod sentinel;
pub mod types;

pub use ops::{CommandKind, CommandSet, FileOp, HashTableOp};
pub use sentinel::{Outcome, REDIRECTED_MARKER, Reply, Sentinel};
pub use types::{BlockFrame, ClientFrame, CommandRequest, CommandResponse, ControlKind, SequenceId};
