use serde::{Deserialize, Serialize};

/// Correlates one chain request with its response.
///
/// `client_id` is handed out by the head block when the chain client connects;
/// `client_seq_no` increases by one for every request the chain client sends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceId {
    pub client_id: i64,
    pub client_seq_no: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequest {
    pub seq: SequenceId,
    /// Block the command is addressed to (a server may host many blocks).
    pub block_id: i32,
    pub opcode: i32,
    pub args: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResponse {
    pub client_seq_no: i64,
    /// First element carries the primary result or a sentinel.
    pub result: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlKind {
    Subscribe,
    Unsubscribe,
}

/// Client to block messages.
///
/// - `GetClientId/RegisterClientId`: connection setup, answered on the same connection.
/// - `Command`: a data-structure operation; its response is delivered on the
///   connection that registered the client id at the chain's tail.
/// - `Subscribe/Unsubscribe`: notification interest, acknowledged with `Control`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientFrame {
    GetClientId {
        rpc_id: u64,
    },

    RegisterClientId {
        rpc_id: u64,
        block_id: i32,
        client_id: i64,
    },

    Command(CommandRequest),

    Subscribe {
        block_id: i32,
        ops: Vec<String>,
    },

    Unsubscribe {
        block_id: i32,
        ops: Vec<String>,
    },
}

/// Block to client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BlockFrame {
    ClientId {
        rpc_id: u64,
        client_id: i64,
    },

    Registered {
        rpc_id: u64,
    },

    Response {
        client_id: i64,
        response: CommandResponse,
    },

    Notification {
        op: String,
        data: Vec<u8>,
    },

    Control {
        kind: ControlKind,
        ops: Vec<String>,
        error: Option<String>,
    },
}
