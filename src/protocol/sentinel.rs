//! Sentinel decoding.
//!
//! Blocks answer every command with a list of byte strings. When the first element
//! starts with `!` it may be a control signal rather than data; [`Reply::decode`]
//! is the only place that looks at raw response bytes, so the layers above match
//! on enums instead of comparing strings.

use crate::error::{ClientError, Result};
use crate::routing::{BlockEndpoint, ReplicaChain};

/// Trailing argument marking a command already resolved through a redirect.
/// Blocks must not redirect it again.
pub const REDIRECTED_MARKER: &[u8] = b"!redirected";

const OK: &[u8] = b"!ok";
const KEY_NOT_FOUND: &[u8] = b"!key_not_found";
const DUPLICATE_KEY: &[u8] = b"!duplicate_key";
const ARGS_ERROR: &[u8] = b"!args_error";
const BLOCK_MOVED: &[u8] = b"!block_moved";
const MSG_NOT_FOUND: &[u8] = b"!msg_not_found";
const REDO: &[u8] = b"!redo";
const EXPORTING: &[u8] = b"!exporting";
const SPLIT_WRITE: &[u8] = b"!split_write";
const SPLIT_READ: &[u8] = b"!split_read";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sentinel {
    KeyNotFound,
    DuplicateKey,
    ArgsError,
    /// Routing is stale; refresh the partition map and redo the whole operation.
    BlockMoved,
    /// The key now lives on another chain mid-split; replay there with `!redirected`.
    Exporting(ReplicaChain),
    /// A file write crossed the partition boundary; `remaining` bytes go to `chain`.
    SplitWrite { chain: ReplicaChain, remaining: usize },
    /// A file read crossed the partition boundary; `data` is the part already read.
    SplitRead { chain: ReplicaChain, data: Vec<u8> },
    MsgNotFound,
    /// Resend without interpreting anything as data.
    Redo,
}

impl Sentinel {
    /// Wire rendering, exactly as blocks send it.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Sentinel::KeyNotFound => KEY_NOT_FOUND.to_vec(),
            Sentinel::DuplicateKey => DUPLICATE_KEY.to_vec(),
            Sentinel::ArgsError => ARGS_ERROR.to_vec(),
            Sentinel::BlockMoved => BLOCK_MOVED.to_vec(),
            Sentinel::MsgNotFound => MSG_NOT_FOUND.to_vec(),
            Sentinel::Redo => REDO.to_vec(),
            Sentinel::Exporting(chain) => format!("!exporting!{chain}").into_bytes(),
            Sentinel::SplitWrite { chain, remaining } => {
                format!("!split_write!{chain}!{remaining}").into_bytes()
            }
            Sentinel::SplitRead { chain, data } => {
                let mut buf = format!("!split_read!{chain}!").into_bytes();
                buf.extend_from_slice(data);
                buf
            }
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Sentinel::KeyNotFound
                | Sentinel::DuplicateKey
                | Sentinel::ArgsError
                | Sentinel::MsgNotFound
        )
    }
}

/// A decoded block response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `!ok`, with whatever elements followed it.
    Ok(Vec<Vec<u8>>),
    /// Plain data in the first element.
    Value(Vec<u8>),
    Sentinel(Sentinel),
}

impl Reply {
    pub fn decode(mut result: Vec<Vec<u8>>) -> Result<Reply> {
        if result.is_empty() {
            return Err(ClientError::MalformedResponse("empty result list".into()));
        }
        let first = result.remove(0);

        if first.first() != Some(&b'!') {
            return Ok(Reply::Value(first));
        }

        let sentinel = match first.as_slice() {
            OK => return Ok(Reply::Ok(result)),
            KEY_NOT_FOUND => Sentinel::KeyNotFound,
            DUPLICATE_KEY => Sentinel::DuplicateKey,
            ARGS_ERROR => Sentinel::ArgsError,
            BLOCK_MOVED => Sentinel::BlockMoved,
            MSG_NOT_FOUND => Sentinel::MsgNotFound,
            REDO => Sentinel::Redo,
            // Older blocks send the chain as a separate element.
            EXPORTING => match result.first() {
                Some(chain) => Sentinel::Exporting(parse_chain(chain)?),
                None => {
                    return Err(ClientError::MalformedResponse(
                        "!exporting without a destination chain".into(),
                    ));
                }
            },
            raw if raw.starts_with(b"!exporting!") => {
                Sentinel::Exporting(parse_chain(&raw[EXPORTING.len() + 1..])?)
            }
            raw if raw.starts_with(b"!split_write!") => parse_split_write(&raw[SPLIT_WRITE.len() + 1..])?,
            raw if raw.starts_with(b"!split_read!") => parse_split_read(&raw[SPLIT_READ.len() + 1..])?,
            _ => return Ok(Reply::Value(first)),
        };

        Ok(Reply::Sentinel(sentinel))
    }

    pub fn sentinel(&self) -> Option<&Sentinel> {
        match self {
            Reply::Sentinel(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_exporting(&self) -> bool {
        matches!(self, Reply::Sentinel(Sentinel::Exporting(_)))
    }

    /// Converts a fully resolved reply into the value handed to applications.
    pub fn into_outcome(self) -> Result<Outcome> {
        match self {
            Reply::Ok(_) => Ok(Outcome::Ok),
            Reply::Value(v) => Ok(Outcome::Value(v)),
            Reply::Sentinel(Sentinel::KeyNotFound) => Ok(Outcome::KeyNotFound),
            Reply::Sentinel(Sentinel::DuplicateKey) => Ok(Outcome::DuplicateKey),
            Reply::Sentinel(Sentinel::ArgsError) => Ok(Outcome::ArgsError),
            Reply::Sentinel(Sentinel::MsgNotFound) => Ok(Outcome::MsgNotFound),
            Reply::Sentinel(other) => {
                debug_assert!(!other.is_terminal());
                Err(ClientError::MalformedResponse(format!(
                    "unresolved control sentinel {other:?}"
                )))
            }
        }
    }
}

/// Terminal result of an operation. Application-level rejections are values,
/// never errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Value(Vec<u8>),
    KeyNotFound,
    DuplicateKey,
    ArgsError,
    MsgNotFound,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok | Outcome::Value(_))
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The bytes a block would have sent for this outcome.
    pub fn wire(&self) -> &[u8] {
        match self {
            Outcome::Ok => OK,
            Outcome::Value(v) => v,
            Outcome::KeyNotFound => KEY_NOT_FOUND,
            Outcome::DuplicateKey => DUPLICATE_KEY,
            Outcome::ArgsError => ARGS_ERROR,
            Outcome::MsgNotFound => MSG_NOT_FOUND,
        }
    }
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes)
        .map_err(|_| ClientError::MalformedResponse("sentinel payload is not UTF-8".into()))
}

fn parse_chain(bytes: &[u8]) -> Result<ReplicaChain> {
    ReplicaChain::from_segments(utf8(bytes)?.split('!'))
}

fn parse_split_write(payload: &[u8]) -> Result<Sentinel> {
    let text = utf8(payload)?;
    let (chain, remaining) = text.rsplit_once('!').ok_or_else(|| {
        ClientError::MalformedResponse(format!("split_write without length: {text:?}"))
    })?;
    let remaining = remaining.parse::<usize>().map_err(|_| {
        ClientError::MalformedResponse(format!("split_write length {remaining:?}"))
    })?;
    Ok(Sentinel::SplitWrite {
        chain: ReplicaChain::from_segments(chain.split('!'))?,
        remaining,
    })
}

// The data part is arbitrary bytes and may itself contain '!', so endpoints are
// consumed from the front for as long as they parse.
fn parse_split_read(payload: &[u8]) -> Result<Sentinel> {
    let mut endpoints = Vec::new();
    let mut rest = payload;

    loop {
        let (segment, tail) = match rest.iter().position(|&b| b == b'!') {
            Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
            None => (rest, None),
        };
        let parsed = std::str::from_utf8(segment)
            .ok()
            .and_then(|s| s.parse::<BlockEndpoint>().ok());

        match (parsed, tail) {
            (Some(endpoint), Some(tail)) => {
                endpoints.push(endpoint);
                rest = tail;
            }
            (Some(endpoint), None) => {
                endpoints.push(endpoint);
                rest = &[];
                break;
            }
            (None, _) => break,
        }
    }

    Ok(Sentinel::SplitRead {
        chain: ReplicaChain::new(endpoints)?,
        data: rest.to_vec(),
    })
}
