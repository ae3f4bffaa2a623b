use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One block of a replica chain, addressed as `host:port:block_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockEndpoint {
    pub host: String,
    pub port: u16,
    pub block_id: i32,
}

impl BlockEndpoint {
    pub fn new(host: impl Into<String>, port: u16, block_id: i32) -> Self {
        Self {
            host: host.into(),
            port,
            block_id,
        }
    }

    /// Key used by the endpoint cache; blocks on the same server share a channel.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BlockEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.block_id)
    }
}

impl FromStr for BlockEndpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        // Hosts may be IPv6 literals, so peel the numeric fields off the right.
        let mut parts = s.rsplitn(3, ':');
        let block_id = parts.next();
        let port = parts.next();
        let host = parts.next();

        match (host, port, block_id) {
            (Some(host), Some(port), Some(block_id)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ClientError::MalformedResponse(format!("bad port in {s:?}")))?;
                let block_id = block_id.parse::<i32>().map_err(|_| {
                    ClientError::MalformedResponse(format!("bad block id in {s:?}"))
                })?;
                Ok(Self::new(host, port, block_id))
            }
            _ => Err(ClientError::MalformedResponse(format!(
                "expected host:port:block_id, got {s:?}"
            ))),
        }
    }
}

impl TryFrom<String> for BlockEndpoint {
    type Error = ClientError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BlockEndpoint> for String {
    fn from(value: BlockEndpoint) -> Self {
        value.to_string()
    }
}

/// Ordered replica list for one partition. `endpoints[0]` is the head and the
/// last entry is the tail; they coincide for a chain of length one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<BlockEndpoint>", into = "Vec<BlockEndpoint>")]
pub struct ReplicaChain {
    endpoints: Vec<BlockEndpoint>,
}

impl ReplicaChain {
    pub fn new(endpoints: Vec<BlockEndpoint>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(ClientError::InvalidArguments(
                "a replica chain needs at least one endpoint".into(),
            ));
        }
        Ok(Self { endpoints })
    }

    /// Parses the `!`-separated segments carried by redirect sentinels.
    pub fn from_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let endpoints = segments
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<BlockEndpoint>>>()?;
        Self::new(endpoints)
    }

    pub fn head(&self) -> &BlockEndpoint {
        &self.endpoints[0]
    }

    pub fn tail(&self) -> &BlockEndpoint {
        &self.endpoints[self.endpoints.len() - 1]
    }

    pub fn endpoints(&self) -> &[BlockEndpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl TryFrom<Vec<BlockEndpoint>> for ReplicaChain {
    type Error = ClientError;

    fn try_from(endpoints: Vec<BlockEndpoint>) -> Result<Self> {
        Self::new(endpoints)
    }
}

impl From<ReplicaChain> for Vec<BlockEndpoint> {
    fn from(chain: ReplicaChain) -> Self {
        chain.endpoints
    }
}

impl fmt::Display for ReplicaChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if i > 0 {
                f.write_str("!")?;
            }
            write!(f, "{endpoint}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub slot_begin: u32,
    pub chain: ReplicaChain,
}

/// Partition layout of one data structure as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMap {
    partitions: Vec<Partition>,
}

impl PartitionMap {
    pub fn new(partitions: Vec<Partition>) -> Result<Self> {
        let map = Self { partitions };
        map.validate()?;
        Ok(map)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partitions.is_empty() {
            return Err(ClientError::InvalidArguments(
                "partition map has no partitions".into(),
            ));
        }
        for pair in self.partitions.windows(2) {
            if pair[0].slot_begin >= pair[1].slot_begin {
                return Err(ClientError::InvalidArguments(format!(
                    "slot boundaries not strictly increasing: {} then {}",
                    pair[0].slot_begin, pair[1].slot_begin
                )));
            }
        }
        Ok(())
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn chains(&self) -> impl Iterator<Item = &ReplicaChain> {
        self.partitions.iter().map(|p| &p.chain)
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
