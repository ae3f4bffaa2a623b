use super::hash::{MAX_SLOT, slot_of};
use super::types::PartitionMap;
use crate::error::{ClientError, Result};

/// Key to partition lookup over sorted slot boundaries.
#[derive(Debug, Clone)]
pub struct PartitionRouter {
    slot_begins: Vec<u32>,
}

impl PartitionRouter {
    pub fn new(map: &PartitionMap) -> Result<Self> {
        map.validate()?;
        let slot_begins: Vec<u32> = map.partitions().iter().map(|p| p.slot_begin).collect();

        if slot_begins[0] != 0 {
            return Err(ClientError::InvalidArguments(format!(
                "first partition must start at slot 0, starts at {}",
                slot_begins[0]
            )));
        }
        if let Some(last) = slot_begins.last()
            && *last >= MAX_SLOT
        {
            return Err(ClientError::InvalidArguments(format!(
                "slot {last} is outside the slot space"
            )));
        }

        Ok(Self { slot_begins })
    }

    /// Rightmost partition whose `slot_begin` is <= the key's slot.
    pub fn route(&self, key: &[u8]) -> usize {
        self.route_slot(slot_of(key))
    }

    pub fn route_slot(&self, slot: u32) -> usize {
        // slot_begins[0] == 0, so the partition point is always >= 1.
        self.slot_begins.partition_point(|&begin| begin <= slot) - 1
    }

    /// Half-open slot range `[begin, end)` owned by a partition.
    pub fn slot_range(&self, partition: usize) -> (u32, u32) {
        let begin = self.slot_begins[partition];
        let end = self
            .slot_begins
            .get(partition + 1)
            .copied()
            .unwrap_or(MAX_SLOT);
        (begin, end)
    }

    pub fn num_partitions(&self) -> usize {
        self.slot_begins.len()
    }
}
