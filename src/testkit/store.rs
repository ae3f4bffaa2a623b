//! Block state of the in-process cluster: which structures exist, how they are
//! partitioned, and what each partition holds. Everything here runs under the
//! cluster's registry lock; nothing touches the network.

use crate::directory::CreateOptions;
use crate::error::{ClientError, Result};
use crate::protocol::{
    CommandSet, FileOp, HashTableOp, REDIRECTED_MARKER, Sentinel,
};
use crate::routing::{BlockEndpoint, MAX_SLOT, Partition, PartitionMap, ReplicaChain, slot_of};

use std::collections::HashMap;

const OK: &[u8] = b"!ok";

#[derive(Debug, Clone)]
pub(crate) struct BlockRef {
    pub path: String,
    pub partition: u64,
    pub position: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AutoScale {
    pub split_above: usize,
    pub merge_below: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct Export {
    /// Half-open slot range being handed over.
    pub range: (u32, u32),
    pub target: u64,
}

#[derive(Debug)]
pub(crate) struct PartitionState {
    pub chain: ReplicaChain,
    pub range: (u32, u32),
    pub kv: HashMap<Vec<u8>, Vec<u8>>,
    pub file: Vec<u8>,
    pub exporting: Option<Export>,
    pub locked: bool,
}

impl PartitionState {
    fn new(chain: ReplicaChain, range: (u32, u32)) -> Self {
        Self {
            chain,
            range,
            kv: HashMap::new(),
            file: Vec::new(),
            exporting: None,
            locked: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Structure {
    /// Partitions visible in the directory, in slot order.
    pub order: Vec<u64>,
    /// Every partition, including export targets not yet in `order`.
    pub partitions: HashMap<u64, PartitionState>,
    pub scaling: Option<AutoScale>,
}

impl Structure {
    fn ordered(&self, index: usize) -> Option<&PartitionState> {
        self.order.get(index).and_then(|id| self.partitions.get(id))
    }

    fn ordered_mut(&mut self, index: usize) -> Option<&mut PartitionState> {
        let id = *self.order.get(index)?;
        self.partitions.get_mut(&id)
    }
}

/// Result of one command: the response elements and the mutations to announce
/// as `(tail block, op name, key)`.
#[derive(Debug, Default)]
pub(crate) struct Executed {
    pub result: Vec<Vec<u8>>,
    pub events: Vec<(i32, String, Vec<u8>)>,
}

impl Executed {
    fn single(element: Vec<u8>) -> Self {
        Self {
            result: vec![element],
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub structures: HashMap<String, Structure>,
    pub blocks: HashMap<i32, BlockRef>,
    next_block: i32,
    next_partition: u64,
    placement: usize,
}

impl Registry {
    // ============================================================
    // DIRECTORY
    // ============================================================

    pub fn create(
        &mut self,
        path: &str,
        options: &CreateOptions,
        live: &[u16],
    ) -> Result<PartitionMap> {
        if self.structures.contains_key(path) {
            return Err(ClientError::Directory(format!("path already exists: {path}")));
        }
        let partitions = options.num_partitions.max(1);
        let width = MAX_SLOT as u64 / partitions as u64;
        self.structures.insert(path.to_string(), Structure::default());

        for i in 0..partitions {
            let begin = (i as u64 * width) as u32;
            let end = if i + 1 == partitions {
                MAX_SLOT
            } else {
                ((i as u64 + 1) * width) as u32
            };
            let (id, chain) = match self.allocate(path, options.chain_length.max(1), live) {
                Ok(allocated) => allocated,
                Err(e) => {
                    self.remove(path)?;
                    return Err(e);
                }
            };
            let structure = self.structure_mut(path)?;
            structure
                .partitions
                .insert(id, PartitionState::new(chain, (begin, end)));
            structure.order.push(id);
        }

        self.map_of(path)
    }

    pub fn map_of(&self, path: &str) -> Result<PartitionMap> {
        let structure = self.structure(path)?;
        let partitions = structure
            .order
            .iter()
            .filter_map(|id| structure.partitions.get(id))
            .map(|p| Partition {
                slot_begin: p.range.0,
                chain: p.chain.clone(),
            })
            .collect();
        PartitionMap::new(partitions)
    }

    /// Drops members whose server is down from the partition served by `chain`.
    pub fn resolve(&mut self, path: &str, chain: &ReplicaChain, live: &[u16]) -> Result<ReplicaChain> {
        let structure = self.structure_mut(path)?;
        // Match on any shared block so a chain resolved earlier is still found.
        let (id, partition) = structure
            .partitions
            .iter_mut()
            .find(|(_, p)| {
                p.chain
                    .endpoints()
                    .iter()
                    .any(|e| chain.endpoints().iter().any(|c| c.block_id == e.block_id))
            })
            .ok_or_else(|| ClientError::Directory(format!("{chain} is not part of {path}")))?;
        let id = *id;

        let survivors: Vec<BlockEndpoint> = partition
            .chain
            .endpoints()
            .iter()
            .filter(|e| live.contains(&e.port))
            .cloned()
            .collect();
        if survivors.is_empty() {
            return Err(ClientError::Directory(format!("every member of {chain} is down")));
        }

        let dropped: Vec<i32> = partition
            .chain
            .endpoints()
            .iter()
            .filter(|e| !live.contains(&e.port))
            .map(|e| e.block_id)
            .collect();
        partition.chain = ReplicaChain::new(survivors)?;
        let resolved = partition.chain.clone();

        for block in dropped {
            self.blocks.remove(&block);
        }
        for (position, endpoint) in resolved.endpoints().iter().enumerate() {
            self.blocks.insert(
                endpoint.block_id,
                BlockRef {
                    path: path.to_string(),
                    partition: id,
                    position,
                },
            );
        }
        Ok(resolved)
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.structures
            .remove(path)
            .ok_or_else(|| ClientError::Directory(format!("no such path: {path}")))?;
        self.blocks.retain(|_, block| block.path != path);
        Ok(())
    }

    pub fn remove_all(&mut self, path: &str) -> Result<()> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let doomed: Vec<String> = self
            .structures
            .keys()
            .filter(|p| *p == path || p.starts_with(&prefix))
            .cloned()
            .collect();
        for path in doomed {
            self.remove(&path)?;
        }
        Ok(())
    }

    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        if self.structures.contains_key(new_path) {
            return Err(ClientError::Directory(format!("path already exists: {new_path}")));
        }
        let structure = self
            .structures
            .remove(old_path)
            .ok_or_else(|| ClientError::Directory(format!("no such path: {old_path}")))?;
        self.structures.insert(new_path.to_string(), structure);
        for block in self.blocks.values_mut() {
            if block.path == old_path {
                block.path = new_path.to_string();
            }
        }
        Ok(())
    }

    // ============================================================
    // SCALING
    // ============================================================

    pub fn enable_auto_scale(&mut self, path: &str, scale: AutoScale) -> Result<()> {
        self.structure_mut(path)?.scaling = Some(scale);
        Ok(())
    }

    /// Splits partition `index` at the middle of its slot range.
    pub fn split(&mut self, path: &str, index: usize, live: &[u16]) -> Result<ReplicaChain> {
        let (mid, end, chain_len) = self.split_point(path, index)?;
        let (id, chain) = self.allocate(path, chain_len, live)?;

        let structure = self.structure_mut(path)?;
        let source = structure
            .ordered_mut(index)
            .ok_or_else(|| ClientError::Directory(format!("no partition {index}")))?;
        let moved = take_from(&mut source.kv, mid);
        source.range.1 = mid;

        let mut state = PartitionState::new(chain.clone(), (mid, end));
        state.kv = moved;
        structure.partitions.insert(id, state);
        structure.order.insert(index + 1, id);
        Ok(chain)
    }

    /// Starts handing the upper half of partition `index` to a new chain. The new
    /// chain only becomes visible in the directory once the export finishes.
    pub fn begin_export(&mut self, path: &str, index: usize, live: &[u16]) -> Result<ReplicaChain> {
        let (mid, end, chain_len) = self.split_point(path, index)?;
        let (id, chain) = self.allocate(path, chain_len, live)?;

        let structure = self.structure_mut(path)?;
        let source = structure
            .ordered_mut(index)
            .ok_or_else(|| ClientError::Directory(format!("no partition {index}")))?;
        let moved = take_from(&mut source.kv, mid);
        source.exporting = Some(Export {
            range: (mid, end),
            target: id,
        });

        let mut state = PartitionState::new(chain.clone(), (mid, end));
        state.kv = moved;
        structure.partitions.insert(id, state);
        Ok(chain)
    }

    pub fn finish_export(&mut self, path: &str, index: usize) -> Result<()> {
        let structure = self.structure_mut(path)?;
        let source = structure
            .ordered_mut(index)
            .ok_or_else(|| ClientError::Directory(format!("no partition {index}")))?;
        let export = source
            .exporting
            .take()
            .ok_or_else(|| ClientError::Directory(format!("partition {index} is not exporting")))?;
        source.range.1 = export.range.0;
        structure.order.insert(index + 1, export.target);
        Ok(())
    }

    fn split_point(&self, path: &str, index: usize) -> Result<(u32, u32, usize)> {
        let source = self
            .structure(path)?
            .ordered(index)
            .ok_or_else(|| ClientError::Directory(format!("no partition {index}")))?;
        let (begin, end) = source.range;
        if end - begin < 2 {
            return Err(ClientError::Directory(format!("partition {index} is too narrow")));
        }
        Ok((begin + (end - begin) / 2, end, source.chain.len()))
    }

    fn rebalance(&mut self, path: &str, live: &[u16]) {
        let Some(scale) = self.structures.get(path).and_then(|s| s.scaling) else {
            return;
        };

        loop {
            let Ok(structure) = self.structure(path) else {
                return;
            };
            let candidate = structure.order.iter().position(|id| {
                let p = &structure.partitions[id];
                p.kv.len() > scale.split_above
                    && p.range.1 - p.range.0 >= 2
                    && p.exporting.is_none()
                    && !p.locked
            });
            match candidate {
                Some(index) => {
                    if let Err(e) = self.split(path, index, live) {
                        tracing::warn!("Auto split of {} failed: {}", path, e);
                        return;
                    }
                    tracing::debug!("Auto split {} at partition {}", path, index);
                }
                None => break,
            }
        }

        loop {
            let Ok(structure) = self.structure(path) else {
                return;
            };
            let candidate = structure.order.windows(2).position(|pair| {
                let (left, right) = (&structure.partitions[&pair[0]], &structure.partitions[&pair[1]]);
                left.kv.len() + right.kv.len() < scale.merge_below
                    && left.exporting.is_none()
                    && right.exporting.is_none()
                    && !left.locked
                    && !right.locked
            });
            match candidate {
                Some(index) => {
                    self.merge(path, index);
                    tracing::debug!("Auto merged {} at partition {}", path, index);
                }
                None => break,
            }
        }
    }

    // Folds partition `index + 1` into partition `index`.
    fn merge(&mut self, path: &str, index: usize) {
        let Some(structure) = self.structures.get_mut(path) else {
            return;
        };
        let right_id = structure.order.remove(index + 1);
        let Some(right) = structure.partitions.remove(&right_id) else {
            return;
        };
        if let Some(left) = structure.ordered_mut(index) {
            left.kv.extend(right.kv);
            left.range.1 = right.range.1;
        }
        for endpoint in right.chain.endpoints() {
            self.blocks.remove(&endpoint.block_id);
        }
    }

    // ============================================================
    // COMMANDS
    // ============================================================

    pub fn execute(
        &mut self,
        block_id: i32,
        opcode: i32,
        mut args: Vec<Vec<u8>>,
        live: &[u16],
        file_capacity: usize,
    ) -> Executed {
        let redirected = args.last().map(Vec::as_slice) == Some(REDIRECTED_MARKER);
        if redirected {
            args.pop();
        }
        let Some(block) = self.blocks.get(&block_id).cloned() else {
            // One answer per batch element, so the client can match them up.
            let elements = match HashTableOp::from_code(opcode).map(|op| op.args_per_op()) {
                Some(per_op) if per_op > 0 => (args.len() / per_op).max(1),
                _ => 1,
            };
            return Executed {
                result: vec![Sentinel::BlockMoved.encode(); elements],
                events: Vec::new(),
            };
        };

        if let Some(op) = HashTableOp::from_code(opcode) {
            if !self.in_role(&block, op.is_mutator()) {
                return Executed::single(Sentinel::ArgsError.encode());
            }
            let executed = self.execute_table(&block, op, &args, redirected);
            if op.is_mutator() {
                self.rebalance(&block.path, live);
            }
            executed
        } else if let Some(op) = FileOp::from_code(opcode) {
            if !self.in_role(&block, op.is_mutator()) {
                return Executed::single(Sentinel::ArgsError.encode());
            }
            self.execute_file(&block, op, &args, live, file_capacity)
        } else {
            Executed::single(Sentinel::ArgsError.encode())
        }
    }

    // Mutators enter at the head, accessors are served by the tail.
    fn in_role(&self, block: &BlockRef, mutator: bool) -> bool {
        let Some(partition) = self.partition(block) else {
            return false;
        };
        let expected = if mutator { 0 } else { partition.chain.len() - 1 };
        block.position == expected
    }

    fn execute_table(
        &mut self,
        block: &BlockRef,
        op: HashTableOp,
        args: &[Vec<u8>],
        redirected: bool,
    ) -> Executed {
        let export = self.partition(block).and_then(|partition| {
            let export = partition.exporting.as_ref()?;
            let target = self.structures.get(&block.path)?.partitions.get(&export.target)?;
            Some((export.range, target.chain.clone()))
        });
        let Some(partition) = self.partition_mut(block) else {
            return Executed::single(Sentinel::BlockMoved.encode());
        };
        let tail = partition.chain.tail().block_id;

        let per_op = op.args_per_op();
        if per_op == 0 {
            let element = match op {
                HashTableOp::NumKeys => partition.kv.len().to_string().into_bytes(),
                HashTableOp::Lock => {
                    partition.locked = true;
                    match export {
                        Some((_, chain)) => Sentinel::Exporting(chain).encode(),
                        None => OK.to_vec(),
                    }
                }
                HashTableOp::Unlock => {
                    partition.locked = false;
                    OK.to_vec()
                }
                _ => Sentinel::ArgsError.encode(),
            };
            return Executed::single(element);
        }

        if args.is_empty() || args.len() % per_op != 0 {
            return Executed::single(Sentinel::ArgsError.encode());
        }

        let mut executed = Executed::default();
        for group in args.chunks(per_op) {
            let key = &group[0];
            if !redirected {
                let slot = slot_of(key);
                if let Some((range, chain)) = &export
                    && contains(*range, slot)
                {
                    executed.result.push(Sentinel::Exporting(chain.clone()).encode());
                    continue;
                }
                if !contains(partition.range, slot) {
                    executed.result.push(Sentinel::BlockMoved.encode());
                    continue;
                }
            }
            if is_locked_op(op) && !partition.locked {
                executed.result.push(Sentinel::ArgsError.encode());
                continue;
            }

            let element = apply(&mut partition.kv, op, group);
            if op.is_mutator() && element == OK {
                executed
                    .events
                    .push((tail, op.name().trim_start_matches("locked_").to_string(), key.clone()));
            }
            executed.result.push(element);
        }
        executed
    }

    fn execute_file(
        &mut self,
        block: &BlockRef,
        op: FileOp,
        args: &[Vec<u8>],
        live: &[u16],
        capacity: usize,
    ) -> Executed {
        let Some(index) = self
            .structures
            .get(&block.path)
            .and_then(|s| s.order.iter().position(|id| *id == block.partition))
        else {
            return Executed::single(Sentinel::BlockMoved.encode());
        };
        let Some(partition) = self.partition(block) else {
            return Executed::single(Sentinel::BlockMoved.encode());
        };
        let len = partition.file.len();

        match op {
            FileOp::Seek => Executed {
                result: vec![
                    OK.to_vec(),
                    len.to_string().into_bytes(),
                    capacity.to_string().into_bytes(),
                ],
                events: Vec::new(),
            },

            FileOp::Write => {
                let (Some(offset), Some(data)) = (args.first().and_then(|a| number(a)), args.get(1))
                else {
                    return Executed::single(Sentinel::ArgsError.encode());
                };
                if offset > len {
                    return Executed::single(Sentinel::ArgsError.encode());
                }

                let room = capacity.saturating_sub(offset);
                let written = data.len().min(room);
                if let Some(partition) = self.partition_mut(block) {
                    write_at(&mut partition.file, offset, &data[..written]);
                }
                if written == data.len() {
                    return Executed::single(OK.to_vec());
                }

                match self.next_file_partition(&block.path, index, live) {
                    Ok(chain) => Executed::single(
                        Sentinel::SplitWrite {
                            chain,
                            remaining: data.len() - written,
                        }
                        .encode(),
                    ),
                    Err(e) => {
                        tracing::warn!("File {} could not grow: {}", block.path, e);
                        Executed::single(Sentinel::ArgsError.encode())
                    }
                }
            }

            FileOp::Read => {
                let (Some(offset), Some(size)) = (
                    args.first().and_then(|a| number(a)),
                    args.get(1).and_then(|a| number(a)),
                ) else {
                    return Executed::single(Sentinel::ArgsError.encode());
                };

                let next = if len >= capacity {
                    self.structure(&block.path)
                        .ok()
                        .and_then(|s| s.ordered(index + 1))
                        .map(|p| p.chain.clone())
                } else {
                    None
                };
                let data = if offset < len {
                    partition.file[offset..len.min(offset + size)].to_vec()
                } else {
                    Vec::new()
                };

                match next {
                    Some(chain) if offset + size > len => {
                        Executed::single(Sentinel::SplitRead { chain, data }.encode())
                    }
                    _ if data.is_empty() => Executed::single(Sentinel::MsgNotFound.encode()),
                    _ => Executed::single(data),
                }
            }
        }
    }

    fn next_file_partition(&mut self, path: &str, index: usize, live: &[u16]) -> Result<ReplicaChain> {
        let structure = self.structure(path)?;
        if let Some(next) = structure.ordered(index + 1) {
            return Ok(next.chain.clone());
        }
        let current = structure
            .ordered(index)
            .ok_or_else(|| ClientError::Directory(format!("no partition {index}")))?;
        let begin = current.range.0 + 1;
        let chain_len = current.chain.len();

        let (id, chain) = self.allocate(path, chain_len, live)?;
        let structure = self.structure_mut(path)?;
        if let Some(current) = structure.ordered_mut(index) {
            current.range.1 = begin;
        }
        structure
            .partitions
            .insert(id, PartitionState::new(chain.clone(), (begin, MAX_SLOT)));
        structure.order.push(id);
        Ok(chain)
    }

    // ============================================================
    // LOOKUPS
    // ============================================================

    fn allocate(&mut self, path: &str, length: usize, live: &[u16]) -> Result<(u64, ReplicaChain)> {
        if length > live.len() {
            return Err(ClientError::Directory(format!(
                "chain of {length} needs more than {} live server(s)",
                live.len()
            )));
        }

        let id = self.next_partition;
        self.next_partition += 1;

        let mut endpoints = Vec::with_capacity(length);
        for position in 0..length {
            let port = live[(self.placement + position) % live.len()];
            let block_id = self.next_block;
            self.next_block += 1;
            self.blocks.insert(
                block_id,
                BlockRef {
                    path: path.to_string(),
                    partition: id,
                    position,
                },
            );
            endpoints.push(BlockEndpoint::new("127.0.0.1", port, block_id));
        }
        self.placement += 1;

        Ok((id, ReplicaChain::new(endpoints)?))
    }

    pub fn structure(&self, path: &str) -> Result<&Structure> {
        self.structures
            .get(path)
            .ok_or_else(|| ClientError::Directory(format!("no such path: {path}")))
    }

    fn structure_mut(&mut self, path: &str) -> Result<&mut Structure> {
        self.structures
            .get_mut(path)
            .ok_or_else(|| ClientError::Directory(format!("no such path: {path}")))
    }

    fn partition(&self, block: &BlockRef) -> Option<&PartitionState> {
        self.structures.get(&block.path)?.partitions.get(&block.partition)
    }

    fn partition_mut(&mut self, block: &BlockRef) -> Option<&mut PartitionState> {
        self.structures
            .get_mut(&block.path)?
            .partitions
            .get_mut(&block.partition)
    }
}

fn apply(kv: &mut HashMap<Vec<u8>, Vec<u8>>, op: HashTableOp, group: &[Vec<u8>]) -> Vec<u8> {
    let key = &group[0];
    match op {
        HashTableOp::Get | HashTableOp::LockedGet => match kv.get(key) {
            Some(value) => value.clone(),
            None => Sentinel::KeyNotFound.encode(),
        },
        HashTableOp::Exists => {
            if kv.contains_key(key) {
                b"true".to_vec()
            } else {
                b"false".to_vec()
            }
        }
        HashTableOp::Put | HashTableOp::LockedPut => {
            if kv.contains_key(key) {
                Sentinel::DuplicateKey.encode()
            } else {
                kv.insert(key.clone(), group[1].clone());
                OK.to_vec()
            }
        }
        HashTableOp::Update | HashTableOp::LockedUpdate => match kv.get_mut(key) {
            Some(value) => {
                *value = group[1].clone();
                OK.to_vec()
            }
            None => Sentinel::KeyNotFound.encode(),
        },
        HashTableOp::Upsert | HashTableOp::LockedUpsert => {
            kv.insert(key.clone(), group[1].clone());
            OK.to_vec()
        }
        HashTableOp::Remove | HashTableOp::LockedRemove => match kv.remove(key) {
            Some(_) => OK.to_vec(),
            None => Sentinel::KeyNotFound.encode(),
        },
        HashTableOp::NumKeys | HashTableOp::Lock | HashTableOp::Unlock => {
            Sentinel::ArgsError.encode()
        }
    }
}

fn is_locked_op(op: HashTableOp) -> bool {
    matches!(
        op,
        HashTableOp::LockedGet
            | HashTableOp::LockedPut
            | HashTableOp::LockedRemove
            | HashTableOp::LockedUpdate
            | HashTableOp::LockedUpsert
    )
}

fn contains(range: (u32, u32), slot: u32) -> bool {
    range.0 <= slot && slot < range.1
}

fn take_from(kv: &mut HashMap<Vec<u8>, Vec<u8>>, from_slot: u32) -> HashMap<Vec<u8>, Vec<u8>> {
    let moving: Vec<Vec<u8>> = kv
        .keys()
        .filter(|k| slot_of(k) >= from_slot)
        .cloned()
        .collect();
    moving
        .into_iter()
        .filter_map(|k| kv.remove_entry(&k))
        .collect()
}

fn write_at(file: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if file.len() < end {
        file.resize(end, 0);
    }
    file[offset..end].copy_from_slice(data);
}

fn number(raw: &[u8]) -> Option<usize> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

pub(crate) fn is_mutator(opcode: i32) -> bool {
    HashTableOp::from_code(opcode)
        .map(|op| op.is_mutator())
        .or_else(|| FileOp::from_code(opcode).map(|op| op.is_mutator()))
        .unwrap_or(false)
}
