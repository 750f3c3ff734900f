use std::collections::BTreeMap;

use crate::io_commands::Lba;

/// Sparse in-memory backing store of a namespace.
///
/// Blocks that were never written read as zeros.
#[derive(Debug)]
pub struct Namespace {
    blocks: u64,
    block_size: usize,
    data: BTreeMap<u64, Vec<u8>>,
    pub(super) bytes_read: u64,
    pub(super) bytes_written: u64,
}

impl Namespace {
    pub fn new(blocks: u64, block_size: usize) -> Self {
        Self {
            blocks,
            block_size,
            data: BTreeMap::new(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The number of blocks holding data
    pub fn utilization(&self) -> u64 {
        self.data.len() as u64
    }

    /// `true` if `count` blocks starting at `start` are within the namespace
    pub fn contains(&self, start: Lba, count: u32) -> bool {
        start
            .value()
            .checked_add(count as u64)
            .is_some_and(|end| end <= self.blocks)
    }

    pub fn read(&mut self, start: Lba, count: u32) -> Vec<u8> {
        let mut out = vec![0; count as usize * self.block_size];
        for (index, chunk) in out.chunks_exact_mut(self.block_size).enumerate() {
            if let Some(block) = self.data.get(&(start.value() + index as u64)) {
                chunk.copy_from_slice(block);
            }
        }
        self.bytes_read += out.len() as u64;
        out
    }

    /// Writes whole blocks, `data` must be a multiple of the block size
    pub fn write(&mut self, start: Lba, data: &[u8]) {
        for (index, chunk) in data.chunks_exact(self.block_size).enumerate() {
            self.data
                .insert(start.value() + index as u64, chunk.to_vec());
        }
        self.bytes_written += data.len() as u64;
    }
}
