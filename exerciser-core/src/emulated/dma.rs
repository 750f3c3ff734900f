//! Bus addresses and PRP walking for the emulated device.
//!
//! Every [DmaBuffer] the device can access is registered as a region. The
//! bus address of a region is its id in the upper 32 bits and the byte offset
//! into the region in the lower 32 bits.

use std::collections::BTreeMap;

use log::trace;
use thiserror::Error;

use crate::{
    memory::{DmaBuffer, MemoryError, PAGE_SIZE},
    prp::{PrpEntry, PAGE_ENTRY_COUNT},
};

#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DmaError {
    #[error("bus address {0:#x} does not belong to any region")]
    UnmappedAddress(u64),
    #[error("prp entry {0:?} must be page aligned")]
    UnalignedEntry(PrpEntry),
    #[error("transfer of {0:#x} bytes needs a chained prp list")]
    ChainedList(usize),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// All memory regions visible to the device
#[derive(Debug, Default)]
pub struct DmaRegions {
    regions: BTreeMap<u32, DmaBuffer>,
    next_id: u32,
}

impl DmaRegions {
    /// Registers `memory` and returns its bus address
    pub fn map(&mut self, memory: DmaBuffer) -> u64 {
        // 0 is never used so that a zeroed PRP entry is invalid
        self.next_id = self.next_id.wrapping_add(1).max(1);
        while self.regions.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1).max(1);
        }
        self.regions.insert(self.next_id, memory);
        trace!("map dma region {}", self.next_id);
        (self.next_id as u64) << 32
    }

    /// Removes the region containing `address`
    pub fn unmap(&mut self, address: u64) {
        self.regions.remove(&((address >> 32) as u32));
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn resolve(&self, address: u64) -> Result<(&DmaBuffer, usize), DmaError> {
        let region = self
            .regions
            .get(&((address >> 32) as u32))
            .ok_or(DmaError::UnmappedAddress(address))?;
        Ok((region, (address & 0xffff_ffff) as usize))
    }

    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), DmaError> {
        let (region, offset) = self.resolve(address)?;
        Ok(region.read(offset, buf)?)
    }

    pub fn write(&self, address: u64, data: &[u8]) -> Result<(), DmaError> {
        let (region, offset) = self.resolve(address)?;
        Ok(region.write(offset, data)?)
    }

    /// Splits a transfer of `len` bytes described by `prp1` and `prp2` into
    /// contiguous `(address, len)` segments
    pub fn segments(
        &self,
        prp1: PrpEntry,
        prp2: PrpEntry,
        len: usize,
    ) -> Result<Vec<(u64, usize)>, DmaError> {
        let first_len = len.min(PAGE_SIZE - prp1.offset());
        let mut segments = vec![(prp1.as_u64(), first_len)];
        let mut remaining = len - first_len;
        if remaining == 0 {
            return Ok(segments);
        }

        if remaining <= PAGE_SIZE {
            if prp2.offset() != 0 {
                return Err(DmaError::UnalignedEntry(prp2));
            }
            segments.push((prp2.as_u64(), remaining));
            return Ok(segments);
        }

        let entries = remaining.div_ceil(PAGE_SIZE);
        let list_slots = PAGE_ENTRY_COUNT - prp2.offset() / size_of::<u64>();
        if entries > list_slots {
            return Err(DmaError::ChainedList(len));
        }
        let mut list = vec![0; entries * size_of::<u64>()];
        self.read(prp2.as_u64(), &mut list)?;
        for raw in list.chunks_exact(size_of::<u64>()) {
            let mut bytes = [0; 8];
            bytes.copy_from_slice(raw);
            let entry = PrpEntry::new(u64::from_le_bytes(bytes))?;
            if entry.offset() != 0 {
                return Err(DmaError::UnalignedEntry(entry));
            }
            let segment_len = remaining.min(PAGE_SIZE);
            segments.push((entry.as_u64(), segment_len));
            remaining -= segment_len;
        }
        Ok(segments)
    }

    /// Device to host transfer
    pub fn write_prp(&self, prp1: PrpEntry, prp2: PrpEntry, data: &[u8]) -> Result<(), DmaError> {
        let mut at = 0;
        for (address, len) in self.segments(prp1, prp2, data.len())? {
            self.write(address, &data[at..at + len])?;
            at += len;
        }
        Ok(())
    }

    /// Host to device transfer
    pub fn read_prp(&self, prp1: PrpEntry, prp2: PrpEntry, len: usize) -> Result<Vec<u8>, DmaError> {
        let mut data = vec![0; len];
        let mut at = 0;
        for (address, segment_len) in self.segments(prp1, prp2, len)? {
            self.read(address, &mut data[at..at + segment_len])?;
            at += segment_len;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        generic_command::{CommandBuffer, DataDirection},
        memory::DataBuffer,
        prp::{read_data_pointer, DataTransferDescriptor, PlacementMask},
    };

    fn map_descriptor(regions: &mut DmaRegions, buffer: &DataBuffer) -> (PrpEntry, PrpEntry) {
        let mut command = CommandBuffer::new(64, DataDirection::DeviceToHost).unwrap();
        DataTransferDescriptor::attach(&mut command, PlacementMask::all(), buffer.clone())
            .unwrap();
        let descriptor = command.descriptor().unwrap();
        let base = regions.map(buffer.memory().clone());
        let prp = descriptor.prp(base, 0);
        let prp = match prp.list_page() {
            Some(page) => {
                let list = DmaBuffer::zeroed(PAGE_SIZE);
                list.write(0, &page).unwrap();
                descriptor.prp(base, regions.map(list))
            }
            None => prp,
        };
        let mut entry = [0; 64];
        prp.write_to(&mut entry).unwrap();
        read_data_pointer(&entry).unwrap()
    }

    #[test]
    fn single_page_with_offset() {
        let mut regions = DmaRegions::default();
        let buffer = DataBuffer::with_offset(16, 8).unwrap();
        let (prp1, prp2) = map_descriptor(&mut regions, &buffer);
        regions.write_prp(prp1, prp2, &[0xab; 16]).unwrap();
        assert_eq!(buffer.to_vec(), vec![0xab; 16]);
    }

    #[test]
    fn list_transfer() {
        let mut regions = DmaRegions::default();
        let buffer = DataBuffer::with_offset(3 * PAGE_SIZE, 0x200).unwrap();
        let data: Vec<u8> = (0..3 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        buffer.write(0, &data).unwrap();

        let (prp1, prp2) = map_descriptor(&mut regions, &buffer);
        assert_eq!(regions.len(), 2);
        let segments = regions.segments(prp1, prp2, data.len()).unwrap();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0].1, PAGE_SIZE - 0x200);
        assert_eq!(segments[3].1, 0x200);
        assert_eq!(regions.read_prp(prp1, prp2, data.len()).unwrap(), data);
    }

    #[test]
    fn unmapped_address() {
        let regions = DmaRegions::default();
        assert_eq!(
            regions.read_prp(PrpEntry::zero(), PrpEntry::zero(), 4),
            Err(DmaError::UnmappedAddress(0))
        );
    }
}
