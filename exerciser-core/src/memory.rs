//! Host memory that is shared with the device under test.
//!
//! Ring storage and command data buffers are both [DmaBuffer]s. The device
//! side (the [Transport](crate::transport::Transport)) holds a clone of the
//! same buffer and reads and writes it asynchronously to the host.

use std::sync::Arc;

use parking_lot::Mutex;
use shared::KiB;
use thiserror::Error;

/// The page size used for data transfer descriptors
pub const PAGE_SIZE: usize = KiB!(4);

#[allow(missing_docs)]
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum MemoryError {
    #[error("access of {len:#x} bytes at {offset:#x} is outside of the {size:#x} byte buffer")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("data buffers must not be empty")]
    EmptyBuffer,
    #[error("data buffer offset {0:#x} must be dword aligned")]
    NotDwordAligned(usize),
    #[error("data buffer offset {0:#x} overflows the page size")]
    OffsetTooLarge(usize),
}

/// A shared, lock protected region of host memory.
///
/// Cloning a [DmaBuffer] creates another handle to the same memory.
#[derive(Clone)]
pub struct DmaBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl DmaBuffer {
    /// Allocates `len` zeroed bytes
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; len])),
        }
    }

    /// The size of the buffer in bytes
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    /// `true` if this buffer has a size of 0
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_range(size: usize, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(MemoryError::OutOfBounds { offset, len, size }),
        }
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        let bytes = self.bytes.lock();
        Self::check_range(bytes.len(), offset, buf.len())?;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    /// Copies `data` into the buffer starting at `offset`
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        let mut bytes = self.bytes.lock();
        Self::check_range(bytes.len(), offset, data.len())?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Reads a little endian u32 at `offset`
    pub fn read_u32(&self, offset: usize) -> Result<u32, MemoryError> {
        let mut dword = [0; 4];
        self.read(offset, &mut dword)?;
        Ok(u32::from_le_bytes(dword))
    }

    /// Writes `value` as little endian u32 at `offset`
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), MemoryError> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Sets every byte of the buffer to `value`
    pub fn fill(&self, value: u8) {
        self.bytes.lock().fill(value);
    }

    /// Copies the whole buffer
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// `true` if both handles refer to the same memory
    pub fn ptr_eq(&self, other: &DmaBuffer) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("len", &format_args!("{:#x}", self.len()))
            .finish()
    }
}

/// A data buffer bound to a command through a
/// [DataTransferDescriptor](crate::prp::DataTransferDescriptor).
///
/// The data starts `offset` bytes into its first page. The offset must be
/// dword aligned and smaller than [PAGE_SIZE].
#[derive(Clone, Debug)]
pub struct DataBuffer {
    memory: DmaBuffer,
    offset: usize,
    len: usize,
}

impl DataBuffer {
    /// Allocates a zeroed, page aligned buffer of `len` bytes
    pub fn new(len: usize) -> Result<Self, MemoryError> {
        Self::with_offset(len, 0)
    }

    /// Allocates a zeroed buffer of `len` bytes starting `offset` bytes into
    /// its first page
    pub fn with_offset(len: usize, offset: usize) -> Result<Self, MemoryError> {
        if len == 0 {
            return Err(MemoryError::EmptyBuffer);
        }
        if offset >= PAGE_SIZE {
            return Err(MemoryError::OffsetTooLarge(offset));
        }
        if offset & 0b11 != 0 {
            return Err(MemoryError::NotDwordAligned(offset));
        }
        Ok(Self {
            memory: DmaBuffer::zeroed(offset + len),
            offset,
            len,
        })
    }

    /// Creates a page aligned buffer holding a copy of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self, MemoryError> {
        let buffer = Self::new(data.len())?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    /// The number of data bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`, empty buffers can not be constructed
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The offset of the data into the first page
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The number of pages touched by the data
    pub fn page_count(&self) -> usize {
        (self.offset + self.len).div_ceil(PAGE_SIZE)
    }

    /// The underlying memory, including the first page offset
    pub fn memory(&self) -> &DmaBuffer {
        &self.memory
    }

    /// Reads from the data, `at` is relative to the start of the data
    pub fn read(&self, at: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        DmaBuffer::check_range(self.len, at, buf.len())?;
        self.memory.read(self.offset + at, buf)
    }

    /// Writes into the data, `at` is relative to the start of the data
    pub fn write(&self, at: usize, data: &[u8]) -> Result<(), MemoryError> {
        DmaBuffer::check_range(self.len, at, data.len())?;
        self.memory.write(self.offset + at, data)
    }

    /// Copies the data
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = vec![0; self.len];
        self.memory
            .read(self.offset, &mut data)
            .expect("data range is always within memory");
        data
    }
}
