//! PRP - Physical Region Page Entry
//!
//! A [DataTransferDescriptor] binds a [DataBuffer] to a [CommandBuffer] and
//! checks that the buffer can be described with the data placements the
//! command is allowed to use. The actual PRP entries are only computed by the
//! [Transport](crate::transport::Transport) at submission time, once the bus
//! address of the buffer is known.
//!
//! See: NVM Express Base Specification: 4.1.1

use bitflags::bitflags;
use log::trace;
use thiserror::Error;

use crate::{
    generic_command::{CommandBuffer, FieldError, DATA_PTR_DWORD, DWORD_SIZE},
    memory::{DataBuffer, MemoryError, PAGE_SIZE},
};

/// The number of PRP entries that fit within a page
pub const PAGE_ENTRY_COUNT: usize = PAGE_SIZE / size_of::<u64>();

bitflags! {
    /// The data placements a command may use
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PlacementMask: u8 {
        /// PRP entry 1 addresses (part of) the first page
        const FIRST_PAGE = 1;
        /// PRP entry 2 addresses the second page
        const SECOND_PAGE = 1 << 1;
        /// PRP entry 2 points to a list of PRP entries
        const SECOND_LIST = 1 << 2;
    }
}

/// The data placement a buffer requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    FirstPage,
    FirstAndSecondPage,
    /// `entries` PRP entries are stored in the list
    FirstAndList { entries: usize },
}

impl Placement {
    /// The smallest placement able to describe `buffer`
    pub fn for_buffer(buffer: &DataBuffer) -> Self {
        match buffer.page_count() {
            0 | 1 => Placement::FirstPage,
            2 => Placement::FirstAndSecondPage,
            pages => Placement::FirstAndList { entries: pages - 1 },
        }
    }

    /// The flags this placement needs
    pub fn mask(self) -> PlacementMask {
        match self {
            Placement::FirstPage => PlacementMask::FIRST_PAGE,
            Placement::FirstAndSecondPage => {
                PlacementMask::FIRST_PAGE | PlacementMask::SECOND_PAGE
            }
            Placement::FirstAndList { .. } => {
                PlacementMask::FIRST_PAGE | PlacementMask::SECOND_LIST
            }
        }
    }
}

#[allow(missing_docs)]
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum DescriptorError {
    #[error("placement {requested:?} is not authorized for this command (authorized {authorized:?})")]
    PlacementNotAllowed {
        requested: PlacementMask,
        authorized: PlacementMask,
    },
    #[error("a buffer of {pages} pages can not be described with {allowed:?}")]
    BufferTooLarge {
        pages: usize,
        allowed: PlacementMask,
    },
    #[error("buffer of {available:#x} bytes is too small, {required:#x} bytes are required")]
    BufferTooSmall { required: usize, available: usize },
    #[error("command has no data buffer attached")]
    NotAttached,
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// The association between a command and its data buffer
#[derive(Clone, Debug)]
pub struct DataTransferDescriptor {
    allowed: PlacementMask,
    placement: Placement,
    buffer: DataBuffer,
}

impl DataTransferDescriptor {
    /// Binds `buffer` to `command`.
    ///
    /// `allowed` must be a subset of the placements the command type
    /// authorized and must include [PlacementMask::FIRST_PAGE].
    pub fn attach(
        command: &mut CommandBuffer,
        allowed: PlacementMask,
        buffer: DataBuffer,
    ) -> Result<(), DescriptorError> {
        let authorized = command.authorized_placement();
        if allowed.is_empty()
            || !authorized.contains(allowed)
            || !allowed.contains(PlacementMask::FIRST_PAGE)
        {
            return Err(DescriptorError::PlacementNotAllowed {
                requested: allowed,
                authorized,
            });
        }

        let placement = Self::check_placement(allowed, &buffer)?;
        trace!(
            "attach {:#x} bytes to command {:#x} as {placement:?}",
            buffer.len(),
            command.opcode()
        );
        command.set_descriptor(Some(DataTransferDescriptor {
            allowed,
            placement,
            buffer,
        }));
        Ok(())
    }

    /// Replaces the buffer of an already attached descriptor, keeping its
    /// allowed placements.
    pub fn rebind(command: &mut CommandBuffer, buffer: DataBuffer) -> Result<(), DescriptorError> {
        let allowed = command
            .descriptor()
            .ok_or(DescriptorError::NotAttached)?
            .allowed;
        Self::attach(command, allowed, buffer)
    }

    /// Removes the data buffer from `command`
    pub fn detach(command: &mut CommandBuffer) -> Option<DataBuffer> {
        let descriptor = command.descriptor().cloned();
        command.set_descriptor(None);
        descriptor.map(|d| d.buffer)
    }

    fn check_placement(
        allowed: PlacementMask,
        buffer: &DataBuffer,
    ) -> Result<Placement, DescriptorError> {
        let placement = Placement::for_buffer(buffer);
        let too_large = DescriptorError::BufferTooLarge {
            pages: buffer.page_count(),
            allowed,
        };
        if !allowed.contains(placement.mask()) {
            return Err(too_large);
        }
        if let Placement::FirstAndList { entries } = placement {
            // chained lists are not supported
            if entries > PAGE_ENTRY_COUNT {
                return Err(too_large);
            }
        }
        Ok(placement)
    }

    pub fn allowed(&self) -> PlacementMask {
        self.allowed
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn buffer(&self) -> &DataBuffer {
        &self.buffer
    }

    /// Computes the PRP entries for the buffer.
    ///
    /// `base` is the page aligned bus address of the buffer memory,
    /// `list_address` the page aligned bus address of the PRP list page, which
    /// is only used for [Placement::FirstAndList].
    pub fn prp(&self, base: u64, list_address: u64) -> Prp {
        let page = |index: usize| PrpEntry(base + (index * PAGE_SIZE) as u64);
        let first = PrpEntry(base + self.buffer.offset() as u64);
        match self.placement {
            Placement::FirstPage => Prp::Entry(first),
            Placement::FirstAndSecondPage => Prp::DoubleEntry(first, page(1)),
            Placement::FirstAndList { entries } => Prp::List {
                first,
                list: PrpEntry(list_address),
                entries: (1..=entries).map(page).collect(),
            },
        }
    }
}

/// A Prp Entry
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PrpEntry(u64);

impl PrpEntry {
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Creates an entry for `address`, which must be dword aligned
    pub fn new(address: u64) -> Result<Self, MemoryError> {
        if address & 0b11 != 0 {
            return Err(MemoryError::NotDwordAligned(address as usize));
        }
        Ok(Self(address))
    }

    /// The page aligned part of the address
    pub fn page(&self) -> u64 {
        self.0 & !(PAGE_SIZE as u64 - 1)
    }

    pub fn offset(&self) -> usize {
        (self.0 & (PAGE_SIZE as u64 - 1)) as usize
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for PrpEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrpEntry")
            .field("page", &format_args!("{:#x}", self.page()))
            .field("offset", &format_args!("{:#x}", self.offset()))
            .finish()
    }
}

/// The PRP entries of a single command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prp {
    Entry(PrpEntry),
    DoubleEntry(PrpEntry, PrpEntry),
    List {
        first: PrpEntry,
        list: PrpEntry,
        entries: Vec<PrpEntry>,
    },
}

impl Prp {
    /// The first prp entry of the command
    pub fn entry_1(&self) -> PrpEntry {
        match self {
            Prp::Entry(e) | Prp::DoubleEntry(e, _) => *e,
            Prp::List { first, .. } => *first,
        }
    }

    /// The second prp entry of the command
    pub fn entry_2(&self) -> PrpEntry {
        match self {
            Prp::Entry(_) => PrpEntry::zero(),
            Prp::DoubleEntry(_, e) => *e,
            Prp::List { list, .. } => *list,
        }
    }

    /// The contents of the PRP list page, if any
    pub fn list_page(&self) -> Option<Vec<u8>> {
        let Prp::List { entries, .. } = self else {
            return None;
        };
        let mut page = vec![0; PAGE_SIZE];
        for (slot, entry) in page.chunks_exact_mut(8).zip(entries) {
            slot.copy_from_slice(&entry.0.to_le_bytes());
        }
        Some(page)
    }

    /// Writes both entries into the data pointer of a raw submission entry
    pub fn write_to(&self, entry: &mut [u8]) -> Result<(), FieldError> {
        let start = DATA_PTR_DWORD * DWORD_SIZE;
        let dword_count = entry.len() / DWORD_SIZE;
        let data_ptr = entry
            .get_mut(start..start + 16)
            .ok_or(FieldError::IndexOutOfRange {
                index: DATA_PTR_DWORD + 3,
                dword_count,
            })?;
        data_ptr[..8].copy_from_slice(&self.entry_1().0.to_le_bytes());
        data_ptr[8..].copy_from_slice(&self.entry_2().0.to_le_bytes());
        Ok(())
    }
}

/// Reads PRP entry 1 and 2 from a raw submission entry
pub fn read_data_pointer(entry: &[u8]) -> Option<(PrpEntry, PrpEntry)> {
    let start = DATA_PTR_DWORD * DWORD_SIZE;
    let data_ptr = entry.get(start..start + 16)?;
    let mut first = [0; 8];
    let mut second = [0; 8];
    first.copy_from_slice(&data_ptr[..8]);
    second.copy_from_slice(&data_ptr[8..]);
    Some((
        PrpEntry(u64::from_le_bytes(first)),
        PrpEntry(u64::from_le_bytes(second)),
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::generic_command::DataDirection;

    fn data_command() -> CommandBuffer {
        CommandBuffer::new(64, DataDirection::DeviceToHost).unwrap()
    }

    #[test]
    fn attach_records_descriptor() {
        let mut command = data_command();
        let buffer = DataBuffer::new(PAGE_SIZE).unwrap();
        DataTransferDescriptor::attach(&mut command, PlacementMask::FIRST_PAGE, buffer).unwrap();
        let descriptor = command.descriptor().unwrap();
        assert_eq!(descriptor.placement(), Placement::FirstPage);
        assert_eq!(descriptor.allowed(), PlacementMask::FIRST_PAGE);
    }

    #[test]
    fn unauthorized_placement() {
        let mut command = CommandBuffer::new(64, DataDirection::None).unwrap();
        let buffer = DataBuffer::new(16).unwrap();
        assert_eq!(
            DataTransferDescriptor::attach(&mut command, PlacementMask::FIRST_PAGE, buffer),
            Err(DescriptorError::PlacementNotAllowed {
                requested: PlacementMask::FIRST_PAGE,
                authorized: PlacementMask::empty(),
            })
        );

        let mut command = data_command();
        let buffer = DataBuffer::new(16).unwrap();
        assert!(matches!(
            DataTransferDescriptor::attach(&mut command, PlacementMask::SECOND_PAGE, buffer),
            Err(DescriptorError::PlacementNotAllowed { .. })
        ));
    }

    #[test]
    fn buffer_too_large() {
        let mut command = data_command();
        let buffer = DataBuffer::new(PAGE_SIZE + 4).unwrap();
        assert_eq!(
            DataTransferDescriptor::attach(&mut command, PlacementMask::FIRST_PAGE, buffer),
            Err(DescriptorError::BufferTooLarge {
                pages: 2,
                allowed: PlacementMask::FIRST_PAGE
            })
        );

        // a page offset pushes the data into a second page
        let buffer = DataBuffer::with_offset(PAGE_SIZE, 8).unwrap();
        assert!(DataTransferDescriptor::attach(
            &mut command,
            PlacementMask::FIRST_PAGE | PlacementMask::SECOND_PAGE,
            buffer
        )
        .is_ok());

        let buffer = DataBuffer::new(3 * PAGE_SIZE).unwrap();
        assert!(matches!(
            DataTransferDescriptor::attach(
                &mut command,
                PlacementMask::FIRST_PAGE | PlacementMask::SECOND_PAGE,
                buffer
            ),
            Err(DescriptorError::BufferTooLarge { pages: 3, .. })
        ));
    }

    #[test]
    fn rebind_keeps_allowed_mask() {
        let mut command = data_command();
        assert_eq!(
            DataTransferDescriptor::rebind(&mut command, DataBuffer::new(4).unwrap()),
            Err(DescriptorError::NotAttached)
        );
        DataTransferDescriptor::attach(
            &mut command,
            PlacementMask::FIRST_PAGE,
            DataBuffer::new(4).unwrap(),
        )
        .unwrap();
        DataTransferDescriptor::rebind(&mut command, DataBuffer::new(64).unwrap()).unwrap();
        assert_eq!(command.descriptor().unwrap().buffer().len(), 64);
        assert!(
            DataTransferDescriptor::rebind(&mut command, DataBuffer::new(2 * PAGE_SIZE).unwrap())
                .is_err()
        );
        assert!(DataTransferDescriptor::detach(&mut command).is_some());
        assert!(command.descriptor().is_none());
    }

    #[test]
    fn prp_list_layout() {
        let mut command = data_command();
        let buffer = DataBuffer::with_offset(3 * PAGE_SIZE, 0x10).unwrap();
        DataTransferDescriptor::attach(&mut command, PlacementMask::all(), buffer).unwrap();
        let descriptor = command.descriptor().unwrap();
        assert_eq!(descriptor.placement(), Placement::FirstAndList { entries: 3 });

        let prp = descriptor.prp(0x10_0000, 0x20_0000);
        assert_eq!(prp.entry_1().as_u64(), 0x10_0010);
        assert_eq!(prp.entry_2().as_u64(), 0x20_0000);
        let page = prp.list_page().unwrap();
        assert_eq!(&page[..8], &0x10_1000u64.to_le_bytes());
        assert_eq!(&page[16..24], &0x10_3000u64.to_le_bytes());
        assert_eq!(&page[24..32], &[0; 8]);

        let mut entry = [0; 64];
        prp.write_to(&mut entry).unwrap();
        let (first, second) = read_data_pointer(&entry).unwrap();
        assert_eq!(first.offset(), 0x10);
        assert_eq!(second.as_u64(), 0x20_0000);
    }

    #[test]
    fn write_to_short_entry() {
        let mut command = data_command();
        let buffer = DataBuffer::new(16).unwrap();
        DataTransferDescriptor::attach(&mut command, PlacementMask::FIRST_PAGE, buffer).unwrap();
        let prp = command.descriptor().unwrap().prp(0x10_0000, 0);
        let mut entry = [0; 32];
        assert_eq!(
            prp.write_to(&mut entry),
            Err(FieldError::IndexOutOfRange {
                index: DATA_PTR_DWORD + 3,
                dword_count: 8
            })
        );
    }
}
