//! Data shared between all Command types
//!
//! Every command is a flat array of little endian dwords. [CommandBuffer]
//! provides bounds checked access to that array and to the fields of
//! Command Dword 0 and the namespace identifier that all commands share.
//!
//! See: NVM Express Base Spec: Figure 87/88: Common Command Format

use std::io;

use bit_field::BitField;
use shared_derive::U8Enum;
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::{
    dump::write_dwords,
    kind::CommandKind,
    prp::{DataTransferDescriptor, PlacementMask},
};

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
pub struct CommandIdentifier(pub(crate) u16);

impl CommandIdentifier {
    /// Used by some completions to refer to an error that is not associated
    /// with any command. Never assigned to a submitted command.
    pub const UNASSOCIATED: CommandIdentifier = CommandIdentifier(0xffff);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl core::fmt::LowerHex for CommandIdentifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl core::fmt::UpperHex for CommandIdentifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::UpperHex::fmt(&self.0, f)
    }
}

/// The size of all submission command entries
pub const SUBMISSION_ENTRY_SIZE: usize = 64;
/// The size of a dword in bytes
pub const DWORD_SIZE: usize = 4;
const_assert_eq!(SUBMISSION_ENTRY_SIZE % DWORD_SIZE, 0);

/// Dword index of the first data pointer (PRP entry 1)
pub const DATA_PTR_DWORD: usize = 6;

/// The direction of the data transfer of a command.
///
/// Matches the low 2 bits of the opcode for all standard commands.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum DataDirection {
    None = 0b00,
    HostToDevice = 0b01,
    DeviceToHost = 0b10,
}

/// Fused Operation, Command Dword 0 bits 9:8
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum FusedOperation {
    Normal = 0b00,
    FirstCommand = 0b01,
    SecondCommand = 0b10,
    Reserved = 0b11,
}

/// The width of a sub-dword accessor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    Word,
    Byte,
    Bit,
}

impl FieldWidth {
    fn slots(self) -> u8 {
        match self {
            FieldWidth::Word => 2,
            FieldWidth::Byte => 4,
            FieldWidth::Bit => 32,
        }
    }
}

/// Errors of field access on a [CommandBuffer].
///
/// These are always bugs in the code building the command.
#[allow(missing_docs)]
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum FieldError {
    #[error("command size of {0} bytes is not a positive multiple of 4")]
    InvalidSize(usize),
    #[error("dword index {index} is out of range for a command of {dword_count} dwords")]
    IndexOutOfRange { index: usize, dword_count: usize },
    #[error("offset {offset} is out of range for a {width:?} field")]
    InvalidOffset { width: FieldWidth, offset: u8 },
    #[error("value {value:#x} does not fit into field {name} (bits {first_bit}..={last_bit})")]
    ValueTooWide {
        name: &'static str,
        value: u32,
        first_bit: u8,
        last_bit: u8,
    },
}

/// A named bit range within one dword of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub dword: usize,
    pub first_bit: u8,
    pub last_bit: u8,
}

impl FieldSpec {
    pub const fn new(name: &'static str, dword: usize, first_bit: u8, last_bit: u8) -> Self {
        assert!(first_bit <= last_bit && last_bit < 32);
        Self {
            name,
            dword,
            first_bit,
            last_bit,
        }
    }

    /// A field covering the whole dword
    pub const fn dword(name: &'static str, dword: usize) -> Self {
        Self::new(name, dword, 0, 31)
    }

    /// The largest value the field can hold
    pub fn max_value(&self) -> u32 {
        let width = (self.last_bit - self.first_bit + 1) as u32;
        if width == 32 {
            u32::MAX
        } else {
            (1 << width) - 1
        }
    }
}

/// Dword 0 bits 7:0
pub const OPCODE: FieldSpec = FieldSpec::new("OPC", 0, 0, 7);
/// Dword 0 bits 9:8
pub const FUSE: FieldSpec = FieldSpec::new("FUSE", 0, 8, 9);
/// Dword 0 bits 15:14, always 0 (PRPs) for commands built here
pub const PSDT: FieldSpec = FieldSpec::new("PSDT", 0, 14, 15);
/// Dword 0 bits 31:16
pub const COMMAND_ID: FieldSpec = FieldSpec::new("CID", 0, 16, 31);
/// Dword 1
pub const NAMESPACE_ID: FieldSpec = FieldSpec::dword("NSID", 1);

/// A single command in its binary form.
///
/// The buffer is created zeroed, either with an arbitrary dword granular size
/// through [CommandBuffer::new], or for a known [CommandKind] through
/// [CommandBuffer::for_kind].
///
/// The command identifier is assigned by the transport when the command is
/// submitted. Any value set before that is overwritten.
#[derive(Clone)]
pub struct CommandBuffer {
    bytes: Vec<u8>,
    direction: DataDirection,
    kind: Option<CommandKind>,
    authorized_placement: PlacementMask,
    descriptor: Option<DataTransferDescriptor>,
}

impl CommandBuffer {
    /// Creates a zeroed command of `size` bytes.
    ///
    /// `size` must be a positive multiple of 4. Commands without data
    /// may not bind any data buffer, all others may use any placement.
    pub fn new(size: usize, direction: DataDirection) -> Result<Self, FieldError> {
        if size == 0 || size % DWORD_SIZE != 0 {
            return Err(FieldError::InvalidSize(size));
        }
        let authorized_placement = match direction {
            DataDirection::None => PlacementMask::empty(),
            _ => PlacementMask::all(),
        };
        Ok(Self {
            bytes: vec![0; size],
            direction,
            kind: None,
            authorized_placement,
            descriptor: None,
        })
    }

    /// Creates a command holding a copy of `bytes`
    pub fn from_bytes(bytes: &[u8], direction: DataDirection) -> Result<Self, FieldError> {
        let mut command = Self::new(bytes.len(), direction)?;
        command.bytes.copy_from_slice(bytes);
        Ok(command)
    }

    /// Creates a [SUBMISSION_ENTRY_SIZE] command for `kind`.
    ///
    /// The opcode, data direction and allowed data placements are taken from
    /// the [KindLayout](crate::kind::KindLayout) of `kind`.
    pub fn for_kind(kind: CommandKind) -> Result<Self, FieldError> {
        let layout = kind.layout();
        let mut command = Self::new(SUBMISSION_ENTRY_SIZE, layout.direction)?;
        command.kind = Some(kind);
        command.authorized_placement = layout.placement;
        command.set_opcode(layout.opcode);
        Ok(command)
    }

    /// The size of the command in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always `false`, commands hold at least 1 dword
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn dword_count(&self) -> usize {
        self.bytes.len() / DWORD_SIZE
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn direction(&self) -> DataDirection {
        self.direction
    }

    /// The [CommandKind] if this command was created through [Self::for_kind]
    pub fn kind(&self) -> Option<CommandKind> {
        self.kind
    }

    /// The data placements this command may ever use
    pub fn authorized_placement(&self) -> PlacementMask {
        self.authorized_placement
    }

    pub fn descriptor(&self) -> Option<&DataTransferDescriptor> {
        self.descriptor.as_ref()
    }

    pub(crate) fn set_descriptor(&mut self, descriptor: Option<DataTransferDescriptor>) {
        self.descriptor = descriptor;
    }

    fn check_index(&self, index: usize) -> Result<(), FieldError> {
        if index >= self.dword_count() {
            return Err(FieldError::IndexOutOfRange {
                index,
                dword_count: self.dword_count(),
            });
        }
        Ok(())
    }

    fn check_offset(width: FieldWidth, offset: u8) -> Result<(), FieldError> {
        if offset >= width.slots() {
            return Err(FieldError::InvalidOffset { width, offset });
        }
        Ok(())
    }

    pub fn get_dword(&self, index: usize) -> Result<u32, FieldError> {
        self.check_index(index)?;
        let start = index * DWORD_SIZE;
        let mut dword = [0; DWORD_SIZE];
        dword.copy_from_slice(&self.bytes[start..start + DWORD_SIZE]);
        Ok(u32::from_le_bytes(dword))
    }

    pub fn set_dword(&mut self, index: usize, value: u32) -> Result<(), FieldError> {
        self.check_index(index)?;
        let start = index * DWORD_SIZE;
        self.bytes[start..start + DWORD_SIZE].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Reads the 16 bit word `offset` (0 or 1) of dword `index`
    pub fn get_word(&self, index: usize, offset: u8) -> Result<u16, FieldError> {
        Self::check_offset(FieldWidth::Word, offset)?;
        let bits = offset as usize * 16;
        Ok(self.get_dword(index)?.get_bits(bits..bits + 16) as u16)
    }

    pub fn set_word(&mut self, index: usize, offset: u8, value: u16) -> Result<(), FieldError> {
        Self::check_offset(FieldWidth::Word, offset)?;
        let bits = offset as usize * 16;
        let mut dword = self.get_dword(index)?;
        dword.set_bits(bits..bits + 16, value as u32);
        self.set_dword(index, dword)
    }

    /// Reads the byte `offset` (0 to 3) of dword `index`
    pub fn get_byte(&self, index: usize, offset: u8) -> Result<u8, FieldError> {
        Self::check_offset(FieldWidth::Byte, offset)?;
        let bits = offset as usize * 8;
        Ok(self.get_dword(index)?.get_bits(bits..bits + 8) as u8)
    }

    pub fn set_byte(&mut self, index: usize, offset: u8, value: u8) -> Result<(), FieldError> {
        Self::check_offset(FieldWidth::Byte, offset)?;
        let bits = offset as usize * 8;
        let mut dword = self.get_dword(index)?;
        dword.set_bits(bits..bits + 8, value as u32);
        self.set_dword(index, dword)
    }

    /// Reads the bit `offset` (0 to 31) of dword `index`
    pub fn get_bit(&self, index: usize, offset: u8) -> Result<bool, FieldError> {
        Self::check_offset(FieldWidth::Bit, offset)?;
        Ok(self.get_dword(index)?.get_bit(offset as usize))
    }

    pub fn set_bit(&mut self, index: usize, offset: u8, value: bool) -> Result<(), FieldError> {
        Self::check_offset(FieldWidth::Bit, offset)?;
        let mut dword = self.get_dword(index)?;
        dword.set_bit(offset as usize, value);
        self.set_dword(index, dword)
    }

    /// Reads a named field
    pub fn field(&self, field: &FieldSpec) -> Result<u32, FieldError> {
        Ok(self
            .get_dword(field.dword)?
            .get_bits(field.first_bit as usize..=field.last_bit as usize))
    }

    /// Writes a named field, leaving all other bits of its dword untouched
    pub fn set_field(&mut self, field: &FieldSpec, value: u32) -> Result<(), FieldError> {
        if value > field.max_value() {
            return Err(FieldError::ValueTooWide {
                name: field.name,
                value,
                first_bit: field.first_bit,
                last_bit: field.last_bit,
            });
        }
        let mut dword = self.get_dword(field.dword)?;
        dword.set_bits(field.first_bit as usize..=field.last_bit as usize, value);
        self.set_dword(field.dword, dword)
    }

    // dword 0 always exists, so the accessors for its fields can not fail

    fn dword0(&self) -> u32 {
        u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    fn set_dword0(&mut self, value: u32) {
        self.bytes[..DWORD_SIZE].copy_from_slice(&value.to_le_bytes());
    }

    pub fn opcode(&self) -> u8 {
        self.dword0().get_bits(0..=7) as u8
    }

    pub fn set_opcode(&mut self, value: u8) {
        let mut dword = self.dword0();
        dword.set_bits(0..=7, value as u32);
        self.set_dword0(dword);
    }

    pub fn fused_op(&self) -> FusedOperation {
        match self.dword0().get_bits(8..=9) {
            0b00 => FusedOperation::Normal,
            0b01 => FusedOperation::FirstCommand,
            0b10 => FusedOperation::SecondCommand,
            _ => FusedOperation::Reserved,
        }
    }

    pub fn set_fused_op(&mut self, value: FusedOperation) {
        let mut dword = self.dword0();
        dword.set_bits(8..=9, u8::from(value) as u32);
        self.set_dword0(dword);
    }

    /// The command identifier.
    ///
    /// Only meaningful after the command was submitted, at which point the
    /// transport assigned value is written back into the buffer.
    pub fn command_id(&self) -> CommandIdentifier {
        CommandIdentifier(self.dword0().get_bits(16..=31) as u16)
    }

    pub(crate) fn set_command_id(&mut self, value: CommandIdentifier) {
        let mut dword = self.dword0();
        dword.set_bits(16..=31, value.0 as u32);
        self.set_dword0(dword);
    }

    pub fn namespace_id(&self) -> Result<u32, FieldError> {
        self.get_dword(NAMESPACE_ID.dword)
    }

    pub fn set_namespace_id(&mut self, value: u32) -> Result<(), FieldError> {
        self.set_dword(NAMESPACE_ID.dword, value)
    }

    /// Writes a hex snapshot of the command to `sink`.
    ///
    /// Commands of a known kind also list their named fields.
    pub fn dump(&self, sink: &mut impl io::Write, label: &str) -> io::Result<()> {
        write_dwords(sink, label, &self.bytes)?;
        if let Some(kind) = self.kind {
            writeln!(sink, "  kind: {kind:?}")?;
            for field in kind.layout().fields {
                if let Ok(value) = self.field(field) {
                    writeln!(sink, "  {}: {value:#x}", field.name)?;
                }
            }
        }
        if let Some(descriptor) = &self.descriptor {
            writeln!(sink, "  data: {descriptor:?}")?;
        }
        Ok(())
    }
}

impl core::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("kind", &self.kind)
            .field("opcode", &format_args!("{:#x}", self.opcode()))
            .field("command_id", &format_args!("{:#x}", self.command_id()))
            .field("len", &self.bytes.len())
            .field("direction", &self.direction)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
