//! Completion queue entries and the status they carry

use std::io;

use bit_field::BitField;
use shared_derive::U8Enum;
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::{dump::write_dwords, generic_command::CommandIdentifier, queue::QueueIdentifier};

/// The size of all completion entries
pub const COMPLETION_ENTRY_SIZE: usize = 16;
const_assert_eq!(COMPLETION_ENTRY_SIZE % 4, 0);

/// Decoded view of a single completion entry
///
/// See: NVM Express Base Spec: Figure 90: Common Completion Queue Entry Layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionRecord {
    /// Dword 0, command specific result
    pub result: u32,
    /// Dword 1, command specific
    pub dword1: u32,
    pub sq_head: u16,
    pub sq_id: QueueIdentifier,
    pub command_id: CommandIdentifier,
    pub status_and_phase: StatusAndPhase,
}

impl CompletionRecord {
    /// Creates a record with phase bit `false`
    pub fn new(
        command_id: CommandIdentifier,
        sq_id: QueueIdentifier,
        sq_head: u16,
        status: CommandStatusCode,
        result: u32,
    ) -> Self {
        Self {
            result,
            dword1: 0,
            sq_head,
            sq_id,
            command_id,
            status_and_phase: StatusAndPhase::from_status(status, false),
        }
    }

    pub fn from_bytes(bytes: &[u8; COMPLETION_ENTRY_SIZE]) -> Self {
        let dword = |index: usize| {
            u32::from_le_bytes([
                bytes[index * 4],
                bytes[index * 4 + 1],
                bytes[index * 4 + 2],
                bytes[index * 4 + 3],
            ])
        };
        let dword2 = dword(2);
        let dword3 = dword(3);
        Self {
            result: dword(0),
            dword1: dword(1),
            sq_head: dword2.get_bits(0..=15) as u16,
            sq_id: QueueIdentifier(dword2.get_bits(16..=31) as u16),
            command_id: CommandIdentifier(dword3.get_bits(0..=15) as u16),
            status_and_phase: StatusAndPhase(dword3.get_bits(16..=31) as u16),
        }
    }

    pub fn to_bytes(&self) -> [u8; COMPLETION_ENTRY_SIZE] {
        let mut dword2 = 0u32;
        dword2.set_bits(0..=15, self.sq_head as u32);
        dword2.set_bits(16..=31, self.sq_id.as_u16() as u32);
        let mut dword3 = 0u32;
        dword3.set_bits(0..=15, self.command_id.as_u16() as u32);
        dword3.set_bits(16..=31, self.status_and_phase.0 as u32);

        let mut bytes = [0; COMPLETION_ENTRY_SIZE];
        for (slot, dword) in bytes
            .chunks_exact_mut(4)
            .zip([self.result, self.dword1, dword2, dword3])
        {
            slot.copy_from_slice(&dword.to_le_bytes());
        }
        bytes
    }

    /// Returns a copy with the phase bit set to `phase`
    pub fn with_phase(mut self, phase: bool) -> Self {
        self.status_and_phase.0.set_bit(0, phase);
        self
    }

    pub fn phase(&self) -> bool {
        self.status_and_phase.phase()
    }

    pub fn status(&self) -> CommandStatusCode {
        self.status_and_phase.status()
    }

    pub fn dump(&self, sink: &mut impl io::Write, label: &str) -> io::Result<()> {
        write_dwords(sink, label, &self.to_bytes())?;
        writeln!(
            sink,
            "  cid: {:#x}, sq: {}, sq_head: {}, phase: {}, status: {}",
            self.command_id,
            self.sq_id.as_u16(),
            self.sq_head,
            self.phase(),
            self.status()
        )
    }
}

/// Status and Phase of a [CompletionRecord]
///
/// See: NVM Express Base Spec: Figure 93: Completion Queue Entry: Status Field
// NVMe combines this field with the command identifier into a u32.
// Bit 16 of that u32 is bit 0 here.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusAndPhase(pub(crate) u16);

impl StatusAndPhase {
    pub fn from_status(status: CommandStatusCode, phase: bool) -> Self {
        let (typ, code) = status.to_parts();
        let mut value = 0u16;
        value.set_bit(0, phase);
        value.set_bits(1..=8, code as u16);
        value.set_bits(9..=11, typ as u16);
        Self(value)
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn phase(&self) -> bool {
        self.0.get_bit(0)
    }

    pub fn status_code(&self) -> u8 {
        self.0.get_bits(1..=8) as u8
    }

    pub fn status_code_type(&self) -> u8 {
        self.0.get_bits(9..=11) as u8
    }

    pub fn common_retry_delay(&self) -> u8 {
        self.0.get_bits(12..=13) as u8
    }

    pub fn more(&self) -> bool {
        self.0.get_bit(14)
    }

    pub fn do_not_retry(&self) -> bool {
        self.0.get_bit(15)
    }

    pub fn status(&self) -> CommandStatusCode {
        let code = self.status_code();
        match self.status_code_type() {
            0 => match GenericCommandStatus::try_from(code) {
                Ok(status) => CommandStatusCode::GenericStatus(status),
                Err(_) => CommandStatusCode::UnknownGenericStatus(code),
            },
            1 => CommandStatusCode::CommandSpecificStatus(code),
            2 => CommandStatusCode::MediaAndDataIntegrityError(code),
            3 => CommandStatusCode::PathRelatedStatus(code),
            7 => CommandStatusCode::VendorSpecific(code),
            typ => CommandStatusCode::Reserved { typ, status: code },
        }
    }
}

/// StatusCode of a [CompletionRecord]
///
/// See: NVM Express Base Spec: Figure 94: Status Code Type Values
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum CommandStatusCode {
    #[error("Generic Command Status: {0:?}")]
    GenericStatus(GenericCommandStatus),
    #[error("Unknown Generic Command Status: {0:#x}")]
    UnknownGenericStatus(u8),
    #[error("Command specific status: {0:#x}")]
    CommandSpecificStatus(u8),
    #[error("Media and Data integrity error: {0:#x}")]
    MediaAndDataIntegrityError(u8),
    #[error("Path related status: {0:#x}")]
    PathRelatedStatus(u8),
    #[error("Reserved status: type {typ:#x}, code {status:#x}")]
    Reserved { typ: u8, status: u8 },
    #[error("Vendor specific status: {0:#x}")]
    VendorSpecific(u8),
}

impl CommandStatusCode {
    pub const SUCCESS: CommandStatusCode =
        CommandStatusCode::GenericStatus(GenericCommandStatus::Success);

    /// returns `true` if the status represents any type of error
    #[inline]
    pub fn is_err(self) -> bool {
        !self.is_success()
    }

    /// returns `true` if the status does not represents any type of error
    ///
    /// This is `true` for [GenericCommandStatus::Success]
    #[inline]
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// The status code type and status code
    pub fn to_parts(self) -> (u8, u8) {
        match self {
            CommandStatusCode::GenericStatus(status) => (0, status.into()),
            CommandStatusCode::UnknownGenericStatus(code) => (0, code),
            CommandStatusCode::CommandSpecificStatus(code) => (1, code),
            CommandStatusCode::MediaAndDataIntegrityError(code) => (2, code),
            CommandStatusCode::PathRelatedStatus(code) => (3, code),
            CommandStatusCode::Reserved { typ, status } => (typ & 0b111, status),
            CommandStatusCode::VendorSpecific(code) => (7, code),
        }
    }
}

impl From<GenericCommandStatus> for CommandStatusCode {
    fn from(value: GenericCommandStatus) -> Self {
        CommandStatusCode::GenericStatus(value)
    }
}

/// Generic Status Code of a [CompletionRecord]
///
/// See: NVM Express Base Spec: Figure 95: Generic Command Status Values
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, U8Enum)]
pub enum GenericCommandStatus {
    Success = 0,
    InvalidCommandOpcode = 1,
    InvalidFieldInCommand = 2,
    CommandIdConflict = 3,
    DataTransferError = 4,
    CommandAbortedPowerLoss = 5,
    InternalError = 6,
    AbortRequested = 7,
    AbortSqDeletion = 8,
    AbortFailedFuse = 9,
    AbortMissingFuse = 0xa,
    InvalidNamespaceOrFormat = 0xb,
    CommandSequenceError = 0xc,
    InvalidSglSegmentDescriptor = 0xd,
    InvalidSglCount = 0xe,
    InvalidDataSglLength = 0xf,
    InvalidMetadataSglLength = 0x10,
    InvalidSglType = 0x11,
    InvalidUseOfControllerMemBuf = 0x12,
    InvalidPrpOffset = 0x13,
    AtomicWriteExceeded = 0x14,
    OperationDenied = 0x15,
    InvalidSglOffset = 0x16,
    // reserved 0x17
    HostIdInconsistentFormat = 0x18,
    KeepAliveExpired = 0x19,
    InvalidKeepAliveTimeout = 0x1a,
    AbortDueToPreemptAbort = 0x1b,
    SanitizeFailed = 0x1c,
    SanitizeInProgress = 0x1d,
    InvalidSglBlockGranularity = 0x1e,
    NotSupportedForQueueInCmb = 0x1f,
    NamespaceWriteProtected = 0x20,
    Interrupted = 0x21,
    TransientTransportError = 0x22,
    ProhibitedByLockdown = 0x23,
    AdminCommandMediaNotReady = 0x24,
    // reserved 0x25 .. 0x7f
    LbaOutOfRange = 0x80,
    CapacityExceeded = 0x81,
    NamespaceNotReady = 0x82,
    ReservationConflict = 0x83,
    FormatInProgress = 0x84,
    InvalidValueSize = 0x85,
    InvalidKeySize = 0x86,
    KvKeyDoesNotExist = 0x87,
    UnrecoveredError = 0x88,
    KeyExists = 0x89,
    // reserved 0x90 .. 0xbf
    // vendor specific 0xc0 .. 0xff
}
