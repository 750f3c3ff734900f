use bit_field::BitField;
use shared_derive::U8Enum;

use crate::{
    generic_command::{CommandBuffer, CommandIdentifier, FieldError, FieldSpec, DWORD_SIZE},
    kind::CommandKind,
    memory::DataBuffer,
    prp::{DataTransferDescriptor, DescriptorError, PlacementMask},
    queue::QueueIdentifier,
};

pub const ABORT_SQID: FieldSpec = FieldSpec::new("SQID", 10, 0, 15);
pub const ABORT_CID: FieldSpec = FieldSpec::new("CID", 10, 16, 31);
pub const ABORT_FIELDS: &[FieldSpec] = &[ABORT_SQID, ABORT_CID];

pub const LOG_PAGE_ID: FieldSpec = FieldSpec::new("LID", 10, 0, 7);
/// Lower 16 bits of the 0 based dword count
pub const LOG_PAGE_NUMDL: FieldSpec = FieldSpec::new("NUMDL", 10, 16, 31);
/// Upper 16 bits of the 0 based dword count
pub const LOG_PAGE_NUMDU: FieldSpec = FieldSpec::new("NUMDU", 11, 0, 15);
pub const LOG_PAGE_OFFSET_LOW: FieldSpec = FieldSpec::dword("LPOL", 12);
pub const LOG_PAGE_OFFSET_HIGH: FieldSpec = FieldSpec::dword("LPOU", 13);
pub const GET_LOG_PAGE_FIELDS: &[FieldSpec] = &[
    LOG_PAGE_ID,
    LOG_PAGE_NUMDL,
    LOG_PAGE_NUMDU,
    LOG_PAGE_OFFSET_LOW,
    LOG_PAGE_OFFSET_HIGH,
];

/// See: NVM Express Base Spec: Figure 202: Get Log Page – Log Page Identifiers
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum LogPageIdentifier {
    ErrorInformation = 0x1,
    SmartHealthInformation = 0x2,
    FirmwareSlotInformation = 0x3,
}

/// Create the [CommandBuffer] for an abort command
///
/// See: NVM Express Base Spec: 5.1
pub fn abort(
    queue: QueueIdentifier,
    command_id: CommandIdentifier,
) -> Result<CommandBuffer, FieldError> {
    let mut command = CommandBuffer::for_kind(CommandKind::Abort)?;
    command.set_field(&ABORT_SQID, queue.as_u16() as u32)?;
    command.set_field(&ABORT_CID, command_id.as_u16() as u32)?;
    Ok(command)
}

/// `true` if the abort result (dword 0) reports that the command was not
/// aborted
pub fn abort_not_performed(result: u32) -> bool {
    result.get_bit(0)
}

/// Create the [CommandBuffer] for a keep alive command
///
/// See: NVM Express Base Spec: 5.25
pub fn keep_alive() -> Result<CommandBuffer, FieldError> {
    CommandBuffer::for_kind(CommandKind::KeepAlive)
}

/// Create the [CommandBuffer] for a get log page command reading
/// `data.len()` bytes, which must be a multiple of 4.
///
/// See: NVM Express Base Spec: 5.16
pub fn get_log_page(
    log_page: u8,
    nsid: u32,
    offset: u64,
    allowed: PlacementMask,
    data: DataBuffer,
) -> Result<CommandBuffer, DescriptorError> {
    if data.len() % DWORD_SIZE != 0 {
        return Err(FieldError::InvalidSize(data.len()).into());
    }
    let dwords = (data.len() / DWORD_SIZE - 1) as u32;

    let mut command = CommandBuffer::for_kind(CommandKind::GetLogPage)?;
    command.set_namespace_id(nsid)?;
    command.set_field(&LOG_PAGE_ID, log_page as u32)?;
    command.set_field(&LOG_PAGE_NUMDL, dwords.get_bits(0..=15))?;
    command.set_field(&LOG_PAGE_NUMDU, dwords.get_bits(16..=31))?;
    command.set_field(&LOG_PAGE_OFFSET_LOW, offset.get_bits(0..=31) as u32)?;
    command.set_field(&LOG_PAGE_OFFSET_HIGH, offset.get_bits(32..=63) as u32)?;
    DataTransferDescriptor::attach(&mut command, allowed, data)?;
    Ok(command)
}

/// The number of bytes a get log page command transfers
pub fn log_page_length(command: &CommandBuffer) -> Result<usize, FieldError> {
    let low = command.field(&LOG_PAGE_NUMDL)?;
    let high = command.field(&LOG_PAGE_NUMDU)?;
    Ok(((high << 16 | low) as usize + 1) * DWORD_SIZE)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::PAGE_SIZE;

    #[test]
    fn abort_fields() {
        let command = abort(QueueIdentifier::new(1), CommandIdentifier::new(0x1234)).unwrap();
        assert_eq!(command.opcode(), 0x08);
        assert_eq!(command.get_dword(10).unwrap(), 0x1234_0001);
    }

    #[test]
    fn log_page_length_round_trip() {
        let command = get_log_page(
            LogPageIdentifier::SmartHealthInformation.into(),
            0xffff_ffff,
            0,
            PlacementMask::all(),
            DataBuffer::new(512).unwrap(),
        )
        .unwrap();
        assert_eq!(command.opcode(), 0x02);
        assert_eq!(command.get_dword(10).unwrap(), 0x007f_0002);
        assert_eq!(log_page_length(&command).unwrap(), 512);
    }

    #[test]
    fn log_page_placement_is_checked() {
        let result = get_log_page(
            LogPageIdentifier::ErrorInformation.into(),
            0,
            0,
            PlacementMask::FIRST_PAGE,
            DataBuffer::new(2 * PAGE_SIZE).unwrap(),
        );
        assert!(matches!(
            result,
            Err(DescriptorError::BufferTooLarge { pages: 2, .. })
        ));
        assert!(keep_alive().unwrap().descriptor().is_none());
    }
}
