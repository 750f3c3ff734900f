use crate::{
    generic_command::{CommandBuffer, FieldError, FieldSpec},
    kind::CommandKind,
    memory::DataBuffer,
    prp::{DataTransferDescriptor, DescriptorError},
};

use super::Lba;

pub const SLBA_LOW: FieldSpec = FieldSpec::dword("SLBA", 10);
pub const SLBA_HIGH: FieldSpec = FieldSpec::dword("SLBA_HI", 11);
/// 0 based
pub const BLOCK_COUNT: FieldSpec = FieldSpec::new("NLB", 12, 0, 15);
pub const FORCE_UNIT_ACCESS: FieldSpec = FieldSpec::new("FUA", 12, 30, 30);
pub const LIMITED_RETRY: FieldSpec = FieldSpec::new("LR", 12, 31, 31);
pub const READ_WRITE_FIELDS: &[FieldSpec] = &[
    SLBA_LOW,
    SLBA_HIGH,
    BLOCK_COUNT,
    FORCE_UNIT_ACCESS,
    LIMITED_RETRY,
];

fn read_write(
    kind: CommandKind,
    nsid: u32,
    slba: Lba,
    block_count: u16,
    data: DataBuffer,
) -> Result<CommandBuffer, DescriptorError> {
    let mut command = CommandBuffer::for_kind(kind)?;
    command.set_namespace_id(nsid)?;

    let slba = slba.value();
    command.set_field(&SLBA_LOW, (slba & 0xffff_ffff) as u32)?;
    command.set_field(&SLBA_HIGH, (slba >> 32) as u32)?;
    // set block count as 0 based value
    command.set_field(&BLOCK_COUNT, block_count.saturating_sub(1) as u32)?;

    let allowed = command.authorized_placement();
    DataTransferDescriptor::attach(&mut command, allowed, data)?;
    Ok(command)
}

/// Create the [CommandBuffer] for a read command
///
/// See: NVM Command Spec: 3.3.4
pub fn nvm_read(
    nsid: u32,
    slba: Lba,
    block_count: u16,
    data: DataBuffer,
) -> Result<CommandBuffer, DescriptorError> {
    read_write(CommandKind::Read, nsid, slba, block_count, data)
}

/// Create the [CommandBuffer] for a write command
///
/// See: NVM Command Spec: 3.3.6
pub fn nvm_write(
    nsid: u32,
    slba: Lba,
    block_count: u16,
    data: DataBuffer,
) -> Result<CommandBuffer, DescriptorError> {
    read_write(CommandKind::Write, nsid, slba, block_count, data)
}

/// Create the [CommandBuffer] for a flush command
///
/// See: NVM Command Spec: 3.3.2
pub fn nvm_flush(nsid: u32) -> Result<CommandBuffer, FieldError> {
    let mut command = CommandBuffer::for_kind(CommandKind::Flush)?;
    command.set_namespace_id(nsid)?;
    Ok(command)
}

/// The starting block and 1 based block count of a read or write command
pub fn block_range(command: &CommandBuffer) -> Result<(Lba, u32), FieldError> {
    let low = command.field(&SLBA_LOW)? as u64;
    let high = command.field(&SLBA_HIGH)? as u64;
    let count = command.field(&BLOCK_COUNT)? + 1;
    Ok((Lba::new(high << 32 | low), count))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{generic_command::DataDirection, memory::PAGE_SIZE, prp::Placement};

    #[test]
    fn write_fields() {
        let command = nvm_write(
            1,
            Lba::new(0x1_0000_0002),
            8,
            DataBuffer::new(8 * 512).unwrap(),
        )
        .unwrap();
        assert_eq!(command.opcode(), 0x01);
        assert_eq!(command.direction(), DataDirection::HostToDevice);
        assert_eq!(command.namespace_id().unwrap(), 1);
        assert_eq!(command.get_dword(10).unwrap(), 2);
        assert_eq!(command.get_dword(11).unwrap(), 1);
        assert_eq!(command.get_dword(12).unwrap(), 7);
        assert_eq!(block_range(&command).unwrap(), (Lba::new(0x1_0000_0002), 8));
    }

    #[test]
    fn large_read_uses_prp_list() {
        let command = nvm_read(1, Lba::new(0), 32, DataBuffer::new(4 * PAGE_SIZE).unwrap()).unwrap();
        assert_eq!(command.opcode(), 0x02);
        assert_eq!(
            command.descriptor().unwrap().placement(),
            Placement::FirstAndList { entries: 3 }
        );
    }

    #[test]
    fn flush_has_no_data() {
        let command = nvm_flush(1).unwrap();
        assert_eq!(command.opcode(), 0x00);
        assert!(command.authorized_placement().is_empty());
    }
}
