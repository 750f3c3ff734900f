use bit_field::BitField;

use crate::{
    generic_command::{CommandBuffer, FieldSpec},
    kind::CommandKind,
    memory::DataBuffer,
    prp::{DataTransferDescriptor, DescriptorError},
};

/// The size of all identify data structures
pub const IDENTIFY_DATA_SIZE: usize = 4096;

pub const IDENTIFY_CNS: FieldSpec = FieldSpec::new("CNS", 10, 0, 7);
pub const IDENTIFY_CNTID: FieldSpec = FieldSpec::new("CNTID", 10, 16, 31);
pub const IDENTIFY_CSI: FieldSpec = FieldSpec::new("CSI", 11, 24, 31);
pub const IDENTIFY_FIELDS: &[FieldSpec] = &[IDENTIFY_CNS, IDENTIFY_CNTID, IDENTIFY_CSI];

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
/// CNS Value
///
/// See: NVM Express Base Spec: Figure 274: Identify CNS Value
pub enum IdentifyCns {
    Namespace { nsid: u32 },
    Controller,
    ActiveNamespaces { start_after: u32 },
}

impl IdentifyCns {
    pub fn cns(&self) -> u8 {
        match self {
            IdentifyCns::Namespace { .. } => 0x0,
            IdentifyCns::Controller => 0x1,
            IdentifyCns::ActiveNamespaces { .. } => 0x2,
        }
    }
}

/// Create the [CommandBuffer] for an identify command
///
/// See: NVM Express Base Spec: 5.17
pub fn identify(cns: IdentifyCns, data: DataBuffer) -> Result<CommandBuffer, DescriptorError> {
    if data.len() < IDENTIFY_DATA_SIZE {
        return Err(DescriptorError::BufferTooSmall {
            required: IDENTIFY_DATA_SIZE,
            available: data.len(),
        });
    }
    let mut command = CommandBuffer::for_kind(CommandKind::Identify)?;
    command.set_field(&IDENTIFY_CNS, cns.cns() as u32)?;
    match cns {
        IdentifyCns::Namespace { nsid } => command.set_namespace_id(nsid)?,
        IdentifyCns::ActiveNamespaces { start_after } => command.set_namespace_id(start_after)?,
        IdentifyCns::Controller => {
            // NSID, CNTID and CSI not used
        }
    }
    let allowed = command.authorized_placement();
    DataTransferDescriptor::attach(&mut command, allowed, data)?;
    Ok(command)
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

fn write_ascii_field(target: &mut [u8], value: &str) {
    target.fill(b' ');
    let len = value.len().min(target.len());
    target[..len].copy_from_slice(&value.as_bytes()[..len]);
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    read_u32(bytes, at) as u64 | (read_u32(bytes, at + 4) as u64) << 32
}

/// The parts of the identify controller data the exerciser uses
///
/// See: NVM Express Base Spec: Figure 276: Identify Controller Data Structure
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentifyControllerData {
    pub pci_vendor_id: u16,
    pub pci_subsystem_vendor_id: u16,
    pub serial_number: String,
    pub model_number: String,
    pub firmware_revision: String,
    /// Power of two in units of the minimum page size, 0 means no limit
    pub maximum_data_transfer_size: u8,
    pub controller_id: u16,
    pub version: u32,
    pub number_of_namespaces: u32,
}

impl IdentifyControllerData {
    pub fn parse(bytes: &[u8; IDENTIFY_DATA_SIZE]) -> Self {
        Self {
            pci_vendor_id: read_u16(bytes, 0),
            pci_subsystem_vendor_id: read_u16(bytes, 2),
            serial_number: ascii_field(&bytes[4..24]),
            model_number: ascii_field(&bytes[24..64]),
            firmware_revision: ascii_field(&bytes[64..72]),
            maximum_data_transfer_size: bytes[77],
            controller_id: read_u16(bytes, 78),
            version: read_u32(bytes, 80),
            number_of_namespaces: read_u32(bytes, 516),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8; IDENTIFY_DATA_SIZE]) {
        bytes[0..2].copy_from_slice(&self.pci_vendor_id.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.pci_subsystem_vendor_id.to_le_bytes());
        write_ascii_field(&mut bytes[4..24], &self.serial_number);
        write_ascii_field(&mut bytes[24..64], &self.model_number);
        write_ascii_field(&mut bytes[64..72], &self.firmware_revision);
        bytes[77] = self.maximum_data_transfer_size;
        bytes[78..80].copy_from_slice(&self.controller_id.to_le_bytes());
        bytes[80..84].copy_from_slice(&self.version.to_le_bytes());
        bytes[516..520].copy_from_slice(&self.number_of_namespaces.to_le_bytes());
    }

    /// The version as `(major, minor, tertiary)`
    pub fn version_parts(&self) -> (u16, u8, u8) {
        (
            self.version.get_bits(16..=31) as u16,
            self.version.get_bits(8..=15) as u8,
            self.version.get_bits(0..=7) as u8,
        )
    }
}

/// The parts of the identify namespace data the exerciser uses
///
/// See: NVM Command Set Spec: Figure 97: Identify Namespace Data Structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdentifyNamespaceData {
    /// Namespace size in logical blocks
    pub size: u64,
    pub capacity: u64,
    pub utilization: u64,
    /// log2 of the logical block size of the active LBA format
    pub lba_data_size: u8,
}

impl IdentifyNamespaceData {
    pub fn parse(bytes: &[u8; IDENTIFY_DATA_SIZE]) -> Self {
        let format = bytes[26].get_bits(0..=3) as usize;
        let lba_format = read_u32(bytes, 128 + format * 4);
        Self {
            size: read_u64(bytes, 0),
            capacity: read_u64(bytes, 8),
            utilization: read_u64(bytes, 16),
            lba_data_size: lba_format.get_bits(16..=23) as u8,
        }
    }

    /// Writes the data using LBA format 0
    pub fn write_to(&self, bytes: &mut [u8; IDENTIFY_DATA_SIZE]) {
        bytes[0..8].copy_from_slice(&self.size.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.capacity.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.utilization.to_le_bytes());
        bytes[26] = 0;
        let mut lba_format = 0u32;
        lba_format.set_bits(16..=23, self.lba_data_size as u32);
        bytes[128..132].copy_from_slice(&lba_format.to_le_bytes());
    }

    pub fn block_size(&self) -> usize {
        1 << self.lba_data_size
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{generic_command::DataDirection, prp::Placement};

    #[test]
    fn identify_controller_command() {
        let command = identify(
            IdentifyCns::Controller,
            DataBuffer::new(IDENTIFY_DATA_SIZE).unwrap(),
        )
        .unwrap();
        assert_eq!(command.opcode(), 0x06);
        assert_eq!(command.direction(), DataDirection::DeviceToHost);
        assert_eq!(command.field(&IDENTIFY_CNS).unwrap(), 1);
        assert_eq!(command.namespace_id().unwrap(), 0);
        assert_eq!(
            command.descriptor().unwrap().placement(),
            Placement::FirstPage
        );
    }

    #[test]
    fn identify_namespace_command() {
        let command = identify(
            IdentifyCns::Namespace { nsid: 1 },
            DataBuffer::new(IDENTIFY_DATA_SIZE).unwrap(),
        )
        .unwrap();
        assert_eq!(command.field(&IDENTIFY_CNS).unwrap(), 0);
        assert_eq!(command.namespace_id().unwrap(), 1);
    }

    #[test]
    fn identify_needs_a_full_page() {
        assert_eq!(
            identify(IdentifyCns::Controller, DataBuffer::new(512).unwrap()).unwrap_err(),
            DescriptorError::BufferTooSmall {
                required: IDENTIFY_DATA_SIZE,
                available: 512
            }
        );
    }

    #[test]
    fn controller_data_layout() {
        let data = IdentifyControllerData {
            pci_vendor_id: 0x1b36,
            pci_subsystem_vendor_id: 0x1af4,
            serial_number: "SERIAL".into(),
            model_number: "Model".into(),
            firmware_revision: "1.0".into(),
            maximum_data_transfer_size: 5,
            controller_id: 1,
            version: 0x0001_0400,
            number_of_namespaces: 1,
        };
        let mut bytes = [0; IDENTIFY_DATA_SIZE];
        data.write_to(&mut bytes);
        assert_eq!(&bytes[0..2], &[0x36, 0x1b]);
        assert_eq!(&bytes[4..10], b"SERIAL");
        assert_eq!(bytes[10], b' ');
        assert_eq!(IdentifyControllerData::parse(&bytes), data);
        assert_eq!(data.version_parts(), (1, 4, 0));
    }

    #[test]
    fn namespace_data_layout() {
        let data = IdentifyNamespaceData {
            size: 1024,
            capacity: 1024,
            utilization: 0,
            lba_data_size: 9,
        };
        let mut bytes = [0; IDENTIFY_DATA_SIZE];
        data.write_to(&mut bytes);
        assert_eq!(bytes[130], 9);
        let parsed = IdentifyNamespaceData::parse(&bytes);
        assert_eq!(parsed, data);
        assert_eq!(parsed.block_size(), 512);
    }
}
