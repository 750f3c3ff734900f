//! Command execution of the emulated controller

use std::collections::{BTreeMap, BTreeSet};

use bit_field::BitField;
use log::{debug, trace};

use crate::{
    admin_commands::{
        self, decode_number_of_queues, log_page_length, AdminOpcode,
        CompletionQueueCreationStatus, FeatureIdentifier, FeatureSelect,
        IdentifyNamespaceData, LogPageIdentifier, QueueDeletionStatus,
        SubmissionQueueCreationStatus, IDENTIFY_DATA_SIZE,
    },
    completion::{CommandStatusCode, GenericCommandStatus},
    generic_command::CommandBuffer,
    io_commands::{self, IoOpcode},
    prp::read_data_pointer,
    transport::QueueKind,
};

use super::{dma::DmaRegions, namespace::Namespace, EmulatedConfig};

/// The only namespace of the emulated controller
pub const NAMESPACE_ID: u32 = 1;
/// Addresses all namespaces
pub const BROADCAST_NAMESPACE: u32 = 0xffff_ffff;

/// Command specific status: Invalid Log Page
const INVALID_LOG_PAGE: u8 = 0x09;

/// The result of executing a single command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Outcome {
    pub status: CommandStatusCode,
    pub result: u32,
}

impl Outcome {
    fn success(result: u32) -> Self {
        Self {
            status: CommandStatusCode::SUCCESS,
            result,
        }
    }

    fn status(status: impl Into<CommandStatusCode>) -> Self {
        Self {
            status: status.into(),
            result: 0,
        }
    }
}

macro_rules! try_field {
    ($e:expr) => {
        match $e {
            Ok(value) => value,
            Err(_) => return Outcome::status(GenericCommandStatus::InvalidFieldInCommand),
        }
    };
}

/// Controller state that is not tied to a single queue
#[derive(Debug)]
pub(super) struct Controller {
    config: EmulatedConfig,
    namespace: Namespace,
    features: BTreeMap<u8, u32>,
    /// I/O completion queues created through admin commands
    raw_completion_queues: BTreeSet<u16>,
    /// I/O submission queues created through admin commands and their
    /// completion queue
    raw_submission_queues: BTreeMap<u16, u16>,
    host_read_commands: u64,
    host_write_commands: u64,
}

impl Controller {
    pub(super) fn new(config: EmulatedConfig) -> Self {
        let namespace = Namespace::new(config.namespace_blocks, config.block_size);
        let mut controller = Self {
            config,
            namespace,
            features: BTreeMap::new(),
            raw_completion_queues: BTreeSet::new(),
            raw_submission_queues: BTreeMap::new(),
            host_read_commands: 0,
            host_write_commands: 0,
        };
        controller.features = controller.default_features();
        controller
    }

    fn default_features(&self) -> BTreeMap<u8, u32> {
        let max = self.config.max_io_queues;
        [
            (FeatureIdentifier::Arbitration, 0),
            (FeatureIdentifier::PowerManagement, 0),
            // 343 kelvin
            (FeatureIdentifier::TemperatureThreshold, 0x0157),
            (FeatureIdentifier::VolatileWriteCache, 0),
            (
                FeatureIdentifier::NumberOfQueues,
                admin_commands::number_of_queues_value(max, max),
            ),
            (FeatureIdentifier::InterruptCoalescing, 0),
            (FeatureIdentifier::InterruptVectorConfiguration, 0),
            (FeatureIdentifier::AsynchronousEventConfiguration, 0),
            (FeatureIdentifier::KeepAliveTimer, 0),
        ]
        .into_iter()
        .map(|(id, value)| (u8::from(id), value))
        .collect()
    }

    /// The number of I/O queues the host may create
    pub(super) fn granted_io_queues(&self) -> u16 {
        let value = self
            .features
            .get(&u8::from(FeatureIdentifier::NumberOfQueues))
            .copied()
            .unwrap_or(0);
        let (sub, comp) = decode_number_of_queues(value);
        sub.min(comp).min(self.config.max_io_queues as u32) as u16
    }

    /// `true` if `id` is used by an I/O queue created through admin commands
    pub(super) fn raw_queue_in_use(&self, id: u16) -> bool {
        self.raw_completion_queues.contains(&id) || self.raw_submission_queues.contains_key(&id)
    }

    pub(super) fn execute(
        &mut self,
        queue: QueueKind,
        command: &CommandBuffer,
        dma: &DmaRegions,
        hw_queues: &BTreeSet<u16>,
    ) -> Outcome {
        let opcode = command.opcode();
        let outcome = if queue.is_admin() {
            match AdminOpcode::try_from(opcode) {
                Ok(AdminOpcode::Identify) => self.identify(command, dma),
                Ok(AdminOpcode::GetFeatures) => self.get_features(command),
                Ok(AdminOpcode::SetFeatures) => self.set_features(command, hw_queues),
                Ok(AdminOpcode::GetLogPage) => self.get_log_page(command, dma),
                Ok(AdminOpcode::CreateIoCompletionQueue) => {
                    self.create_completion_queue(command, hw_queues)
                }
                Ok(AdminOpcode::CreateIoSubmissionQueue) => {
                    self.create_submission_queue(command, hw_queues)
                }
                Ok(AdminOpcode::DeleteIoCompletionQueue) => self.delete_completion_queue(command),
                Ok(AdminOpcode::DeleteIoSubmissionQueue) => self.delete_submission_queue(command),
                // the command is never found, so it is never aborted
                Ok(AdminOpcode::Abort) => Outcome::success(1),
                Ok(AdminOpcode::KeepAlive) => Outcome::success(0),
                _ => Outcome::status(GenericCommandStatus::InvalidCommandOpcode),
            }
        } else {
            match IoOpcode::try_from(opcode) {
                Ok(IoOpcode::Read) => self.read(command, dma),
                Ok(IoOpcode::Write) => self.write(command, dma),
                Ok(IoOpcode::Flush) => self.flush(command),
                _ => Outcome::status(GenericCommandStatus::InvalidCommandOpcode),
            }
        };
        trace!("executed opcode {opcode:#x}: {:?}", outcome.status);
        outcome
    }

    fn transfer_to_host(&self, command: &CommandBuffer, dma: &DmaRegions, data: &[u8]) -> Outcome {
        let Some((prp1, prp2)) = read_data_pointer(command.as_bytes()) else {
            return Outcome::status(GenericCommandStatus::InvalidFieldInCommand);
        };
        match dma.write_prp(prp1, prp2, data) {
            Ok(()) => Outcome::success(0),
            Err(err) => {
                debug!("device to host transfer failed: {err}");
                Outcome::status(GenericCommandStatus::DataTransferError)
            }
        }
    }

    fn identify(&mut self, command: &CommandBuffer, dma: &DmaRegions) -> Outcome {
        let cns = try_field!(command.field(&admin_commands::IDENTIFY_CNS));
        let nsid = try_field!(command.namespace_id());
        let mut data = [0; IDENTIFY_DATA_SIZE];
        match cns {
            0x0 => {
                if nsid != NAMESPACE_ID {
                    return Outcome::status(GenericCommandStatus::InvalidNamespaceOrFormat);
                }
                IdentifyNamespaceData {
                    size: self.namespace.blocks(),
                    capacity: self.namespace.blocks(),
                    utilization: self.namespace.utilization(),
                    lba_data_size: self.namespace.block_size().trailing_zeros() as u8,
                }
                .write_to(&mut data);
            }
            0x1 => {
                let mut identify = self.config.controller.clone();
                identify.number_of_namespaces = NAMESPACE_ID;
                identify.write_to(&mut data);
            }
            0x2 => {
                if nsid >= 0xffff_fffe {
                    return Outcome::status(GenericCommandStatus::InvalidNamespaceOrFormat);
                }
                if nsid < NAMESPACE_ID {
                    data[0..4].copy_from_slice(&NAMESPACE_ID.to_le_bytes());
                }
            }
            _ => return Outcome::status(GenericCommandStatus::InvalidFieldInCommand),
        }
        self.transfer_to_host(command, dma, &data)
    }

    fn get_features(&mut self, command: &CommandBuffer) -> Outcome {
        let fid = try_field!(command.field(&admin_commands::FEATURE_ID)) as u8;
        let select = try_field!(command.field(&admin_commands::FEATURE_SELECT)) as u8;
        let Some(current) = self.features.get(&fid).copied() else {
            return Outcome::status(GenericCommandStatus::InvalidFieldInCommand);
        };
        match FeatureSelect::try_from(select) {
            Ok(FeatureSelect::Current | FeatureSelect::Saved) => Outcome::success(current),
            Ok(FeatureSelect::Default) => {
                Outcome::success(self.default_features().get(&fid).copied().unwrap_or(0))
            }
            // changeable, not saveable
            Ok(FeatureSelect::SupportedCapabilities) => Outcome::success(0b100),
            Err(_) => Outcome::status(GenericCommandStatus::InvalidFieldInCommand),
        }
    }

    fn set_features(&mut self, command: &CommandBuffer, hw_queues: &BTreeSet<u16>) -> Outcome {
        let fid = try_field!(command.field(&admin_commands::FEATURE_ID)) as u8;
        let value = try_field!(command.field(&admin_commands::FEATURE_VALUE));
        if !self.features.contains_key(&fid) {
            return Outcome::status(GenericCommandStatus::InvalidFieldInCommand);
        }
        if fid != u8::from(FeatureIdentifier::NumberOfQueues) {
            self.features.insert(fid, value);
            return Outcome::success(0);
        }

        // only allowed before any I/O queue exists
        if hw_queues.iter().any(|id| *id != 0) || !self.raw_completion_queues.is_empty() {
            return Outcome::status(GenericCommandStatus::CommandSequenceError);
        }
        let requested_sub = value.get_bits(0..=15);
        let requested_comp = value.get_bits(16..=31);
        if requested_sub == 0xffff || requested_comp == 0xffff {
            return Outcome::status(GenericCommandStatus::InvalidFieldInCommand);
        }
        let max = (self.config.max_io_queues as u32).saturating_sub(1);
        let mut granted = 0u32;
        granted.set_bits(0..=15, requested_sub.min(max));
        granted.set_bits(16..=31, requested_comp.min(max));
        self.features.insert(fid, granted);
        Outcome::success(granted)
    }

    fn get_log_page(&mut self, command: &CommandBuffer, dma: &DmaRegions) -> Outcome {
        let lid = try_field!(command.field(&admin_commands::LOG_PAGE_ID)) as u8;
        let len = try_field!(log_page_length(command));
        let mut page = match LogPageIdentifier::try_from(lid) {
            Ok(LogPageIdentifier::ErrorInformation) => vec![0; 64],
            Ok(LogPageIdentifier::SmartHealthInformation) => self.smart_log(),
            Ok(LogPageIdentifier::FirmwareSlotInformation) => {
                let mut page = vec![0; 512];
                // active firmware in slot 1
                page[0] = 1;
                let firmware = self.config.controller.firmware_revision.as_bytes();
                let firmware = &firmware[..firmware.len().min(8)];
                page[8..16].fill(b' ');
                page[8..8 + firmware.len()].copy_from_slice(firmware);
                page
            }
            Err(_) => {
                return Outcome::status(CommandStatusCode::CommandSpecificStatus(
                    INVALID_LOG_PAGE,
                ))
            }
        };
        page.resize(len, 0);
        self.transfer_to_host(command, dma, &page)
    }

    fn smart_log(&self) -> Vec<u8> {
        let mut page = vec![0; 512];
        // composite temperature, 320 kelvin
        page[1..3].copy_from_slice(&320u16.to_le_bytes());
        // available spare, threshold
        page[3] = 100;
        page[4] = 10;
        // data units are thousands of 512 byte units, rounded up
        let units = |bytes: u64| (bytes / 512).div_ceil(1000) as u128;
        page[32..48].copy_from_slice(&units(self.namespace.bytes_read).to_le_bytes());
        page[48..64].copy_from_slice(&units(self.namespace.bytes_written).to_le_bytes());
        page[64..80].copy_from_slice(&(self.host_read_commands as u128).to_le_bytes());
        page[80..96].copy_from_slice(&(self.host_write_commands as u128).to_le_bytes());
        page
    }

    /// `Err(true)` for an invalid identifier, `Err(false)` for an invalid size
    fn check_new_queue(
        &self,
        id: u16,
        size: u16,
        hw_queues: &BTreeSet<u16>,
    ) -> Result<(), bool> {
        if id == 0 || id > self.granted_io_queues() || hw_queues.contains(&id) {
            return Err(true);
        }
        if size == 0 || size as u32 + 1 > self.config.max_queue_entries as u32 {
            return Err(false);
        }
        Ok(())
    }

    fn create_completion_queue(&mut self, command: &CommandBuffer, hw_queues: &BTreeSet<u16>) -> Outcome {
        let id = try_field!(command.field(&admin_commands::QUEUE_ID)) as u16;
        let size = try_field!(command.field(&admin_commands::QUEUE_SIZE)) as u16;
        if let Err(invalid_id) = self.check_new_queue(id, size, hw_queues) {
            return Outcome::status(if invalid_id {
                CompletionQueueCreationStatus::InvalidQueueIdentifier
            } else {
                CompletionQueueCreationStatus::InvalidQueueSize
            });
        }
        if !self.raw_completion_queues.insert(id) {
            return Outcome::status(CompletionQueueCreationStatus::InvalidQueueIdentifier);
        }
        debug!("created raw I/O completion queue {id}");
        Outcome::success(0)
    }

    fn create_submission_queue(&mut self, command: &CommandBuffer, hw_queues: &BTreeSet<u16>) -> Outcome {
        let id = try_field!(command.field(&admin_commands::QUEUE_ID)) as u16;
        let size = try_field!(command.field(&admin_commands::QUEUE_SIZE)) as u16;
        let cq = try_field!(command.field(&admin_commands::COMPLETION_QUEUE_ID)) as u16;
        if !self.raw_completion_queues.contains(&cq) {
            return Outcome::status(SubmissionQueueCreationStatus::CompletionQueueInvalid);
        }
        if let Err(invalid_id) = self.check_new_queue(id, size, hw_queues) {
            return Outcome::status(if invalid_id {
                SubmissionQueueCreationStatus::InvalidQueueIdentifier
            } else {
                SubmissionQueueCreationStatus::InvalidQueueSize
            });
        }
        if self.raw_submission_queues.contains_key(&id) {
            return Outcome::status(SubmissionQueueCreationStatus::InvalidQueueIdentifier);
        }
        self.raw_submission_queues.insert(id, cq);
        debug!("created raw I/O submission queue {id} -> cq {cq}");
        Outcome::success(0)
    }

    fn delete_completion_queue(&mut self, command: &CommandBuffer) -> Outcome {
        let id = try_field!(command.field(&admin_commands::QUEUE_ID)) as u16;
        if !self.raw_completion_queues.contains(&id) {
            return Outcome::status(QueueDeletionStatus::InvalidQueueIdentifier);
        }
        if self.raw_submission_queues.values().any(|cq| *cq == id) {
            return Outcome::status(QueueDeletionStatus::InvalidQueueDeletion);
        }
        self.raw_completion_queues.remove(&id);
        Outcome::success(0)
    }

    fn delete_submission_queue(&mut self, command: &CommandBuffer) -> Outcome {
        let id = try_field!(command.field(&admin_commands::QUEUE_ID)) as u16;
        match self.raw_submission_queues.remove(&id) {
            Some(_) => Outcome::success(0),
            None => Outcome::status(QueueDeletionStatus::InvalidQueueIdentifier),
        }
    }

    fn check_io(&self, command: &CommandBuffer) -> Result<(io_commands::Lba, u32), Outcome> {
        let nsid = command
            .namespace_id()
            .map_err(|_| Outcome::status(GenericCommandStatus::InvalidFieldInCommand))?;
        if nsid != NAMESPACE_ID {
            return Err(Outcome::status(
                GenericCommandStatus::InvalidNamespaceOrFormat,
            ));
        }
        let (start, count) = io_commands::block_range(command)
            .map_err(|_| Outcome::status(GenericCommandStatus::InvalidFieldInCommand))?;
        if !self.namespace.contains(start, count) {
            return Err(Outcome::status(GenericCommandStatus::LbaOutOfRange));
        }
        Ok((start, count))
    }

    fn read(&mut self, command: &CommandBuffer, dma: &DmaRegions) -> Outcome {
        let (start, count) = match self.check_io(command) {
            Ok(range) => range,
            Err(outcome) => return outcome,
        };
        self.host_read_commands += 1;
        let data = self.namespace.read(start, count);
        self.transfer_to_host(command, dma, &data)
    }

    fn write(&mut self, command: &CommandBuffer, dma: &DmaRegions) -> Outcome {
        let (start, count) = match self.check_io(command) {
            Ok(range) => range,
            Err(outcome) => return outcome,
        };
        let Some((prp1, prp2)) = read_data_pointer(command.as_bytes()) else {
            return Outcome::status(GenericCommandStatus::InvalidFieldInCommand);
        };
        let len = count as usize * self.namespace.block_size();
        match dma.read_prp(prp1, prp2, len) {
            Ok(data) => {
                self.host_write_commands += 1;
                self.namespace.write(start, &data);
                Outcome::success(0)
            }
            Err(err) => {
                debug!("host to device transfer failed: {err}");
                Outcome::status(GenericCommandStatus::DataTransferError)
            }
        }
    }

    fn flush(&mut self, command: &CommandBuffer) -> Outcome {
        match command.namespace_id() {
            Ok(NAMESPACE_ID | BROADCAST_NAMESPACE) => Outcome::success(0),
            Ok(_) => Outcome::status(GenericCommandStatus::InvalidNamespaceOrFormat),
            Err(_) => Outcome::status(GenericCommandStatus::InvalidFieldInCommand),
        }
    }
}
