use log::trace;
use shared_derive::U8Enum;

use crate::{
    completion::{CommandStatusCode, COMPLETION_ENTRY_SIZE},
    generic_command::{CommandBuffer, FieldError, FieldSpec, SUBMISSION_ENTRY_SIZE},
    kind::CommandKind,
    memory::DataBuffer,
    prp::{DataTransferDescriptor, DescriptorError},
    queue::QueueIdentifier,
};

pub const QUEUE_ID: FieldSpec = FieldSpec::new("QID", 10, 0, 15);
/// 0 based
pub const QUEUE_SIZE: FieldSpec = FieldSpec::new("QSIZE", 10, 16, 31);
pub const PHYSICALLY_CONTIGUOUS: FieldSpec = FieldSpec::new("PC", 11, 0, 0);
pub const INTERRUPTS_ENABLED: FieldSpec = FieldSpec::new("IEN", 11, 1, 1);
pub const INTERRUPT_VECTOR: FieldSpec = FieldSpec::new("IV", 11, 16, 31);
pub const QUEUE_PRIORITY: FieldSpec = FieldSpec::new("QPRIO", 11, 1, 2);
pub const COMPLETION_QUEUE_ID: FieldSpec = FieldSpec::new("CQID", 11, 16, 31);

pub const CREATE_IO_CQ_FIELDS: &[FieldSpec] = &[
    QUEUE_ID,
    QUEUE_SIZE,
    PHYSICALLY_CONTIGUOUS,
    INTERRUPTS_ENABLED,
    INTERRUPT_VECTOR,
];
pub const CREATE_IO_SQ_FIELDS: &[FieldSpec] = &[
    QUEUE_ID,
    QUEUE_SIZE,
    PHYSICALLY_CONTIGUOUS,
    QUEUE_PRIORITY,
    COMPLETION_QUEUE_ID,
];
pub const DELETE_IO_QUEUE_FIELDS: &[FieldSpec] = &[QUEUE_ID];

/// Submission queue arbitration priority
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum QueuePriority {
    Urgent = 0b00,
    High = 0b01,
    Medium = 0b10,
    Low = 0b11,
}

fn check_queue_memory(
    memory: &DataBuffer,
    queue_size: u16,
    entry_size: usize,
) -> Result<(), DescriptorError> {
    let required = queue_size as usize * entry_size;
    if memory.len() < required {
        return Err(DescriptorError::BufferTooSmall {
            required,
            available: memory.len(),
        });
    }
    Ok(())
}

/// Create the [CommandBuffer] for a create I/O completion queue command.
///
/// `queue_size` is 1 based. The queue memory must be physically contiguous.
///
/// See: NVM Express Base Spec: 5.4
pub fn create_io_completion_queue(
    queue_ident: QueueIdentifier,
    queue_size: u16,
    interrupt_vector: Option<u16>,
    memory: DataBuffer,
) -> Result<CommandBuffer, DescriptorError> {
    trace!("create io completion queue command, ident: {queue_ident:?}, size: {queue_size}");
    check_queue_memory(&memory, queue_size, COMPLETION_ENTRY_SIZE)?;

    let mut command = CommandBuffer::for_kind(CommandKind::CreateIoCompletionQueue)?;
    command.set_field(&QUEUE_ID, queue_ident.as_u16() as u32)?;
    command.set_field(&QUEUE_SIZE, queue_size.saturating_sub(1) as u32)?;
    command.set_field(&PHYSICALLY_CONTIGUOUS, 1)?;
    if let Some(vector) = interrupt_vector {
        command.set_field(&INTERRUPTS_ENABLED, 1)?;
        command.set_field(&INTERRUPT_VECTOR, vector as u32)?;
    }
    let allowed = command.authorized_placement();
    DataTransferDescriptor::attach(&mut command, allowed, memory)?;
    Ok(command)
}

/// Create the [CommandBuffer] for a create I/O submission queue command.
///
/// `queue_size` is 1 based. The queue memory must be physically contiguous.
///
/// See: NVM Express Base Spec: 5.5
pub fn create_io_submission_queue(
    queue_ident: QueueIdentifier,
    queue_size: u16,
    completion_queue: QueueIdentifier,
    priority: QueuePriority,
    memory: DataBuffer,
) -> Result<CommandBuffer, DescriptorError> {
    trace!(
        "create io submission queue command, ident: {queue_ident:?}, size: {queue_size}, cq: {completion_queue:?}"
    );
    check_queue_memory(&memory, queue_size, SUBMISSION_ENTRY_SIZE)?;

    let mut command = CommandBuffer::for_kind(CommandKind::CreateIoSubmissionQueue)?;
    command.set_field(&QUEUE_ID, queue_ident.as_u16() as u32)?;
    command.set_field(&QUEUE_SIZE, queue_size.saturating_sub(1) as u32)?;
    command.set_field(&PHYSICALLY_CONTIGUOUS, 1)?;
    command.set_field(&QUEUE_PRIORITY, u8::from(priority) as u32)?;
    command.set_field(&COMPLETION_QUEUE_ID, completion_queue.as_u16() as u32)?;
    let allowed = command.authorized_placement();
    DataTransferDescriptor::attach(&mut command, allowed, memory)?;
    Ok(command)
}

/// See: NVM Express Base Spec: 5.6
pub fn delete_io_completion_queue(queue_ident: QueueIdentifier) -> Result<CommandBuffer, FieldError> {
    let mut command = CommandBuffer::for_kind(CommandKind::DeleteIoCompletionQueue)?;
    command.set_field(&QUEUE_ID, queue_ident.as_u16() as u32)?;
    Ok(command)
}

/// See: NVM Express Base Spec: 5.7
pub fn delete_io_submission_queue(queue_ident: QueueIdentifier) -> Result<CommandBuffer, FieldError> {
    let mut command = CommandBuffer::for_kind(CommandKind::DeleteIoSubmissionQueue)?;
    command.set_field(&QUEUE_ID, queue_ident.as_u16() as u32)?;
    Ok(command)
}

/// Command specific status of a create I/O completion queue command
#[allow(missing_docs)]
#[repr(u8)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy, U8Enum)]
pub enum CompletionQueueCreationStatus {
    InvalidQueueIdentifier = 0x1,
    InvalidQueueSize = 0x2,
    InvalidInterruptVector = 0x8,
}

/// Command specific status of a create I/O submission queue command
#[allow(missing_docs)]
#[repr(u8)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy, U8Enum)]
pub enum SubmissionQueueCreationStatus {
    CompletionQueueInvalid = 0x0,
    InvalidQueueIdentifier = 0x1,
    InvalidQueueSize = 0x2,
}

/// Command specific status of the delete I/O queue commands
#[allow(missing_docs)]
#[repr(u8)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy, U8Enum)]
pub enum QueueDeletionStatus {
    InvalidQueueIdentifier = 0x1,
    InvalidQueueDeletion = 0xc,
}

macro_rules! command_specific_status {
    ($($status:ty),*) => {
        $(
            impl From<$status> for CommandStatusCode {
                fn from(value: $status) -> Self {
                    CommandStatusCode::CommandSpecificStatus(value.into())
                }
            }
        )*
    };
}

command_specific_status!(
    CompletionQueueCreationStatus,
    SubmissionQueueCreationStatus,
    QueueDeletionStatus
);

#[cfg(test)]
mod test {
    use super::*;
    use crate::{generic_command::DataDirection, memory::PAGE_SIZE};

    #[test]
    fn create_completion_queue_fields() {
        let command = create_io_completion_queue(
            QueueIdentifier::new(1),
            16,
            Some(3),
            DataBuffer::new(PAGE_SIZE).unwrap(),
        )
        .unwrap();
        assert_eq!(command.opcode(), 0x05);
        assert_eq!(command.direction(), DataDirection::HostToDevice);
        assert_eq!(command.get_dword(10).unwrap(), 0x000f_0001);
        assert_eq!(command.get_dword(11).unwrap(), 0x0003_0003);
    }

    #[test]
    fn create_submission_queue_fields() {
        let command = create_io_submission_queue(
            QueueIdentifier::new(2),
            64,
            QueueIdentifier::new(1),
            QueuePriority::Medium,
            DataBuffer::new(PAGE_SIZE).unwrap(),
        )
        .unwrap();
        assert_eq!(command.opcode(), 0x01);
        assert_eq!(command.get_dword(10).unwrap(), 0x003f_0002);
        assert_eq!(command.get_dword(11).unwrap(), 0x0001_0005);
    }

    #[test]
    fn queue_memory_is_checked() {
        assert_eq!(
            create_io_submission_queue(
                QueueIdentifier::new(1),
                65,
                QueueIdentifier::new(1),
                QueuePriority::Low,
                DataBuffer::new(PAGE_SIZE).unwrap(),
            )
            .unwrap_err(),
            DescriptorError::BufferTooSmall {
                required: 65 * 64,
                available: PAGE_SIZE
            }
        );
    }

    #[test]
    fn delete_queue_fields() {
        let command = delete_io_submission_queue(QueueIdentifier::new(7)).unwrap();
        assert_eq!(command.opcode(), 0x00);
        assert_eq!(command.get_dword(10).unwrap(), 7);
        assert!(command.descriptor().is_none());
        assert_eq!(
            CommandStatusCode::from(QueueDeletionStatus::InvalidQueueDeletion),
            CommandStatusCode::CommandSpecificStatus(0x0c)
        );
    }
}
