//! The channel to the device under test.
//!
//! A [Transport] moves ring contents between the host and the device. It is
//! implemented by a driver binding for real hardware and by
//! [EmulatedDevice](crate::emulated::EmulatedDevice) for tests.

use std::time::Duration;

use thiserror::Error;

use crate::{
    completion::CommandStatusCode,
    generic_command::CommandIdentifier,
    memory::{DmaBuffer, MemoryError},
    prp::DataTransferDescriptor,
    queue::QueueIdentifier,
};

/// The kind of a hardware queue pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Admin,
    Io { interrupt_vector: Option<u16> },
}

impl QueueKind {
    pub fn is_admin(self) -> bool {
        matches!(self, QueueKind::Admin)
    }
}

/// Opaque handle to a hardware queue pair created by a [Transport]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueHandle {
    raw: u32,
    id: QueueIdentifier,
}

impl QueueHandle {
    pub fn new(raw: u32, id: QueueIdentifier) -> Self {
        Self { raw, id }
    }

    /// The transport specific value
    pub fn raw(self) -> u32 {
        self.raw
    }

    /// The queue identifier used by the device
    pub fn id(self) -> QueueIdentifier {
        self.id
    }
}

/// Everything a [Transport] needs to create a hardware queue pair
#[derive(Debug, Clone)]
pub struct HwQueueRequest {
    pub kind: QueueKind,
    pub submission: DmaBuffer,
    pub submission_capacity: u16,
    pub completion: DmaBuffer,
    pub completion_capacity: u16,
}

#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("queue {0:?} is not known to the transport")]
    UnknownQueue(QueueHandle),
    #[error("device rejected creation of {kind:?} queue: {status}")]
    QueueCreationRejected {
        kind: QueueKind,
        status: CommandStatusCode,
    },
    #[error("no free command identifier on queue {0:?}")]
    IdentifiersExhausted(QueueHandle),
    #[error("doorbell value {value} is invalid for queue {queue:?}")]
    InvalidDoorbell { queue: QueueHandle, value: u16 },
    #[error("submission entry must be {expected} bytes, got {actual}")]
    InvalidEntrySize { expected: usize, actual: usize },
    #[error("driver error: {0}")]
    Driver(String),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// The driver boundary used by [QueuePair](crate::queue_pair::QueuePair)s
pub trait Transport: Send + Sync {
    /// Creates the hardware queue pair backed by the ring memory in `request`
    fn create_hw_queue(&self, request: HwQueueRequest) -> Result<QueueHandle, TransportError>;

    /// Releases the hardware queue pair
    fn destroy_hw_queue(&self, queue: QueueHandle) -> Result<(), TransportError>;

    /// Prepares a submission entry before it is written into the ring.
    ///
    /// The transport assigns a command identifier that is unique among the
    /// outstanding commands of `queue`, writes it into `entry` and fills in
    /// the data pointer for `data`.
    fn submit(
        &self,
        queue: QueueHandle,
        entry: &mut [u8],
        data: Option<&DataTransferDescriptor>,
    ) -> Result<CommandIdentifier, TransportError>;

    /// Hands back an identifier from [Self::submit] whose entry was never
    /// written into the ring
    fn cancel_submission(
        &self,
        queue: QueueHandle,
        command_id: CommandIdentifier,
    ) -> Result<(), TransportError>;

    /// Writes the submission queue tail doorbell
    fn ring_submission_doorbell(&self, queue: QueueHandle, tail: u16)
        -> Result<(), TransportError>;

    /// Writes the completion queue head doorbell
    fn ring_completion_doorbell(&self, queue: QueueHandle, head: u16)
        -> Result<(), TransportError>;

    /// Waits until at least `want` completions the host has not consumed are
    /// visible in the completion ring of `queue` or `timeout` elapsed.
    ///
    /// Returns the number of visible, unconsumed completions.
    fn wait_for_completions(
        &self,
        queue: QueueHandle,
        want: u16,
        timeout: Duration,
    ) -> Result<u16, TransportError>;
}
