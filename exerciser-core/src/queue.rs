//! Submission and completion rings.
//!
//! A [RingQueue] is a circular buffer of fixed size slots in [DmaBuffer]
//! memory that is shared with the device. The host owns the tail of a
//! [SubmissionRing] and the head of a [CompletionRing], the device owns the
//! other end and reports it through completions (submission head) or the
//! phase tag (completion tail).
//!
//! A ring of capacity `N` holds at most `N - 1` entries.
//!
//! See: NVMe Base Spec: 3.3.1: Memory-based Transport Queue Model

use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use derive_where::derive_where;
use log::{debug, trace, warn};
use shared::math::WrappingValue;
use thiserror::Error;

use crate::{
    completion::{CompletionRecord, COMPLETION_ENTRY_SIZE},
    dump::write_slots,
    generic_command::{CommandBuffer, CommandIdentifier, SUBMISSION_ENTRY_SIZE},
    memory::{DmaBuffer, MemoryError},
    transport::{QueueHandle, Transport, TransportError},
};

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
pub struct QueueIdentifier(pub(crate) u16);

impl QueueIdentifier {
    /// The admin queue always uses identifier 0
    pub const ADMIN: QueueIdentifier = QueueIdentifier(0);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }

    pub fn checked_add(self, rhs: u16) -> Option<Self> {
        self.0.checked_add(rhs).map(Self)
    }
}

/// The lifecycle of a [RingQueue]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    Uninitialized,
    Initialized,
    Active,
    Destroyed,
}

#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("ring capacity {0} is invalid")]
    InvalidCapacity(u16),
    #[error("ring of capacity {capacity} is full")]
    QueueFull { capacity: u16 },
    #[error("only {available} of {want} completions arrived within {timeout:?}")]
    Timeout {
        want: u16,
        available: u16,
        timeout: Duration,
    },
    #[error("ring is not active, current state: {0:?}")]
    NotActive(RingState),
    #[error("operation not allowed in ring state {0:?}")]
    InvalidState(RingState),
    #[error("command of {0} bytes does not fit into a submission slot")]
    CommandTooLarge(usize),
    #[error("command id {0:#x} is still in use on this queue")]
    IdentifierInUse(CommandIdentifier),
    #[error("can not wait for {want} completions, the ring holds at most {max}")]
    InvalidCount { want: u16, max: u16 },
    #[error("slot {index} is out of range for a ring of capacity {capacity}")]
    IndexOutOfRange { index: u16, capacity: u16 },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

mod sealed {
    pub trait Sealed {}
}

/// The direction of a [RingQueue], either [Submission] or [Completion]
pub trait Direction: sealed::Sealed {
    /// The size of a single slot
    const ENTRY_SIZE: usize;
    const NAME: &'static str;
    /// Direction specific host state
    type Bookkeeping: core::fmt::Debug + Default;
}

/// Host to device commands
#[derive(Debug)]
pub enum Submission {}

/// Device to host completions
#[derive(Debug)]
pub enum Completion {}

impl sealed::Sealed for Submission {}
impl sealed::Sealed for Completion {}

impl Direction for Submission {
    const ENTRY_SIZE: usize = SUBMISSION_ENTRY_SIZE;
    const NAME: &'static str = "submission";
    type Bookkeeping = SubmissionBookkeeping;
}

impl Direction for Completion {
    const ENTRY_SIZE: usize = COMPLETION_ENTRY_SIZE;
    const NAME: &'static str = "completion";
    type Bookkeeping = CompletionBookkeeping;
}

#[doc(hidden)]
#[derive(Debug, Default)]
pub struct SubmissionBookkeeping {
    /// The last tail written to the doorbell
    doorbell_tail: u16,
    /// Number of commands sent over the lifetime of the ring
    sequence: u64,
}

#[doc(hidden)]
#[derive(Debug)]
pub struct CompletionBookkeeping {
    /// The expected phase of the next completion entry.
    ///
    /// This starts out at `true` and switches every time the ring
    /// wraps around to the `0th` index
    expected_phase: bool,
}

impl Default for CompletionBookkeeping {
    fn default() -> Self {
        Self {
            expected_phase: true,
        }
    }
}

#[derive(Debug)]
struct RingSlots {
    memory: DmaBuffer,
    head: WrappingValue<u16>,
    tail: WrappingValue<u16>,
}

#[derive_where(Debug)]
struct RingBinding {
    queue: QueueHandle,
    #[derive_where(skip)]
    transport: Arc<dyn Transport>,
}

/// A circular buffer of [Direction::ENTRY_SIZE] slots
#[derive_where(Debug)]
pub struct RingQueue<D: Direction> {
    state: RingState,
    slots: Option<RingSlots>,
    binding: Option<RingBinding>,
    book: D::Bookkeeping,
}

pub type SubmissionRing = RingQueue<Submission>;
pub type CompletionRing = RingQueue<Completion>;

/// The result of [SubmissionRing::send]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    /// The identifier assigned by the transport
    pub command_id: CommandIdentifier,
    /// The slot the command was written to
    pub slot: u16,
    /// The logical number of this command, counted from 0 over the lifetime
    /// of the ring
    pub sequence: u64,
}

impl<D: Direction> Default for RingQueue<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Direction> RingQueue<D> {
    /// Creates an [RingState::Uninitialized] ring
    pub fn new() -> Self {
        Self {
            state: RingState::Uninitialized,
            slots: None,
            binding: None,
            book: D::Bookkeeping::default(),
        }
    }

    /// Allocates `capacity` zeroed slots
    pub fn init(&mut self, capacity: u16) -> Result<(), QueueError> {
        if self.state != RingState::Uninitialized {
            return Err(QueueError::InvalidState(self.state));
        }
        if capacity == 0 {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        debug!("init {} ring with {capacity} slots", D::NAME);
        self.slots = Some(RingSlots {
            memory: DmaBuffer::zeroed(capacity as usize * D::ENTRY_SIZE),
            head: WrappingValue::zero(capacity),
            tail: WrappingValue::zero(capacity),
        });
        self.state = RingState::Initialized;
        Ok(())
    }

    /// Binds the ring to the hardware queue `queue`
    pub(crate) fn activate(
        &mut self,
        queue: QueueHandle,
        transport: Arc<dyn Transport>,
    ) -> Result<(), QueueError> {
        if self.state != RingState::Initialized {
            return Err(QueueError::InvalidState(self.state));
        }
        self.binding = Some(RingBinding { queue, transport });
        self.state = RingState::Active;
        Ok(())
    }

    /// Releases the ring memory.
    ///
    /// The matching hardware queue must already be destroyed.
    pub(crate) fn destroy(&mut self) {
        debug!("destroy {} ring", D::NAME);
        self.slots = None;
        self.binding = None;
        self.state = RingState::Destroyed;
    }

    pub fn state(&self) -> RingState {
        self.state
    }

    /// The number of slots, `0` until [Self::init] is called
    pub fn capacity(&self) -> u16 {
        self.slots.as_ref().map_or(0, |s| s.head.modulo())
    }

    /// The ring memory shared with the device
    pub fn memory(&self) -> Option<&DmaBuffer> {
        self.slots.as_ref().map(|s| &s.memory)
    }

    pub fn head(&self) -> u16 {
        self.slots.as_ref().map_or(0, |s| s.head.value())
    }

    pub fn tail(&self) -> u16 {
        self.slots.as_ref().map_or(0, |s| s.tail.value())
    }

    fn active(&mut self) -> Result<(&mut RingSlots, &RingBinding), QueueError> {
        match (self.state, self.slots.as_mut(), self.binding.as_ref()) {
            (RingState::Active, Some(slots), Some(binding)) => Ok((slots, binding)),
            (state, _, _) => Err(QueueError::NotActive(state)),
        }
    }

    /// Writes a hex snapshot of all slots to `sink`
    pub fn dump(&self, sink: &mut impl io::Write, label: &str) -> io::Result<()> {
        let Some(slots) = &self.slots else {
            return writeln!(sink, "{label}: {} ring in state {:?}", D::NAME, self.state);
        };
        writeln!(
            sink,
            "{label}: {} ring, capacity {}, head {}, tail {}, {:?}",
            D::NAME,
            slots.head.modulo(),
            slots.head.value(),
            slots.tail.value(),
            self.book
        )?;
        write_slots(sink, label, &slots.memory.to_vec(), D::ENTRY_SIZE)
    }
}

impl RingQueue<Submission> {
    /// The number of entries between head and tail
    pub fn len(&self) -> u16 {
        self.slots
            .as_ref()
            .map_or(0, |s| s.head.distance_to(s.tail.value()))
    }

    /// `true` if the device consumed every entry
    ///
    /// See: NVMe Base Spec: 3.3.1.4: Empty Queue
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// See: NVMe Base Spec: 3.3.1.5: Full Queue
    pub fn is_full(&self) -> bool {
        self.slots
            .as_ref()
            .is_some_and(|s| (s.tail + 1).value() == s.head.value())
    }

    /// `true` if commands were sent since the last [Self::ring_doorbell]
    pub fn has_pending_doorbell(&self) -> bool {
        self.slots
            .as_ref()
            .is_some_and(|s| s.tail.value() != self.book.doorbell_tail)
    }

    /// Number of commands sent over the lifetime of the ring
    pub fn sequence(&self) -> u64 {
        self.book.sequence
    }

    /// Writes `command` into the tail slot.
    ///
    /// The identifier assigned by the transport is written back into
    /// `command`. The device only sees the command after the next
    /// [Self::ring_doorbell].
    pub fn send(&mut self, command: &mut CommandBuffer) -> Result<Submitted, QueueError> {
        self.send_unless(command, |_| false)
    }

    /// Like [Self::send], but fails with [QueueError::IdentifierInUse] if
    /// `in_use` rejects the identifier the transport assigned.
    ///
    /// A rejected identifier is handed back to the transport and the ring is
    /// left untouched.
    pub fn send_unless(
        &mut self,
        command: &mut CommandBuffer,
        in_use: impl FnOnce(CommandIdentifier) -> bool,
    ) -> Result<Submitted, QueueError> {
        if command.len() > SUBMISSION_ENTRY_SIZE {
            return Err(QueueError::CommandTooLarge(command.len()));
        }
        let sequence = self.book.sequence;
        let (slots, binding) = self.active()?;
        if (slots.tail + 1).value() == slots.head.value() {
            return Err(QueueError::QueueFull {
                capacity: slots.tail.modulo(),
            });
        }

        let mut entry = [0; SUBMISSION_ENTRY_SIZE];
        entry[..command.len()].copy_from_slice(command.as_bytes());
        let command_id =
            binding
                .transport
                .submit(binding.queue, &mut entry, command.descriptor())?;
        if in_use(command_id) {
            warn!("transport assigned command id {command_id:#x} which is still in use");
            binding
                .transport
                .cancel_submission(binding.queue, command_id)?;
            return Err(QueueError::IdentifierInUse(command_id));
        }

        let slot = slots.tail.value();
        slots
            .memory
            .write(slot as usize * SUBMISSION_ENTRY_SIZE, &entry)?;
        slots.tail += 1;
        command.set_command_id(command_id);

        trace!(
            "submit command({command_id:#x}) opcode {:#x} to slot {slot}",
            command.opcode()
        );
        self.book.sequence += 1;

        Ok(Submitted {
            command_id,
            slot,
            sequence,
        })
    }

    /// Notify the device about any pending submission entries
    pub fn ring_doorbell(&mut self) -> Result<(), QueueError> {
        let doorbell_tail = self.book.doorbell_tail;
        let (slots, binding) = self.active()?;
        let tail = slots.tail.value();
        if tail == doorbell_tail {
            warn!("no submissions pending");
            return Ok(());
        }
        trace!("ring submission doorbell: tail {tail}");
        binding.transport.ring_submission_doorbell(binding.queue, tail)?;
        self.book.doorbell_tail = tail;
        Ok(())
    }

    /// Updates the head with the value the device reported in a completion
    pub(crate) fn update_head(&mut self, head: u16) {
        let Some(slots) = self.slots.as_mut() else {
            return;
        };
        if head >= slots.head.modulo() {
            warn!(
                "device reported submission head {head} for ring of capacity {}",
                slots.head.modulo()
            );
            return;
        }
        slots.head = WrappingValue::new(head, slots.head.modulo());
    }
}

impl RingQueue<Completion> {
    /// Non destructive read of `at`, ignoring the phase tag
    pub fn peek(&self, at: u16) -> Result<CompletionRecord, QueueError> {
        let Some(slots) = &self.slots else {
            return Err(QueueError::NotActive(self.state));
        };
        let capacity = slots.head.modulo();
        if at >= capacity {
            return Err(QueueError::IndexOutOfRange {
                index: at,
                capacity,
            });
        }
        let mut entry = [0; COMPLETION_ENTRY_SIZE];
        slots
            .memory
            .read(at as usize * COMPLETION_ENTRY_SIZE, &mut entry)?;
        Ok(CompletionRecord::from_bytes(&entry))
    }

    /// The expected phase of the next new completion
    pub fn expected_phase(&self) -> bool {
        self.book.expected_phase
    }

    /// The number of new completions visible starting at head
    pub fn available(&self) -> u16 {
        let Some(slots) = &self.slots else {
            return 0;
        };
        let mut index = slots.head;
        let mut phase = self.book.expected_phase;
        let mut count = 0;
        while count < index.max() {
            match self.peek(index.value()) {
                Ok(entry) if entry.phase() == phase => {}
                _ => break,
            }
            count += 1;
            index += 1;
            if index.value() == 0 {
                phase = !phase;
            }
        }
        count
    }

    /// Alias for [Self::available]
    pub fn len(&self) -> u16 {
        self.available()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Waits until at least `want` new completions are visible.
    ///
    /// Returns the number of visible completions, or [QueueError::Timeout]
    /// if fewer than `want` arrived before `timeout` elapsed.
    pub fn poll_count(&mut self, timeout: Duration, want: u16) -> Result<u16, QueueError> {
        let max = self.capacity().saturating_sub(1);
        if want > max {
            return Err(QueueError::InvalidCount { want, max });
        }
        let deadline = Instant::now() + timeout;
        loop {
            let available = self.available();
            if available >= want {
                return Ok(available);
            }
            let now = Instant::now();
            if now >= deadline {
                trace!("poll_count timed out with {available}/{want}");
                return Err(QueueError::Timeout {
                    want,
                    available,
                    timeout,
                });
            }
            let (_, binding) = self.active()?;
            binding
                .transport
                .wait_for_completions(binding.queue, want, deadline - now)?;
        }
    }

    /// Reaps up to `max` completions, advancing the head past each.
    ///
    /// Never blocks. The completion head doorbell is written once if any
    /// entry was reaped.
    pub fn reap(&mut self, max: u16) -> Result<Vec<CompletionRecord>, QueueError> {
        let mut reaped = Vec::new();
        while reaped.len() < max as usize {
            let head = self.head();
            let entry = self.peek(head)?;
            if entry.phase() != self.book.expected_phase {
                break;
            }
            trace!("reaped completion({:#x}) from slot {head}", entry.command_id);
            reaped.push(entry);

            let (slots, _) = self.active()?;
            slots.head += 1;
            if slots.head.value() == 0 {
                trace!("completion ring wrapping");
                self.book.expected_phase = !self.book.expected_phase;
            }
        }
        if !reaped.is_empty() {
            let (slots, binding) = self.active()?;
            let head = slots.head.value();
            binding.transport.ring_completion_doorbell(binding.queue, head)?;
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn init_rejects_zero_capacity() {
        let mut ring = SubmissionRing::new();
        assert_eq!(ring.init(0), Err(QueueError::InvalidCapacity(0)));
        assert_eq!(ring.state(), RingState::Uninitialized);
        ring.init(4).unwrap();
        assert_eq!(ring.state(), RingState::Initialized);
        assert_eq!(ring.capacity(), 4);
        assert_eq!(ring.memory().unwrap().len(), 4 * SUBMISSION_ENTRY_SIZE);
        assert_eq!(ring.init(4), Err(QueueError::InvalidState(RingState::Initialized)));
    }

    #[test]
    fn send_requires_active_ring() {
        let mut ring = SubmissionRing::new();
        ring.init(2).unwrap();
        let mut command =
            CommandBuffer::new(64, crate::generic_command::DataDirection::None).unwrap();
        assert_eq!(
            ring.send(&mut command),
            Err(QueueError::NotActive(RingState::Initialized))
        );
    }

    #[test]
    fn completion_memory_size() {
        let mut ring = CompletionRing::new();
        ring.init(3).unwrap();
        assert_eq!(ring.memory().unwrap().len(), 3 * COMPLETION_ENTRY_SIZE);
        assert!(ring.expected_phase());
        assert_eq!(ring.available(), 0);
        assert!(matches!(
            ring.peek(3),
            Err(QueueError::IndexOutOfRange {
                index: 3,
                capacity: 3
            })
        ));
    }

    #[test]
    fn available_follows_phase() {
        let mut ring = CompletionRing::new();
        ring.init(4).unwrap();
        let memory = ring.memory().unwrap().clone();
        let entry = CompletionRecord::default().with_phase(true).to_bytes();
        memory.write(0, &entry).unwrap();
        memory.write(COMPLETION_ENTRY_SIZE, &entry).unwrap();
        assert_eq!(ring.available(), 2);
        assert!(ring.peek(1).unwrap().phase());
        assert!(!ring.peek(2).unwrap().phase());
    }

    #[test]
    fn poll_count_bounds() {
        let mut ring = CompletionRing::new();
        ring.init(2).unwrap();
        assert_eq!(
            ring.poll_count(Duration::ZERO, 2),
            Err(QueueError::InvalidCount { want: 2, max: 1 })
        );
        assert_eq!(ring.poll_count(Duration::ZERO, 0), Ok(0));
    }
}
