//! A submission ring and a completion ring sharing one command identifier
//! namespace.
//!
//! [QueuePair] implements the send, ring, reap protocol every test uses.
//! Completions may arrive in any order, they are always matched back to
//! their command through the command identifier.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt::Display,
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use derive_where::derive_where;
use log::{debug, trace, warn};
use thiserror::Error;

use crate::{
    completion::{CommandStatusCode, CompletionRecord, GenericCommandStatus},
    generic_command::{CommandBuffer, CommandIdentifier},
    queue::{CompletionRing, QueueError, SubmissionRing},
    transport::{HwQueueRequest, QueueHandle, QueueKind, Transport, TransportError},
};

/// Largest admin queue allowed by the AQA register
pub const MAX_ADMIN_QUEUE_ENTRIES: u16 = 4096;

/// Reaped completions kept for [QueuePair::wait_for] and
/// [QueuePair::take_completion]. Older ones are dropped on the next reap.
pub const MAX_UNCLAIMED_COMPLETIONS: usize = 4096;

/// Lifecycle of a [QueuePair]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// Rings are allocated, the hardware queue does not exist yet
    Created,
    /// Commands flow
    Enabled,
    /// No commands flow, unreaped completions are lost
    Disabled,
    Destroyed,
}

/// The set of status values a caller accepts for a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedStatus(Vec<CommandStatusCode>);

impl ExpectedStatus {
    pub fn success() -> Self {
        Self(vec![CommandStatusCode::SUCCESS])
    }

    pub fn any_of(status: impl IntoIterator<Item = CommandStatusCode>) -> Self {
        Self(status.into_iter().collect())
    }

    pub fn matches(&self, status: CommandStatusCode) -> bool {
        self.0.contains(&status)
    }
}

impl From<CommandStatusCode> for ExpectedStatus {
    fn from(value: CommandStatusCode) -> Self {
        Self(vec![value])
    }
}

impl From<GenericCommandStatus> for ExpectedStatus {
    fn from(value: GenericCommandStatus) -> Self {
        Self(vec![value.into()])
    }
}

impl<const N: usize> From<[CommandStatusCode; N]> for ExpectedStatus {
    fn from(value: [CommandStatusCode; N]) -> Self {
        Self(value.to_vec())
    }
}

impl Display for ExpectedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, status) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(" or ")?;
            }
            write!(f, "{status}")?;
        }
        Ok(())
    }
}

/// A reaped completion together with the command that caused it
#[derive(Debug, Clone)]
pub struct Reaped {
    pub command: CommandBuffer,
    pub completion: CompletionRecord,
}

#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueuePairError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("capacity {capacity} is invalid for a {kind:?} queue")]
    InvalidCapacity { kind: QueueKind, capacity: u16 },
    #[error("operation not allowed in queue pair state {0:?}")]
    InvalidState(PairState),
    #[error("command {command_id:#x} completed with {}, expected {expected}", .actual.status())]
    UnexpectedStatus {
        command_id: CommandIdentifier,
        expected: ExpectedStatus,
        actual: CompletionRecord,
    },
    #[error("no completion for command {command_id:#x} within {timeout:?}")]
    CompletionMissing {
        command_id: CommandIdentifier,
        timeout: Duration,
    },
    #[error("command {0:#x} is not in flight on this queue")]
    UnknownCommand(CommandIdentifier),
    #[error("transport assigned command id {0:#x} which is still in flight")]
    IdentifierStillInUse(CommandIdentifier),
}

/// Reaped completions in the order they were reaped
#[derive(Debug, Default)]
struct Unclaimed {
    by_id: BTreeMap<CommandIdentifier, (u64, Reaped)>,
    order: VecDeque<(u64, CommandIdentifier)>,
    next_sequence: u64,
}

impl Unclaimed {
    fn len(&self) -> usize {
        self.by_id.len()
    }

    fn insert(&mut self, command_id: CommandIdentifier, reaped: Reaped) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.by_id.insert(command_id, (sequence, reaped));
        self.order.push_back((sequence, command_id));
    }

    fn remove(&mut self, command_id: CommandIdentifier) -> Option<Reaped> {
        self.by_id.remove(&command_id).map(|(_, reaped)| reaped)
    }

    fn clear(&mut self) {
        self.by_id.clear();
        self.order.clear();
    }

    fn is_current(&self, sequence: u64, command_id: CommandIdentifier) -> bool {
        self.by_id
            .get(&command_id)
            .is_some_and(|(current, _)| *current == sequence)
    }

    /// Drops the oldest completions until at most `limit` are left.
    ///
    /// Returns the number of dropped completions.
    fn trim(&mut self, limit: usize) -> usize {
        let mut dropped = 0;
        while self.by_id.len() > limit {
            let Some((sequence, command_id)) = self.order.pop_front() else {
                break;
            };
            if self.is_current(sequence, command_id) {
                self.by_id.remove(&command_id);
                dropped += 1;
            }
        }
        // claimed completions leave stale entries in `order`
        if self.order.len() > 2 * limit.max(self.by_id.len()) {
            let by_id = &self.by_id;
            self.order.retain(|(sequence, command_id)| {
                by_id
                    .get(command_id)
                    .is_some_and(|(current, _)| current == sequence)
            });
        }
        dropped
    }
}

/// A data structure giving access to a hardware queue pair.
///
/// The hardware queue must be destroyed explicitly with [Self::destroy].
#[derive_where(Debug)]
pub struct QueuePair {
    kind: QueueKind,
    state: PairState,
    handle: Option<QueueHandle>,
    submission: SubmissionRing,
    completion: CompletionRing,
    #[derive_where(skip)]
    transport: Arc<dyn Transport>,
    /// Commands sent whose completion was not yet reaped
    in_flight: BTreeMap<CommandIdentifier, CommandBuffer>,
    /// Reaped completions not yet claimed by [Self::wait_for] or
    /// [Self::take_completion]
    completions: Unclaimed,
}

impl QueuePair {
    /// Allocates both rings. The hardware queue is created by [Self::enable].
    pub fn new(
        transport: Arc<dyn Transport>,
        kind: QueueKind,
        submission_capacity: u16,
        completion_capacity: u16,
    ) -> Result<Self, QueuePairError> {
        for capacity in [submission_capacity, completion_capacity] {
            let too_large = kind.is_admin() && capacity > MAX_ADMIN_QUEUE_ENTRIES;
            if capacity < 2 || too_large {
                return Err(QueuePairError::InvalidCapacity { kind, capacity });
            }
        }

        let mut submission = SubmissionRing::new();
        submission.init(submission_capacity)?;
        let mut completion = CompletionRing::new();
        completion.init(completion_capacity)?;

        Ok(Self {
            kind,
            state: PairState::Created,
            handle: None,
            submission,
            completion,
            transport,
            in_flight: BTreeMap::new(),
            completions: Unclaimed::default(),
        })
    }

    /// Allocates both rings and creates the hardware queue
    pub fn create(
        transport: Arc<dyn Transport>,
        kind: QueueKind,
        submission_capacity: u16,
        completion_capacity: u16,
    ) -> Result<Self, QueuePairError> {
        let mut pair = Self::new(transport, kind, submission_capacity, completion_capacity)?;
        pair.enable()?;
        Ok(pair)
    }

    /// Creates the hardware queue
    pub fn enable(&mut self) -> Result<(), QueuePairError> {
        if self.state != PairState::Created {
            return Err(QueuePairError::InvalidState(self.state));
        }
        let (Some(submission), Some(completion)) =
            (self.submission.memory(), self.completion.memory())
        else {
            return Err(QueuePairError::InvalidState(self.state));
        };
        let request = HwQueueRequest {
            kind: self.kind,
            submission: submission.clone(),
            submission_capacity: self.submission.capacity(),
            completion: completion.clone(),
            completion_capacity: self.completion.capacity(),
        };
        let handle = self.transport.create_hw_queue(request)?;
        debug!(
            "created {:?} queue pair {:?}: sq {} / cq {}",
            self.kind,
            handle.id(),
            self.submission.capacity(),
            self.completion.capacity()
        );
        self.submission.activate(handle, self.transport.clone())?;
        self.completion.activate(handle, self.transport.clone())?;
        self.handle = Some(handle);
        self.state = PairState::Enabled;
        Ok(())
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    /// The hardware queue, `None` until [Self::enable]
    pub fn handle(&self) -> Option<QueueHandle> {
        self.handle
    }

    pub fn submission(&self) -> &SubmissionRing {
        &self.submission
    }

    pub fn completion(&self) -> &CompletionRing {
        &self.completion
    }

    fn check_enabled(&self) -> Result<(), QueuePairError> {
        if self.state != PairState::Enabled {
            return Err(QueuePairError::InvalidState(self.state));
        }
        Ok(())
    }

    /// The number of sent commands whose completion was not reaped yet
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of reaped completions nobody claimed yet
    pub fn unclaimed(&self) -> usize {
        self.completions.len()
    }

    /// Writes `command` into the submission ring.
    ///
    /// The device only sees the command after [Self::ring_doorbell].
    pub fn send(&mut self, mut command: CommandBuffer) -> Result<CommandIdentifier, QueuePairError> {
        self.check_enabled()?;
        let in_flight = &self.in_flight;
        let submitted = match self
            .submission
            .send_unless(&mut command, |id| in_flight.contains_key(&id))
        {
            Err(QueueError::IdentifierInUse(id)) => {
                return Err(QueuePairError::IdentifierStillInUse(id))
            }
            result => result?,
        };
        let command_id = submitted.command_id;
        // the device consumed the old command, its completion can no longer
        // be told apart from the new one
        if let Some(stale) = self.completions.remove(command_id) {
            debug!(
                "command id {command_id:#x} reused, dropping unclaimed completion with {}",
                stale.completion.status()
            );
        }
        self.in_flight.insert(command_id, command);
        Ok(command_id)
    }

    /// Sends all `commands`, stopping at the first error
    pub fn send_all<I: IntoIterator<Item = CommandBuffer>>(
        &mut self,
        commands: I,
    ) -> Result<Vec<CommandIdentifier>, QueuePairError> {
        let commands = commands.into_iter();
        let mut idents = Vec::with_capacity(commands.size_hint().0);
        for command in commands {
            idents.push(self.send(command)?);
        }
        Ok(idents)
    }

    pub fn ring_doorbell(&mut self) -> Result<(), QueuePairError> {
        self.check_enabled()?;
        self.submission.ring_doorbell()?;
        Ok(())
    }

    /// Waits until at least `want` new completions are visible
    pub fn poll_count(&mut self, timeout: Duration, want: u16) -> Result<u16, QueuePairError> {
        self.check_enabled()?;
        Ok(self.completion.poll_count(timeout, want)?)
    }

    /// Reaps up to `max` completions from the ring and pairs each with its
    /// command.
    ///
    /// Returns every reaped record in ring order, including completions that
    /// match no command in flight. The paired completions are also kept
    /// until claimed with [Self::take_completion] or [Self::wait_for], at
    /// most [MAX_UNCLAIMED_COMPLETIONS] of them from earlier reaps.
    pub fn reap(&mut self, max: u16) -> Result<Vec<CompletionRecord>, QueuePairError> {
        self.check_enabled()?;
        let dropped = self.completions.trim(MAX_UNCLAIMED_COMPLETIONS);
        if dropped > 0 {
            debug!("dropped {dropped} unclaimed completions");
        }
        let reaped = self.completion.reap(max)?;
        let queue_id = self.handle.map(|h| h.id());
        for completion in reaped.iter().copied() {
            if Some(completion.sq_id) != queue_id {
                warn!(
                    "completion({:#x}) reports submission queue {:?}, expected {queue_id:?}",
                    completion.command_id, completion.sq_id
                );
            }
            // only tells us that the device fetched the command, not that it
            // is fully handled
            self.submission.update_head(completion.sq_head);

            let id = completion.command_id;
            let Some(command) = self.in_flight.remove(&id) else {
                warn!("completion for command {id:#x} which is not in flight");
                continue;
            };
            trace!("paired completion({id:#x}) with its command");
            self.completions.insert(id, Reaped { command, completion });
        }
        Ok(reaped)
    }

    /// Removes a reaped completion
    pub fn take_completion(&mut self, command_id: CommandIdentifier) -> Option<Reaped> {
        self.completions.remove(command_id)
    }

    /// Waits until the completion for `command_id` is reaped
    pub fn wait_for(
        &mut self,
        command_id: CommandIdentifier,
        timeout: Duration,
    ) -> Result<Reaped, QueuePairError> {
        self.check_enabled()?;
        trace!("Waiting for {command_id:#x}");
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reaped) = self.completions.remove(command_id) {
                return Ok(reaped);
            }
            if !self.in_flight.contains_key(&command_id) {
                return Err(QueuePairError::UnknownCommand(command_id));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completion.poll_count(remaining, 1) {
                Ok(available) => {
                    self.reap(available)?;
                }
                Err(QueueError::Timeout { .. }) => {
                    return Err(QueuePairError::CompletionMissing {
                        command_id,
                        timeout,
                    })
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Waits for every command in `idents` with one shared deadline
    pub fn wait_for_all<I: IntoIterator<Item = CommandIdentifier>>(
        &mut self,
        idents: I,
        timeout: Duration,
    ) -> Result<Vec<Reaped>, QueuePairError> {
        let deadline = Instant::now() + timeout;
        idents
            .into_iter()
            .map(|id| {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.wait_for(id, remaining)
            })
            .collect()
    }

    /// Sends `command`, rings the doorbell and waits for its completion.
    ///
    /// Returns the command together with the completion, or
    /// [QueuePairError::UnexpectedStatus] if the status is not `expected`.
    pub fn exchange(
        &mut self,
        command: CommandBuffer,
        timeout: Duration,
        expected: impl Into<ExpectedStatus>,
    ) -> Result<Reaped, QueuePairError> {
        let expected = expected.into();
        let command_id = self.send(command)?;
        self.ring_doorbell()?;
        let reaped = self.wait_for(command_id, timeout)?;
        if !expected.matches(reaped.completion.status()) {
            return Err(QueuePairError::UnexpectedStatus {
                command_id,
                expected,
                actual: reaped.completion,
            });
        }
        Ok(reaped)
    }

    /// Same as [Self::exchange], but only returns the completion
    pub fn send_and_wait(
        &mut self,
        command: CommandBuffer,
        timeout: Duration,
        expected: impl Into<ExpectedStatus>,
    ) -> Result<CompletionRecord, QueuePairError> {
        Ok(self.exchange(command, timeout, expected)?.completion)
    }

    /// Stops command flow.
    ///
    /// Commands still in flight and unclaimed completions are dropped, the
    /// same as if they timed out.
    pub fn disable(&mut self) -> Result<(), QueuePairError> {
        self.check_enabled()?;
        let lost = self.in_flight.len() + self.completions.len();
        if lost > 0 {
            warn!(
                "disable {:?} queue pair with {lost} commands outstanding",
                self.kind
            );
        }
        self.in_flight.clear();
        self.completions.clear();
        self.state = PairState::Disabled;
        Ok(())
    }

    /// Releases the hardware queue and both rings
    pub fn destroy(&mut self) -> Result<(), QueuePairError> {
        if self.state == PairState::Destroyed {
            return Err(QueuePairError::InvalidState(self.state));
        }
        if !self.in_flight.is_empty() {
            warn!(
                "destroy {:?} queue pair with {} commands in flight",
                self.kind,
                self.in_flight.len()
            );
        }
        if let Some(handle) = self.handle.take() {
            self.transport.destroy_hw_queue(handle)?;
        }
        self.submission.destroy();
        self.completion.destroy();
        self.in_flight.clear();
        self.completions.clear();
        self.state = PairState::Destroyed;
        debug!("destroyed {:?} queue pair", self.kind);
        Ok(())
    }

    /// Writes a hex snapshot of both rings to `sink`
    pub fn dump(&self, sink: &mut impl io::Write, label: &str) -> io::Result<()> {
        writeln!(
            sink,
            "{label}: {:?} queue pair {:?}, state {:?}, {} outstanding",
            self.kind,
            self.handle.map(|h| h.id()),
            self.state,
            self.in_flight.len()
        )?;
        self.submission.dump(sink, &format!("{label}.sq"))?;
        self.completion.dump(sink, &format!("{label}.cq"))
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!(
                "{:?} queue pair dropped without destroy, hardware queue leaked",
                self.kind
            );
        }
    }
}
