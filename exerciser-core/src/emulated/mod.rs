//! An in-process NVMe controller implementing [Transport].
//!
//! The device fetches submission entries when the submission doorbell is
//! written, executes them against a sparse in-memory namespace and posts the
//! completions into the host owned completion ring once their latency has
//! elapsed.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::{
    admin_commands::{CompletionQueueCreationStatus, IdentifyControllerData},
    completion::{CommandStatusCode, CompletionRecord, GenericCommandStatus, COMPLETION_ENTRY_SIZE},
    generic_command::{CommandBuffer, CommandIdentifier, DataDirection, SUBMISSION_ENTRY_SIZE},
    memory::{DmaBuffer, PAGE_SIZE},
    prp::DataTransferDescriptor,
    queue::QueueIdentifier,
    transport::{HwQueueRequest, QueueHandle, QueueKind, Transport, TransportError},
};

mod dma;
mod execute;
mod namespace;

pub use dma::{DmaError, DmaRegions};
pub use execute::{BROADCAST_NAMESPACE, NAMESPACE_ID};
pub use namespace::Namespace;

use execute::Controller;

/// The number of interrupt vectors the emulated controller supports
pub const INTERRUPT_VECTOR_COUNT: u16 = 32;

/// Order in which the completions of one doorbell write are posted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionOrder {
    #[default]
    InOrder,
    /// Each batch of fetched commands completes last to first
    Reversed,
}

/// Configuration of an [EmulatedDevice]
#[derive(Debug, Clone)]
pub struct EmulatedConfig {
    pub completion_order: CompletionOrder,
    /// Delay between fetching a command and posting its completion
    pub latency: Duration,
    /// Maximum number of I/O queue pairs
    pub max_io_queues: u16,
    /// Maximum number of entries of a single ring
    pub max_queue_entries: u16,
    pub namespace_blocks: u64,
    pub block_size: usize,
    pub controller: IdentifyControllerData,
}

impl Default for EmulatedConfig {
    fn default() -> Self {
        Self {
            completion_order: CompletionOrder::InOrder,
            latency: Duration::ZERO,
            max_io_queues: 8,
            max_queue_entries: 1024,
            namespace_blocks: 1024,
            block_size: 512,
            controller: IdentifyControllerData {
                pci_vendor_id: 0x1b36,
                pci_subsystem_vendor_id: 0x1af4,
                serial_number: "EMU0001".into(),
                model_number: "Emulated NVMe Controller".into(),
                firmware_revision: "1.0".into(),
                maximum_data_transfer_size: 5,
                controller_id: 1,
                // 1.4.0
                version: 0x0001_0400,
                number_of_namespaces: 1,
            },
        }
    }
}

#[derive(Debug)]
struct PendingCompletion {
    due: Instant,
    record: CompletionRecord,
}

/// Device side state of a queue pair
#[derive(Debug)]
struct HwQueue {
    id: QueueIdentifier,
    kind: QueueKind,

    submission: DmaBuffer,
    submission_capacity: u16,
    sq_head: u16,

    completion: DmaBuffer,
    completion_capacity: u16,
    cq_tail: u16,
    cq_head: u16,
    phase: bool,

    next_command_id: u16,
    /// Identifiers whose completion was not yet consumed by the host
    outstanding: BTreeSet<u16>,
    /// Bus addresses mapped for each outstanding command
    mappings: BTreeMap<u16, Vec<u64>>,
    pending: VecDeque<PendingCompletion>,
    /// Identifiers of posted completions in ring order
    posted: VecDeque<u16>,
}

impl HwQueue {
    fn completion_ring_full(&self) -> bool {
        (self.cq_tail + 1) % self.completion_capacity == self.cq_head
    }

    fn next_free_command_id(&mut self) -> Option<u16> {
        for _ in 0..=u16::MAX {
            let candidate = self.next_command_id;
            self.next_command_id = self.next_command_id.wrapping_add(1);
            if candidate == CommandIdentifier::UNASSOCIATED.as_u16() {
                continue;
            }
            if !self.outstanding.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Posts every due completion while there is room in the completion ring
    fn service(&mut self, now: Instant) {
        while let Some(front) = self.pending.front() {
            if front.due > now || self.completion_ring_full() {
                break;
            }
            let Some(PendingCompletion { mut record, .. }) = self.pending.pop_front() else {
                break;
            };
            record.sq_head = self.sq_head;
            let bytes = record.with_phase(self.phase).to_bytes();
            let offset = self.cq_tail as usize * COMPLETION_ENTRY_SIZE;
            if let Err(err) = self.completion.write(offset, &bytes) {
                warn!("failed to post completion on queue {:?}: {err}", self.id);
                continue;
            }
            trace!(
                "queue {:?}: posted completion({:#x}) to slot {}",
                self.id,
                record.command_id,
                self.cq_tail
            );
            self.posted.push_back(record.command_id.as_u16());
            self.cq_tail += 1;
            if self.cq_tail == self.completion_capacity {
                self.cq_tail = 0;
                self.phase = !self.phase;
            }
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    controller: Controller,
    queues: BTreeMap<u32, HwQueue>,
    regions: DmaRegions,
    next_raw: u32,
    /// Drop completions instead of posting them
    silent: bool,
    swallowed: u64,
    injected: Option<CommandStatusCode>,
}

/// An NVMe controller living inside the host process
#[derive(Debug)]
pub struct EmulatedDevice {
    config: EmulatedConfig,
    state: Mutex<DeviceState>,
}

impl EmulatedDevice {
    pub fn new(config: EmulatedConfig) -> Self {
        info!(
            "emulated controller \"{}\": {} blocks of {} bytes, {:?} completions",
            config.controller.model_number,
            config.namespace_blocks,
            config.block_size,
            config.completion_order
        );
        let state = DeviceState {
            controller: Controller::new(config.clone()),
            queues: BTreeMap::new(),
            regions: DmaRegions::default(),
            next_raw: 0,
            silent: false,
            swallowed: 0,
            injected: None,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &EmulatedConfig {
        &self.config
    }

    /// While set, commands are executed but their completions are dropped
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// The number of completions dropped while silent
    pub fn swallowed_completions(&self) -> u64 {
        self.state.lock().swallowed
    }

    /// The next fetched command completes with `status` without being
    /// executed
    pub fn inject_status(&self, status: CommandStatusCode) {
        self.state.lock().injected = Some(status);
    }

    /// The number of bus address regions currently mapped
    pub fn mapped_regions(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// The number of live hardware queue pairs, including the admin pair
    pub fn queue_count(&self) -> usize {
        self.state.lock().queues.len()
    }

    fn reject(kind: QueueKind, status: impl Into<CommandStatusCode>) -> TransportError {
        let status = status.into();
        warn!("reject creation of {kind:?} queue: {status}");
        TransportError::QueueCreationRejected { kind, status }
    }

    fn allocate_queue_id(
        &self,
        state: &DeviceState,
        request: &HwQueueRequest,
    ) -> Result<QueueIdentifier, TransportError> {
        let in_use: BTreeSet<u16> = state.queues.values().map(|q| q.id.as_u16()).collect();
        match request.kind {
            QueueKind::Admin => {
                if in_use.contains(&0) {
                    return Err(Self::reject(
                        request.kind,
                        GenericCommandStatus::CommandSequenceError,
                    ));
                }
                Ok(QueueIdentifier::ADMIN)
            }
            QueueKind::Io { interrupt_vector } => {
                if !in_use.contains(&0) {
                    return Err(Self::reject(
                        request.kind,
                        GenericCommandStatus::CommandSequenceError,
                    ));
                }
                if interrupt_vector.is_some_and(|v| v >= INTERRUPT_VECTOR_COUNT) {
                    return Err(Self::reject(
                        request.kind,
                        CompletionQueueCreationStatus::InvalidInterruptVector,
                    ));
                }
                (1..=state.controller.granted_io_queues())
                    .find(|id| !in_use.contains(id) && !state.controller.raw_queue_in_use(*id))
                    .map(QueueIdentifier::new)
                    .ok_or_else(|| {
                        Self::reject(
                            request.kind,
                            CompletionQueueCreationStatus::InvalidQueueIdentifier,
                        )
                    })
            }
        }
    }

    fn execute_batch(&self, state: &mut DeviceState, raw: u32, tail: u16) {
        let hw_ids: BTreeSet<u16> = state.queues.values().map(|q| q.id.as_u16()).collect();
        let DeviceState {
            controller,
            queues,
            regions,
            silent,
            swallowed,
            injected,
            ..
        } = state;
        let Some(queue) = queues.get_mut(&raw) else {
            return;
        };

        let mut batch = Vec::new();
        while queue.sq_head != tail {
            let mut entry = [0; SUBMISSION_ENTRY_SIZE];
            let offset = queue.sq_head as usize * SUBMISSION_ENTRY_SIZE;
            queue.sq_head = (queue.sq_head + 1) % queue.submission_capacity;
            if let Err(err) = queue.submission.read(offset, &mut entry) {
                warn!("queue {:?}: failed to fetch submission: {err}", queue.id);
                continue;
            }
            let direction = DataDirection::try_from(entry[0] & 0b11).unwrap_or(DataDirection::None);
            let command = match CommandBuffer::from_bytes(&entry, direction) {
                Ok(command) => command,
                Err(err) => {
                    warn!("queue {:?}: malformed submission: {err}", queue.id);
                    continue;
                }
            };
            let command_id = command.command_id();

            let (status, result) = match injected.take() {
                Some(status) => {
                    debug!("complete command({command_id:#x}) with injected {status}");
                    (status, 0)
                }
                None => {
                    let outcome = controller.execute(queue.kind, &command, regions, &hw_ids);
                    (outcome.status, outcome.result)
                }
            };
            for address in queue.mappings.remove(&command_id.as_u16()).unwrap_or_default() {
                regions.unmap(address);
            }
            batch.push(CompletionRecord::new(command_id, queue.id, 0, status, result));
        }
        trace!("queue {:?}: fetched {} commands", queue.id, batch.len());

        if self.config.completion_order == CompletionOrder::Reversed {
            batch.reverse();
        }
        if *silent {
            *swallowed += batch.len() as u64;
            return;
        }
        let due = Instant::now() + self.config.latency;
        queue
            .pending
            .extend(batch.into_iter().map(|record| PendingCompletion { due, record }));
    }
}

impl Transport for EmulatedDevice {
    fn create_hw_queue(&self, request: HwQueueRequest) -> Result<QueueHandle, TransportError> {
        let mut state = self.state.lock();
        let id = self.allocate_queue_id(&state, &request)?;

        for capacity in [request.submission_capacity, request.completion_capacity] {
            if capacity < 2 || capacity > self.config.max_queue_entries {
                return Err(Self::reject(
                    request.kind,
                    CompletionQueueCreationStatus::InvalidQueueSize,
                ));
            }
        }
        if request.submission.len() < request.submission_capacity as usize * SUBMISSION_ENTRY_SIZE
            || request.completion.len()
                < request.completion_capacity as usize * COMPLETION_ENTRY_SIZE
        {
            return Err(TransportError::Driver(
                "ring memory is smaller than its capacity".into(),
            ));
        }

        state.next_raw = state.next_raw.wrapping_add(1);
        let raw = state.next_raw;
        state.queues.insert(
            raw,
            HwQueue {
                id,
                kind: request.kind,
                submission: request.submission,
                submission_capacity: request.submission_capacity,
                sq_head: 0,
                completion: request.completion,
                completion_capacity: request.completion_capacity,
                cq_tail: 0,
                cq_head: 0,
                phase: true,
                next_command_id: 0,
                outstanding: BTreeSet::new(),
                mappings: BTreeMap::new(),
                pending: VecDeque::new(),
                posted: VecDeque::new(),
            },
        );
        debug!(
            "created {:?} queue {id:?}: sq {} cq {}",
            request.kind, request.submission_capacity, request.completion_capacity
        );
        Ok(QueueHandle::new(raw, id))
    }

    fn destroy_hw_queue(&self, queue: QueueHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let removed = state
            .queues
            .remove(&queue.raw())
            .ok_or(TransportError::UnknownQueue(queue))?;
        for address in removed.mappings.into_values().flatten() {
            state.regions.unmap(address);
        }
        if !removed.pending.is_empty() {
            warn!(
                "queue {:?} destroyed with {} completions pending",
                removed.id,
                removed.pending.len()
            );
        }
        debug!("destroyed queue {:?}", removed.id);
        Ok(())
    }

    fn submit(
        &self,
        queue: QueueHandle,
        entry: &mut [u8],
        data: Option<&DataTransferDescriptor>,
    ) -> Result<CommandIdentifier, TransportError> {
        if entry.len() != SUBMISSION_ENTRY_SIZE {
            return Err(TransportError::InvalidEntrySize {
                expected: SUBMISSION_ENTRY_SIZE,
                actual: entry.len(),
            });
        }
        let mut state = self.state.lock();
        let DeviceState {
            queues, regions, ..
        } = &mut *state;
        let hw_queue = queues
            .get_mut(&queue.raw())
            .ok_or(TransportError::UnknownQueue(queue))?;
        let command_id = hw_queue
            .next_free_command_id()
            .ok_or(TransportError::IdentifiersExhausted(queue))?;

        let mut mapped = Vec::new();
        if let Some(descriptor) = data {
            let base = regions.map(descriptor.buffer().memory().clone());
            mapped.push(base);
            let mut prp = descriptor.prp(base, 0);
            if let Some(page) = prp.list_page() {
                let list = DmaBuffer::zeroed(PAGE_SIZE);
                list.write(0, &page)?;
                let list_address = regions.map(list);
                mapped.push(list_address);
                prp = descriptor.prp(base, list_address);
            }
            if let Err(err) = prp.write_to(entry) {
                for address in mapped {
                    regions.unmap(address);
                }
                return Err(TransportError::Driver(err.to_string()));
            }
        }

        entry[2..4].copy_from_slice(&command_id.to_le_bytes());
        hw_queue.outstanding.insert(command_id);
        if !mapped.is_empty() {
            hw_queue.mappings.insert(command_id, mapped);
        }
        Ok(CommandIdentifier::new(command_id))
    }

    fn cancel_submission(
        &self,
        queue: QueueHandle,
        command_id: CommandIdentifier,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let DeviceState {
            queues, regions, ..
        } = &mut *state;
        let hw_queue = queues
            .get_mut(&queue.raw())
            .ok_or(TransportError::UnknownQueue(queue))?;
        let id = command_id.as_u16();
        if !hw_queue.outstanding.remove(&id) {
            return Err(TransportError::Driver(format!(
                "command {id:#x} is not outstanding on queue {:?}",
                hw_queue.id
            )));
        }
        for address in hw_queue.mappings.remove(&id).into_iter().flatten() {
            regions.unmap(address);
        }
        trace!("queue {:?}: cancelled command({id:#x})", hw_queue.id);
        Ok(())
    }

    fn ring_submission_doorbell(&self, queue: QueueHandle, tail: u16) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let hw_queue = state
            .queues
            .get(&queue.raw())
            .ok_or(TransportError::UnknownQueue(queue))?;
        if tail >= hw_queue.submission_capacity {
            return Err(TransportError::InvalidDoorbell { queue, value: tail });
        }
        self.execute_batch(&mut state, queue.raw(), tail);
        if let Some(hw_queue) = state.queues.get_mut(&queue.raw()) {
            hw_queue.service(Instant::now());
        }
        Ok(())
    }

    fn ring_completion_doorbell(&self, queue: QueueHandle, head: u16) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let hw_queue = state
            .queues
            .get_mut(&queue.raw())
            .ok_or(TransportError::UnknownQueue(queue))?;
        let capacity = hw_queue.completion_capacity;
        if head >= capacity {
            return Err(TransportError::InvalidDoorbell { queue, value: head });
        }
        let consumed = (head + capacity - hw_queue.cq_head) % capacity;
        if consumed as usize > hw_queue.posted.len() {
            return Err(TransportError::InvalidDoorbell { queue, value: head });
        }
        for command_id in hw_queue.posted.drain(..consumed as usize) {
            hw_queue.outstanding.remove(&command_id);
        }
        hw_queue.cq_head = head;
        hw_queue.service(Instant::now());
        Ok(())
    }

    fn wait_for_completions(
        &self,
        queue: QueueHandle,
        want: u16,
        timeout: Duration,
    ) -> Result<u16, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            let wake_at = {
                let mut state = self.state.lock();
                let hw_queue = state
                    .queues
                    .get_mut(&queue.raw())
                    .ok_or(TransportError::UnknownQueue(queue))?;
                hw_queue.service(now);
                let visible = hw_queue.posted.len() as u16;
                if visible >= want || now >= deadline {
                    return Ok(visible);
                }
                match hw_queue.pending.front() {
                    Some(next) if next.due > now => next.due.min(deadline),
                    // nothing arrives before the host makes room or submits more
                    _ => deadline,
                }
            };
            thread::sleep(wake_at.saturating_duration_since(now));
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{
        admin_commands::{self, IdentifyCns, IDENTIFY_DATA_SIZE},
        memory::DataBuffer,
        queue_pair::{QueuePair, QueuePairError},
    };

    fn admin_pair(config: EmulatedConfig) -> (Arc<EmulatedDevice>, QueuePair) {
        crate::test_utils::init_test_logger();
        let device = Arc::new(EmulatedDevice::new(config));
        let transport: Arc<dyn Transport> = device.clone();
        let pair = QueuePair::create(transport, QueueKind::Admin, 4, 4).unwrap();
        (device, pair)
    }

    #[test]
    fn identify_controller_transfers_data() {
        let (device, mut pair) = admin_pair(EmulatedConfig::default());
        let data = DataBuffer::new(IDENTIFY_DATA_SIZE).unwrap();
        let command = admin_commands::identify(IdentifyCns::Controller, data.clone()).unwrap();
        pair.send_and_wait(command, Duration::from_millis(500), CommandStatusCode::SUCCESS)
            .unwrap();
        assert_eq!(device.mapped_regions(), 0);

        let mut bytes = [0; IDENTIFY_DATA_SIZE];
        data.read(0, &mut bytes).unwrap();
        let identify = IdentifyControllerData::parse(&bytes);
        assert_eq!(identify.model_number, "Emulated NVMe Controller");
        assert_eq!(identify.number_of_namespaces, 1);
        pair.destroy().unwrap();
    }

    #[test]
    fn number_of_queues_without_io_queues() {
        let (device, mut pair) = admin_pair(EmulatedConfig {
            max_io_queues: 0,
            ..Default::default()
        });
        let command = admin_commands::set_features(
            admin_commands::SetFeatureData::NumberOfQueues {
                sub_count: 4,
                comp_count: 4,
            },
            false,
        )
        .unwrap();
        let completion = pair
            .send_and_wait(command, Duration::from_millis(500), CommandStatusCode::SUCCESS)
            .unwrap();
        assert_eq!(admin_commands::decode_number_of_queues(completion.result), (1, 1));

        let transport: Arc<dyn Transport> = device.clone();
        let kind = QueueKind::Io {
            interrupt_vector: None,
        };
        assert!(QueuePair::create(transport, kind, 4, 4).is_err());
        pair.destroy().unwrap();
    }

    #[test]
    fn second_admin_queue_is_rejected() {
        let (device, mut pair) = admin_pair(EmulatedConfig::default());
        let transport: Arc<dyn Transport> = device.clone();
        let result = QueuePair::create(transport, QueueKind::Admin, 4, 4);
        assert!(result.is_err());
        assert_eq!(device.queue_count(), 1);
        pair.destroy().unwrap();
        assert_eq!(device.queue_count(), 0);
    }

    #[test]
    fn unknown_opcode_fails() {
        let (_device, mut pair) = admin_pair(EmulatedConfig::default());
        let mut command = CommandBuffer::new(64, DataDirection::None).unwrap();
        command.set_opcode(0x7e);
        let result = pair.send_and_wait(command, Duration::from_millis(500), CommandStatusCode::SUCCESS);
        let Err(QueuePairError::UnexpectedStatus { actual, .. }) = result else {
            panic!("expected an unexpected status, got {result:?}");
        };
        assert_eq!(
            actual.status(),
            CommandStatusCode::GenericStatus(GenericCommandStatus::InvalidCommandOpcode)
        );
        pair.destroy().unwrap();
    }

    #[test]
    fn injected_status_replaces_execution() {
        let (device, mut pair) = admin_pair(EmulatedConfig::default());
        device.inject_status(GenericCommandStatus::InternalError.into());
        let command = admin_commands::keep_alive().unwrap();
        pair.send_and_wait(
            command,
            Duration::from_millis(500),
            GenericCommandStatus::InternalError,
        )
        .unwrap();
        pair.send_and_wait(
            admin_commands::keep_alive().unwrap(),
            Duration::from_millis(500),
            CommandStatusCode::SUCCESS,
        )
        .unwrap();
        pair.destroy().unwrap();
    }

    #[test]
    fn latency_delays_completion() {
        let config = EmulatedConfig {
            latency: Duration::from_millis(20),
            ..Default::default()
        };
        let (_device, mut pair) = admin_pair(config);
        pair.send(admin_commands::keep_alive().unwrap()).unwrap();
        pair.ring_doorbell().unwrap();
        assert_eq!(pair.completion().available(), 0);

        let start = Instant::now();
        assert_eq!(pair.poll_count(Duration::from_millis(500), 1).unwrap(), 1);
        assert!(start.elapsed() >= Duration::from_millis(15));
        pair.destroy().unwrap();
    }
}
