use std::time::Duration;

use anyhow::{Context, Result};
use exerciser_core::{
    admin_commands::{
        decode_number_of_queues, get_features, identify, FeatureIdentifier, FeatureSelect,
        IdentifyCns, IdentifyControllerData, IdentifyNamespaceData, IDENTIFY_DATA_SIZE,
    },
    completion::CommandStatusCode,
    emulated::NAMESPACE_ID,
    memory::{DataBuffer, PAGE_SIZE},
    queue_pair::QueuePair,
};
use log::info;

/// Information about the device, read once before any case runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceContext {
    pub controller: IdentifyControllerData,
    pub namespace_id: u32,
    pub namespace: IdentifyNamespaceData,
    /// 1 based number of I/O submission queues the device granted
    pub submission_queues: u32,
    /// 1 based number of I/O completion queues the device granted
    pub completion_queues: u32,
}

fn read_identify(
    admin: &mut QueuePair,
    cns: IdentifyCns,
    timeout: Duration,
) -> Result<[u8; IDENTIFY_DATA_SIZE]> {
    let data = DataBuffer::new(IDENTIFY_DATA_SIZE)?;
    let command = identify(cns, data.clone())?;
    admin.send_and_wait(command, timeout, CommandStatusCode::SUCCESS)?;
    let mut bytes = [0; IDENTIFY_DATA_SIZE];
    data.read(0, &mut bytes)?;
    Ok(bytes)
}

impl DeviceContext {
    /// Reads the identify data and queue counts through `admin`
    pub fn populate(admin: &mut QueuePair, timeout: Duration) -> Result<Self> {
        let controller = IdentifyControllerData::parse(
            &read_identify(admin, IdentifyCns::Controller, timeout)
                .context("identify controller")?,
        );
        let namespace = IdentifyNamespaceData::parse(
            &read_identify(admin, IdentifyCns::Namespace { nsid: NAMESPACE_ID }, timeout)
                .context("identify namespace")?,
        );

        let command = get_features(
            FeatureIdentifier::NumberOfQueues.into(),
            FeatureSelect::Current,
        )?;
        let completion = admin
            .send_and_wait(command, timeout, CommandStatusCode::SUCCESS)
            .context("get number of queues")?;
        let (submission_queues, completion_queues) = decode_number_of_queues(completion.result);

        let (major, minor, tertiary) = controller.version_parts();
        info!(
            "device {:?} serial {:?} firmware {:?}, NVMe {major}.{minor}.{tertiary}",
            controller.model_number, controller.serial_number, controller.firmware_revision
        );
        info!(
            "namespace {NAMESPACE_ID}: {} blocks of {} bytes, {submission_queues}/{completion_queues} io queues",
            namespace.size,
            namespace.block_size()
        );

        Ok(Self {
            controller,
            namespace_id: NAMESPACE_ID,
            namespace,
            submission_queues,
            completion_queues,
        })
    }

    /// The number of I/O queue pairs that can exist at the same time
    pub fn io_queue_pairs(&self) -> u32 {
        self.submission_queues.min(self.completion_queues)
    }

    pub fn block_size(&self) -> usize {
        self.namespace.block_size()
    }

    /// Largest data transfer of a single command, `None` if unlimited
    pub fn max_transfer_size(&self) -> Option<usize> {
        match self.controller.maximum_data_transfer_size {
            0 => None,
            mdts => Some(PAGE_SIZE << mdts),
        }
    }
}
