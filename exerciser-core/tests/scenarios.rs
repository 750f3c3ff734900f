mod common;

use std::time::Duration;

use common::{admin_pair, device, io_pair};
use exerciser_core::{
    admin_commands::{
        decode_number_of_queues, get_features, identify, set_features, FeatureIdentifier,
        FeatureSelect, IdentifyCns, IdentifyControllerData, IdentifyNamespaceData,
        SetFeatureData, IDENTIFY_DATA_SIZE,
    },
    completion::{CommandStatusCode, GenericCommandStatus},
    emulated::{EmulatedConfig, NAMESPACE_ID},
    generic_command::DataDirection,
    io_commands::{nvm_read, nvm_write, Lba},
    memory::{DataBuffer, PAGE_SIZE},
    prp::Placement,
    queue_pair::QueuePairError,
};

const TIMEOUT: Duration = Duration::from_millis(500);

fn identify_data(buffer: &DataBuffer) -> [u8; IDENTIFY_DATA_SIZE] {
    let mut bytes = [0; IDENTIFY_DATA_SIZE];
    buffer.read(0, &mut bytes).unwrap();
    bytes
}

#[test]
fn identify_controller_on_small_admin_queue() {
    let device = device(EmulatedConfig::default());
    let mut pair = admin_pair(&device, 5, 5);

    let data = DataBuffer::new(IDENTIFY_DATA_SIZE).unwrap();
    let command = identify(IdentifyCns::Controller, data.clone()).unwrap();
    assert_eq!(command.opcode(), 0x06);
    assert_eq!(command.direction(), DataDirection::DeviceToHost);

    let command_id = pair.send(command).unwrap();
    pair.ring_doorbell().unwrap();
    let reaped = pair.wait_for(command_id, TIMEOUT).unwrap();
    assert_eq!(reaped.completion.command_id, command_id);
    assert_eq!(reaped.command.command_id(), command_id);
    assert!(reaped.completion.status().is_success());

    let controller = IdentifyControllerData::parse(&identify_data(&data));
    assert_eq!(controller, {
        let mut expected = device.config().controller.clone();
        expected.number_of_namespaces = 1;
        expected
    });

    // the composite does the same in one call
    let data = DataBuffer::new(IDENTIFY_DATA_SIZE).unwrap();
    let command = identify(IdentifyCns::Namespace { nsid: NAMESPACE_ID }, data.clone()).unwrap();
    pair.send_and_wait(command, TIMEOUT, CommandStatusCode::SUCCESS)
        .unwrap();
    let namespace = IdentifyNamespaceData::parse(&identify_data(&data));
    assert_eq!(namespace.size, 1024);
    assert_eq!(namespace.block_size(), 512);

    pair.destroy().unwrap();
}

#[test]
fn submission_one_larger_than_completion() {
    let device = device(EmulatedConfig::default());
    let mut pair = admin_pair(&device, 3, 2);

    let first = pair
        .send(exerciser_core::admin_commands::keep_alive().unwrap())
        .unwrap();
    let second = pair
        .send(exerciser_core::admin_commands::keep_alive().unwrap())
        .unwrap();
    pair.ring_doorbell().unwrap();

    assert_eq!(pair.poll_count(TIMEOUT, 1).unwrap(), 1);
    // the completion ring only has room for one entry
    assert_eq!(pair.completion().available(), 1);
    let reaped = pair.reap(2).unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].command_id, first);

    assert_eq!(pair.poll_count(TIMEOUT, 1).unwrap(), 1);
    let reaped = pair.reap(2).unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].command_id, second);
    assert!(pair.take_completion(first).is_some());
    assert!(pair.take_completion(second).is_some());

    pair.destroy().unwrap();
}

#[test]
fn number_of_queues_feature() {
    let device = device(EmulatedConfig {
        max_io_queues: 4,
        ..Default::default()
    });
    let mut admin = admin_pair(&device, 8, 8);

    let command = set_features(
        SetFeatureData::NumberOfQueues {
            sub_count: 2,
            comp_count: 16,
        },
        false,
    )
    .unwrap();
    let completion = admin
        .send_and_wait(command, TIMEOUT, CommandStatusCode::SUCCESS)
        .unwrap();
    assert_eq!(decode_number_of_queues(completion.result), (2, 4));

    let command = get_features(FeatureIdentifier::NumberOfQueues.into(), FeatureSelect::Current)
        .unwrap();
    let completion = admin
        .send_and_wait(command, TIMEOUT, CommandStatusCode::SUCCESS)
        .unwrap();
    assert_eq!(decode_number_of_queues(completion.result), (2, 4));

    let mut first = io_pair(&device, 16, 16);
    let mut second = io_pair(&device, 16, 16);
    assert_eq!(first.handle().unwrap().id().as_u16(), 1);
    assert_eq!(second.handle().unwrap().id().as_u16(), 2);

    // a third pair exceeds the granted count
    let transport: std::sync::Arc<dyn exerciser_core::transport::Transport> = device.clone();
    let third = exerciser_core::queue_pair::QueuePair::create(
        transport,
        exerciser_core::transport::QueueKind::Io {
            interrupt_vector: None,
        },
        16,
        16,
    );
    assert!(matches!(third, Err(QueuePairError::Transport(_))));

    // the count is fixed once I/O queues exist
    let command = set_features(
        SetFeatureData::NumberOfQueues {
            sub_count: 4,
            comp_count: 4,
        },
        false,
    )
    .unwrap();
    admin
        .send_and_wait(command, TIMEOUT, GenericCommandStatus::CommandSequenceError)
        .unwrap();

    first.destroy().unwrap();
    second.destroy().unwrap();
    admin.destroy().unwrap();
}

#[test]
fn io_write_read_compare() {
    let device = device(EmulatedConfig::default());
    let mut admin = admin_pair(&device, 4, 4);
    let mut io = io_pair(&device, 32, 32);

    let pattern: Vec<u8> = (0..4 * PAGE_SIZE).map(|i| (i * 7 % 256) as u8).collect();
    let write_buffer = DataBuffer::from_bytes(&pattern).unwrap();
    let blocks = (pattern.len() / 512) as u16;
    let write = nvm_write(NAMESPACE_ID, Lba::new(16), blocks, write_buffer).unwrap();
    assert_eq!(
        write.descriptor().unwrap().placement(),
        Placement::FirstAndList { entries: 3 }
    );
    io.send_and_wait(write, TIMEOUT, CommandStatusCode::SUCCESS)
        .unwrap();

    let read_buffer = DataBuffer::with_offset(pattern.len(), 0x100).unwrap();
    let read = nvm_read(NAMESPACE_ID, Lba::new(16), blocks, read_buffer.clone()).unwrap();
    io.send_and_wait(read, TIMEOUT, CommandStatusCode::SUCCESS)
        .unwrap();
    assert_eq!(read_buffer.to_vec(), pattern);
    assert_eq!(device.mapped_regions(), 0);

    let past_end = nvm_read(NAMESPACE_ID, Lba::new(1020), 8, DataBuffer::new(4096).unwrap()).unwrap();
    io.send_and_wait(past_end, TIMEOUT, GenericCommandStatus::LbaOutOfRange)
        .unwrap();

    io.destroy().unwrap();
    admin.destroy().unwrap();
}
