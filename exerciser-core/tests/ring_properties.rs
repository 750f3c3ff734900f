mod common;

use std::{
    collections::BTreeSet,
    time::{Duration, Instant},
};

use common::{admin_pair, device};
use exerciser_core::{
    admin_commands::keep_alive,
    emulated::{CompletionOrder, EmulatedConfig},
    generic_command::{CommandBuffer, DataDirection, FieldError, FieldWidth},
    queue::QueueError,
    queue_pair::{QueuePairError, MAX_UNCLAIMED_COMPLETIONS},
};

#[test]
fn sub_field_writes_keep_other_bits() {
    let mut command = CommandBuffer::new(64, DataDirection::None).unwrap();
    command.set_dword(5, 0xdead_beef).unwrap();
    assert_eq!(command.get_dword(5).unwrap(), 0xdead_beef);

    command.set_word(5, 1, 0x1234).unwrap();
    assert_eq!(command.get_word(5, 1).unwrap(), 0x1234);
    assert_eq!(command.get_dword(5).unwrap(), 0x1234_beef);

    command.set_byte(5, 0, 0x00).unwrap();
    assert_eq!(command.get_byte(5, 0).unwrap(), 0);
    assert_eq!(command.get_dword(5).unwrap(), 0x1234_be00);

    command.set_bit(5, 31, false).unwrap();
    command.set_bit(5, 0, true).unwrap();
    assert!(command.get_bit(5, 0).unwrap());
    assert!(!command.get_bit(5, 31).unwrap());
    assert_eq!(command.get_dword(5).unwrap(), 0x1234_be01);

    // neighbours are untouched
    assert_eq!(command.get_dword(4).unwrap(), 0);
    assert_eq!(command.get_dword(6).unwrap(), 0);
}

#[test]
fn accessors_reject_out_of_range() {
    let mut command = CommandBuffer::new(64, DataDirection::None).unwrap();
    assert_eq!(command.dword_count(), 16);
    assert_eq!(
        command.get_dword(16),
        Err(FieldError::IndexOutOfRange {
            index: 16,
            dword_count: 16
        })
    );
    assert!(command.set_dword(100, 1).is_err());
    assert_eq!(
        command.get_byte(0, 4),
        Err(FieldError::InvalidOffset {
            width: FieldWidth::Byte,
            offset: 4
        })
    );
    assert_eq!(
        command.get_bit(0, 32),
        Err(FieldError::InvalidOffset {
            width: FieldWidth::Bit,
            offset: 32
        })
    );
    assert!(command.get_word(0, 2).is_err());
}

#[test]
fn size_must_be_whole_dwords() {
    assert_eq!(
        CommandBuffer::new(6, DataDirection::None).unwrap_err(),
        FieldError::InvalidSize(6)
    );
    assert!(CommandBuffer::new(0, DataDirection::None).is_err());
    let command = CommandBuffer::new(64, DataDirection::DeviceToHost).unwrap();
    assert_eq!(command.dword_count(), 16);
}

#[test]
fn submission_ring_holds_capacity_minus_one() {
    let device = device(EmulatedConfig::default());
    let mut pair = admin_pair(&device, 4, 8);

    for _ in 0..3 {
        pair.send(keep_alive().unwrap()).unwrap();
    }
    assert!(pair.submission().is_full());
    assert_eq!(
        pair.send(keep_alive().unwrap()),
        Err(QueuePairError::Queue(QueueError::QueueFull { capacity: 4 }))
    );

    pair.ring_doorbell().unwrap();
    pair.poll_count(Duration::from_millis(500), 1).unwrap();
    assert_eq!(pair.reap(1).unwrap().len(), 1);
    pair.send(keep_alive().unwrap()).unwrap();

    pair.ring_doorbell().unwrap();
    pair.poll_count(Duration::from_millis(500), 3).unwrap();
    assert_eq!(pair.reap(u16::MAX).unwrap().len(), 3);
    pair.destroy().unwrap();
}

#[test]
fn command_ids_are_unique_and_correlate_in_reverse() {
    let device = device(EmulatedConfig {
        completion_order: CompletionOrder::Reversed,
        ..Default::default()
    });
    let mut pair = admin_pair(&device, 16, 16);

    let ids = pair
        .send_all((0..8).map(|_| keep_alive().unwrap()))
        .unwrap();
    let distinct: BTreeSet<_> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), ids.len());
    assert_eq!(pair.outstanding(), 8);

    pair.ring_doorbell().unwrap();
    pair.poll_count(Duration::from_millis(500), 8).unwrap();
    let reaped = pair.reap(8).unwrap();
    let order: Vec<_> = reaped.iter().map(|c| c.command_id).collect();
    let mut reversed = ids.clone();
    reversed.reverse();
    assert_eq!(order, reversed);

    for id in ids {
        let reaped = pair.take_completion(id).expect("completion was reaped");
        assert_eq!(reaped.command.command_id(), id);
        assert_eq!(reaped.completion.command_id, id);
        assert!(reaped.completion.status().is_success());
    }
    assert_eq!(pair.outstanding(), 0);
    pair.destroy().unwrap();
}

#[test]
fn reap_only_survives_command_id_wrap() {
    let device = device(EmulatedConfig::default());
    let mut pair = admin_pair(&device, 4, 4);
    let timeout = Duration::from_millis(500);

    let mut seen = BTreeSet::new();
    for sent in 0..0x1_0010u32 {
        let id = pair
            .send(keep_alive().unwrap())
            .unwrap_or_else(|err| panic!("send {sent} failed: {err}"));
        seen.insert(id);
        pair.ring_doorbell().unwrap();
        pair.poll_count(timeout, 1).unwrap();
        let reaped = pair.reap(1).unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].command_id, id);
        assert!(reaped[0].status().is_success());
        assert!(pair.unclaimed() <= MAX_UNCLAIMED_COMPLETIONS + 1);
    }
    // every id except 0xffff was handed out and reused
    assert_eq!(seen.len(), 0xffff);
    assert_eq!(pair.outstanding(), 0);
    assert!(pair.submission().is_empty());

    // the latest completion can still be claimed
    let id = pair.send(keep_alive().unwrap()).unwrap();
    pair.ring_doorbell().unwrap();
    pair.poll_count(timeout, 1).unwrap();
    pair.reap(1).unwrap();
    assert!(pair.take_completion(id).is_some());
    pair.destroy().unwrap();
}

#[test]
fn poll_count_times_out_without_completions() {
    let device = device(EmulatedConfig::default());
    let mut pair = admin_pair(&device, 4, 4);

    let start = Instant::now();
    let result = pair.poll_count(Duration::from_millis(50), 1);
    let elapsed = start.elapsed();
    assert!(matches!(
        result,
        Err(QueuePairError::Queue(QueueError::Timeout {
            want: 1,
            available: 0,
            ..
        }))
    ));
    assert!(elapsed >= Duration::from_millis(50), "returned after {elapsed:?}");
    pair.destroy().unwrap();
}

#[test]
fn poll_count_rejects_unreachable_counts() {
    let device = device(EmulatedConfig::default());
    let mut pair = admin_pair(&device, 4, 4);
    assert_eq!(
        pair.poll_count(Duration::from_millis(10), 4),
        Err(QueuePairError::Queue(QueueError::InvalidCount { want: 4, max: 3 }))
    );
    pair.destroy().unwrap();
}

#[test]
fn silent_device_reports_missing_completion() {
    let device = device(EmulatedConfig::default());
    let mut pair = admin_pair(&device, 4, 4);
    device.set_silent(true);

    let result = pair.send_and_wait(
        keep_alive().unwrap(),
        Duration::from_millis(50),
        exerciser_core::completion::CommandStatusCode::SUCCESS,
    );
    assert!(matches!(
        result,
        Err(QueuePairError::CompletionMissing { .. })
    ));
    assert_eq!(device.swallowed_completions(), 1);

    pair.disable().unwrap();
    assert_eq!(pair.outstanding(), 0);
    pair.destroy().unwrap();
}
