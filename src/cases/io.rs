use anyhow::{bail, ensure, Result};
use exerciser_core::{
    admin_commands::{get_log_page, LogPageIdentifier},
    completion::CommandStatusCode,
    emulated::BROADCAST_NAMESPACE,
    io_commands::{nvm_flush, nvm_read, nvm_write, Lba},
    kind::CommandKind,
    memory::DataBuffer,
    queue::QueueError,
    queue_pair::QueuePairError,
};

use super::{CaseEnv, CaseOutcome};

const SMART_LOG_SIZE: usize = 512;

pub fn submission_queue_full(env: &mut CaseEnv) -> Result<CaseOutcome> {
    let timeout = env.timeout();
    let depth = env.config.io_depth;
    let nsid = env.context.namespace_id;
    let handle = env.io_pair("submission-full", depth)?;
    let io = env.tracker.pair(handle)?;

    let ids = io.send_all((1..depth).map(|_| nvm_flush(nsid)).collect::<Result<Vec<_>, _>>()?)?;
    ensure!(io.submission().is_full());
    match io.send(nvm_flush(nsid)?) {
        Err(QueuePairError::Queue(QueueError::QueueFull { capacity })) if capacity == depth => {}
        Err(err) => return Err(err.into()),
        Ok(id) => bail!("command {id:#x} was accepted by a full submission ring"),
    }

    io.ring_doorbell()?;
    for reaped in io.wait_for_all(ids, timeout)? {
        let status = reaped.completion.status();
        ensure!(status.is_success(), "flush failed with {status}");
    }
    ensure!(io.submission().is_empty());
    Ok(CaseOutcome::Passed)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn write_read_compare(env: &mut CaseEnv) -> Result<CaseOutcome> {
    let timeout = env.timeout();
    let context = env.context.clone();
    let block_size = context.block_size();
    let mut blocks: usize = 32;
    if let Some(max) = context.max_transfer_size() {
        blocks = blocks.min(max / block_size);
    }
    if (context.namespace.size as usize) < blocks {
        return Ok(CaseOutcome::Skipped(format!(
            "namespace has only {} blocks",
            context.namespace.size
        )));
    }
    // the last blocks of the namespace
    let slba = Lba::new(context.namespace.size - blocks as u64);

    let depth = env.config.io_depth;
    let handle = env.io_pair("write-read", depth)?;
    let io = env.tracker.pair(handle)?;

    let data = pattern(blocks * block_size, 0x5a);
    let write = nvm_write(
        context.namespace_id,
        slba,
        blocks as u16,
        DataBuffer::from_bytes(&data)?,
    )?;
    io.send_and_wait(write, timeout, CommandStatusCode::SUCCESS)?;

    // odd first page offset to exercise the prp offset
    let read_buffer = DataBuffer::with_offset(data.len(), 0x204)?;
    let read = nvm_read(context.namespace_id, slba, blocks as u16, read_buffer.clone())?;
    io.send_and_wait(read, timeout, CommandStatusCode::SUCCESS)?;

    let read_back = read_buffer.to_vec();
    if let Some(at) = read_back.iter().zip(&data).position(|(a, b)| a != b) {
        bail!(
            "data mismatch at byte {at}: read {:#x}, wrote {:#x}",
            read_back[at],
            data[at]
        );
    }
    Ok(CaseOutcome::Passed)
}

/// Host write commands and data units written from the smart log
fn smart_write_counters(env: &mut CaseEnv) -> Result<(u128, u128)> {
    let timeout = env.timeout();
    let data = DataBuffer::new(SMART_LOG_SIZE)?;
    let command = get_log_page(
        LogPageIdentifier::SmartHealthInformation.into(),
        BROADCAST_NAMESPACE,
        0,
        CommandKind::GetLogPage.layout().placement,
        data.clone(),
    )?;
    env.admin_pair()?
        .send_and_wait(command, timeout, CommandStatusCode::SUCCESS)?;

    let mut page = [0; SMART_LOG_SIZE];
    data.read(0, &mut page)?;
    let counter = |at: usize| {
        let mut bytes = [0; 16];
        bytes.copy_from_slice(&page[at..at + 16]);
        u128::from_le_bytes(bytes)
    };
    Ok((counter(80), counter(48)))
}

pub fn smart_data_units(env: &mut CaseEnv) -> Result<CaseOutcome> {
    let timeout = env.timeout();
    let (commands_before, _) = smart_write_counters(env)?;

    let nsid = env.context.namespace_id;
    let block_size = env.context.block_size();
    let handle = env.io_pair("smart", 4)?;
    let write = nvm_write(nsid, Lba::new(0), 1, DataBuffer::from_bytes(&pattern(block_size, 1))?)?;
    env.tracker
        .pair(handle)?
        .send_and_wait(write, timeout, CommandStatusCode::SUCCESS)?;

    let (commands_after, units_after) = smart_write_counters(env)?;
    ensure!(
        commands_after == commands_before + 1,
        "host write commands went from {commands_before} to {commands_after}"
    );
    ensure!(units_after > 0, "no data units written reported");
    Ok(CaseOutcome::Passed)
}
