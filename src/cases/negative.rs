use std::time::Duration;

use anyhow::{bail, Result};
use exerciser_core::{
    admin_commands::keep_alive,
    completion::{CommandStatusCode, GenericCommandStatus},
    generic_command::{CommandBuffer, DataDirection, SUBMISSION_ENTRY_SIZE},
    io_commands::{nvm_read, Lba},
    memory::DataBuffer,
    queue_pair::QueuePairError,
};

use super::{CaseEnv, CaseOutcome};

/// Not assigned in the admin or the NVM command set
const UNUSED_OPCODE: u8 = 0x7e;

pub fn invalid_opcode(env: &mut CaseEnv) -> Result<CaseOutcome> {
    let timeout = env.timeout();
    let mut command = CommandBuffer::new(SUBMISSION_ENTRY_SIZE, DataDirection::None)?;
    command.set_opcode(UNUSED_OPCODE);

    env.admin_pair()?.send_and_wait(
        command.clone(),
        timeout,
        GenericCommandStatus::InvalidCommandOpcode,
    )?;

    let handle = env.io_pair("invalid-opcode", 4)?;
    env.tracker.pair(handle)?.send_and_wait(
        command,
        timeout,
        GenericCommandStatus::InvalidCommandOpcode,
    )?;
    Ok(CaseOutcome::Passed)
}

pub fn lba_out_of_range(env: &mut CaseEnv) -> Result<CaseOutcome> {
    let timeout = env.timeout();
    let nsid = env.context.namespace_id;
    let Some(last) = env.context.namespace.size.checked_sub(1) else {
        return Ok(CaseOutcome::Skipped("namespace has no blocks".into()));
    };
    let block_size = env.context.block_size();

    let handle = env.io_pair("lba-range", 4)?;
    let read = nvm_read(nsid, Lba::new(last), 2, DataBuffer::new(2 * block_size)?)?;
    env.tracker
        .pair(handle)?
        .send_and_wait(read, timeout, GenericCommandStatus::LbaOutOfRange)?;

    let read = nvm_read(nsid, Lba::new(last), 1, DataBuffer::new(block_size)?)?;
    env.tracker
        .pair(handle)?
        .send_and_wait(read, timeout, CommandStatusCode::SUCCESS)?;
    Ok(CaseOutcome::Passed)
}

pub fn completion_timeout(env: &mut CaseEnv) -> Result<CaseOutcome> {
    let timeout = (env.timeout() / 10).max(Duration::from_millis(20));
    let device = env.device.clone();

    // the admin queue is recreated afterwards, which drops the lost command
    env.with_admin_queue(4, 4, |admin| {
        device.set_silent(true);
        let result = admin.send_and_wait(keep_alive()?, timeout, CommandStatusCode::SUCCESS);
        device.set_silent(false);

        match result {
            Err(QueuePairError::CompletionMissing { .. }) => {}
            Err(err) => return Err(err.into()),
            Ok(completion) => bail!(
                "silent device completed command {:#x}",
                completion.command_id
            ),
        }
        admin.disable()?;
        Ok(CaseOutcome::Passed)
    })
}
