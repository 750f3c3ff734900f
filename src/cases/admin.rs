use std::collections::BTreeSet;

use anyhow::{bail, ensure, Context, Result};
use exerciser_core::{
    admin_commands::{
        abort, abort_not_performed, decode_number_of_queues, get_features, identify,
        keep_alive, set_features, FeatureIdentifier, FeatureSelect, IdentifyCns,
        IdentifyControllerData, SetFeatureData, FEATURE_ID, IDENTIFY_DATA_SIZE,
    },
    completion::{CommandStatusCode, GenericCommandStatus},
    generic_command::CommandIdentifier,
    memory::DataBuffer,
    queue::QueueIdentifier,
};
use log::debug;

use super::{CaseEnv, CaseOutcome};

pub fn identify_controller(env: &mut CaseEnv) -> Result<CaseOutcome> {
    let timeout = env.timeout();
    let expected = env.context.controller.clone();
    env.with_admin_queue(5, 5, |admin| {
        let data = DataBuffer::new(IDENTIFY_DATA_SIZE)?;
        let command = identify(IdentifyCns::Controller, data.clone())?;

        let command_id = admin.send(command)?;
        admin.ring_doorbell()?;
        let reaped = admin.wait_for(command_id, timeout)?;
        let status = reaped.completion.status();
        ensure!(status.is_success(), "identify failed with {status}");
        ensure!(
            reaped.completion.command_id == command_id,
            "completion for {:#x} returned for command {command_id:#x}",
            reaped.completion.command_id
        );
        ensure!(reaped.command.command_id() == command_id);

        let mut bytes = [0; IDENTIFY_DATA_SIZE];
        data.read(0, &mut bytes)?;
        let controller = IdentifyControllerData::parse(&bytes);
        ensure!(
            controller == expected,
            "identify data differs from setup: {controller:?}"
        );
        Ok(CaseOutcome::Passed)
    })
}

pub fn ring_wrap(env: &mut CaseEnv) -> Result<CaseOutcome> {
    const CAPACITY: u16 = 4;
    let timeout = env.timeout();
    env.with_admin_queue(CAPACITY, CAPACITY, |admin| {
        for sent in 1..=(3 * CAPACITY + 1) {
            admin
                .send_and_wait(keep_alive()?, timeout, CommandStatusCode::SUCCESS)
                .with_context(|| format!("keep alive {sent}"))?;

            let wraps = sent / CAPACITY;
            let phase = admin.completion().expected_phase();
            ensure!(
                phase == (wraps % 2 == 0),
                "expected phase {phase} after {wraps} wraps"
            );
            ensure!(admin.completion().head() == sent % CAPACITY);
            ensure!(admin.submission().tail() == sent % CAPACITY);
        }
        Ok(CaseOutcome::Passed)
    })
}

pub fn completion_smaller_than_submission(env: &mut CaseEnv) -> Result<CaseOutcome> {
    let timeout = env.timeout();
    env.with_admin_queue(3, 2, |admin| {
        let ids: BTreeSet<_> = admin
            .send_all([keep_alive()?, keep_alive()?])?
            .into_iter()
            .collect();
        admin.ring_doorbell()?;

        let mut seen = BTreeSet::new();
        for round in 0..2 {
            admin.poll_count(timeout, 1)?;
            // one slot stays empty, so the second completion is not posted yet
            let available = admin.completion().available();
            ensure!(available == 1, "round {round}: {available} completions visible");
            let reaped = admin.reap(u16::MAX)?;
            ensure!(reaped.len() == 1, "round {round}: reaped {}", reaped.len());
            seen.insert(reaped[0].command_id);
        }
        ensure!(seen == ids, "completions {seen:?} do not match commands {ids:?}");
        for id in ids {
            admin
                .take_completion(id)
                .with_context(|| format!("completion {id:#x} was not paired"))?;
        }
        Ok(CaseOutcome::Passed)
    })
}

pub fn out_of_order_correlation(env: &mut CaseEnv) -> Result<CaseOutcome> {
    let timeout = env.timeout();
    let queues = (env.context.submission_queues, env.context.completion_queues);
    let admin = env.admin_pair()?;

    let features = [
        FeatureIdentifier::Arbitration,
        FeatureIdentifier::PowerManagement,
        FeatureIdentifier::TemperatureThreshold,
        FeatureIdentifier::VolatileWriteCache,
        FeatureIdentifier::NumberOfQueues,
    ];
    let mut sent = Vec::new();
    for feature in features {
        let command = get_features(feature.into(), FeatureSelect::Current)?;
        sent.push((admin.send(command)?, feature));
    }
    admin.ring_doorbell()?;

    for (command_id, feature) in sent.into_iter().rev() {
        let reaped = admin.wait_for(command_id, timeout)?;
        let status = reaped.completion.status();
        ensure!(status.is_success(), "get {feature:?} failed with {status}");
        let fid = reaped.command.field(&FEATURE_ID)?;
        ensure!(
            fid == u8::from(feature) as u32,
            "completion {command_id:#x} was paired with feature {fid:#x}"
        );
        debug!("{feature:?}: {:#x}", reaped.completion.result);
        if feature == FeatureIdentifier::NumberOfQueues {
            let granted = decode_number_of_queues(reaped.completion.result);
            ensure!(granted == queues, "granted queues {granted:?}, expected {queues:?}");
        }
    }
    ensure!(admin.outstanding() == 0);
    Ok(CaseOutcome::Passed)
}

pub fn number_of_queues(env: &mut CaseEnv) -> Result<CaseOutcome> {
    let timeout = env.timeout();
    let context = env.context.clone();
    let (sub_count, comp_count) = (
        context.submission_queues as u16,
        context.completion_queues as u16,
    );

    let admin = env.admin_pair()?;
    let command = get_features(
        FeatureIdentifier::NumberOfQueues.into(),
        FeatureSelect::Current,
    )?;
    let current = admin.send_and_wait(command, timeout, CommandStatusCode::SUCCESS)?;
    ensure!(decode_number_of_queues(current.result) == (sub_count as u32, comp_count as u32));

    let command = set_features(
        SetFeatureData::NumberOfQueues {
            sub_count,
            comp_count,
        },
        false,
    )?;
    let granted = admin.send_and_wait(command, timeout, CommandStatusCode::SUCCESS)?;
    let (granted_sub, granted_comp) = decode_number_of_queues(granted.result);
    ensure!(
        granted_sub <= sub_count as u32 && granted_comp <= comp_count as u32,
        "device granted {granted_sub}/{granted_comp} queues, requested {sub_count}/{comp_count}"
    );

    // 0xffff is not a valid count
    let command = set_features(
        SetFeatureData::Raw {
            identifier: FeatureIdentifier::NumberOfQueues.into(),
            value: u32::MAX,
        },
        false,
    )?;
    admin.send_and_wait(command, timeout, GenericCommandStatus::InvalidFieldInCommand)?;

    // the count is fixed once an I/O queue exists
    let io = env.io_pair("number-of-queues-io", 4)?;
    let command = set_features(
        SetFeatureData::NumberOfQueues {
            sub_count,
            comp_count,
        },
        false,
    )?;
    env.admin_pair()?.send_and_wait(
        command,
        timeout,
        GenericCommandStatus::CommandSequenceError,
    )?;
    env.tracker.destroy_pair(io)?;

    Ok(CaseOutcome::Passed)
}

pub fn abort_unknown_command(env: &mut CaseEnv) -> Result<CaseOutcome> {
    let timeout = env.timeout();
    let admin = env.admin_pair()?;
    let command = abort(QueueIdentifier::ADMIN, CommandIdentifier::new(0x1234))?;
    let completion = admin.send_and_wait(command, timeout, CommandStatusCode::SUCCESS)?;
    if !abort_not_performed(completion.result) {
        bail!("device reports that a command that was never sent was aborted");
    }
    Ok(CaseOutcome::Passed)
}
