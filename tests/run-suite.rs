use std::{sync::Once, time::Duration};

use anyhow::{bail, Result};
use exerciser_core::emulated::CompletionOrder;
use nvme_exerciser::{
    cases::{builtin_cases, CaseEnv, CaseOutcome, TestCase},
    config::ExerciserConfig,
    suite::{run_suite, CaseStatus},
};

static LOGGER_INIT: Once = Once::new();

fn init_test_logger() {
    LOGGER_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn failing(env: &mut CaseEnv) -> Result<CaseOutcome> {
    // leave a queue pair behind for the dump
    env.io_pair("left-behind", 4)?;
    bail!("this case always fails")
}

fn skipping(_env: &mut CaseEnv) -> Result<CaseOutcome> {
    Ok(CaseOutcome::Skipped("not supported".into()))
}

const FAILING: TestCase = TestCase {
    name: "custom::failing",
    description: "always fails",
    run: failing,
};

const SKIPPING: TestCase = TestCase {
    name: "custom::skipping",
    description: "always skips",
    run: skipping,
};

#[test]
fn builtin_cases_pass_with_defaults() {
    init_test_logger();
    let config = ExerciserConfig::default();
    let cases = builtin_cases();
    let report = run_suite(&config, &cases).unwrap();
    assert!(report.success(), "{report}");
    assert_eq!(report.passed(), cases.len());
}

#[test]
fn builtin_cases_pass_with_reversed_completions() {
    init_test_logger();
    let mut config = ExerciserConfig::default();
    config.device.completion_order = CompletionOrder::Reversed;
    config.device.latency = Duration::from_millis(2);
    let report = run_suite(&config, &builtin_cases()).unwrap();
    assert!(report.success(), "{report}");
}

#[test]
fn filter_selects_cases() {
    init_test_logger();
    let config = ExerciserConfig {
        filter: Some("negative::".into()),
        ..ExerciserConfig::default()
    };
    let report = run_suite(&config, &builtin_cases()).unwrap();
    assert_eq!(report.results.len(), 3);
    assert!(report
        .results
        .iter()
        .all(|r| r.name.starts_with("negative::")));
    assert!(report.success(), "{report}");
}

#[test]
fn failure_stops_the_suite() {
    init_test_logger();
    let config = ExerciserConfig::default();
    let cases = [FAILING, builtin_cases()[0], SKIPPING];
    let report = run_suite(&config, &cases).unwrap();

    assert!(!report.success());
    assert_eq!(report.failed(), 1);
    assert_eq!(report.skipped(), 2);
    assert!(matches!(
        report.get("custom::skipping").unwrap().status,
        CaseStatus::Skipped(_)
    ));
}

#[test]
fn keep_going_writes_dump() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = ExerciserConfig {
        keep_going: true,
        dump_dir: Some(dir.path().to_owned()),
        ..ExerciserConfig::default()
    };
    let cases = [FAILING, builtin_cases()[0], SKIPPING];
    let report = run_suite(&config, &cases).unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(report.passed(), 1);
    assert_eq!(report.skipped(), 1);

    let failed = report.get("custom::failing").unwrap();
    let dump = failed.dump.as_ref().unwrap();
    assert!(dump.starts_with(dir.path()));
    let content = std::fs::read_to_string(dump).unwrap();
    assert!(content.contains("this case always fails"));
    assert!(content.contains("admin"));
    assert!(content.contains("left-behind"));
    assert!(report.get("admin::identify_controller").unwrap().dump.is_none());
}

#[test]
fn empty_namespace_skips_lba_cases() {
    init_test_logger();
    let mut config = ExerciserConfig {
        filter: Some("negative::lba_out_of_range".into()),
        ..ExerciserConfig::default()
    };
    config.device.namespace_blocks = 0;
    let report = run_suite(&config, &builtin_cases()).unwrap();
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.skipped(), 1, "{report}");
}
