//! Runs a list of [TestCase]s against a fresh emulated device

use std::{
    fmt::{self, Display},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use exerciser_core::{emulated::EmulatedDevice, transport::QueueKind};
use log::{error, info, warn};

use crate::{
    cases::{CaseEnv, CaseOutcome, TestCase},
    config::ExerciserConfig,
    context::DeviceContext,
    tracker::ResourceTracker,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseStatus {
    Passed,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct CaseResult {
    pub name: &'static str,
    pub status: CaseStatus,
    pub duration: Duration,
    /// The dump file written for a failed case
    pub dump: Option<PathBuf>,
}

/// The results of [run_suite] in the order the cases ran
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    fn count(&self, f: impl Fn(&CaseStatus) -> bool) -> usize {
        self.results.iter().filter(|r| f(&r.status)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|s| matches!(s, CaseStatus::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, CaseStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, CaseStatus::Skipped(_)))
    }

    /// `true` if no case failed
    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    pub fn get(&self, name: &str) -> Option<&CaseResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

impl Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            match &result.status {
                CaseStatus::Passed => {
                    writeln!(f, "ok      {} ({:?})", result.name, result.duration)?
                }
                CaseStatus::Failed(message) => {
                    writeln!(f, "FAILED  {}: {message}", result.name)?
                }
                CaseStatus::Skipped(reason) => {
                    writeln!(f, "skipped {}: {reason}", result.name)?
                }
            }
        }
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.passed(),
            self.failed(),
            self.skipped()
        )
    }
}

fn write_dump(
    dir: &Path,
    case: &TestCase,
    message: &str,
    tracker: &ResourceTracker,
) -> Result<PathBuf> {
    fs_err::create_dir_all(dir)?;
    let path = dir.join(format!("{}.dump", case.name.replace("::", "-")));
    let mut out = BufWriter::new(fs_err::File::create(&path)?);
    writeln!(out, "case: {}", case.name)?;
    writeln!(out, "error: {message}")?;
    for (name, pair) in tracker.pairs() {
        writeln!(out)?;
        pair.dump(&mut out, name)?;
    }
    out.flush()?;
    Ok(path)
}

/// Runs every case of `cases` selected by the filter of `config`.
///
/// Fails only if the device setup fails. Failures of individual cases are
/// part of the report.
pub fn run_suite(config: &ExerciserConfig, cases: &[TestCase]) -> Result<SuiteReport> {
    let device = Arc::new(EmulatedDevice::new(config.device.clone()));
    let mut tracker = ResourceTracker::new(device.clone());
    let admin = tracker
        .create_pair(
            "admin",
            QueueKind::Admin,
            config.admin_depth,
            config.admin_depth,
        )
        .context("create admin queue")?;
    let context = DeviceContext::populate(tracker.pair(admin)?, config.timeout)
        .context("read device context")?;

    let mut report = SuiteReport::default();
    let mut stop = false;
    for case in cases.iter().filter(|c| config.selects(c.name)) {
        if stop {
            report.results.push(CaseResult {
                name: case.name,
                status: CaseStatus::Skipped("an earlier case failed".into()),
                duration: Duration::ZERO,
                dump: None,
            });
            continue;
        }

        info!("run {}", case.name);
        let checkpoint = tracker.mark();
        let start = Instant::now();
        let result = {
            let mut env = CaseEnv {
                config,
                context: &context,
                device: &device,
                tracker: &mut tracker,
                admin,
            };
            (case.run)(&mut env)
        };
        let duration = start.elapsed();

        let mut dump = None;
        let status = match result {
            Ok(CaseOutcome::Passed) => CaseStatus::Passed,
            Ok(CaseOutcome::Skipped(reason)) => {
                info!("skipped {}: {reason}", case.name);
                CaseStatus::Skipped(reason)
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!("{} failed: {message}", case.name);
                if let Some(dir) = &config.dump_dir {
                    match write_dump(dir, case, &message, &tracker) {
                        Ok(path) => dump = Some(path),
                        Err(err) => warn!("failed to write dump for {}: {err:#}", case.name),
                    }
                }
                stop = !config.keep_going;
                CaseStatus::Failed(message)
            }
        };

        tracker
            .release_since(checkpoint)
            .with_context(|| format!("release resources of {}", case.name))?;
        if matches!(status, CaseStatus::Failed(_)) {
            // drop anything the case left in flight on the admin queue
            let depth = config.admin_depth;
            tracker.recreate_pair(admin, depth, depth)?;
        }

        report.results.push(CaseResult {
            name: case.name,
            status,
            duration,
            dump,
        });
    }

    tracker.teardown().context("teardown")?;
    info!(
        "{} passed, {} failed, {} skipped",
        report.passed(),
        report.failed(),
        report.skipped()
    );
    Ok(report)
}
