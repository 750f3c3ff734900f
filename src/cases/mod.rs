//! Built-in conformance cases.
//!
//! Each case is a short script on top of the exerciser core. It gets a
//! [CaseEnv] with the admin queue pair, the [DeviceContext] and a
//! [ResourceTracker] for anything else it creates. Resources a case creates
//! are released when it returns.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use exerciser_core::{emulated::EmulatedDevice, queue_pair::QueuePair, transport::QueueKind};

use crate::{
    config::ExerciserConfig,
    context::DeviceContext,
    tracker::{PairHandle, ResourceTracker},
};

mod admin;
mod io;
mod negative;

/// How a case ended if it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    /// The device does not support what the case needs
    Skipped(String),
}

/// A registered case
#[derive(Clone, Copy)]
pub struct TestCase {
    pub name: &'static str,
    pub description: &'static str,
    pub run: fn(&mut CaseEnv) -> Result<CaseOutcome>,
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Everything a case has access to
pub struct CaseEnv<'a> {
    pub config: &'a ExerciserConfig,
    pub context: &'a DeviceContext,
    pub device: &'a Arc<EmulatedDevice>,
    pub tracker: &'a mut ResourceTracker,
    pub admin: PairHandle,
}

impl CaseEnv<'_> {
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn admin_pair(&mut self) -> Result<&mut QueuePair> {
        Ok(self.tracker.pair(self.admin)?)
    }

    /// Creates a tracked I/O queue pair with `depth` entries in both rings
    pub fn io_pair(&mut self, name: &str, depth: u16) -> Result<PairHandle> {
        let kind = QueueKind::Io {
            interrupt_vector: None,
        };
        Ok(self.tracker.create_pair(name, kind, depth, depth)?)
    }

    /// Runs `f` with the admin queue resized to the given capacities.
    ///
    /// The admin queue is restored to the configured depth afterwards, even
    /// if `f` fails.
    pub fn with_admin_queue<T>(
        &mut self,
        submission_capacity: u16,
        completion_capacity: u16,
        f: impl FnOnce(&mut QueuePair) -> Result<T>,
    ) -> Result<T> {
        self.tracker
            .recreate_pair(self.admin, submission_capacity, completion_capacity)?;
        let result = match self.tracker.pair(self.admin) {
            Ok(pair) => f(pair),
            Err(err) => Err(err.into()),
        };
        let depth = self.config.admin_depth;
        self.tracker.recreate_pair(self.admin, depth, depth)?;
        result
    }
}

/// All built-in cases in the order they run
pub fn builtin_cases() -> Vec<TestCase> {
    vec![
        TestCase {
            name: "admin::identify_controller",
            description: "identify controller on a 5/5 admin queue and check the returned id",
            run: admin::identify_controller,
        },
        TestCase {
            name: "admin::ring_wrap",
            description: "send more commands than the admin rings hold, one at a time",
            run: admin::ring_wrap,
        },
        TestCase {
            name: "admin::completion_smaller_than_submission",
            description: "admin sq of 3 and cq of 2, the second completion waits for a reap",
            run: admin::completion_smaller_than_submission,
        },
        TestCase {
            name: "admin::out_of_order_correlation",
            description: "claim completions in reverse order by command id",
            run: admin::out_of_order_correlation,
        },
        TestCase {
            name: "admin::number_of_queues",
            description: "get and set the number of queues feature",
            run: admin::number_of_queues,
        },
        TestCase {
            name: "admin::abort_unknown_command",
            description: "abort a command that was never sent",
            run: admin::abort_unknown_command,
        },
        TestCase {
            name: "io::submission_queue_full",
            description: "an I/O submission ring accepts capacity - 1 commands",
            run: io::submission_queue_full,
        },
        TestCase {
            name: "io::write_read_compare",
            description: "write a pattern, read it back and compare",
            run: io::write_read_compare,
        },
        TestCase {
            name: "io::smart_data_units",
            description: "the smart log counts written data",
            run: io::smart_data_units,
        },
        TestCase {
            name: "negative::invalid_opcode",
            description: "an unknown admin opcode fails with invalid command opcode",
            run: negative::invalid_opcode,
        },
        TestCase {
            name: "negative::lba_out_of_range",
            description: "a read past the end of the namespace fails",
            run: negative::lba_out_of_range,
        },
        TestCase {
            name: "negative::completion_timeout",
            description: "a command without completion is reported as missing",
            run: negative::completion_timeout,
        },
    ]
}
