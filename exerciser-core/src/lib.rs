//! Host side core of the NVMe conformance exerciser.
//!
//! Commands are built as [CommandBuffer](generic_command::CommandBuffer)s,
//! optionally carrying a data transfer described by PRP entries, and sent
//! through a [QueuePair](queue_pair::QueuePair). A queue pair owns the
//! submission and completion rings and talks to the device through the
//! [Transport](transport::Transport) trait. The [emulated] device implements
//! that trait in process.

pub mod admin_commands;
pub mod completion;
pub mod dump;
pub mod emulated;
pub mod generic_command;
pub mod io_commands;
pub mod kind;
pub mod memory;
pub mod prp;
pub mod queue;
pub mod queue_pair;
pub mod transport;

#[cfg(test)]
mod test_utils {
    use std::sync::Once;

    static LOGGER: Once = Once::new();

    /// Initializes `env_logger` once for all unit tests
    pub fn init_test_logger() {
        LOGGER.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }
}
