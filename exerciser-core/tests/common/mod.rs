//! Helpers shared by the integration tests

use std::sync::{Arc, Once};

use exerciser_core::{
    emulated::{EmulatedConfig, EmulatedDevice},
    queue_pair::QueuePair,
    transport::{QueueKind, Transport},
};

static LOGGER_INIT: Once = Once::new();

/// Initializes a logger
///
/// This can be called multiple times and ensures that
/// the logger is only initialized once.
pub fn init_test_logger() {
    LOGGER_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn device(config: EmulatedConfig) -> Arc<EmulatedDevice> {
    init_test_logger();
    Arc::new(EmulatedDevice::new(config))
}

#[allow(dead_code)]
pub fn admin_pair(device: &Arc<EmulatedDevice>, submission: u16, completion: u16) -> QueuePair {
    let transport: Arc<dyn Transport> = device.clone();
    QueuePair::create(transport, QueueKind::Admin, submission, completion)
        .expect("failed to create admin queue pair")
}

#[allow(dead_code)]
pub fn io_pair(device: &Arc<EmulatedDevice>, submission: u16, completion: u16) -> QueuePair {
    let transport: Arc<dyn Transport> = device.clone();
    let kind = QueueKind::Io {
        interrupt_vector: None,
    };
    QueuePair::create(transport, kind, submission, completion)
        .expect("failed to create io queue pair")
}
