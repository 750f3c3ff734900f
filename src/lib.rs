//! Conformance exerciser for NVMe controllers.
//!
//! The exerciser core lives in the `exerciser_core` crate. This crate adds
//! the harness on top of it: a [tracker::ResourceTracker] that releases queue
//! pairs a case leaves behind, the [context::DeviceContext] read during
//! setup, the built-in [cases] and [suite::run_suite].

pub mod cases;
pub mod config;
pub mod context;
pub mod suite;
pub mod tracker;

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init_test_logger() {
        INIT.call_once(|| {
            let _ = env_logger::builder()
                .is_test(true)
                .filter_level(log::LevelFilter::Debug)
                .try_init();
        });
    }
}
