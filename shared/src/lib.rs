//! Small helpers shared by all crates of the exerciser workspace.
//!
//! Nothing in here knows about NVMe. This crate is `no_std` so that the
//! ring arithmetic can be reused by code that runs without an allocator.
#![no_std]

pub mod math;
pub mod primitive_enum;

#[macro_export]
macro_rules! KiB {
    ($v:expr) => {
        $v * 1024
    };
}

#[macro_export]
macro_rules! MiB {
    ($v:expr) => {
        $v * 1024 * 1024
    };
}
