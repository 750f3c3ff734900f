//! NVMe io command set
//!
//! The specification documents can be found at <https://nvmexpress.org/specifications/>
//! specifically: NVM Command Set

use core::fmt::{Debug, LowerHex, UpperHex};

use shared_derive::U8Enum;

mod read_write;

pub use read_write::*;

/// Opcode for the different commands
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum IoOpcode {
    Flush = 0x0,
    Write = 0x1,
    Read = 0x2,
    WriteUncorrectable = 0x4,
    Compare = 0x5,
    WriteZeroes = 0x8,
    DatasetManagement = 0x9,
    Verify = 0xc,
    ReservationRegister = 0xd,
    ReservationReport = 0xe,
    ReservationAcquire = 0x11,
    ReservationRelease = 0x15,
    Copy = 0x19,
}

/// Logical block address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lba(u64);

impl Lba {
    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Lba {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Lba> for u64 {
    fn from(value: Lba) -> Self {
        value.0
    }
}

impl Debug for Lba {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Lba")
            .field("address", &format_args!("{:#x}", self.0))
            .finish()
    }
}

impl LowerHex for Lba {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        LowerHex::fmt(&self.0, f)
    }
}

impl UpperHex for Lba {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        UpperHex::fmt(&self.0, f)
    }
}
