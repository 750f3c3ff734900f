//! utilites for the primitive enum proc-macros in `shared-derive`

use core::fmt::{Debug, LowerHex};

use thiserror::Error;

/// Error type used to denote that a given value is not a valid discriminant
/// of the target enum
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid enum value: {value:#x}")]
pub struct InvalidValue<T: Debug + LowerHex> {
    /// the invalid value
    pub value: T,
}
