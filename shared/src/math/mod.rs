//! Math utilities

mod mod_group;

use core::ops::{Add, Rem, Sub};

pub use mod_group::*;

/// A utility trait for all unsigned number types
pub trait UnsignedNumber:
    Copy
    + Add<Self, Output = Self>
    + Sub<Self, Output = Self>
    + Rem<Self, Output = Self>
    + PartialEq
    + Eq
    + PartialOrd
    + Ord
    + CheckedAdd<Self, Output = Self>
    + CheckedSub<Self, Output = Self>
{
    /// The lowest representable value
    const MIN: Self;
    /// The largest representable value
    const MAX: Self;
    /// the zero value
    const ZERO: Self;
    /// the 1 value
    const ONE: Self;
}

/// Checked additon
pub trait CheckedAdd<T>: Sized {
    /// The result of the checked operation
    type Output;

    /// Performs the add opertion or returns None on an overflow
    fn checked_add(self, rhs: T) -> Option<Self::Output>;
}

/// Checked subtraction
pub trait CheckedSub<T>: Sized {
    /// The result of the checked operation
    type Output;

    /// Performs the sub opertion or returns None on an overflow
    fn checked_sub(self, rhs: T) -> Option<Self::Output>;
}

macro_rules! impl_unsigned {
    ($t:ident) => {
        impl UnsignedNumber for $t {
            const MIN: Self = Self::MIN;
            const MAX: Self = Self::MAX;
            const ZERO: Self = 0;
            const ONE: Self = 1;
        }

        impl CheckedAdd<$t> for $t {
            type Output = $t;

            fn checked_add(self, rhs: Self) -> Option<Self::Output> {
                self.checked_add(rhs)
            }
        }

        impl CheckedSub<$t> for $t {
            type Output = $t;

            fn checked_sub(self, rhs: Self) -> Option<Self::Output> {
                self.checked_sub(rhs)
            }
        }
    };
}

impl_unsigned!(u8);
impl_unsigned!(u16);
impl_unsigned!(u32);
impl_unsigned!(u64);
impl_unsigned!(usize);
