//! Integers modulo n, used for the head and tail indices of ring buffers.

use core::{
    fmt::{LowerHex, UpperHex},
    ops::{Add, AddAssign, Sub},
};

use super::UnsignedNumber;

/// A number that automatically wraps at [Self::modulo].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WrappingValue<T: UnsignedNumber> {
    value: T,
    modulo: T,
}

impl<T: UnsignedNumber> WrappingValue<T> {
    /// Creates a new [WrappingValue] with the value 0
    ///
    /// # Panics
    ///
    /// if `modulo` is zero
    pub fn zero(modulo: T) -> Self {
        assert!(modulo != T::ZERO, "modulo must not be zero");
        Self {
            value: T::ZERO,
            modulo,
        }
    }

    /// Creates a new [WrappingValue], reducing `value` modulo `modulo`
    ///
    /// # Panics
    ///
    /// if `modulo` is zero
    pub fn new(value: T, modulo: T) -> Self {
        assert!(modulo != T::ZERO, "modulo must not be zero");
        Self {
            value: value % modulo,
            modulo,
        }
    }

    /// The value
    pub fn value(self) -> T {
        self.value
    }

    /// The modulo used for all calculations
    pub fn modulo(self) -> T {
        self.modulo
    }

    /// The highest valid value using this [Self::modulo].
    pub fn max(self) -> T {
        self.modulo - T::ONE
    }

    /// The number of increments needed to get from `self` to `other`.
    ///
    /// For ring indices this is the number of occupied slots between a
    /// head (`self`) and a tail (`other`).
    pub fn distance_to(self, other: T) -> T {
        debug_assert!(other < self.modulo);
        if other >= self.value {
            other - self.value
        } else {
            self.modulo - self.value + other
        }
    }
}

impl<T> PartialOrd for WrappingValue<T>
where
    T: UnsignedNumber,
{
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for WrappingValue<T>
where
    T: UnsignedNumber,
{
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl<T> Add<T> for WrappingValue<T>
where
    T: UnsignedNumber,
{
    type Output = Self;

    fn add(self, rhs: T) -> Self::Output {
        let value = match self.value.checked_add(rhs) {
            Some(value) => value % self.modulo,
            // value < modulo, so `modulo - value` can not underflow and
            // rhs is larger than it because the plain add overflowed
            None => (rhs - (self.modulo - self.value)) % self.modulo,
        };
        Self {
            value,
            modulo: self.modulo,
        }
    }
}

impl<T> AddAssign<T> for WrappingValue<T>
where
    T: UnsignedNumber,
{
    fn add_assign(&mut self, rhs: T) {
        *self = *self + rhs;
    }
}

impl<T> Sub<T> for WrappingValue<T>
where
    T: UnsignedNumber,
{
    type Output = Self;

    fn sub(self, rhs: T) -> Self::Output {
        let rhs = rhs % self.modulo;
        let value = if rhs <= self.value {
            self.value - rhs
        } else {
            self.modulo - (rhs - self.value)
        };
        Self {
            value,
            modulo: self.modulo,
        }
    }
}

impl<T> core::fmt::Debug for WrappingValue<T>
where
    T: UnsignedNumber + core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("({:?} % {:?})", self.value, self.modulo))
    }
}

impl<T> LowerHex for WrappingValue<T>
where
    T: UnsignedNumber + LowerHex,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("({:#x} % {:#x})", self.value, self.modulo))
    }
}

impl<T> UpperHex for WrappingValue<T>
where
    T: UnsignedNumber + UpperHex,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("({:#X} % {:#X})", self.value, self.modulo))
    }
}
