//! The 64-bit remote address primitive.

use core::fmt;
use core::ops::Add;

use bytemuck::{Pod, Zeroable};
use serde::{Serialize, Serializer};

/// An address in the target process's address space.
///
/// The target is always treated as a 64-bit process; narrower targets are
/// out of scope. `0` is the null address.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Zeroable, Pod)]
#[repr(transparent)]
pub struct Address(pub(crate) u64);

impl Address {
    /// The null pointer pointing to address 0.
    pub const NULL: Self = Self(0);

    /// Creates a new address from the given value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying address as an integer.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Checks whether the address is null.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offsets the address by the given number of bytes.
    #[inline]
    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Offsets the address by the given signed number of bytes.
    #[inline]
    pub const fn add_signed(self, bytes: i64) -> Self {
        Self(self.0.wrapping_add_signed(bytes))
    }

    /// The distance in bytes from `base` to this address.
    #[inline]
    pub const fn offset_from(self, base: Self) -> u64 {
        self.0.wrapping_sub(base.0)
    }
}

impl From<u64> for Address {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Address> for u64 {
    #[inline]
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl Add<u64> for Address {
    type Output = Self;

    #[inline]
    fn add(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for Address {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(self, f)
    }
}

impl fmt::Display for Address {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(self, f)
    }
}

impl fmt::Pointer for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Serialize for Address {
    /// Addresses travel the event channel as lowercase `0x`-prefixed hex.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&format_args!("{:#x}", self.0))
    }
}
