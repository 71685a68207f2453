use crate::info::{P4D_SIZE, PAGE_SIZE, PMD_SIZE, PUD_SIZE, USER_VA_END};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the page sizes a leaf entry can map.
pub trait PageSize: sealed::Sealed + Copy + Eq + Ord + fmt::Debug {
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
}

/// 4 KiB page, mapped by a leaf-table entry.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = PAGE_SIZE;
    const SHIFT: u32 = 12;
}

/// 2 MiB page, mapped by a huge middle-level entry.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Size2M;
impl sealed::Sealed for Size2M {}
impl PageSize for Size2M {
    const SIZE: u64 = PMD_SIZE;
    const SHIFT: u32 = 21;
}

/// 1 GiB page, mapped by a huge upper-level entry.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Size1G;
impl sealed::Sealed for Size1G {}
impl PageSize for Size1G {
    const SIZE: u64 = PUD_SIZE;
    const SHIFT: u32 = 30;
}

/// Virtual memory address.
///
/// Only carries the *kind* of address at the type level; canonicality is not
/// checked, but page-table lookups require [`is_user`](Self::is_user)
/// addresses. Arithmetic that could leave the 64-bit range is offered in checked
/// form ([`checked_add`](Self::checked_add), [`align_up`](Self::align_up)).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether the address lies in the user half, below [`USER_VA_END`].
    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 < USER_VA_END
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    /// Round up to the next `S` boundary, or `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn align_up<S: PageSize>(self) -> Option<Self> {
        match self.0.checked_add(S::SIZE - 1) {
            Some(v) => Some(Self(v & !(S::SIZE - 1))),
            None => None,
        }
    }

    /// Start of the next block of `size` bytes after `self`, clamped to `end`.
    ///
    /// `size` must be a power of two. Used to step a walk one table entry at a time.
    #[inline]
    #[must_use]
    pub const fn next_boundary(self, size: u64, end: Self) -> Self {
        match (self.0 & !(size - 1)).checked_add(size) {
            Some(next) if next < end.0 => Self(next),
            _ => end,
        }
    }

    /// Number of base pages between `self` and `end`.
    #[inline]
    #[must_use]
    pub const fn pages_until(self, end: Self) -> usize {
        debug_assert!(end.0 >= self.0);
        ((end.0 - self.0) >> Size4K::SHIFT) as usize
    }

    /// Address `n` base pages after `self`.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, n: usize) -> Self {
        Self(self.0 + ((n as u64) << Size4K::SHIFT))
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

/// Index into one level of the page-table tree.
///
/// Range is `0..512` (checked in debug builds).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TableIndex(u16);

impl TableIndex {
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 512);
        Self(v)
    }

    #[inline]
    const fn at(va: VirtualAddress, shift: u32) -> Self {
        Self(((va.0 >> shift) & 0x1FF) as u16)
    }

    /// Top-level index, VA bits `[47:39]`. `va` must be a user address.
    #[inline]
    #[must_use]
    pub const fn l4(va: VirtualAddress) -> Self {
        debug_assert!(va.is_user());
        Self::at(va, P4D_SIZE.trailing_zeros())
    }

    /// Upper directory index, VA bits `[38:30]`.
    #[inline]
    #[must_use]
    pub const fn l3(va: VirtualAddress) -> Self {
        Self::at(va, Size1G::SHIFT)
    }

    /// Middle directory index, VA bits `[29:21]`.
    #[inline]
    #[must_use]
    pub const fn l2(va: VirtualAddress) -> Self {
        Self::at(va, Size2M::SHIFT)
    }

    /// Leaf table index, VA bits `[20:12]`.
    #[inline]
    #[must_use]
    pub const fn l1(va: VirtualAddress) -> Self {
        Self::at(va, Size4K::SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}
