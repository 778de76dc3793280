//! Heap addresses and object header words.

use std::fmt;
use std::num::NonZeroUsize;

/// Every object starts on this boundary and its size is rounded up to it.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Bytes taken by the class word at offset 0 of every object.
pub const HEADER_SIZE: usize = std::mem::size_of::<usize>();

/// Rounds `value` up to a multiple of `align` (a power of two).
///
/// `value` must leave room for the rounding; see [`checked_round_up`].
#[inline]
#[must_use]
pub const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` up to a multiple of `align`, or `None` on overflow.
#[inline]
#[must_use]
pub const fn checked_round_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Rounds `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn round_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// The number of heap bytes an object of `byte_size` occupies.
///
/// For sizes of objects already in the heap. Requested sizes go through
/// [`checked_allocation_size`].
#[inline]
#[must_use]
pub const fn allocation_size(byte_size: usize) -> usize {
    let size = round_up(byte_size, OBJECT_ALIGNMENT);
    if size < HEADER_SIZE {
        HEADER_SIZE
    } else {
        size
    }
}

/// Like [`allocation_size`], but `None` if the aligned size does not fit
/// in `usize`.
#[inline]
#[must_use]
pub const fn checked_allocation_size(byte_size: usize) -> Option<usize> {
    match checked_round_up(byte_size, OBJECT_ALIGNMENT) {
        Some(size) if size < HEADER_SIZE => Some(HEADER_SIZE),
        other => other,
    }
}

/// The address of a managed object.
///
/// An `ObjectRef` is only a location. After a moving collection the same
/// object may live elsewhere; hold references in roots or in other objects
/// so the collector can rewrite them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    /// Wraps a raw address. Returns `None` for null.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// The raw address.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    /// Encodes an optional reference as a heap word.
    #[inline]
    #[must_use]
    pub const fn to_word(reference: Option<Self>) -> usize {
        match reference {
            Some(r) => r.addr(),
            None => 0,
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// Type information stored in the first word of every object.
///
/// The heap never interprets it; the [`ObjectModel`](crate::ObjectModel)
/// decodes it to find an object's size and reference fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ClassWord(pub usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_down(4097, 4096), 4096);
    }

    #[test]
    fn test_checked_rounding_rejects_overflow() {
        assert_eq!(checked_round_up(4097, 4096), Some(8192));
        assert_eq!(checked_round_up(usize::MAX, 8), None);
        assert_eq!(checked_round_up(usize::MAX - 7, 8), Some(usize::MAX - 7));
        assert_eq!(checked_allocation_size(0), Some(HEADER_SIZE));
        assert_eq!(checked_allocation_size(17), Some(24));
        assert_eq!(checked_allocation_size(usize::MAX - 3), None);
    }

    #[test]
    fn test_allocation_size_has_room_for_header() {
        assert_eq!(allocation_size(0), HEADER_SIZE);
        assert_eq!(allocation_size(3), HEADER_SIZE);
        assert_eq!(allocation_size(17), 24);
    }

    #[test]
    fn test_null_is_none() {
        assert!(ObjectRef::from_addr(0).is_none());
        let r = ObjectRef::from_addr(0x1000).unwrap();
        assert_eq!(r.addr(), 0x1000);
        assert_eq!(ObjectRef::to_word(Some(r)), 0x1000);
        assert_eq!(ObjectRef::to_word(None), 0);
    }
}
