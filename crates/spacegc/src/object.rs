//! The boundary between the heap and the embedder's object layout.
//!
//! The heap stores a [`ClassWord`] at offset 0 of every object and knows
//! nothing else about layout. An [`ObjectModel`] tells it how big an object
//! is and where its reference fields are.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::address::{ClassWord, ObjectRef, HEADER_SIZE};

/// Reads the word at `addr`.
///
/// # Safety
///
/// `addr` must be word aligned and inside memory mapped by the heap.
#[inline]
pub(crate) unsafe fn load_word(addr: usize, order: Ordering) -> usize {
    // SAFETY: caller guarantees a mapped, aligned word.
    unsafe { (*(addr as *const AtomicUsize)).load(order) }
}

/// Writes the word at `addr`.
///
/// # Safety
///
/// `addr` must be word aligned and inside memory mapped by the heap.
#[inline]
pub(crate) unsafe fn store_word(addr: usize, value: usize, order: Ordering) {
    // SAFETY: caller guarantees a mapped, aligned word.
    unsafe { (*(addr as *const AtomicUsize)).store(value, order) }
}

/// Returns the atomic cell for the word at `addr`.
///
/// # Safety
///
/// `addr` must be word aligned and inside memory mapped by the heap for `'a`.
#[inline]
pub(crate) unsafe fn word_cell<'a>(addr: usize) -> &'a AtomicUsize {
    // SAFETY: caller guarantees a mapped, aligned word.
    unsafe { &*(addr as *const AtomicUsize) }
}

/// A read-only view of one heap object, handed to the [`ObjectModel`].
#[derive(Clone, Copy)]
pub struct Object<'h> {
    addr: ObjectRef,
    _heap: PhantomData<&'h ()>,
}

impl Object<'_> {
    /// # Safety
    ///
    /// `addr` must be the start of an object in mapped heap memory that
    /// stays mapped for the view's lifetime.
    #[inline]
    pub(crate) const unsafe fn new(addr: ObjectRef) -> Self {
        Self {
            addr,
            _heap: PhantomData,
        }
    }

    /// The object's address.
    #[inline]
    #[must_use]
    pub const fn addr(&self) -> ObjectRef {
        self.addr
    }

    /// The class word written at allocation.
    #[inline]
    #[must_use]
    pub fn class_word(&self) -> ClassWord {
        ClassWord(self.read_word(0))
    }

    /// Reads the word at byte `offset` from the object start.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not word aligned.
    #[inline]
    #[must_use]
    pub fn read_word(&self, offset: usize) -> usize {
        assert_eq!(offset % HEADER_SIZE, 0, "unaligned field offset {offset}");
        // SAFETY: the view was created for a live object in mapped memory,
        // and the model only reads inside the object it describes.
        unsafe { load_word(self.addr.addr() + offset, Ordering::Acquire) }
    }
}

/// Layout knowledge the heap needs from the embedding runtime.
///
/// Implementations must be consistent: `size_of` must return the same value
/// for an object for its whole lifetime, and `visit_references` must report
/// only word-aligned offsets below that size.
pub trait ObjectModel: Send + Sync {
    /// The byte size requested when `obj` was allocated.
    fn size_of(&self, obj: Object<'_>) -> usize;

    /// Calls `visitor` with the byte offset of every reference field of
    /// `obj`. A field holds an object address or 0 for null.
    fn visit_references(&self, obj: Object<'_>, visitor: &mut dyn FnMut(usize));
}

/// A uniform layout: `[class word][references...][payload words...]`.
///
/// The class word encodes the number of reference slots and payload words,
/// so any object built with [`SlotModel::class`] is self-describing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotModel;

const HALF_BITS: u32 = usize::BITS / 2;
const HALF_MASK: usize = (1 << HALF_BITS) - 1;

impl SlotModel {
    /// Class word for an object with `refs` reference slots and
    /// `payload_words` plain words.
    ///
    /// # Panics
    ///
    /// Panics if either count does not fit in half a word.
    #[must_use]
    pub const fn class(refs: usize, payload_words: usize) -> ClassWord {
        assert!(refs <= HALF_MASK && payload_words <= HALF_MASK);
        ClassWord((refs << HALF_BITS) | payload_words)
    }

    /// Byte size of an object with the given shape.
    #[must_use]
    pub const fn object_size(refs: usize, payload_words: usize) -> usize {
        HEADER_SIZE + (refs + payload_words) * HEADER_SIZE
    }

    /// Offset of reference slot `index`.
    #[must_use]
    pub const fn reference_offset(index: usize) -> usize {
        HEADER_SIZE + index * HEADER_SIZE
    }

    /// Offset of payload word `index` in an object with `refs` references.
    #[must_use]
    pub const fn payload_offset(refs: usize, index: usize) -> usize {
        HEADER_SIZE + (refs + index) * HEADER_SIZE
    }

    /// Decodes a class word into `(refs, payload_words)`.
    #[must_use]
    pub const fn shape(class: ClassWord) -> (usize, usize) {
        (class.0 >> HALF_BITS, class.0 & HALF_MASK)
    }
}

impl ObjectModel for SlotModel {
    fn size_of(&self, obj: Object<'_>) -> usize {
        let (refs, payload) = Self::shape(obj.class_word());
        Self::object_size(refs, payload)
    }

    fn visit_references(&self, obj: Object<'_>, visitor: &mut dyn FnMut(usize)) {
        let (refs, _) = Self::shape(obj.class_word());
        for i in 0..refs {
            visitor(Self::reference_offset(i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_model_shape_roundtrip() {
        let class = SlotModel::class(3, 5);
        assert_eq!(SlotModel::shape(class), (3, 5));
        assert_eq!(SlotModel::object_size(3, 5), 8 + 8 * 8);
        assert_eq!(SlotModel::reference_offset(0), 8);
        assert_eq!(SlotModel::payload_offset(3, 0), 32);
    }

    #[test]
    fn test_slot_model_reads_object_memory() {
        let mut words = [0usize; 4];
        words[0] = SlotModel::class(2, 1).0;
        let addr = ObjectRef::from_addr(words.as_mut_ptr() as usize).unwrap();
        let obj = unsafe { Object::new(addr) };
        assert_eq!(SlotModel.size_of(obj), 32);
        let mut offsets = Vec::new();
        SlotModel.visit_references(obj, &mut |off| offsets.push(off));
        assert_eq!(offsets, vec![8, 16]);
    }
}
