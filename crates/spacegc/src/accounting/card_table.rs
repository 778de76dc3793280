//! The card table.
//!
//! One byte per [`CARD_SIZE`] bytes of the whole heap reservation. The write
//! barrier dirties the card holding an object's start whenever a reference
//! field of that object is stored. Collectors consume dirty cards instead of
//! rescanning spaces they do not collect.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};

use sys_mem::{MemMap, MemMapOptions};

use crate::accounting::bitmap::SpaceBitmap;
use crate::address::{round_down, round_up, ObjectRef};

/// log2 of the bytes covered by one card.
pub const CARD_SHIFT: u32 = 7;
/// Bytes covered by one card.
pub const CARD_SIZE: usize = 1 << CARD_SHIFT;
/// A card with no reference store since it was last cleaned.
pub const CARD_CLEAN: u8 = 0;
/// A card written by the barrier.
pub const CARD_DIRTY: u8 = 0x70;
/// A dirty card that has survived one collection.
pub const CARD_AGED: u8 = CARD_DIRTY - 1;

/// Ages a card by one collection: dirty becomes aged, anything else clean.
#[inline]
#[must_use]
pub const fn age_card(value: u8) -> u8 {
    if value == CARD_DIRTY {
        CARD_AGED
    } else {
        CARD_CLEAN
    }
}

/// A byte per card over `[heap_begin, heap_end)`.
pub struct CardTable {
    heap_begin: usize,
    heap_end: usize,
    count: usize,
    mem: MemMap,
}

impl CardTable {
    /// Creates a clean card table covering `capacity` bytes from `heap_begin`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the table could not be mapped.
    pub fn create(heap_begin: usize, capacity: usize) -> io::Result<Self> {
        let count = round_up(capacity, CARD_SIZE) >> CARD_SHIFT;
        let mem = MemMapOptions::new("card table").len(count.max(1)).map_anonymous()?;
        Ok(Self {
            heap_begin,
            heap_end: heap_begin + capacity,
            count,
            mem,
        })
    }

    #[inline]
    fn cards(&self) -> &[AtomicU8] {
        // SAFETY: the mapping is zero initialised, at least `count` bytes long
        // and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.mem.as_ptr().cast::<AtomicU8>(), self.count) }
    }

    #[inline]
    fn index(&self, addr: usize) -> usize {
        assert!(
            addr >= self.heap_begin && addr < self.heap_end,
            "card lookup for {addr:#x} outside heap {:#x}..{:#x}",
            self.heap_begin,
            self.heap_end
        );
        (addr - self.heap_begin) >> CARD_SHIFT
    }

    #[inline]
    fn range(&self, begin: usize, end: usize) -> std::ops::Range<usize> {
        let begin = begin.max(self.heap_begin);
        let end = end.min(self.heap_end);
        if begin >= end {
            return 0..0;
        }
        self.index(begin)..((round_up(end, CARD_SIZE) - self.heap_begin) >> CARD_SHIFT).min(self.count)
    }

    /// First address of the card containing `addr`.
    #[inline]
    #[must_use]
    pub const fn card_begin(addr: usize) -> usize {
        round_down(addr, CARD_SIZE)
    }

    /// Address covered by the first byte of card `index`.
    #[inline]
    #[must_use]
    pub const fn addr_from_card(&self, index: usize) -> usize {
        self.heap_begin + (index << CARD_SHIFT)
    }

    /// Write barrier: dirties the card covering `obj`'s start.
    #[inline]
    pub fn mark_card(&self, obj: ObjectRef) {
        self.cards()[self.index(obj.addr())].store(CARD_DIRTY, Ordering::Release);
    }

    /// The raw value of the card covering `addr`.
    #[inline]
    #[must_use]
    pub fn get_card(&self, addr: usize) -> u8 {
        self.cards()[self.index(addr)].load(Ordering::Acquire)
    }

    /// Returns `true` if the card covering `addr` is dirty.
    #[inline]
    #[must_use]
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.get_card(addr) == CARD_DIRTY
    }

    /// Cleans every card covering `[begin, end)`.
    pub fn clear_range(&self, begin: usize, end: usize) {
        for card in &self.cards()[self.range(begin, end)] {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Cleans the whole table.
    pub fn clear_all(&self) {
        self.clear_range(self.heap_begin, self.heap_end);
    }

    /// Applies `modify` to every card in `[begin, end)` with a CAS, calling
    /// `visitor(card_begin, old, new)` for every card that changed.
    pub fn modify_cards_atomic(
        &self,
        begin: usize,
        end: usize,
        modify: impl Fn(u8) -> u8,
        mut visitor: impl FnMut(usize, u8, u8),
    ) {
        let range = self.range(begin, end);
        let start = range.start;
        for (i, card) in self.cards()[range].iter().enumerate() {
            let mut old = card.load(Ordering::Relaxed);
            loop {
                let new = modify(old);
                if new == old {
                    break;
                }
                match card.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => {
                        visitor(self.addr_from_card(start + i), old, new);
                        break;
                    }
                    Err(actual) => old = actual,
                }
            }
        }
    }

    /// Calls `visitor` with the start of every card in `[begin, end)` whose
    /// value is at least `min_age`.
    pub fn visit_cards(&self, begin: usize, end: usize, min_age: u8, mut visitor: impl FnMut(usize)) {
        let range = self.range(begin, end);
        let start = range.start;
        for (i, card) in self.cards()[range].iter().enumerate() {
            if card.load(Ordering::Acquire) >= min_age {
                visitor(self.addr_from_card(start + i));
            }
        }
    }

    /// Visits every object in `bitmap` that starts on a card in
    /// `[begin, end)` with value at least `min_age`. Returns the number of
    /// cards scanned.
    pub fn scan(
        &self,
        bitmap: &SpaceBitmap,
        begin: usize,
        end: usize,
        min_age: u8,
        mut visitor: impl FnMut(ObjectRef),
    ) -> usize {
        let mut scanned = 0;
        self.visit_cards(begin, end, min_age, |card| {
            scanned += 1;
            bitmap.visit_marked_range(card, card + CARD_SIZE, &mut visitor);
        });
        scanned
    }

    /// Number of cards at least `min_age` in `[begin, end)`.
    #[must_use]
    pub fn count_cards(&self, begin: usize, end: usize, min_age: u8) -> usize {
        let mut n = 0;
        self.visit_cards(begin, end, min_age, |_| n += 1);
        n
    }
}

impl std::fmt::Debug for CardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardTable")
            .field("begin", &format_args!("{:#x}", self.heap_begin))
            .field("end", &format_args!("{:#x}", self.heap_end))
            .field("cards", &self.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BEGIN: usize = 0x40_0000;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_addr(addr).unwrap()
    }

    #[test]
    fn test_mark_card_covers_object_start() {
        let table = CardTable::create(BEGIN, 64 * 1024).unwrap();
        table.mark_card(obj(BEGIN + CARD_SIZE + 8));
        assert!(table.is_dirty(BEGIN + CARD_SIZE));
        assert!(table.is_dirty(BEGIN + 2 * CARD_SIZE - 8));
        assert!(!table.is_dirty(BEGIN));
        assert!(!table.is_dirty(BEGIN + 2 * CARD_SIZE));
    }

    #[test]
    fn test_ageing() {
        let table = CardTable::create(BEGIN, 64 * 1024).unwrap();
        table.mark_card(obj(BEGIN));
        let mut changed = Vec::new();
        table.modify_cards_atomic(BEGIN, BEGIN + 64 * 1024, age_card, |card, old, new| {
            changed.push((card, old, new));
        });
        assert_eq!(changed, vec![(BEGIN, CARD_DIRTY, CARD_AGED)]);
        table.modify_cards_atomic(BEGIN, BEGIN + 64 * 1024, age_card, |_, _, _| {});
        assert_eq!(table.get_card(BEGIN), CARD_CLEAN);
    }

    #[test]
    fn test_scan_visits_objects_on_dirty_cards() {
        let table = CardTable::create(BEGIN, 64 * 1024).unwrap();
        let bitmap = SpaceBitmap::create("scan", BEGIN, 64 * 1024, 8).unwrap();
        bitmap.set(BEGIN + 16);
        bitmap.set(BEGIN + CARD_SIZE + 32);
        bitmap.set(BEGIN + 10 * CARD_SIZE);
        table.mark_card(obj(BEGIN + CARD_SIZE + 32));

        let mut seen = Vec::new();
        let scanned = table.scan(&bitmap, BEGIN, BEGIN + 64 * 1024, CARD_DIRTY, |o| seen.push(o.addr()));
        assert_eq!(scanned, 1);
        assert_eq!(seen, vec![BEGIN + CARD_SIZE + 32]);
    }

    #[test]
    fn test_clear_range() {
        let table = CardTable::create(BEGIN, 64 * 1024).unwrap();
        for i in 0..8 {
            table.mark_card(obj(BEGIN + i * CARD_SIZE));
        }
        table.clear_range(BEGIN + 2 * CARD_SIZE, BEGIN + 4 * CARD_SIZE);
        assert_eq!(table.count_cards(BEGIN, BEGIN + 64 * 1024, CARD_DIRTY), 6);
        table.clear_all();
        assert_eq!(table.count_cards(BEGIN, BEGIN + 64 * 1024, CARD_AGED), 0);
    }
}
