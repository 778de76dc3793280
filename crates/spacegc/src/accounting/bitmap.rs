//! Live and mark bitmaps.
//!
//! A [`SpaceBitmap`] keeps one bit per aligned slot of a space; a set bit
//! means an object starts at that address. Each collected space owns a
//! [`BitmapPair`]: the live bitmap describes the heap as of the last
//! collection, the mark bitmap is built by the running one. At the end of a
//! collection the two are swapped, never copied.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use sys_mem::{MemMap, MemMapOptions};

use crate::address::{round_up, ObjectRef};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// An atomic bitmap over `[heap_begin, heap_begin + capacity)`.
pub struct SpaceBitmap {
    name: String,
    heap_begin: usize,
    heap_limit: usize,
    shift: u32,
    word_count: usize,
    mem: MemMap,
}

impl SpaceBitmap {
    /// Creates a bitmap covering `capacity` bytes from `heap_begin`, one bit
    /// per `alignment` bytes.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the backing memory could not be mapped.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    pub fn create(
        name: impl Into<String>,
        heap_begin: usize,
        capacity: usize,
        alignment: usize,
    ) -> io::Result<Self> {
        assert!(alignment.is_power_of_two(), "bitmap alignment {alignment}");
        let name = name.into();
        let shift = alignment.trailing_zeros();
        let bits = round_up(capacity, alignment) >> shift;
        let word_count = bits.div_ceil(BITS_PER_WORD).max(1);
        let mem = MemMapOptions::new(format!("{name} bitmap"))
            .len(word_count * std::mem::size_of::<u64>())
            .map_anonymous()?;
        Ok(Self {
            name,
            heap_begin,
            heap_limit: heap_begin + capacity,
            shift,
            word_count,
            mem,
        })
    }

    #[inline]
    fn words(&self) -> &[AtomicU64] {
        // SAFETY: the mapping is page aligned, zero initialised and at least
        // `word_count` words long. It lives as long as `self`.
        unsafe {
            std::slice::from_raw_parts(self.mem.as_ptr().cast::<AtomicU64>(), self.word_count)
        }
    }

    #[inline]
    fn bit_index(&self, addr: usize) -> usize {
        debug_assert!(self.has_address(addr), "{:#x} outside {}", addr, self.name);
        (addr - self.heap_begin) >> self.shift
    }

    #[inline]
    fn bit_addr(&self, index: usize) -> usize {
        self.heap_begin + (index << self.shift)
    }

    /// Name of the owning space.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First covered address.
    #[must_use]
    pub const fn heap_begin(&self) -> usize {
        self.heap_begin
    }

    /// One past the last covered address.
    #[must_use]
    pub const fn heap_limit(&self) -> usize {
        self.heap_limit
    }

    /// Returns `true` if `addr` is covered.
    #[inline]
    #[must_use]
    pub const fn has_address(&self, addr: usize) -> bool {
        addr >= self.heap_begin && addr < self.heap_limit
    }

    /// Returns `true` if the bit for `addr` is set.
    #[inline]
    #[must_use]
    pub fn test(&self, addr: usize) -> bool {
        let i = self.bit_index(addr);
        self.words()[i / BITS_PER_WORD].load(Ordering::Acquire) & (1 << (i % BITS_PER_WORD)) != 0
    }

    /// Sets the bit for `addr` and returns whether it was already set.
    #[inline]
    pub fn set(&self, addr: usize) -> bool {
        let i = self.bit_index(addr);
        let mask = 1 << (i % BITS_PER_WORD);
        self.words()[i / BITS_PER_WORD].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Atomic test-and-set used by markers racing on the same object.
    /// Returns `true` if this call set the bit.
    #[inline]
    pub fn atomic_test_and_set(&self, addr: usize) -> bool {
        !self.set(addr)
    }

    /// Clears the bit for `addr` and returns whether it was set.
    #[inline]
    pub fn clear(&self, addr: usize) -> bool {
        let i = self.bit_index(addr);
        let mask = 1 << (i % BITS_PER_WORD);
        self.words()[i / BITS_PER_WORD].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Clears every bit.
    pub fn clear_all(&self) {
        if self.mem.zero(self.mem.begin(), self.mem.end()).is_err() {
            for word in self.words() {
                word.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Clears the bits of objects starting in `[begin, end)`.
    pub fn clear_range(&self, begin: usize, end: usize) {
        let begin = begin.max(self.heap_begin);
        let end = end.min(self.heap_limit);
        if begin >= end {
            return;
        }
        let first = (begin - self.heap_begin).div_ceil(1 << self.shift);
        let last = (end - self.heap_begin).div_ceil(1 << self.shift);
        let words = self.words();
        let mut i = first;
        while i < last {
            let word = i / BITS_PER_WORD;
            let bit = i % BITS_PER_WORD;
            let n = (BITS_PER_WORD - bit).min(last - i);
            let mask = if n == BITS_PER_WORD {
                u64::MAX
            } else {
                ((1u64 << n) - 1) << bit
            };
            words[word].fetch_and(!mask, Ordering::AcqRel);
            i += n;
        }
    }

    /// Visits, in increasing address order, every object whose start lies
    /// in `[begin, end)`.
    ///
    /// Each word is loaded once, so the visitor may clear bits.
    pub fn visit_marked_range(&self, begin: usize, end: usize, mut visitor: impl FnMut(ObjectRef)) {
        let begin = begin.max(self.heap_begin);
        let end = end.min(self.heap_limit);
        if begin >= end {
            return;
        }
        let first = (begin - self.heap_begin).div_ceil(1 << self.shift);
        let last = (end - self.heap_begin).div_ceil(1 << self.shift);
        if first >= last {
            return;
        }
        let words = self.words();
        for word_index in first / BITS_PER_WORD..=(last - 1) / BITS_PER_WORD {
            let mut bits = words[word_index].load(Ordering::Acquire);
            let base = word_index * BITS_PER_WORD;
            if base < first {
                bits &= u64::MAX << (first - base);
            }
            if last - base < BITS_PER_WORD {
                bits &= (1u64 << (last - base)) - 1;
            }
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                if let Some(obj) = ObjectRef::from_addr(self.bit_addr(base + bit)) {
                    visitor(obj);
                }
            }
        }
    }

    /// Visits every set bit in increasing address order.
    pub fn walk(&self, visitor: impl FnMut(ObjectRef)) {
        self.visit_marked_range(self.heap_begin, self.heap_limit, visitor);
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words()
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

impl std::fmt::Debug for SpaceBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceBitmap")
            .field("name", &self.name)
            .field("begin", &format_args!("{:#x}", self.heap_begin))
            .field("limit", &format_args!("{:#x}", self.heap_limit))
            .finish_non_exhaustive()
    }
}

struct PairState {
    live: Arc<SpaceBitmap>,
    mark: Arc<SpaceBitmap>,
    /// The real mark bitmap while `mark` aliases `live`.
    unbound_mark: Option<Arc<SpaceBitmap>>,
}

/// The live and mark bitmaps of one space.
pub struct BitmapPair {
    state: RwLock<PairState>,
}

impl BitmapPair {
    /// Creates empty live and mark bitmaps over the same range.
    ///
    /// # Errors
    ///
    /// Returns the OS error if either bitmap could not be mapped.
    pub fn create(name: &str, heap_begin: usize, capacity: usize, alignment: usize) -> io::Result<Self> {
        let live = SpaceBitmap::create(format!("{name} live"), heap_begin, capacity, alignment)?;
        let mark = SpaceBitmap::create(format!("{name} mark"), heap_begin, capacity, alignment)?;
        Ok(Self::from_parts(Arc::new(live), Arc::new(mark)))
    }

    /// Wraps existing bitmaps, e.g. when a space hands its bitmaps on.
    #[must_use]
    pub fn from_parts(live: Arc<SpaceBitmap>, mark: Arc<SpaceBitmap>) -> Self {
        Self {
            state: RwLock::new(PairState {
                live,
                mark,
                unbound_mark: None,
            }),
        }
    }

    /// The live bitmap.
    #[must_use]
    pub fn live(&self) -> Arc<SpaceBitmap> {
        Arc::clone(&self.state.read().live)
    }

    /// The mark bitmap (the live bitmap while bound).
    #[must_use]
    pub fn mark(&self) -> Arc<SpaceBitmap> {
        Arc::clone(&self.state.read().mark)
    }

    /// Makes the mark bitmap the live one and vice versa.
    ///
    /// # Panics
    ///
    /// Panics if the bitmaps are currently bound.
    pub fn swap(&self) {
        let mut state = self.state.write();
        assert!(state.unbound_mark.is_none(), "swapping bound bitmaps");
        let PairState { live, mark, .. } = &mut *state;
        std::mem::swap(live, mark);
    }

    /// Points the mark bitmap at the live bitmap so everything live counts
    /// as marked. Used for spaces a collection must not sweep.
    pub fn bind_live_to_mark(&self) {
        let mut state = self.state.write();
        if state.unbound_mark.is_some() {
            return;
        }
        let live = Arc::clone(&state.live);
        let mark = std::mem::replace(&mut state.mark, live);
        state.unbound_mark = Some(mark);
    }

    /// Restores the real mark bitmap after [`bind_live_to_mark`](Self::bind_live_to_mark).
    pub fn unbind(&self) {
        let mut state = self.state.write();
        if let Some(mark) = state.unbound_mark.take() {
            state.mark = mark;
        }
    }

    /// Returns `true` while the mark bitmap aliases the live bitmap.
    #[must_use]
    pub fn has_bound_bitmaps(&self) -> bool {
        self.state.read().unbound_mark.is_some()
    }
}

impl std::fmt::Debug for BitmapPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("BitmapPair")
            .field("live", &state.live)
            .field("bound", &state.unbound_mark.is_some())
            .finish()
    }
}
