use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sys_mem::{page_round_up, MemMap};

use crate::address::{allocation_size, ObjectRef, OBJECT_ALIGNMENT};
use crate::object::{Object, ObjectModel};
use crate::space::{AllocSpace, GcRetentionPolicy, Space, SpaceKind};

/// A contiguous space allocated by advancing a cursor.
///
/// Objects are never freed individually; the copying collector evacuates
/// the survivors and then [`reset`](Self::reset)s the whole space.
pub struct BumpPointerSpace {
    name: String,
    mem: Arc<MemMap>,
    begin: usize,
    limit: usize,
    end: AtomicUsize,
    footprint_limit: AtomicUsize,
    objects_allocated: AtomicUsize,
}

impl BumpPointerSpace {
    /// Creates an empty space over `[begin, limit)` of `mem`.
    ///
    /// # Panics
    ///
    /// Panics if the range is not inside `mem`.
    #[must_use]
    pub fn new(name: impl Into<String>, mem: Arc<MemMap>, begin: usize, limit: usize) -> Self {
        assert!(mem.contains(begin) && limit <= mem.end() && begin < limit);
        Self {
            name: name.into(),
            mem,
            begin,
            limit,
            end: AtomicUsize::new(begin),
            footprint_limit: AtomicUsize::new(limit - begin),
            objects_allocated: AtomicUsize::new(0),
        }
    }

    /// Rewinds the cursor and zeroes everything handed out.
    pub fn reset(&self) {
        let end = self.end.swap(self.begin, Ordering::AcqRel);
        if let Err(err) = self.mem.zero(self.begin, end) {
            tracing::warn!(space = %self.name, %err, "failed to zero bump pointer space");
            // SAFETY: [begin, end) is inside our reservation and no mutator
            // is running while a space is reset.
            unsafe { std::ptr::write_bytes(self.begin as *mut u8, 0, end - self.begin) };
        }
        self.objects_allocated.store(0, Ordering::Release);
    }

    /// Returns `true` if nothing has been allocated since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end.load(Ordering::Acquire) == self.begin
    }
}

impl Space for BumpPointerSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SpaceKind {
        SpaceKind::BumpPointer
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        GcRetentionPolicy::AlwaysCollect
    }

    fn begin(&self) -> usize {
        self.begin
    }

    fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    fn limit(&self) -> usize {
        self.limit
    }

    fn can_move_objects(&self) -> bool {
        true
    }

    fn walk(&self, model: &dyn ObjectModel, visitor: &mut dyn FnMut(ObjectRef)) {
        let end = self.end();
        let mut pos = self.begin;
        while pos < end {
            let Some(obj) = ObjectRef::from_addr(pos) else { break };
            // SAFETY: every byte below the cursor belongs to an initialised
            // object and the world is stopped.
            let size = allocation_size(model.size_of(unsafe { Object::new(obj) }));
            visitor(obj);
            pos += size;
        }
    }
}

impl AllocSpace for BumpPointerSpace {
    fn alloc(&self, num_bytes: usize) -> Option<ObjectRef> {
        debug_assert_eq!(num_bytes % OBJECT_ALIGNMENT, 0);
        let bound = self.begin + self.footprint_limit.load(Ordering::Relaxed);
        let mut end = self.end.load(Ordering::Relaxed);
        loop {
            let new_end = end.checked_add(num_bytes)?;
            if new_end > bound {
                return None;
            }
            match self
                .end
                .compare_exchange_weak(end, new_end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => end = actual,
            }
        }
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        ObjectRef::from_addr(end)
    }

    fn bytes_allocated(&self) -> usize {
        self.size()
    }

    fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    fn footprint_limit(&self) -> usize {
        self.footprint_limit.load(Ordering::Relaxed)
    }

    fn set_footprint_limit(&self, limit: usize) {
        let limit = limit.clamp(self.size(), self.capacity());
        self.footprint_limit.store(limit, Ordering::Relaxed);
    }

    fn clear(&self) {
        self.reset();
        let _ = self.mem.release(self.begin, self.limit);
    }

    fn trim(&self) -> usize {
        let from = page_round_up(self.end()).min(self.limit);
        self.mem.release(from, self.limit).unwrap_or(0)
    }
}

impl std::fmt::Debug for BumpPointerSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&crate::space::describe(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ClassWord;
    use crate::object::{store_word, SlotModel};
    use std::thread;
    use sys_mem::MemMapOptions;

    fn space(len: usize) -> BumpPointerSpace {
        let mem = Arc::new(MemMapOptions::new("bump").len(len).map_anonymous().unwrap());
        let (begin, end) = (mem.begin(), mem.end());
        BumpPointerSpace::new("bump pointer space", mem, begin, end)
    }

    #[test]
    fn test_alloc_until_full() {
        let s = space(4096);
        let a = s.alloc(1024).unwrap();
        assert_eq!(a.addr(), s.begin());
        assert_eq!(s.alloc(s.capacity() - 1024).unwrap().addr(), s.begin() + 1024);
        assert!(s.alloc(8).is_none());
        assert_eq!(s.bytes_allocated(), s.capacity());
        assert_eq!(s.objects_allocated(), 2);
    }

    #[test]
    fn test_footprint_limit_bounds_cursor() {
        let s = space(8192);
        s.set_footprint_limit(1024);
        assert!(s.alloc(1024).is_some());
        assert!(s.alloc(8).is_none());
        s.set_footprint_limit(8192);
        assert!(s.alloc(8).is_some());
    }

    #[test]
    fn test_reset_zeroes_and_rewinds() {
        let s = space(8192);
        let a = s.alloc(64).unwrap();
        unsafe { store_word(a.addr() + 8, 0xdead, Ordering::Relaxed) };
        s.reset();
        assert!(s.is_empty());
        let b = s.alloc(64).unwrap();
        assert_eq!(a, b);
        assert_eq!(unsafe { crate::object::load_word(b.addr() + 8, Ordering::Relaxed) }, 0);
    }

    #[test]
    fn test_walk_uses_model_sizes() {
        let s = space(8192);
        let shapes = [(1, 0), (0, 3), (2, 2)];
        for (refs, payload) in shapes {
            let obj = s.alloc(SlotModel::object_size(refs, payload)).unwrap();
            let ClassWord(word) = SlotModel::class(refs, payload);
            unsafe { store_word(obj.addr(), word, Ordering::Relaxed) };
        }
        let mut seen = Vec::new();
        s.walk(&SlotModel, &mut |o| seen.push(o.addr() - s.begin()));
        assert_eq!(seen, vec![0, 16, 48]);
    }

    #[test]
    fn test_concurrent_alloc_disjoint() {
        let s = Arc::new(space(64 * 1024));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&s);
                thread::spawn(move || (0..256).filter_map(|_| s.alloc(16)).map(ObjectRef::addr).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1024);
    }
}
