use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use sys_mem::{page_round_up, MemMap};

use crate::accounting::bitmap::BitmapPair;
use crate::address::{ObjectRef, OBJECT_ALIGNMENT};
use crate::space::{AllocSpace, GcRetentionPolicy, Space, SpaceKind, ZygoteSpace};

/// Address-ordered free chunks with a best-fit size index, plus the bump
/// tail past the highest chunk ever handed out.
#[derive(Debug, Default)]
struct FreeList {
    by_addr: BTreeMap<usize, usize>,
    by_size: BTreeSet<(usize, usize)>,
    end: usize,
}

impl FreeList {
    fn insert_chunk(&mut self, addr: usize, size: usize) {
        self.by_addr.insert(addr, size);
        self.by_size.insert((size, addr));
    }

    fn remove_chunk(&mut self, addr: usize, size: usize) {
        self.by_addr.remove(&addr);
        self.by_size.remove(&(size, addr));
    }

    fn take_best_fit(&mut self, size: usize) -> Option<usize> {
        let &(chunk_size, addr) = self.by_size.range((size, 0)..).next()?;
        self.remove_chunk(addr, chunk_size);
        if chunk_size > size {
            self.insert_chunk(addr + size, chunk_size - size);
        }
        Some(addr)
    }

    /// Returns a chunk, coalescing with its neighbours. A chunk that reaches
    /// the tail pulls the tail back instead.
    fn release(&mut self, mut addr: usize, mut size: usize) {
        debug_assert!(addr + size <= self.end, "freeing past the tail");
        if let Some((&prev, &prev_size)) = self.by_addr.range(..addr).next_back() {
            debug_assert!(prev + prev_size <= addr, "double free of {addr:#x}");
            if prev + prev_size == addr {
                self.remove_chunk(prev, prev_size);
                addr = prev;
                size += prev_size;
            }
        }
        if let Some(&next_size) = self.by_addr.get(&(addr + size)) {
            self.remove_chunk(addr + size, next_size);
            size += next_size;
        }
        if addr + size == self.end {
            self.end = addr;
        } else {
            self.insert_chunk(addr, size);
        }
    }

    fn free_bytes(&self) -> usize {
        self.by_addr.values().sum()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tlab {
    pos: usize,
    end: usize,
}

/// A free-list space.
///
/// Small requests are served from per-thread allocation buffers carved out
/// of the free list; larger ones take the best-fitting free chunk or extend
/// the tail. Freed chunks coalesce with their neighbours.
pub struct MallocSpace {
    name: String,
    mem: Arc<MemMap>,
    begin: usize,
    limit: AtomicUsize,
    growth_limit: AtomicUsize,
    footprint_limit: AtomicUsize,
    end: AtomicUsize,
    free_list: Mutex<FreeList>,
    tlabs: Mutex<HashMap<ThreadId, Tlab>>,
    tlab_size: usize,
    bitmaps: BitmapPair,
    bytes_allocated: AtomicUsize,
    objects_allocated: AtomicUsize,
    can_move: bool,
    zygote_created: AtomicBool,
}

impl MallocSpace {
    /// Creates an empty space over `[begin, limit)` of `mem` that may not
    /// grow past `begin + growth_limit` until the growth limit is cleared.
    ///
    /// A `tlab_size` of 0 disables thread-local buffers.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the bitmaps could not be mapped, or
    /// `InvalidInput` if the range is empty or outside `mem`.
    pub fn create(
        name: impl Into<String>,
        mem: Arc<MemMap>,
        begin: usize,
        limit: usize,
        growth_limit: usize,
        tlab_size: usize,
        can_move: bool,
    ) -> io::Result<Self> {
        let name = name.into();
        if begin >= limit || !mem.contains(begin) || limit > mem.end() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{name}: bad range {begin:#x}..{limit:#x}"),
            ));
        }
        let bitmaps = BitmapPair::create(&name, begin, limit - begin, OBJECT_ALIGNMENT)?;
        let growth_end = (begin + growth_limit).min(limit);
        Ok(Self {
            name,
            mem,
            begin,
            limit: AtomicUsize::new(limit),
            growth_limit: AtomicUsize::new(growth_end),
            footprint_limit: AtomicUsize::new(limit - begin),
            end: AtomicUsize::new(begin),
            free_list: Mutex::new(FreeList {
                end: begin,
                ..FreeList::default()
            }),
            tlabs: Mutex::new(HashMap::new()),
            tlab_size,
            bitmaps,
            bytes_allocated: AtomicUsize::new(0),
            objects_allocated: AtomicUsize::new(0),
            can_move,
            zygote_created: AtomicBool::new(false),
        })
    }

    fn allocation_bound(&self) -> usize {
        let soft = self.begin + self.footprint_limit.load(Ordering::Relaxed);
        self.limit
            .load(Ordering::Relaxed)
            .min(self.growth_limit.load(Ordering::Relaxed))
            .min(soft)
    }

    fn publish_end(&self, free_list: &FreeList) {
        self.end.store(free_list.end, Ordering::Release);
    }

    fn zero(&self, addr: usize, len: usize) {
        if self.mem.zero(addr, addr + len).is_err() {
            // SAFETY: the chunk is inside our reservation and owned by the
            // caller until it is handed out.
            unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
        }
    }

    fn alloc_chunk(&self, num_bytes: usize) -> Option<usize> {
        let addr = {
            let mut free_list = self.free_list.lock();
            if let Some(addr) = free_list.take_best_fit(num_bytes) {
                addr
            } else {
                let addr = free_list.end;
                if addr + num_bytes > self.allocation_bound() {
                    return None;
                }
                free_list.end = addr + num_bytes;
                self.publish_end(&free_list);
                addr
            }
        };
        self.zero(addr, num_bytes);
        Some(addr)
    }

    fn alloc_in_tlab(&self, num_bytes: usize) -> Option<usize> {
        let mut tlabs = self.tlabs.lock();
        let tlab = tlabs.entry(thread::current().id()).or_default();
        if tlab.end - tlab.pos < num_bytes {
            let chunk = self.alloc_chunk(self.tlab_size)?;
            let old = std::mem::replace(
                tlab,
                Tlab {
                    pos: chunk,
                    end: chunk + self.tlab_size,
                },
            );
            if old.end > old.pos {
                let mut free_list = self.free_list.lock();
                free_list.release(old.pos, old.end - old.pos);
                self.publish_end(&free_list);
            }
        }
        let addr = tlab.pos;
        tlab.pos += num_bytes;
        Some(addr)
    }

    fn record_alloc(&self, num_bytes: usize) {
        self.bytes_allocated.fetch_add(num_bytes, Ordering::Relaxed);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns one object's chunk to the free list.
    pub fn free(&self, obj: ObjectRef, num_bytes: usize) {
        {
            let mut free_list = self.free_list.lock();
            free_list.release(obj.addr(), num_bytes);
            self.publish_end(&free_list);
        }
        self.bytes_allocated.fetch_sub(num_bytes, Ordering::Relaxed);
        self.objects_allocated.fetch_sub(1, Ordering::Relaxed);
    }

    /// Frees a batch of `(object, bytes)` under one lock. Returns the bytes
    /// freed.
    pub fn free_list(&self, objects: &[(ObjectRef, usize)]) -> usize {
        let mut total = 0;
        {
            let mut free_list = self.free_list.lock();
            for &(obj, bytes) in objects {
                free_list.release(obj.addr(), bytes);
                total += bytes;
            }
            self.publish_end(&free_list);
        }
        self.bytes_allocated.fetch_sub(total, Ordering::Relaxed);
        self.objects_allocated
            .fetch_sub(objects.len(), Ordering::Relaxed);
        total
    }

    /// Bytes sitting in free chunks below the tail.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_list.lock().free_bytes()
    }

    /// Free chunks in address order, for bin building and verification.
    #[must_use]
    pub fn free_chunks(&self) -> Vec<(usize, usize)> {
        self.free_list
            .lock()
            .by_addr
            .iter()
            .map(|(&a, &s)| (a, s))
            .collect()
    }

    /// Bytes this space may grow to before the growth limit is cleared.
    #[must_use]
    pub fn growth_limit(&self) -> usize {
        self.growth_limit.load(Ordering::Relaxed) - self.begin
    }

    /// Gives up the memory between the growth limit and the limit for good.
    pub fn clamp_growth_limit(&self) {
        let growth_end = self.growth_limit.load(Ordering::Relaxed);
        let old_limit = self.limit.swap(growth_end, Ordering::AcqRel);
        if old_limit > growth_end {
            let from = page_round_up(growth_end).min(old_limit);
            let _ = self.mem.release(from, old_limit);
        }
    }

    /// Lets the space grow up to its limit.
    pub fn clear_growth_limit(&self) {
        self.growth_limit
            .store(self.limit.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Splits the space at `end` (rounded up to a page): everything below
    /// becomes a frozen [`ZygoteSpace`] that keeps this space's bitmaps, and
    /// the rest becomes a new empty non-moving space called `new_name`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the space was already split or no room is
    /// left above `end`, or the OS error if new bitmaps could not be mapped.
    pub fn create_zygote_space(&self, end: usize, new_name: &str) -> io::Result<(ZygoteSpace, Self)> {
        if self.zygote_created.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} already split into a zygote space", self.name),
            ));
        }
        self.revoke_thread_local_buffers();
        let limit = self.limit();
        let zygote_end = page_round_up(end.max(self.end())).min(limit);
        let zygote = ZygoteSpace::new(
            "zygote space",
            self.begin,
            zygote_end,
            BitmapPair::from_parts(self.bitmaps.live(), self.bitmaps.mark()),
        );
        let growth_end = self.growth_limit.load(Ordering::Relaxed).max(zygote_end);
        let rest = Self::create(
            new_name,
            Arc::clone(&self.mem),
            zygote_end,
            limit,
            growth_end - zygote_end,
            self.tlab_size,
            false,
        )?;
        tracing::debug!(
            zygote_size = zygote_end - self.begin,
            non_moving_capacity = limit - zygote_end,
            "split {} into zygote and {}",
            self.name,
            new_name
        );
        Ok((zygote, rest))
    }
}

impl Space for MallocSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SpaceKind {
        SpaceKind::Malloc
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
        self.limit.load(Ordering::Acquire)
    }

    fn bitmaps(&self) -> Option<&BitmapPair> {
        Some(&self.bitmaps)
    }

    fn can_move_objects(&self) -> bool {
        self.can_move
    }
}

impl AllocSpace for MallocSpace {
    fn alloc(&self, num_bytes: usize) -> Option<ObjectRef> {
        debug_assert_eq!(num_bytes % OBJECT_ALIGNMENT, 0);
        let small = self.tlab_size != 0 && num_bytes <= self.tlab_size / 8;
        let addr = if small {
            self.alloc_in_tlab(num_bytes)
                .or_else(|| self.alloc_chunk(num_bytes))?
        } else {
            self.alloc_chunk(num_bytes)?
        };
        self.record_alloc(num_bytes);
        ObjectRef::from_addr(addr)
    }

    fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
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
        self.tlabs.lock().clear();
        {
            let mut free_list = self.free_list.lock();
            *free_list = FreeList {
                end: self.begin,
                ..FreeList::default()
            };
            self.publish_end(&free_list);
        }
        self.bitmaps.unbind();
        self.bitmaps.live().clear_all();
        self.bitmaps.mark().clear_all();
        self.bytes_allocated.store(0, Ordering::Relaxed);
        self.objects_allocated.store(0, Ordering::Relaxed);
        let _ = self.mem.release(self.begin, self.limit());
    }

    fn trim(&self) -> usize {
        let free_list = self.free_list.lock();
        let mut released = 0;
        for (&addr, &size) in &free_list.by_addr {
            released += self.mem.release(addr, addr + size).unwrap_or(0);
        }
        let limit = self.limit();
        let tail = page_round_up(free_list.end).min(limit);
        released += self.mem.release(tail, limit).unwrap_or(0);
        released
    }

    fn revoke_thread_local_buffers(&self) -> usize {
        let mut tlabs = self.tlabs.lock();
        let mut free_list = self.free_list.lock();
        let mut recovered = 0;
        for (_, tlab) in tlabs.drain() {
            if tlab.end > tlab.pos {
                free_list.release(tlab.pos, tlab.end - tlab.pos);
                recovered += tlab.end - tlab.pos;
            }
        }
        self.publish_end(&free_list);
        recovered
    }
}

impl std::fmt::Debug for MallocSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&crate::space::describe(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sys_mem::{page_size, MemMapOptions};

    fn space(len: usize, tlab_size: usize) -> MallocSpace {
        let mem = Arc::new(MemMapOptions::new("malloc").len(len).map_anonymous().unwrap());
        let (begin, end) = (mem.begin(), mem.end());
        MallocSpace::create("malloc space", mem, begin, end, end - begin, tlab_size, false).unwrap()
    }

    #[test]
    fn test_free_coalesces_and_retracts_tail() {
        let s = space(64 * 1024, 0);
        let a = s.alloc(64).unwrap();
        let b = s.alloc(64).unwrap();
        let c = s.alloc(64).unwrap();
        assert_eq!(s.end(), s.begin() + 192);
        s.free(a, 64);
        s.free(b, 64);
        assert_eq!(s.free_chunks(), vec![(a.addr(), 128)]);
        s.free(c, 64);
        assert!(s.free_chunks().is_empty());
        assert_eq!(s.end(), s.begin());
        assert_eq!(s.bytes_allocated(), 0);
        assert_eq!(s.objects_allocated(), 0);
    }

    #[test]
    fn test_best_fit_reuses_smallest_chunk() {
        let s = space(64 * 1024, 0);
        let objs: Vec<_> = [256, 8, 64, 8, 32, 8].iter().map(|&n| s.alloc(n).unwrap()).collect();
        s.free(objs[0], 256);
        s.free(objs[2], 64);
        s.free(objs[4], 32);
        let x = s.alloc(40).unwrap();
        assert_eq!(x, objs[2]);
        assert_eq!(s.free_bytes(), 256 + 24 + 32);
    }

    #[test]
    fn test_allocations_are_zeroed() {
        let s = space(64 * 1024, 0);
        let a = s.alloc(64).unwrap();
        unsafe { std::ptr::write_bytes(a.addr() as *mut u8, 0xAA, 64) };
        s.free(a, 64);
        let b = s.alloc(64).unwrap();
        assert_eq!(a, b);
        let bytes = unsafe { std::slice::from_raw_parts(b.addr() as *const u8, 64) };
        assert!(bytes.iter().all(|&x| x == 0));
    }

    #[test]
    fn test_growth_and_footprint_limits() {
        let mem = Arc::new(MemMapOptions::new("malloc").len(64 * 1024).map_anonymous().unwrap());
        let (begin, end) = (mem.begin(), mem.end());
        let s = MallocSpace::create("limited", mem, begin, end, 1024, 0, false).unwrap();
        assert!(s.alloc(1024).is_some());
        assert!(s.alloc(8).is_none());
        s.clear_growth_limit();
        assert!(s.alloc(8).is_some());
        s.set_footprint_limit(0);
        assert_eq!(s.footprint_limit(), s.size());
        assert!(s.alloc(8).is_none());
    }

    #[test]
    fn test_tlab_revoke_returns_tail() {
        let s = space(256 * 1024, 4096);
        let a = s.alloc(16).unwrap();
        let b = s.alloc(16).unwrap();
        assert_eq!(b.addr(), a.addr() + 16);
        assert_eq!(s.end(), s.begin() + 4096);
        let recovered = s.revoke_thread_local_buffers();
        assert_eq!(recovered, 4096 - 32);
        assert_eq!(s.end(), s.begin() + 32);
        assert_eq!(s.bytes_allocated(), 32);
    }

    #[test]
    fn test_trim_releases_free_pages() {
        let ps = page_size();
        let s = space(16 * ps, 0);
        let a = s.alloc(4 * ps).unwrap();
        let _pin = s.alloc(8).unwrap();
        s.free(a, 4 * ps);
        assert!(s.trim() >= 4 * ps);
    }

    #[test]
    fn test_clear_resets_everything() {
        let s = space(64 * 1024, 0);
        let a = s.alloc(64).unwrap();
        s.bitmaps().unwrap().live().set(a.addr());
        s.clear();
        assert_eq!(s.end(), s.begin());
        assert_eq!(s.bitmaps().unwrap().live().count(), 0);
        assert_eq!(s.bytes_allocated(), 0);
    }

    #[test]
    fn test_create_zygote_space_splits() {
        let ps = page_size();
        let s = space(16 * ps, 0);
        let a = s.alloc(64).unwrap();
        s.bitmaps().unwrap().live().set(a.addr());
        let (zygote, rest) = s.create_zygote_space(s.end(), "non moving space").unwrap();
        assert_eq!(zygote.begin(), s.begin());
        assert_eq!(zygote.end(), s.begin() + ps);
        assert_eq!(rest.begin(), zygote.end());
        assert_eq!(rest.limit(), s.limit());
        assert_eq!(zygote.objects_allocated(), 1);
        assert!(s.create_zygote_space(s.end(), "again").is_err());
    }
}
