use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sys_mem::{checked_page_round_up, page_size, MemMap};

use crate::accounting::bitmap::BitmapPair;
use crate::address::ObjectRef;
use crate::space::{AllocSpace, GcRetentionPolicy, Space, SpaceKind};

#[derive(Debug, Clone, Copy)]
struct LargeObject {
    size: usize,
    zygote: bool,
}

#[derive(Debug, Default)]
struct LosState {
    objects: BTreeMap<usize, LargeObject>,
    free: BTreeMap<usize, usize>,
    end: usize,
}

/// Page-granular space for objects at or above the large-object threshold.
///
/// Each object owns whole pages; freed pages go straight back to the OS.
/// The object map is the source of truth; the live and mark bitmaps (one bit
/// per page) serve the collectors like any other space.
pub struct LargeObjectSpace {
    name: String,
    mem: Arc<MemMap>,
    begin: usize,
    limit: usize,
    state: Mutex<LosState>,
    bitmaps: BitmapPair,
    bytes_allocated: AtomicUsize,
    objects_allocated: AtomicUsize,
    footprint_limit: AtomicUsize,
}

impl LargeObjectSpace {
    /// Creates an empty space over `[begin, limit)`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the bitmaps could not be mapped.
    pub fn create(name: impl Into<String>, mem: Arc<MemMap>, begin: usize, limit: usize) -> io::Result<Self> {
        let name = name.into();
        let bitmaps = BitmapPair::create(&name, begin, limit - begin, page_size())?;
        Ok(Self {
            name,
            mem,
            begin,
            limit,
            state: Mutex::new(LosState {
                end: begin,
                ..LosState::default()
            }),
            bitmaps,
            bytes_allocated: AtomicUsize::new(0),
            objects_allocated: AtomicUsize::new(0),
            footprint_limit: AtomicUsize::new(limit - begin),
        })
    }

    /// Bytes an allocation of `num_bytes` occupies, or `None` if that
    /// does not fit in `usize`.
    #[must_use]
    pub fn allocation_size(num_bytes: usize) -> Option<usize> {
        checked_page_round_up(num_bytes)
    }

    /// Frees one object. Returns the bytes released, or 0 if `obj` is not a
    /// large object.
    pub fn free(&self, obj: ObjectRef) -> usize {
        let size = {
            let mut state = self.state.lock();
            let Some(large) = state.objects.remove(&obj.addr()) else {
                return 0;
            };
            Self::release_chunk(&mut state, obj.addr(), large.size);
            large.size
        };
        let _ = self.mem.release(obj.addr(), obj.addr() + size);
        self.bytes_allocated.fetch_sub(size, Ordering::Relaxed);
        self.objects_allocated.fetch_sub(1, Ordering::Relaxed);
        size
    }

    fn release_chunk(state: &mut LosState, mut addr: usize, mut size: usize) {
        if let Some((&prev, &prev_size)) = state.free.range(..addr).next_back() {
            if prev + prev_size == addr {
                state.free.remove(&prev);
                addr = prev;
                size += prev_size;
            }
        }
        if let Some(next_size) = state.free.remove(&(addr + size)) {
            size += next_size;
        }
        if addr + size == state.end {
            state.end = addr;
        } else {
            state.free.insert(addr, size);
        }
    }

    /// Returns `true` if `obj` is the start of a large object.
    #[must_use]
    pub fn is_object(&self, obj: ObjectRef) -> bool {
        self.state.lock().objects.contains_key(&obj.addr())
    }

    /// Bytes occupied by `obj`, if it is a large object.
    #[must_use]
    pub fn object_size(&self, obj: ObjectRef) -> Option<usize> {
        self.state.lock().objects.get(&obj.addr()).map(|o| o.size)
    }

    /// Returns `true` if `obj` was allocated before the zygote fork.
    #[must_use]
    pub fn is_zygote_object(&self, obj: ObjectRef) -> bool {
        self.state
            .lock()
            .objects
            .get(&obj.addr())
            .is_some_and(|o| o.zygote)
    }

    /// Flags every current object as a zygote object. Partial collections
    /// never free zygote objects.
    pub fn set_all_large_objects_as_zygote_objects(&self) {
        for object in self.state.lock().objects.values_mut() {
            object.zygote = true;
        }
    }

    /// All large objects in address order.
    #[must_use]
    pub fn objects(&self) -> Vec<ObjectRef> {
        self.state
            .lock()
            .objects
            .keys()
            .filter_map(|&a| ObjectRef::from_addr(a))
            .collect()
    }

    /// Zygote objects in address order.
    #[must_use]
    pub fn zygote_objects(&self) -> Vec<ObjectRef> {
        self.state
            .lock()
            .objects
            .iter()
            .filter(|(_, o)| o.zygote)
            .filter_map(|(&a, _)| ObjectRef::from_addr(a))
            .collect()
    }
}

impl Space for LargeObjectSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SpaceKind {
        SpaceKind::LargeObject
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        GcRetentionPolicy::AlwaysCollect
    }

    fn begin(&self) -> usize {
        self.begin
    }

    fn end(&self) -> usize {
        self.state.lock().end
    }

    fn limit(&self) -> usize {
        self.limit
    }

    fn bitmaps(&self) -> Option<&BitmapPair> {
        Some(&self.bitmaps)
    }

    fn size(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    fn walk(&self, _model: &dyn crate::object::ObjectModel, visitor: &mut dyn FnMut(ObjectRef)) {
        for obj in self.objects() {
            visitor(obj);
        }
    }
}

impl AllocSpace for LargeObjectSpace {
    fn alloc(&self, num_bytes: usize) -> Option<ObjectRef> {
        let size = Self::allocation_size(num_bytes)?;
        let mut state = self.state.lock();
        let fit = state
            .free
            .iter()
            .find(|(_, &chunk)| chunk >= size)
            .map(|(&a, &s)| (a, s));
        let addr = if let Some((addr, chunk)) = fit {
            state.free.remove(&addr);
            if chunk > size {
                state.free.insert(addr + size, chunk - size);
            }
            addr
        } else {
            let addr = state.end;
            let bound = self.limit.min(self.begin + self.footprint_limit.load(Ordering::Relaxed));
            let end = addr.checked_add(size).filter(|&end| end <= bound)?;
            state.end = end;
            addr
        };
        state.objects.insert(addr, LargeObject { size, zygote: false });
        drop(state);
        self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
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
        let used = self.end() - self.begin;
        self.footprint_limit
            .store(limit.clamp(used, self.limit - self.begin), Ordering::Relaxed);
    }

    fn clear(&self) {
        *self.state.lock() = LosState {
            end: self.begin,
            ..LosState::default()
        };
        self.bitmaps.unbind();
        self.bitmaps.live().clear_all();
        self.bitmaps.mark().clear_all();
        self.bytes_allocated.store(0, Ordering::Relaxed);
        self.objects_allocated.store(0, Ordering::Relaxed);
        let _ = self.mem.release(self.begin, self.limit);
    }

    fn trim(&self) -> usize {
        let state = self.state.lock();
        self.mem.release(state.end, self.limit).unwrap_or(0)
    }
}

impl std::fmt::Debug for LargeObjectSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&crate::space::describe(self))
    }
}
