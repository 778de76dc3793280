use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use sys_mem::MemMap;

use crate::accounting::bitmap::BitmapPair;
use crate::address::{ObjectRef, OBJECT_ALIGNMENT};
use crate::space::{GcRetentionPolicy, Space, SpaceKind};

/// Boot image objects.
///
/// The embedder populates the space while booting and then seals it. Every
/// object is live forever; the space is immune to every collection and its
/// outgoing references are found through a mod-union table.
pub struct ImageSpace {
    name: String,
    begin: usize,
    limit: usize,
    end: AtomicUsize,
    sealed: AtomicBool,
    objects: AtomicUsize,
    bitmaps: BitmapPair,
    _mem: Arc<MemMap>,
}

impl ImageSpace {
    /// Creates an empty, unsealed image space over `[begin, limit)`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the bitmaps could not be mapped.
    pub fn create(name: impl Into<String>, mem: Arc<MemMap>, begin: usize, limit: usize) -> io::Result<Self> {
        let name = name.into();
        let bitmaps = BitmapPair::create(&name, begin, limit - begin, OBJECT_ALIGNMENT)?;
        bitmaps.bind_live_to_mark();
        Ok(Self {
            name,
            begin,
            limit,
            end: AtomicUsize::new(begin),
            sealed: AtomicBool::new(false),
            objects: AtomicUsize::new(0),
            bitmaps,
            _mem: mem,
        })
    }

    /// Allocates a boot object and marks it live. Returns `None` once the
    /// space is sealed or full.
    pub fn alloc(&self, num_bytes: usize) -> Option<ObjectRef> {
        if self.is_sealed() {
            return None;
        }
        let mut end = self.end.load(Ordering::Relaxed);
        loop {
            let new_end = end.checked_add(num_bytes).filter(|&e| e <= self.limit)?;
            match self.end.compare_exchange_weak(
                end,
                new_end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => end = actual,
            }
        }
        self.bitmaps.live().set(end);
        self.objects.fetch_add(1, Ordering::Relaxed);
        ObjectRef::from_addr(end)
    }

    /// Freezes the space; later allocations fail.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Returns `true` once sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Number of boot objects.
    #[must_use]
    pub fn objects_allocated(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }
}

impl Space for ImageSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SpaceKind {
        SpaceKind::Image
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        GcRetentionPolicy::NeverCollect
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

    fn bitmaps(&self) -> Option<&BitmapPair> {
        Some(&self.bitmaps)
    }
}

impl std::fmt::Debug for ImageSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&crate::space::describe(self))
    }
}
