use std::sync::atomic::{AtomicUsize, Ordering};

use crate::accounting::bitmap::BitmapPair;
use crate::address::ObjectRef;
use crate::space::{GcRetentionPolicy, Space, SpaceKind};

/// The frozen lower part of the pre-fork non-moving space.
///
/// Nothing is allocated here. Partial and sticky collections treat it as
/// immune; a full collection may find dead objects, which are counted and
/// dropped from the live bitmap but whose memory is never reused, so the
/// shared pages stay clean.
pub struct ZygoteSpace {
    name: String,
    begin: usize,
    end: usize,
    bitmaps: BitmapPair,
    objects_allocated: AtomicUsize,
}

impl ZygoteSpace {
    /// Wraps `[begin, end)` and the bitmaps inherited from the split space.
    #[must_use]
    pub fn new(name: impl Into<String>, begin: usize, end: usize, bitmaps: BitmapPair) -> Self {
        let mut objects = 0;
        bitmaps.live().visit_marked_range(begin, end, |_| objects += 1);
        Self {
            name: name.into(),
            begin,
            end,
            bitmaps,
            objects_allocated: AtomicUsize::new(objects),
        }
    }

    /// Objects still considered live.
    #[must_use]
    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    /// Records objects a full collection found dead. The memory stays put.
    pub fn record_dead(&self, objects: &[ObjectRef]) {
        let live = self.bitmaps.live();
        for &obj in objects {
            live.clear(obj.addr());
        }
        self.objects_allocated
            .fetch_sub(objects.len(), Ordering::Relaxed);
    }
}

impl Space for ZygoteSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SpaceKind {
        SpaceKind::Zygote
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        GcRetentionPolicy::FullCollect
    }

    fn begin(&self) -> usize {
        self.begin
    }

    fn end(&self) -> usize {
        self.end
    }

    fn limit(&self) -> usize {
        self.end
    }

    fn bitmaps(&self) -> Option<&BitmapPair> {
        Some(&self.bitmaps)
    }
}

impl std::fmt::Debug for ZygoteSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&crate::space::describe(self))
    }
}
