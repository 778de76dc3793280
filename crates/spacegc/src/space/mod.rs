//! Heap spaces.
//!
//! The heap reservation is carved into contiguous spaces, each with its own
//! allocation strategy:
//!
//! - [`BumpPointerSpace`]: lock-free cursor, emptied wholesale by the copying
//!   collector.
//! - [`MallocSpace`]: free-list allocator with per-thread buffers, used for
//!   the non-moving space and for the main space of mark-sweep heaps.
//! - [`LargeObjectSpace`]: page-granular objects above the large-object
//!   threshold, tracked in their own map.
//! - [`ImageSpace`]: boot objects, allocated once and never collected.
//! - [`ZygoteSpace`]: the frozen remains of the non-moving space after
//!   zygote compaction.

mod bump_pointer;
mod image;
mod large_object;
mod malloc_space;
mod zygote;

pub use bump_pointer::BumpPointerSpace;
pub use image::ImageSpace;
pub use large_object::LargeObjectSpace;
pub use malloc_space::MallocSpace;
pub use zygote::ZygoteSpace;

use crate::accounting::bitmap::BitmapPair;
use crate::address::ObjectRef;
use crate::object::ObjectModel;

/// The allocation strategy behind a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpaceKind {
    /// Boot image objects.
    Image = 0,
    /// Frozen pre-fork objects.
    Zygote = 1,
    /// Free-list allocation.
    Malloc = 2,
    /// Bump-pointer allocation.
    BumpPointer = 3,
    /// Page-granular large objects.
    LargeObject = 4,
}

/// Which collections may reclaim objects in a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcRetentionPolicy {
    /// Objects are never reclaimed.
    NeverCollect = 0,
    /// Every collection may reclaim objects.
    AlwaysCollect = 1,
    /// Only full collections reclaim objects.
    FullCollect = 2,
}

/// Common view of a space.
pub trait Space: Send + Sync {
    /// Name used in logs and dumps.
    fn name(&self) -> &str;

    /// Allocation strategy.
    fn kind(&self) -> SpaceKind;

    /// Which collections may reclaim objects here.
    fn retention_policy(&self) -> GcRetentionPolicy;

    /// First address of the space.
    fn begin(&self) -> usize;

    /// End of the memory handed out so far.
    fn end(&self) -> usize;

    /// End of the memory the space may ever use.
    fn limit(&self) -> usize;

    /// Returns `true` if `addr` lies in `[begin, limit)`.
    fn contains(&self, addr: usize) -> bool {
        addr >= self.begin() && addr < self.limit()
    }

    /// Live and mark bitmaps, if the space keeps them.
    fn bitmaps(&self) -> Option<&BitmapPair> {
        None
    }

    /// Returns `true` if a collector may relocate objects out of the space.
    fn can_move_objects(&self) -> bool {
        false
    }

    /// Bytes between begin and end.
    fn size(&self) -> usize {
        self.end() - self.begin()
    }

    /// Bytes between begin and limit.
    fn capacity(&self) -> usize {
        self.limit() - self.begin()
    }

    /// Visits every object in address order.
    ///
    /// Only meaningful while mutators are suspended.
    fn walk(&self, model: &dyn ObjectModel, visitor: &mut dyn FnMut(ObjectRef)) {
        let _ = model;
        if let Some(bitmaps) = self.bitmaps() {
            bitmaps.live().walk(visitor);
        }
    }
}

/// A space objects can be allocated in.
pub trait AllocSpace: Space {
    /// Allocates `num_bytes` (already object aligned) of zeroed memory.
    /// Returns `None` when the request does not fit within the footprint
    /// limit; the caller decides whether to collect, grow or give up.
    fn alloc(&self, num_bytes: usize) -> Option<ObjectRef>;

    /// Bytes of live allocations.
    fn bytes_allocated(&self) -> usize;

    /// Number of live allocations.
    fn objects_allocated(&self) -> usize;

    /// Soft cap on bytes handed out from `begin`.
    fn footprint_limit(&self) -> usize;

    /// Sets the soft cap, never below what is already handed out.
    fn set_footprint_limit(&self, limit: usize);

    /// Drops every object and returns the memory to the OS.
    fn clear(&self);

    /// Returns unused pages to the OS. Returns the bytes released.
    fn trim(&self) -> usize {
        0
    }

    /// Hands every thread-local buffer back to the space. Returns the
    /// unused bytes recovered.
    fn revoke_thread_local_buffers(&self) -> usize {
        0
    }
}

/// Short human-readable summary used by heap dumps.
pub(crate) fn describe(space: &dyn Space) -> String {
    format!(
        "{:?} {} begin={:#x} end={:#x} limit={:#x} size={} capacity={}",
        space.kind(),
        space.name(),
        space.begin(),
        space.end(),
        space.limit(),
        space.size(),
        space.capacity()
    )
}
