//! Allocation paths and the collection escalation behind them.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::spaces::{MainSpaces, Spaces};
use super::Heap;
use crate::address::{allocation_size, checked_allocation_size, ClassWord, ObjectRef, HEADER_SIZE};
use crate::collector::{GcCause, GcType};
use crate::error::OutOfMemoryError;
use crate::object::store_word;
use crate::space::{AllocSpace, LargeObjectSpace};

/// Where an allocation goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Allocator {
    /// The main space: bump pointer or free list, depending on the family.
    Main,
    NonMoving,
    LargeObject,
}

impl Allocator {
    fn space(self, spaces: &Spaces) -> Arc<dyn AllocSpace> {
        match self {
            Self::Main => spaces.main.main(),
            Self::NonMoving => spaces.non_moving.clone(),
            Self::LargeObject => spaces.large_objects.clone(),
        }
    }

    /// Bump-pointer allocations are found by walking the space; everything
    /// else is recorded on the allocation stack until the next collection.
    fn uses_allocation_stack(self, spaces: &Spaces) -> bool {
        match self {
            Self::Main => matches!(spaces.main, MainSpaces::FreeList { .. }),
            Self::NonMoving | Self::LargeObject => true,
        }
    }

    /// Bytes the heap accounts for a request of `size` aligned bytes, or
    /// `None` if that overflows.
    fn accounted_size(self, size: usize) -> Option<usize> {
        match self {
            Self::LargeObject => LargeObjectSpace::allocation_size(size),
            Self::Main | Self::NonMoving => Some(size),
        }
    }
}

impl Heap {
    /// Allocates a zeroed object of `byte_size` bytes whose first word is
    /// `class`. Objects at or above the large-object threshold go to the
    /// large-object space, everything else to the main space.
    ///
    /// May run collections, and may block while another thread collects.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemoryError`] once every collection in the plan, a
    /// grow-on-retry and a final soft-reference-clearing collection failed
    /// to make room. A size too large to represent once aligned fails
    /// without collecting.
    ///
    /// # Panics
    ///
    /// Panics if `byte_size` cannot hold the class word.
    pub fn allocate(&self, class: ClassWord, byte_size: usize) -> Result<ObjectRef, OutOfMemoryError> {
        self.allocate_with(class, byte_size, Allocator::Main)
    }

    /// Like [`allocate`](Self::allocate), but the object is never moved.
    ///
    /// # Errors
    ///
    /// See [`allocate`](Self::allocate).
    ///
    /// # Panics
    ///
    /// Panics if `byte_size` cannot hold the class word.
    pub fn allocate_non_movable(&self, class: ClassWord, byte_size: usize) -> Result<ObjectRef, OutOfMemoryError> {
        self.allocate_with(class, byte_size, Allocator::NonMoving)
    }

    /// Allocates an object in the image space. Image objects are never
    /// collected and do not count towards the footprint.
    ///
    /// Returns `None` if the heap has no image space, the image space was
    /// sealed or it is full.
    ///
    /// # Panics
    ///
    /// Panics if `byte_size` cannot hold the class word.
    pub fn allocate_image_object(&self, class: ClassWord, byte_size: usize) -> Option<ObjectRef> {
        assert!(byte_size >= HEADER_SIZE, "{byte_size} bytes cannot hold a class word");
        let spaces = self.spaces();
        let image = spaces.image.as_ref()?;
        let obj = image.alloc(checked_allocation_size(byte_size)?)?;
        // SAFETY: freshly allocated, zeroed and at least one word long.
        unsafe { store_word(obj.addr(), class.0, Ordering::Release) };
        Some(obj)
    }

    /// Closes the image space for allocation.
    pub fn seal_image_space(&self) {
        if let Some(image) = &self.spaces().image {
            image.seal();
            debug!(objects = image.objects_allocated(), "sealed image space");
        }
    }

    fn allocate_with(
        &self,
        class: ClassWord,
        byte_size: usize,
        requested: Allocator,
    ) -> Result<ObjectRef, OutOfMemoryError> {
        assert!(byte_size >= HEADER_SIZE, "{byte_size} bytes cannot hold a class word");
        self.runtime.safepoint();
        let Some(size) = checked_allocation_size(byte_size) else {
            return Err(self.out_of_memory(byte_size));
        };
        let allocator = if size >= self.config.large_object_threshold {
            Allocator::LargeObject
        } else {
            requested
        };
        if allocator.accounted_size(size).is_none() {
            return Err(self.out_of_memory(size));
        }

        let (obj, accounted) = loop {
            if let Some(done) = self.try_to_allocate(allocator, size, false) {
                break done;
            }
            if let Some(done) = self.allocate_internal_with_gc(allocator, size)? {
                break done;
            }
        };

        // SAFETY: freshly allocated, zeroed and at least one word long.
        unsafe { store_word(obj.addr(), class.0, Ordering::Release) };
        debug_assert_eq!(
            allocation_size(self.size_of(obj)),
            size,
            "object model disagrees with the requested size of {obj}"
        );

        let new_bytes = self.num_bytes_allocated.fetch_add(accounted, Ordering::AcqRel) + accounted;
        if let Some(stats) = self.runtime.stats() {
            stats.record_allocation(accounted);
        }
        if allocator.uses_allocation_stack(&self.spaces()) {
            self.push_on_allocation_stack(obj);
        }
        if self.is_gc_concurrent() && new_bytes >= self.concurrent_start_bytes() {
            self.request_concurrent_gc(false);
        }
        Ok(obj)
    }

    /// One attempt without collecting. `grow` lets the target footprint
    /// rise towards the growth limit.
    fn try_to_allocate(&self, allocator: Allocator, size: usize, grow: bool) -> Option<(ObjectRef, usize)> {
        let accounted = allocator.accounted_size(size)?;
        if self.is_out_of_memory_on_allocation(accounted, grow) {
            return None;
        }
        let spaces = self.spaces();
        let obj = allocator.space(&spaces).alloc(size)?;
        Some((obj, accounted))
    }

    /// Returns `true` if allocating `size` more bytes would exceed the
    /// footprint.
    ///
    /// Past the growth limit the answer is always yes. Below it, a
    /// concurrent heap lets the allocation through and relies on the
    /// background collection, and a stop-the-world heap grows the target
    /// only when `grow` is set.
    fn is_out_of_memory_on_allocation(&self, size: usize, grow: bool) -> bool {
        let mut target = self.target_footprint.load(Ordering::Acquire);
        loop {
            let Some(new_footprint) = self.get_bytes_allocated().checked_add(size) else {
                return true;
            };
            if new_footprint <= target {
                return false;
            }
            if new_footprint > self.growth_limit() {
                return true;
            }
            if self.is_gc_concurrent() {
                return false;
            }
            if !grow {
                return true;
            }
            match self.target_footprint.compare_exchange_weak(
                target,
                new_footprint,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(old_footprint = target, new_footprint, "growing heap");
                    return false;
                }
                Err(current) => target = current,
            }
        }
    }

    /// The slow path. Returns `Ok(None)` if the layout changed under the
    /// caller, which then starts over with the current spaces.
    fn allocate_internal_with_gc(
        &self,
        allocator: Allocator,
        size: usize,
    ) -> Result<Option<(ObjectRef, usize)>, OutOfMemoryError> {
        let epoch = self.space_epoch.load(Ordering::Acquire);
        let replaced = || self.space_epoch.load(Ordering::Acquire) != epoch;

        let last_gc = self.wait_for_gc_to_complete(GcCause::ForAlloc);
        if replaced() {
            return Ok(None);
        }
        if last_gc != GcType::None {
            if let Some(done) = self.try_to_allocate(allocator, size, false) {
                return Ok(Some(done));
            }
        }

        let tried = self.next_gc_type();
        if tried != GcType::None {
            let ran = self.collect_internal(tried, GcCause::ForAlloc, false);
            if replaced() {
                return Ok(None);
            }
            if ran != GcType::None {
                if let Some(done) = self.try_to_allocate(allocator, size, false) {
                    return Ok(Some(done));
                }
            }
        }

        for &gc_type in &self.gc_plan {
            if gc_type == tried {
                continue;
            }
            let ran = self.collect_internal(gc_type, GcCause::ForAlloc, false);
            if replaced() {
                return Ok(None);
            }
            if ran != GcType::None {
                if let Some(done) = self.try_to_allocate(allocator, size, false) {
                    return Ok(Some(done));
                }
            }
        }

        if let Some(done) = self.try_to_allocate(allocator, size, true) {
            return Ok(Some(done));
        }

        debug!(size, "forcing collection of soft references");
        let broadest = self.gc_plan.last().copied().unwrap_or(GcType::Full);
        self.collect_internal(broadest, GcCause::ForAlloc, true);
        if replaced() {
            return Ok(None);
        }
        if let Some(done) = self.try_to_allocate(allocator, size, true) {
            return Ok(Some(done));
        }

        if allocator == Allocator::Main && self.should_compact_for_oom() {
            let result = self.perform_homogeneous_space_compact();
            debug!(?result, size, "ran homogeneous space compaction for allocation");
            if result.is_ok() {
                if let Some(done) = self.try_to_allocate(allocator, size, true) {
                    self.metrics.record_delayed_oom();
                    return Ok(Some(done));
                }
            }
        }

        Err(self.out_of_memory(size))
    }

    /// Homogeneous compaction is a last resort for fragmented free-list
    /// main spaces, rate limited by the configured interval.
    fn should_compact_for_oom(&self) -> bool {
        if !self.config.use_homogeneous_space_compaction_for_oom
            || !matches!(self.spaces().main, MainSpaces::FreeList { .. })
        {
            return false;
        }
        let mut last = self.last_homogeneous_compaction_by_oom.lock();
        let now = Instant::now();
        let due = last.map_or(true, |at| {
            now.duration_since(at) > self.config.min_interval_homogeneous_space_compaction_by_oom
        });
        if due {
            *last = Some(now);
        }
        due
    }

    fn out_of_memory(&self, requested: usize) -> OutOfMemoryError {
        let error = OutOfMemoryError {
            requested,
            free_bytes: self.get_free_memory(),
            until_oom: self.growth_limit().saturating_sub(self.get_bytes_allocated()),
            target_footprint: self.target_footprint(),
            growth_limit: self.growth_limit(),
            allocator: self.config.collector_type,
        };
        warn!("{error}");
        error
    }

    /// Records `obj` on the allocation stack. A full stack forces a sticky
    /// collection, with `obj` kept in the reserve region and rooted so the
    /// collection sees it.
    fn push_on_allocation_stack(&self, obj: ObjectRef) {
        if self.allocation_stack().atomic_push(obj) {
            return;
        }
        let root = self.heap_roots().root(obj);
        loop {
            if !self.allocation_stack().atomic_push_ignore_growth_limit(obj) {
                warn!(%obj, "allocation stack reserve exhausted");
            }
            let ran = self.collect_internal(GcType::Sticky, GcCause::ForAllocationStack, false);
            if self.allocation_stack().atomic_push(obj) {
                break;
            }
            if ran == GcType::None {
                warn!(%obj, "allocation stack still full and no collection could run");
                break;
            }
        }
        drop(root);
    }
}
