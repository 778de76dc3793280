//! The copying collector.
//!
//! Live objects of the from-space are evacuated into the to-space (or, once
//! that is full, into a fallback free-list space) and every reference to
//! them is rewritten. Objects outside the from-space are marked in place.
//!
//! The same collector runs in three setups:
//!
//! - the semi-space family, copying one bump-pointer space into the other,
//!   with sticky runs that leave the non-moving and large-object spaces
//!   alone and use remembered sets as extra roots;
//! - homogeneous compaction, copying the main free-list space into its
//!   backup;
//! - zygote compaction, packing objects into the gaps of the non-moving
//!   space before spilling into a bump-pointer space over its tail.

use std::sync::Arc;

use tracing::debug;

use crate::accounting::bitmap::SpaceBitmap;
use crate::accounting::object_stack::ObjectStack;
use crate::address::ObjectRef;
use crate::collector::{
    find_target, mark_alloc_stack_as_live, mark_reachable_from_immune_spaces, sweep_targets, BinPacker, Collector,
    CollectorType, CumulativeTimings, ForwardingTable, GcContext, GcIteration, GcType, ImmuneSpaces, MarkTarget,
};
use crate::space::{AllocSpace, MallocSpace, Space};

/// Copying collector state. The heap sets the from- and to-spaces before
/// every run.
pub(crate) struct SemiSpace {
    name: String,
    gc_type: GcType,
    collector_type: CollectorType,
    bin_packing: bool,
    mark_stack: ObjectStack,
    forwarding: ForwardingTable,
    immune: ImmuneSpaces,
    targets: Vec<MarkTarget>,
    from_space: Option<Arc<dyn AllocSpace>>,
    to_space: Option<Arc<dyn AllocSpace>>,
    fallback_space: Option<Arc<MallocSpace>>,
    bins: Option<BinPacker>,
    from_range: (usize, usize),
    to_range: (usize, usize),
    to_live: Option<Arc<SpaceBitmap>>,
    objects_copied: usize,
    bytes_copied: usize,
    objects_marked: usize,
    cumulative: CumulativeTimings,
}

impl SemiSpace {
    pub fn new(name: &str, gc_type: GcType, collector_type: CollectorType, mark_stack_capacity: usize) -> Self {
        Self {
            name: name.to_owned(),
            gc_type,
            collector_type,
            bin_packing: false,
            mark_stack: ObjectStack::new("semi space mark stack", mark_stack_capacity, 0),
            forwarding: ForwardingTable::new(),
            immune: ImmuneSpaces::new(),
            targets: Vec::new(),
            from_space: None,
            to_space: None,
            fallback_space: None,
            bins: None,
            from_range: (0, 0),
            to_range: (0, 0),
            to_live: None,
            objects_copied: 0,
            bytes_copied: 0,
            objects_marked: 0,
            cumulative: CumulativeTimings::default(),
        }
    }

    /// The zygote compactor: full, never sweeps, places copies into bins
    /// first and has no fallback space.
    pub fn new_bin_packing(mark_stack_capacity: usize) -> Self {
        let mut ss = Self::new(
            "zygote compactor",
            GcType::Full,
            CollectorType::ZygoteCompact,
            mark_stack_capacity,
        );
        ss.bin_packing = true;
        ss
    }

    pub fn set_from_space(&mut self, space: Arc<dyn AllocSpace>) {
        self.from_space = Some(space);
    }

    pub fn set_to_space(&mut self, space: Arc<dyn AllocSpace>) {
        self.to_space = Some(space);
    }

    /// Space that receives copies once the to-space is full.
    pub fn set_fallback_space(&mut self, space: Option<Arc<MallocSpace>>) {
        self.fallback_space = space;
    }

    pub fn set_bins(&mut self, bins: BinPacker) {
        self.bins = Some(bins);
    }

    /// Hands back the bins after a run, with their packing statistics.
    pub fn take_bins(&mut self) -> Option<BinPacker> {
        self.bins.take()
    }

    #[inline]
    const fn in_from_space(&self, addr: usize) -> bool {
        addr >= self.from_range.0 && addr < self.from_range.1
    }

    #[inline]
    const fn in_to_space(&self, addr: usize) -> bool {
        addr >= self.to_range.0 && addr < self.to_range.1
    }

    /// Finds room for a copy of `size` bytes: bins, then the to-space, then
    /// the fallback space. Sets the bitmap bits the destination needs.
    fn allocate_copy(&mut self, size: usize) -> Option<ObjectRef> {
        if let Some(addr) = self.bins.as_mut().and_then(|bins| bins.take(size)) {
            let obj = ObjectRef::from_addr(addr)?;
            if let Some(t) = find_target(&self.targets, addr) {
                t.live.set(addr);
                t.mark.set(addr);
            }
            return Some(obj);
        }
        if let Some(obj) = self.to_space.as_ref().and_then(|to| to.alloc(size)) {
            if let Some(live) = &self.to_live {
                live.set(obj.addr());
            }
            return Some(obj);
        }
        if self.bin_packing {
            return None;
        }
        let obj = self.fallback_space.as_ref()?.alloc(size)?;
        if let Some(t) = find_target(&self.targets, obj.addr()) {
            t.live.set(obj.addr());
            t.mark.set(obj.addr());
        }
        Some(obj)
    }

    fn copy_object(&mut self, ctx: &GcContext<'_>, obj: ObjectRef) -> ObjectRef {
        let size = ctx.allocation_size_of(obj);
        let Some(dest) = self.allocate_copy(size) else {
            ctx.fatal(format_args!(
                "{}: no room to copy {obj} ({size} bytes)",
                self.name
            ));
        };
        // SAFETY: both ranges are inside the heap reservation, the source is
        // a live object in the from-space and the destination was just
        // handed out, so they cannot overlap. Mutators are suspended.
        unsafe {
            std::ptr::copy_nonoverlapping(obj.addr() as *const u8, dest.addr() as *mut u8, size);
        }
        if let Err(existing) = self.forwarding.insert(obj, dest) {
            ctx.fatal(format_args!("{obj} copied twice: {existing} and {dest}"));
        }
        self.objects_copied += 1;
        self.bytes_copied += size;
        self.mark_stack.push(dest);
        dest
    }

    /// Updates every reference of `obj`. A holder outside the to-space that
    /// now points into it gets its card dirtied so the next collection
    /// remembers it.
    fn scan_object(&mut self, ctx: &GcContext<'_>, obj: ObjectRef) {
        let holder_in_to = self.in_to_space(obj.addr());
        let mut references_to_space = false;
        ctx.update_references(obj, |referent| {
            let new = self.mark_object(ctx, referent);
            references_to_space |= self.in_to_space(new.addr());
            new
        });
        if references_to_space && !holder_in_to {
            ctx.card_table.mark_card(obj);
        }
    }

    /// Scans an object found through a remembered set. Returns `true` if it
    /// still references the to-space.
    fn scan_remembered(&mut self, ctx: &GcContext<'_>, obj: ObjectRef) -> bool {
        let mut keep = false;
        ctx.update_references(obj, |referent| {
            let new = self.mark_object(ctx, referent);
            keep |= self.in_to_space(new.addr());
            new
        });
        keep
    }

    fn mark_roots(&mut self, ctx: &GcContext<'_>) {
        ctx.runtime
            .visit_roots(&mut |slot: &mut ObjectRef| *slot = self.mark_object(ctx, *slot));
        ctx.heap_roots
            .visit(&mut |slot: &mut ObjectRef| *slot = self.mark_object(ctx, *slot));
    }

    /// Sticky runs treat the non-moving and large-object spaces as live and
    /// only look at the objects there that may reference the from-space.
    fn mark_remembered(&mut self, ctx: &GcContext<'_>) {
        let spaces = ctx.spaces;
        let candidates: [(&dyn Space, _); 2] = [
            (spaces.non_moving.as_ref(), spaces.non_moving_remembered_set.clone()),
            (spaces.large_objects.as_ref(), spaces.large_object_remembered_set.clone()),
        ];
        for (space, remembered) in candidates {
            let Some(bitmaps) = space.bitmaps() else { continue };
            let live = bitmaps.live();
            match remembered {
                Some(set) => {
                    let visited = set.update_and_mark(&live, |obj| self.scan_remembered(ctx, obj));
                    debug!(space = space.name(), visited, cards = set.len(), "scanned remembered set");
                }
                None => {
                    live.visit_marked_range(space.begin(), space.limit(), |obj| self.scan_object(ctx, obj));
                }
            }
        }
    }

    fn is_marked(&self, obj: ObjectRef) -> Option<ObjectRef> {
        let addr = obj.addr();
        if self.in_from_space(addr) {
            return self.forwarding.get(obj);
        }
        if self.in_to_space(addr) || self.immune.contains(addr) || self.gc_type == GcType::Sticky {
            return Some(obj);
        }
        match find_target(&self.targets, addr) {
            Some(t) if !t.mark.test(addr) => None,
            _ => Some(obj),
        }
    }

    fn reset_run_state(&mut self) {
        self.forwarding.clear();
        self.immune.clear();
        self.targets.clear();
        self.to_live = None;
        self.objects_copied = 0;
        self.bytes_copied = 0;
        self.objects_marked = 0;
    }
}

impl Collector for SemiSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn gc_type(&self) -> GcType {
        self.gc_type
    }

    fn collector_type(&self) -> CollectorType {
        self.collector_type
    }

    fn cumulative(&self) -> &CumulativeTimings {
        &self.cumulative
    }

    fn cumulative_mut(&mut self) -> &mut CumulativeTimings {
        &mut self.cumulative
    }

    fn initialize_phase(&mut self, ctx: &GcContext<'_>) {
        self.reset_run_state();
        let (Some(from), Some(to)) = (&self.from_space, &self.to_space) else {
            ctx.fatal(format_args!("{}: from- and to-space must be set", self.name));
        };
        self.from_range = (from.begin(), from.limit());
        self.to_range = (to.begin(), to.limit());
        self.to_live = to.bitmaps().map(|b| b.live());

        mark_alloc_stack_as_live(ctx.spaces, ctx.live_stack);
        ctx.live_stack.reset();

        if let Some(image) = &ctx.spaces.image {
            self.immune.add_space(image.as_ref());
        }
        if self.gc_type != GcType::Full {
            if let Some(zygote) = &ctx.spaces.zygote {
                self.immune.add_space(zygote.as_ref());
            }
        }

        let (from_range, to_range) = (self.from_range, self.to_range);
        let immune = &self.immune;
        self.targets = ctx
            .spaces
            .bitmap_spaces()
            .into_iter()
            .filter(|s| {
                let b = s.begin();
                !immune.contains(b) && !(b >= from_range.0 && b < from_range.1) && !(b >= to_range.0 && b < to_range.1)
            })
            .filter_map(MarkTarget::new)
            .collect();
        if self.gc_type != GcType::Sticky {
            for t in &self.targets {
                t.mark.clear_all();
            }
        }
    }

    fn marking_phase(&mut self, ctx: &GcContext<'_>, iteration: &mut GcIteration) {
        self.mark_roots(ctx);
        let zygote_immune = ctx
            .spaces
            .zygote
            .as_ref()
            .is_some_and(|zygote| self.immune.contains(zygote.begin()));
        mark_reachable_from_immune_spaces(self, ctx, zygote_immune);
        match self.gc_type {
            GcType::Sticky => self.mark_remembered(ctx),
            GcType::Partial => {
                // Large objects allocated before the fork belong to the zygote.
                for obj in ctx.spaces.large_objects.zygote_objects() {
                    self.mark_object(ctx, obj);
                }
            }
            GcType::Full | GcType::None => {}
        }
        self.process_mark_stack(ctx);
        ctx.runtime
            .sweep_system_weaks(&mut |obj| self.is_marked(obj));
        iteration.objects_surviving = self.objects_copied + self.objects_marked;
        iteration.bytes_copied = self.bytes_copied;
    }

    fn reclaim_phase(&mut self, ctx: &GcContext<'_>, iteration: &mut GcIteration) {
        if self.gc_type != GcType::Sticky && !self.bin_packing {
            sweep_targets(ctx, &self.targets, self.gc_type, iteration);
        }

        if let Some(from) = &self.from_space {
            iteration.freed_bytes += from.bytes_allocated().saturating_sub(self.bytes_copied);
            iteration.freed_objects += from.objects_allocated().saturating_sub(self.objects_copied);
            from.clear();
            ctx.card_table.clear_range(from.begin(), from.limit());
        }
        if let Some(to) = &self.to_space {
            to.revoke_thread_local_buffers();
        }
        debug!(
            collector = %self.name,
            copied_objects = self.objects_copied,
            copied_bytes = self.bytes_copied,
            marked_objects = self.objects_marked,
            "evacuated from-space"
        );
    }

    fn finish_phase(&mut self, _ctx: &GcContext<'_>) {
        self.reset_run_state();
        self.from_space = None;
        self.to_space = None;
        self.fallback_space = None;
        self.from_range = (0, 0);
        self.to_range = (0, 0);
    }

    fn mark_object(&mut self, ctx: &GcContext<'_>, obj: ObjectRef) -> ObjectRef {
        let addr = obj.addr();
        if self.in_from_space(addr) {
            return self.forwarding.get(obj).unwrap_or_else(|| self.copy_object(ctx, obj));
        }
        if self.in_to_space(addr) || self.immune.contains(addr) || self.gc_type == GcType::Sticky {
            return obj;
        }
        let Some(target) = find_target(&self.targets, addr) else {
            ctx.fatal(format_args!("{}: reference to {obj} outside every space", self.name));
        };
        if target.mark.atomic_test_and_set(addr) {
            self.objects_marked += 1;
            self.mark_stack.push(obj);
        }
        obj
    }

    fn process_mark_stack(&mut self, ctx: &GcContext<'_>) {
        while let Some(obj) = self.mark_stack.pop() {
            self.scan_object(ctx, obj);
        }
    }
}
