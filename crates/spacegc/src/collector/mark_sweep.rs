//! Non-moving mark-sweep.
//!
//! Full and partial runs mark from the roots and the immune spaces' mod-union
//! tables, then free every object that is live but unmarked and swap the
//! bitmaps. Sticky runs bind each space's mark bitmap to its live bitmap, so
//! everything that survived the last collection counts as marked, trace from
//! the roots and the aged cards, and only sweep the objects allocated since.

use std::collections::BTreeMap;

use tracing::debug;

use crate::accounting::card_table::CARD_AGED;
use crate::accounting::object_stack::ObjectStack;
use crate::address::ObjectRef;
use crate::collector::{
    find_target, free_objects, mark_alloc_stack_as_live, mark_reachable_from_immune_spaces, sweep_targets, Collector,
    CollectorType, CumulativeTimings, GcContext, GcIteration, GcType, ImmuneSpaces, MarkTarget,
};
use crate::space::{GcRetentionPolicy, Space, SpaceKind};

pub(crate) struct MarkSweep {
    name: String,
    gc_type: GcType,
    collector_type: CollectorType,
    mark_stack: ObjectStack,
    immune: ImmuneSpaces,
    targets: Vec<MarkTarget>,
    bound: Vec<usize>,
    objects_marked: usize,
    cumulative: CumulativeTimings,
}

impl MarkSweep {
    pub fn new(gc_type: GcType, collector_type: CollectorType, mark_stack_capacity: usize) -> Self {
        let base = match gc_type {
            GcType::Sticky => "sticky mark sweep",
            GcType::Partial => "partial mark sweep",
            GcType::Full | GcType::None => "mark sweep",
        };
        let name = if collector_type == CollectorType::ConcurrentMarkSweep {
            format!("concurrent {base}")
        } else {
            base.to_owned()
        };
        Self {
            name,
            gc_type,
            collector_type,
            mark_stack: ObjectStack::new("mark sweep mark stack", mark_stack_capacity, 0),
            immune: ImmuneSpaces::new(),
            targets: Vec::new(),
            bound: Vec::new(),
            objects_marked: 0,
            cumulative: CumulativeTimings::default(),
        }
    }

    const fn is_sticky(&self) -> bool {
        matches!(self.gc_type, GcType::Sticky)
    }

    fn scan_object(&mut self, ctx: &GcContext<'_>, obj: ObjectRef) {
        ctx.update_references(obj, |referent| self.mark_object(ctx, referent));
    }

    fn mark_roots(&mut self, ctx: &GcContext<'_>) {
        ctx.runtime
            .visit_roots(&mut |slot: &mut ObjectRef| *slot = self.mark_object(ctx, *slot));
        ctx.heap_roots
            .visit(&mut |slot: &mut ObjectRef| *slot = self.mark_object(ctx, *slot));
    }

    /// Objects on aged cards may point at objects allocated since the last
    /// collection.
    fn scan_aged_cards(&mut self, ctx: &GcContext<'_>) {
        let ranges: Vec<_> = self
            .targets
            .iter()
            .map(|t| (t.begin, t.limit, t.live.clone()))
            .collect();
        for (begin, limit, live) in ranges {
            let cards = ctx
                .card_table
                .scan(&live, begin, limit, CARD_AGED, |obj| self.scan_object(ctx, obj));
            debug!(begin = format_args!("{begin:#x}"), cards, "scanned aged cards");
        }
    }

    /// Frees the objects allocated since the last collection that nothing
    /// reached.
    fn sweep_allocation_stack(&self, ctx: &GcContext<'_>, iteration: &mut GcIteration) {
        let mut dead: BTreeMap<usize, Vec<ObjectRef>> = BTreeMap::new();
        for obj in ctx.live_stack.iter() {
            let addr = obj.addr();
            if self.immune.contains(addr) {
                continue;
            }
            if let Some(t) = find_target(&self.targets, addr) {
                if !t.mark.test(addr) {
                    dead.entry(t.begin).or_default().push(obj);
                }
            }
        }
        for (begin, mut objects) in dead {
            objects.sort_unstable();
            objects.dedup();
            let Some(t) = find_target(&self.targets, begin) else { continue };
            let (count, bytes) = free_objects(ctx, t.kind, &objects);
            if t.kind == SpaceKind::LargeObject {
                iteration.freed_large_objects += count;
                iteration.freed_large_object_bytes += bytes;
            } else {
                iteration.freed_objects += count;
                iteration.freed_bytes += bytes;
            }
        }
        ctx.live_stack.reset();
    }
}

impl Collector for MarkSweep {
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
        self.immune.clear();
        self.targets.clear();
        self.bound.clear();
        self.objects_marked = 0;

        if let Some(image) = &ctx.spaces.image {
            self.immune.add_space(image.as_ref());
        }
        if self.gc_type != GcType::Full {
            if let Some(zygote) = &ctx.spaces.zygote {
                self.immune.add_space(zygote.as_ref());
            }
        }

        let candidates: Vec<&dyn Space> = ctx
            .spaces
            .bitmap_spaces()
            .into_iter()
            .filter(|s| !self.immune.contains(s.begin()))
            .collect();
        if self.is_sticky() {
            for space in &candidates {
                if space.retention_policy() == GcRetentionPolicy::AlwaysCollect {
                    if let Some(bitmaps) = space.bitmaps() {
                        bitmaps.bind_live_to_mark();
                        self.bound.push(space.begin());
                    }
                }
            }
        } else {
            mark_alloc_stack_as_live(ctx.spaces, ctx.live_stack);
            ctx.live_stack.reset();
        }
        self.targets = candidates.into_iter().filter_map(MarkTarget::new).collect();
        if !self.is_sticky() {
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
            GcType::Sticky => self.scan_aged_cards(ctx),
            GcType::Partial => {
                for obj in ctx.spaces.large_objects.zygote_objects() {
                    self.mark_object(ctx, obj);
                }
            }
            GcType::Full | GcType::None => {}
        }
        self.process_mark_stack(ctx);
        let targets = &self.targets;
        let immune = &self.immune;
        ctx.runtime.sweep_system_weaks(&mut |obj| {
            let addr = obj.addr();
            if immune.contains(addr) {
                return Some(obj);
            }
            match find_target(targets, addr) {
                Some(t) if !t.mark.test(addr) => None,
                _ => Some(obj),
            }
        });
        iteration.objects_surviving = self.objects_marked;
    }

    fn reclaim_phase(&mut self, ctx: &GcContext<'_>, iteration: &mut GcIteration) {
        if self.is_sticky() {
            self.sweep_allocation_stack(ctx, iteration);
        } else {
            sweep_targets(ctx, &self.targets, self.gc_type, iteration);
        }
        debug!(
            collector = %self.name,
            marked_objects = self.objects_marked,
            freed_objects = iteration.freed_objects + iteration.freed_large_objects,
            "swept"
        );
    }

    fn finish_phase(&mut self, ctx: &GcContext<'_>) {
        for space in ctx.spaces.bitmap_spaces() {
            if self.bound.contains(&space.begin()) {
                if let Some(bitmaps) = space.bitmaps() {
                    bitmaps.unbind();
                }
            }
        }
        self.bound.clear();
        self.targets.clear();
        self.immune.clear();
    }

    fn mark_object(&mut self, ctx: &GcContext<'_>, obj: ObjectRef) -> ObjectRef {
        let addr = obj.addr();
        if self.immune.contains(addr) {
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
