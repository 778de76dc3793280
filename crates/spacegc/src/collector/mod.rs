//! Garbage collectors.
//!
//! The heap keeps one collector instance per `(CollectorType, GcType)` pair
//! in a [`CollectorRegistry`] and dispatches through [`CollectorVariant`].
//! Every instance keeps its own [`CumulativeTimings`], which the growth
//! policy reads to compare sticky and non-sticky throughput.

mod bin_packing;
mod forwarding;
mod immune;
mod mark_sweep;
mod semi_space;

pub use bin_packing::BinPacker;
pub use forwarding::ForwardingTable;
pub use immune::ImmuneSpaces;
pub(crate) use mark_sweep::MarkSweep;
pub(crate) use semi_space::SemiSpace;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::accounting::bitmap::SpaceBitmap;
use crate::accounting::card_table::CardTable;
use crate::accounting::object_stack::ObjectStack;
use crate::address::{allocation_size, ObjectRef};
use crate::config::HeapConfig;
use crate::heap::spaces::Spaces;
use crate::metrics::PhaseTimer;
use crate::object::{load_word, store_word, Object, ObjectModel};
use crate::roots::RootTable;
use crate::runtime::Runtime;
use crate::space::{GcRetentionPolicy, LargeObjectSpace, Space, SpaceKind};
use crate::tracing::{log_phase_end, log_phase_start, trace_phase, GcPhase};

/// Scope of a collection, in increasing breadth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum GcType {
    /// No collection ran.
    None = 0,
    /// Only objects allocated since the last collection.
    Sticky = 1,
    /// Everything except the zygote and image spaces.
    Partial = 2,
    /// Everything except the image space.
    Full = 3,
}

impl GcType {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Sticky,
            2 => Self::Partial,
            3 => Self::Full,
            _ => Self::None,
        }
    }
}

/// Algorithm family, or the heap task holding the collection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CollectorType {
    /// Nothing is running.
    None = 0,
    /// Stop-the-world copying between two bump-pointer spaces.
    SemiSpace = 1,
    /// Stop-the-world non-moving mark-sweep.
    MarkSweep = 2,
    /// Mark-sweep whose collections are requested from the background
    /// before the heap fills up.
    ConcurrentMarkSweep = 3,
    /// Read-barrier copying. Not available.
    ConcurrentCopying = 4,
    /// Copying the main free-list space into its backup.
    HomogeneousSpaceCompact = 5,
    /// Returning pages to the OS.
    HeapTrim = 6,
    /// Bin-packing compaction before the first fork.
    ZygoteCompact = 7,
}

impl CollectorType {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::SemiSpace,
            2 => Self::MarkSweep,
            3 => Self::ConcurrentMarkSweep,
            4 => Self::ConcurrentCopying,
            5 => Self::HomogeneousSpaceCompact,
            6 => Self::HeapTrim,
            7 => Self::ZygoteCompact,
            _ => Self::None,
        }
    }

    /// Returns `true` for families that relocate objects in ordinary
    /// collections.
    #[must_use]
    pub const fn is_moving(self) -> bool {
        matches!(
            self,
            Self::SemiSpace | Self::ConcurrentCopying | Self::HomogeneousSpaceCompact | Self::ZygoteCompact
        )
    }
}

/// Why a collection was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcCause {
    /// An allocation failed.
    ForAlloc,
    /// The concurrent trigger fired.
    Background,
    /// The embedder asked for it.
    Explicit,
    /// Defragmenting the main free-list space.
    HomogeneousSpaceCompact,
    /// Zygote compaction.
    CollectorTransition,
    /// Trimming the heap.
    Trim,
    /// The allocation stack filled up.
    ForAllocationStack,
}

impl GcCause {
    /// Returns `true` if a mutator is blocked on the outcome.
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::ForAlloc | Self::ForAllocationStack)
    }
}

/// Outcome of one collector run.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcIteration {
    /// Objects freed outside the large-object space.
    pub freed_objects: usize,
    /// Bytes freed outside the large-object space.
    pub freed_bytes: usize,
    /// Large objects freed.
    pub freed_large_objects: usize,
    /// Large-object bytes freed.
    pub freed_large_object_bytes: usize,
    /// Objects marked or copied.
    pub objects_surviving: usize,
    /// Bytes copied to another address.
    pub bytes_copied: usize,
    /// Wall time of the run.
    pub duration: Duration,
    /// Per-phase durations.
    pub phases: PhaseTimer,
    /// Set when the run was asked to clear soft references. The heap has
    /// no soft-reference queue of its own, so the request is passed on
    /// through the metrics for the embedder to act on.
    pub cleared_soft_references: bool,
}

impl GcIteration {
    /// Bytes freed, large objects included.
    #[must_use]
    pub const fn total_freed_bytes(&self) -> usize {
        self.freed_bytes + self.freed_large_object_bytes
    }

    /// Bytes freed per second of collection time.
    #[must_use]
    pub fn estimated_throughput(&self) -> f64 {
        throughput(self.total_freed_bytes(), self.duration)
    }
}

fn throughput(bytes: usize, time: Duration) -> f64 {
    // One extra microsecond keeps empty runs finite.
    bytes as f64 / (time.as_secs_f64() + 1e-6)
}

/// Totals over every run of one collector.
#[derive(Debug, Clone, Copy, Default)]
pub struct CumulativeTimings {
    /// Runs recorded.
    pub iterations: usize,
    /// Time spent in all runs.
    pub total_time: Duration,
    /// Bytes freed by all runs.
    pub total_freed_bytes: usize,
    /// Objects freed by all runs.
    pub total_freed_objects: usize,
}

impl CumulativeTimings {
    fn record(&mut self, iteration: &GcIteration) {
        self.iterations += 1;
        self.total_time += iteration.duration;
        self.total_freed_bytes += iteration.total_freed_bytes();
        self.total_freed_objects += iteration.freed_objects + iteration.freed_large_objects;
    }

    /// Mean bytes freed per second over all runs.
    #[must_use]
    pub fn estimated_mean_throughput(&self) -> f64 {
        throughput(self.total_freed_bytes, self.total_time)
    }
}

/// Everything a collector needs from the heap for one run.
///
/// Built by the heap while mutators are suspended.
pub(crate) struct GcContext<'a> {
    pub spaces: &'a Spaces,
    pub card_table: &'a CardTable,
    pub model: &'a dyn ObjectModel,
    pub runtime: &'a dyn Runtime,
    pub heap_roots: &'a RootTable,
    pub live_stack: &'a ObjectStack,
    pub clear_soft_references: bool,
}

impl GcContext<'_> {
    /// Bytes `obj` occupies in its space.
    pub fn allocation_size_of(&self, obj: ObjectRef) -> usize {
        // SAFETY: callers only pass objects found through roots, bitmaps or
        // allocation stacks while the world is stopped.
        allocation_size(self.model.size_of(unsafe { Object::new(obj) }))
    }

    /// Visits every reference field of `obj`. `visit` returns the new value
    /// of the field; changed fields are written back. Returns `true` if any
    /// field was rewritten.
    pub fn update_references(&self, obj: ObjectRef, mut visit: impl FnMut(ObjectRef) -> ObjectRef) -> bool {
        let mut changed = false;
        // SAFETY: as above.
        let view = unsafe { Object::new(obj) };
        self.model.visit_references(view, &mut |offset| {
            let slot = obj.addr() + offset;
            // SAFETY: the model reports word-aligned offsets inside `obj`.
            let word = unsafe { load_word(slot, Ordering::Relaxed) };
            if let Some(referent) = ObjectRef::from_addr(word) {
                let new = visit(referent);
                if new != referent {
                    // SAFETY: as above; mutators are suspended.
                    unsafe { store_word(slot, new.addr(), Ordering::Relaxed) };
                    changed = true;
                }
            }
        });
        changed
    }

    /// Logs the heap layout and panics. Used when continuing would operate
    /// on a corrupted heap.
    pub fn fatal(&self, message: std::fmt::Arguments<'_>) -> ! {
        self.spaces.dump_to_log();
        tracing::error!("{message}");
        panic!("heap corruption: {message}");
    }
}

/// A bitmap-backed space taking part in a collection.
pub(crate) struct MarkTarget {
    pub begin: usize,
    pub limit: usize,
    pub kind: SpaceKind,
    pub policy: GcRetentionPolicy,
    pub live: Arc<SpaceBitmap>,
    pub mark: Arc<SpaceBitmap>,
}

impl MarkTarget {
    pub fn new(space: &dyn Space) -> Option<Self> {
        let bitmaps = space.bitmaps()?;
        Some(Self {
            begin: space.begin(),
            limit: space.limit(),
            kind: space.kind(),
            policy: space.retention_policy(),
            live: bitmaps.live(),
            mark: bitmaps.mark(),
        })
    }

    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.limit
    }
}

pub(crate) fn find_target(targets: &[MarkTarget], addr: usize) -> Option<&MarkTarget> {
    targets.iter().find(|t| t.contains(addr))
}

/// Sets the live bit of every object on `stack`, covering allocations made
/// since the last collection.
pub(crate) fn mark_alloc_stack_as_live(spaces: &Spaces, stack: &ObjectStack) {
    let targets = spaces.allocation_stack_targets();
    for obj in stack.iter() {
        if let Some(t) = find_target(&targets, obj.addr()) {
            t.live.set(obj.addr());
        }
    }
}

/// Frees every object that is live but unmarked in a free-list or
/// large-object target. Returns `(objects, bytes)` freed.
pub(crate) fn sweep_target(
    ctx: &GcContext<'_>,
    target: &MarkTarget,
    skip: impl Fn(ObjectRef) -> bool,
) -> (usize, usize) {
    let dead = dead_objects(target, skip);
    free_objects(ctx, target.kind, &dead)
}

/// Objects live but unmarked in `target`, minus the ones `skip` keeps.
pub(crate) fn dead_objects(target: &MarkTarget, skip: impl Fn(ObjectRef) -> bool) -> Vec<ObjectRef> {
    let mut dead = Vec::new();
    target.live.visit_marked_range(target.begin, target.limit, |obj| {
        if !target.mark.test(obj.addr()) && !skip(obj) {
            dead.push(obj);
        }
    });
    dead
}

/// Frees the unmarked objects of every free-list, large-object and zygote
/// target, then swaps the live and mark bitmaps of the spaces swept in
/// place. A partial collection keeps the large objects of the zygote.
pub(crate) fn sweep_targets(ctx: &GcContext<'_>, targets: &[MarkTarget], gc_type: GcType, iteration: &mut GcIteration) {
    let partial = gc_type == GcType::Partial;
    let los = &ctx.spaces.large_objects;
    for t in targets {
        match t.kind {
            SpaceKind::Zygote => {
                let dead = dead_objects(t, |_| false);
                let (objects, bytes) = free_objects(ctx, t.kind, &dead);
                iteration.freed_objects += objects;
                iteration.freed_bytes += bytes;
            }
            SpaceKind::LargeObject => {
                let (objects, bytes) = sweep_target(ctx, t, |obj| partial && los.is_zygote_object(obj));
                iteration.freed_large_objects += objects;
                iteration.freed_large_object_bytes += bytes;
            }
            SpaceKind::Malloc => {
                let (objects, bytes) = sweep_target(ctx, t, |_| false);
                iteration.freed_objects += objects;
                iteration.freed_bytes += bytes;
            }
            SpaceKind::Image | SpaceKind::BumpPointer => {}
        }
    }
    let swept: Vec<usize> = targets
        .iter()
        .filter(|t| t.kind != SpaceKind::Zygote)
        .map(|t| t.begin)
        .collect();
    ctx.spaces.swap_bitmaps(|s| swept.contains(&s.begin()));
}

/// Marks through every field of `obj`. Returns `true` if a field, once
/// marked, satisfies `keep`.
pub(crate) fn scan_immune_object<C: Collector + ?Sized>(
    collector: &mut C,
    ctx: &GcContext<'_>,
    obj: ObjectRef,
    keep: impl Fn(usize) -> bool,
) -> bool {
    let mut kept = false;
    ctx.update_references(obj, |referent| {
        let new = collector.mark_object(ctx, referent);
        kept |= keep(new.addr());
        new
    });
    kept
}

/// Marks what the image space references, and what the zygote space
/// references when `zygote_immune` is set, through their mod-union tables.
/// A card stays in its table while it references outside the immune spaces.
pub(crate) fn mark_reachable_from_immune_spaces<C: Collector + ?Sized>(
    collector: &mut C,
    ctx: &GcContext<'_>,
    zygote_immune: bool,
) {
    let spaces = ctx.spaces;
    let (image_begin, image_limit) = spaces
        .image
        .as_ref()
        .map_or((0, 0), |image| (image.begin(), image.limit()));
    let in_image = move |addr: usize| addr >= image_begin && addr < image_limit;

    if let (Some(image), Some(table)) = (&spaces.image, &spaces.image_mod_union_table) {
        if let Some(bitmaps) = image.bitmaps() {
            let live = bitmaps.live();
            table.update_and_mark_references(&live, |obj| {
                scan_immune_object(&mut *collector, ctx, obj, |a| !in_image(a))
            });
        }
    }
    let Some(zygote) = spaces.zygote.as_ref().filter(|_| zygote_immune) else {
        return;
    };
    let (begin, limit) = (zygote.begin(), zygote.limit());
    let Some(bitmaps) = zygote.bitmaps() else { return };
    let live = bitmaps.live();
    let outside = move |a: usize| !in_image(a) && !(a >= begin && a < limit);
    match &spaces.zygote_mod_union_table {
        Some(table) => {
            table.update_and_mark_references(&live, |obj| scan_immune_object(&mut *collector, ctx, obj, outside));
        }
        None => live.visit_marked_range(begin, limit, |obj| {
            scan_immune_object(&mut *collector, ctx, obj, |_| false);
        }),
    }
}

/// Returns dead objects to the space that owns them.
pub(crate) fn free_objects(ctx: &GcContext<'_>, kind: SpaceKind, dead: &[ObjectRef]) -> (usize, usize) {
    if dead.is_empty() {
        return (0, 0);
    }
    match kind {
        SpaceKind::LargeObject => {
            let los: &LargeObjectSpace = &ctx.spaces.large_objects;
            let bytes = dead.iter().map(|&obj| los.free(obj)).sum();
            (dead.len(), bytes)
        }
        SpaceKind::Zygote => {
            let bytes = dead.iter().map(|&obj| ctx.allocation_size_of(obj)).sum();
            if let Some(zygote) = &ctx.spaces.zygote {
                zygote.record_dead(dead);
            }
            (dead.len(), bytes)
        }
        SpaceKind::Malloc => {
            let Some(space) = ctx.spaces.malloc_space_containing(dead[0].addr()) else {
                ctx.fatal(format_args!("no free-list space owns {}", dead[0]));
            };
            let batch: Vec<_> = dead
                .iter()
                .map(|&obj| (obj, ctx.allocation_size_of(obj)))
                .collect();
            (dead.len(), space.free_list(&batch))
        }
        SpaceKind::Image | SpaceKind::BumpPointer => (0, 0),
    }
}

/// Shared driver: phase spans, timing and cumulative bookkeeping.
pub(crate) trait Collector {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Scope of this collector's runs.
    fn gc_type(&self) -> GcType;

    /// Family this collector belongs to.
    fn collector_type(&self) -> CollectorType;

    /// Totals over all runs.
    fn cumulative(&self) -> &CumulativeTimings;

    /// Mutable totals, for the provided `run`.
    fn cumulative_mut(&mut self) -> &mut CumulativeTimings;

    /// Binds bitmaps and decides which spaces take part.
    fn initialize_phase(&mut self, ctx: &GcContext<'_>);

    /// Marks roots and computes the transitive closure.
    fn marking_phase(&mut self, ctx: &GcContext<'_>, iteration: &mut GcIteration);

    /// Sweeps and releases memory.
    fn reclaim_phase(&mut self, ctx: &GcContext<'_>, iteration: &mut GcIteration);

    /// Unbinds bitmaps and drops per-run state. Always runs.
    fn finish_phase(&mut self, ctx: &GcContext<'_>);

    /// Marks (and for copying collectors, relocates) one object. Returns
    /// its current address.
    fn mark_object(&mut self, ctx: &GcContext<'_>, obj: ObjectRef) -> ObjectRef;

    /// Drains the mark stack.
    fn process_mark_stack(&mut self, ctx: &GcContext<'_>);

    /// Runs one collection. Mutators must be suspended.
    fn run(&mut self, ctx: &GcContext<'_>) -> GcIteration {
        let start = Instant::now();
        let mut iteration = GcIteration::default();
        let mut timer = PhaseTimer::new();
        let bytes_before = ctx.spaces.bytes_allocated();

        timer.start();
        {
            let _phase = trace_phase(GcPhase::Initialize);
            log_phase_start(GcPhase::Initialize, bytes_before);
            self.initialize_phase(ctx);
            log_phase_end(GcPhase::Initialize, 0);
        }
        timer.end_initialize();

        timer.start();
        {
            let _phase = trace_phase(GcPhase::Marking);
            log_phase_start(GcPhase::Marking, bytes_before);
            self.marking_phase(ctx, &mut iteration);
            log_phase_end(GcPhase::Marking, 0);
        }
        timer.end_marking();

        timer.start();
        {
            let _phase = trace_phase(GcPhase::Reclaim);
            log_phase_start(GcPhase::Reclaim, bytes_before);
            self.reclaim_phase(ctx, &mut iteration);
            log_phase_end(GcPhase::Reclaim, iteration.total_freed_bytes());
        }
        timer.end_reclaim();

        {
            let _phase = trace_phase(GcPhase::Finish);
            self.finish_phase(ctx);
        }

        iteration.duration = start.elapsed();
        iteration.phases = timer;
        iteration.cleared_soft_references = ctx.clear_soft_references;
        self.cumulative_mut().record(&iteration);
        iteration
    }
}

/// The collectors the heap can dispatch to.
pub(crate) enum CollectorVariant {
    SemiSpace(SemiSpace),
    MarkSweep(MarkSweep),
}

macro_rules! dispatch {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            CollectorVariant::SemiSpace($c) => $body,
            CollectorVariant::MarkSweep($c) => $body,
        }
    };
}

impl Collector for CollectorVariant {
    fn name(&self) -> &str {
        dispatch!(self, c => c.name())
    }

    fn gc_type(&self) -> GcType {
        dispatch!(self, c => c.gc_type())
    }

    fn collector_type(&self) -> CollectorType {
        dispatch!(self, c => c.collector_type())
    }

    fn cumulative(&self) -> &CumulativeTimings {
        dispatch!(self, c => c.cumulative())
    }

    fn cumulative_mut(&mut self) -> &mut CumulativeTimings {
        dispatch!(self, c => c.cumulative_mut())
    }

    fn initialize_phase(&mut self, ctx: &GcContext<'_>) {
        dispatch!(self, c => c.initialize_phase(ctx));
    }

    fn marking_phase(&mut self, ctx: &GcContext<'_>, iteration: &mut GcIteration) {
        dispatch!(self, c => c.marking_phase(ctx, iteration));
    }

    fn reclaim_phase(&mut self, ctx: &GcContext<'_>, iteration: &mut GcIteration) {
        dispatch!(self, c => c.reclaim_phase(ctx, iteration));
    }

    fn finish_phase(&mut self, ctx: &GcContext<'_>) {
        dispatch!(self, c => c.finish_phase(ctx));
    }

    fn mark_object(&mut self, ctx: &GcContext<'_>, obj: ObjectRef) -> ObjectRef {
        dispatch!(self, c => c.mark_object(ctx, obj))
    }

    fn process_mark_stack(&mut self, ctx: &GcContext<'_>) {
        dispatch!(self, c => c.process_mark_stack(ctx));
    }
}

impl CollectorVariant {
    pub fn as_semi_space_mut(&mut self) -> Option<&mut SemiSpace> {
        match self {
            Self::SemiSpace(ss) => Some(ss),
            Self::MarkSweep(_) => None,
        }
    }
}

/// Maps `(CollectorType, GcType)` to a collector instance.
pub(crate) struct CollectorRegistry {
    collectors: HashMap<(CollectorType, GcType), CollectorVariant>,
}

impl CollectorRegistry {
    /// Registers the collectors a heap of `config.collector_type` needs.
    pub fn for_config(config: &HeapConfig) -> Self {
        let mark_stack = config.mark_stack_initial_capacity;
        let family = config.collector_type;
        let mut collectors = HashMap::new();
        let gc_types = [GcType::Sticky, GcType::Partial, GcType::Full];
        if family == CollectorType::SemiSpace {
            for gc_type in gc_types {
                collectors.insert(
                    (family, gc_type),
                    CollectorVariant::SemiSpace(SemiSpace::new("semi space", gc_type, family, mark_stack)),
                );
            }
        } else {
            for gc_type in gc_types {
                collectors.insert(
                    (family, gc_type),
                    CollectorVariant::MarkSweep(MarkSweep::new(gc_type, family, mark_stack)),
                );
            }
            collectors.insert(
                (CollectorType::HomogeneousSpaceCompact, GcType::Full),
                CollectorVariant::SemiSpace(SemiSpace::new(
                    "homogeneous space compact",
                    GcType::Full,
                    CollectorType::HomogeneousSpaceCompact,
                    mark_stack,
                )),
            );
        }
        collectors.insert(
            (CollectorType::ZygoteCompact, GcType::Full),
            CollectorVariant::SemiSpace(SemiSpace::new_bin_packing(mark_stack)),
        );
        Self { collectors }
    }

    pub fn get(&self, collector_type: CollectorType, gc_type: GcType) -> Option<&CollectorVariant> {
        self.collectors.get(&(collector_type, gc_type))
    }

    pub fn get_mut(&mut self, collector_type: CollectorType, gc_type: GcType) -> Option<&mut CollectorVariant> {
        self.collectors.get_mut(&(collector_type, gc_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_type_order_matches_breadth() {
        assert!(GcType::Sticky < GcType::Partial);
        assert!(GcType::Partial < GcType::Full);
        assert_eq!(GcType::from_u8(GcType::Partial as u8), GcType::Partial);
        assert_eq!(
            CollectorType::from_u8(CollectorType::ZygoteCompact as u8),
            CollectorType::ZygoteCompact
        );
    }

    #[test]
    fn test_cumulative_throughput() {
        let mut timings = CumulativeTimings::default();
        timings.record(&GcIteration {
            freed_bytes: 1000,
            duration: Duration::from_millis(1),
            ..GcIteration::default()
        });
        timings.record(&GcIteration {
            freed_large_object_bytes: 3000,
            duration: Duration::from_millis(1),
            ..GcIteration::default()
        });
        assert_eq!(timings.iterations, 2);
        assert_eq!(timings.total_freed_bytes, 4000);
        let mean = timings.estimated_mean_throughput();
        assert!(mean > 1_900_000.0 && mean < 2_000_000.0);
    }

    #[test]
    fn test_registry_for_each_family() {
        let ss = CollectorRegistry::for_config(&HeapConfig::default());
        assert!(ss.get(CollectorType::SemiSpace, GcType::Sticky).is_some());
        assert!(ss.get(CollectorType::HomogeneousSpaceCompact, GcType::Full).is_none());
        assert!(ss.get(CollectorType::ZygoteCompact, GcType::Full).is_some());

        let ms = CollectorRegistry::for_config(&HeapConfig {
            collector_type: CollectorType::MarkSweep,
            ..HeapConfig::default()
        });
        assert!(ms.get(CollectorType::MarkSweep, GcType::Partial).is_some());
        assert!(ms.get(CollectorType::HomogeneousSpaceCompact, GcType::Full).is_some());
        assert!(ms.get(CollectorType::SemiSpace, GcType::Full).is_none());
    }
}
