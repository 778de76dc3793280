//! The heap orchestrator.
//!
//! [`Heap`] owns the reservation, every space, the card table and the
//! allocation stacks, and is the single point mutators call into. It picks
//! the collector for each collection, enforces that at most one collection
//! runs at a time, sizes the heap after every run and performs the
//! structural operations (homogeneous compaction, the zygote split, trims).
//!
//! The implementation is split by concern:
//!
//! - `alloc`: the allocation paths and the GC-for-alloc escalation.
//! - `gc`: the collection slot, collections, growth and the concurrent
//!   trigger.
//! - `compaction`: homogeneous space compaction and the zygote split.
//! - `task`: the heap task daemon.
//! - `verify`: heap walks and reference verification.

mod alloc;
mod compaction;
mod gc;
pub(crate) mod growth;
pub(crate) mod spaces;
mod task;
mod verify;

pub use gc::MovingGcDisabled;
pub use verify::BadReference;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use sys_mem::{page_round_up, MemMap, MemMapOptions};
use tracing::{debug, info};

use crate::accounting::card_table::CardTable;
use crate::accounting::mod_union_table::ModUnionTable;
use crate::accounting::object_stack::ObjectStack;
use crate::accounting::remembered_set::RememberedSet;
use crate::address::{ClassWord, ObjectRef, HEADER_SIZE};
use crate::collector::{CollectorRegistry, CollectorType, GcCause, GcType};
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::metrics::{GcMetrics, HeapMetrics};
use crate::object::{load_word, store_word, word_cell, Object, ObjectModel};
use crate::roots::RootTable;
use crate::runtime::Runtime;
use crate::space::{
    AllocSpace, BumpPointerSpace, ImageSpace, LargeObjectSpace, MallocSpace, Space, SpaceKind,
};

use self::growth::GrowthPolicy;
use self::spaces::{MainSpaces, Spaces};
use self::task::TaskDaemon;

/// Whether pauses are currently noticeable to the user of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    /// Foreground: grow generously to keep collections rare.
    JankPerceptible = 0,
    /// Background: grow tightly, compact and trim.
    JankImperceptible = 1,
}

/// State guarded by the collection slot.
struct GcState {
    collector_type_running: CollectorType,
    last_gc_type: GcType,
    last_gc_cause: Option<GcCause>,
    disable_moving_gc_count: usize,
    thread_running_gc: Option<ThreadId>,
}

/// A managed heap.
///
/// Created with [`Heap::new`] and shared as `Arc<Heap>`. Every method is
/// safe to call from any thread registered with the heap's [`Runtime`].
pub struct Heap {
    config: HeapConfig,
    model: Arc<dyn ObjectModel>,
    runtime: Arc<dyn Runtime>,
    mem: Arc<MemMap>,
    heap_begin: usize,
    heap_end: usize,
    card_table: CardTable,
    spaces: RwLock<Arc<Spaces>>,
    space_epoch: AtomicU64,
    alloc_stacks: [ObjectStack; 2],
    alloc_stack_index: AtomicUsize,
    collectors: Mutex<CollectorRegistry>,
    gc_state: Mutex<GcState>,
    gc_complete: Condvar,
    gc_plan: Vec<GcType>,
    next_gc_type: AtomicU8,
    gc_count: AtomicU64,
    num_bytes_allocated: AtomicUsize,
    target_footprint: AtomicUsize,
    concurrent_start_bytes: AtomicUsize,
    growth_limit: AtomicUsize,
    capacity: AtomicUsize,
    min_foreground_target_footprint: AtomicUsize,
    growth: Mutex<GrowthPolicy>,
    process_state: AtomicU8,
    concurrent_gc_pending: AtomicBool,
    last_homogeneous_compaction_by_oom: Mutex<Option<Instant>>,
    zygote_creation: Mutex<()>,
    heap_roots: RootTable,
    metrics: HeapMetrics,
    last_gc: Mutex<Option<GcMetrics>>,
    daemon: Mutex<Option<TaskDaemon>>,
    shutting_down: AtomicBool,
}

impl Heap {
    /// Reserves the heap and creates its spaces.
    ///
    /// The reservation is laid out as `[image][non-moving][main][spare][large
    /// objects]`, every part page aligned, with one card table over all of
    /// it. The image space is omitted when its capacity is 0.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Config`] for an invalid configuration and
    /// [`HeapError::Map`] if memory could not be reserved.
    pub fn new(
        config: HeapConfig,
        model: Arc<dyn ObjectModel>,
        runtime: Arc<dyn Runtime>,
    ) -> Result<Arc<Self>, HeapError> {
        config.validate()?;
        let image_capacity = page_round_up(config.image_space_capacity);
        let non_moving_capacity = page_round_up(config.non_moving_space_capacity);
        let main_capacity = page_round_up(config.main_space_capacity);
        let los_capacity = page_round_up(config.large_object_space_capacity);
        let total = image_capacity + non_moving_capacity + 2 * main_capacity + los_capacity;

        let mem = Arc::new(
            MemMapOptions::new("heap")
                .len(total)
                .no_reserve(true)
                .map_anonymous()?,
        );
        let begin = mem.begin();
        let card_table = CardTable::create(begin, total)?;

        let mut cursor = begin;
        let mut carve = |len: usize| {
            let range = (cursor, cursor + len);
            cursor += len;
            range
        };
        let image_range = carve(image_capacity);
        let non_moving_range = carve(non_moving_capacity);
        let main_range = carve(main_capacity);
        let spare_range = carve(main_capacity);
        let los_range = carve(los_capacity);

        let tlab_size = if config.use_tlab { config.tlab_size } else { 0 };
        let image = if image_capacity == 0 {
            None
        } else {
            Some(Arc::new(ImageSpace::create(
                "image space",
                Arc::clone(&mem),
                image_range.0,
                image_range.1,
            )?))
        };
        let non_moving = Arc::new(MallocSpace::create(
            "non moving space",
            Arc::clone(&mem),
            non_moving_range.0,
            non_moving_range.1,
            non_moving_capacity,
            tlab_size,
            false,
        )?);
        let copying = config.collector_type == CollectorType::SemiSpace;
        let main = if copying {
            MainSpaces::Copying {
                bump_pointer: Arc::new(BumpPointerSpace::new(
                    "bump pointer space 1",
                    Arc::clone(&mem),
                    main_range.0,
                    main_range.1,
                )),
                temp: Arc::new(BumpPointerSpace::new(
                    "bump pointer space 2",
                    Arc::clone(&mem),
                    spare_range.0,
                    spare_range.1,
                )),
            }
        } else {
            MainSpaces::FreeList {
                main: Arc::new(MallocSpace::create(
                    "main malloc space",
                    Arc::clone(&mem),
                    main_range.0,
                    main_range.1,
                    config.growth_limit,
                    tlab_size,
                    true,
                )?),
                backup: Arc::new(MallocSpace::create(
                    "main malloc space 1",
                    Arc::clone(&mem),
                    spare_range.0,
                    spare_range.1,
                    config.growth_limit,
                    tlab_size,
                    true,
                )?),
            }
        };
        let large_objects = Arc::new(LargeObjectSpace::create(
            "large object space",
            Arc::clone(&mem),
            los_range.0,
            los_range.1,
        )?);

        let remembered = copying && config.use_remembered_sets;
        let non_moving_remembered_set = remembered.then(|| {
            Arc::new(RememberedSet::new(
                "non moving space remembered set",
                non_moving.begin(),
                non_moving.limit(),
            ))
        });
        let large_object_remembered_set = remembered.then(|| {
            Arc::new(RememberedSet::new(
                "large object space remembered set",
                large_objects.begin(),
                large_objects.limit(),
            ))
        });
        let image_mod_union_table = image.as_ref().map(|image| {
            Arc::new(ModUnionTable::new(
                "image space mod-union table",
                image.begin(),
                image.limit(),
            ))
        });

        let spaces = Spaces {
            image,
            zygote: None,
            non_moving,
            main,
            large_objects,
            non_moving_remembered_set,
            large_object_remembered_set,
            image_mod_union_table,
            zygote_mod_union_table: None,
        };
        debug!(heap_begin = format_args!("{begin:#x}"), total, "created heap\n{}", spaces.dump());

        let growth = GrowthPolicy {
            target_utilization: config.target_utilization,
            min_free: config.min_free,
            max_free: config.max_free,
            foreground_multiplier: config.foreground_heap_growth_multiplier,
            sticky_throughput_adjustment: config.sticky_gc_throughput_adjustment,
            min_concurrent_remaining: config.min_concurrent_remaining_bytes,
            max_concurrent_remaining: config.max_concurrent_remaining_bytes,
        };
        let concurrent = config.collector_type == CollectorType::ConcurrentMarkSweep;
        let concurrent_start_bytes = growth.default_concurrent_start(concurrent, config.initial_size);
        let gc_plan = vec![GcType::Sticky, GcType::Partial, GcType::Full];
        let alloc_stack_capacity = config.allocation_stack_capacity;
        let alloc_stack_reserve = (alloc_stack_capacity / 8).max(64);

        let heap = Arc::new(Self {
            model,
            runtime,
            mem,
            heap_begin: begin,
            heap_end: begin + total,
            card_table,
            spaces: RwLock::new(Arc::new(spaces)),
            space_epoch: AtomicU64::new(0),
            alloc_stacks: [
                ObjectStack::new("allocation stack", alloc_stack_capacity, alloc_stack_reserve),
                ObjectStack::new("live stack", alloc_stack_capacity, alloc_stack_reserve),
            ],
            alloc_stack_index: AtomicUsize::new(0),
            collectors: Mutex::new(CollectorRegistry::for_config(&config)),
            gc_state: Mutex::new(GcState {
                collector_type_running: CollectorType::None,
                last_gc_type: GcType::None,
                last_gc_cause: None,
                disable_moving_gc_count: 0,
                thread_running_gc: None,
            }),
            gc_complete: Condvar::new(),
            // Sticky collections need a previous collection to build on.
            next_gc_type: AtomicU8::new(GcType::Full as u8),
            gc_plan,
            gc_count: AtomicU64::new(0),
            num_bytes_allocated: AtomicUsize::new(0),
            target_footprint: AtomicUsize::new(config.initial_size),
            concurrent_start_bytes: AtomicUsize::new(concurrent_start_bytes),
            growth_limit: AtomicUsize::new(config.growth_limit),
            capacity: AtomicUsize::new(config.capacity),
            min_foreground_target_footprint: AtomicUsize::new(0),
            growth: Mutex::new(growth),
            process_state: AtomicU8::new(ProcessState::JankPerceptible as u8),
            concurrent_gc_pending: AtomicBool::new(false),
            last_homogeneous_compaction_by_oom: Mutex::new(None),
            zygote_creation: Mutex::new(()),
            heap_roots: RootTable::new(),
            metrics: HeapMetrics::new(),
            last_gc: Mutex::new(None),
            daemon: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            config,
        });
        if heap.config.enable_task_daemon {
            let daemon = TaskDaemon::spawn(Arc::downgrade(&heap))?;
            *heap.daemon.lock() = Some(daemon);
        }
        info!(
            collector = ?heap.config.collector_type,
            initial_size = heap.config.initial_size,
            growth_limit = heap.config.growth_limit,
            capacity = heap.config.capacity,
            "heap created"
        );
        Ok(heap)
    }

    /// The configuration the heap was created with.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The runtime the heap suspends and asks for roots.
    #[must_use]
    pub fn runtime(&self) -> &dyn Runtime {
        self.runtime.as_ref()
    }

    /// The object model used to size and trace objects.
    #[must_use]
    pub fn model(&self) -> &dyn ObjectModel {
        self.model.as_ref()
    }

    /// Cumulative collection counters.
    #[must_use]
    pub const fn metrics(&self) -> &HeapMetrics {
        &self.metrics
    }

    /// Metrics of the most recent collection.
    #[must_use]
    pub fn last_gc_metrics(&self) -> Option<GcMetrics> {
        *self.last_gc.lock()
    }

    /// The order in which the allocation path escalates collections.
    #[must_use]
    pub fn gc_plan(&self) -> &[GcType] {
        &self.gc_plan
    }

    pub(crate) fn spaces(&self) -> Arc<Spaces> {
        Arc::clone(&self.spaces.read())
    }

    /// Publishes a new layout. Mutators must be suspended.
    ///
    /// `replaced` is set when a space allocations may target was replaced,
    /// which makes allocations that waited across the change start over.
    fn publish_spaces(&self, spaces: Spaces, replaced: bool) {
        *self.spaces.write() = Arc::new(spaces);
        if replaced {
            self.space_epoch.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn allocation_stack(&self) -> &ObjectStack {
        &self.alloc_stacks[self.alloc_stack_index.load(Ordering::Acquire)]
    }

    pub(crate) fn live_stack(&self) -> &ObjectStack {
        &self.alloc_stacks[1 - self.alloc_stack_index.load(Ordering::Acquire)]
    }

    /// Exchanges the allocation and live stacks. Mutators must be suspended.
    fn swap_stacks(&self) {
        self.alloc_stack_index.fetch_xor(1, Ordering::AcqRel);
    }

    /// Returns `true` once the zygote split happened.
    #[must_use]
    pub fn has_zygote_space(&self) -> bool {
        self.spaces.read().zygote.is_some()
    }

    /// The collection the allocation path will try first.
    #[must_use]
    pub fn next_gc_type(&self) -> GcType {
        GcType::from_u8(self.next_gc_type.load(Ordering::Acquire))
    }

    /// The broadest collection that is not sticky: partial once a zygote
    /// exists, full before.
    #[must_use]
    pub fn non_sticky_gc_type(&self) -> GcType {
        if self.has_zygote_space() {
            GcType::Partial
        } else {
            GcType::Full
        }
    }

    /// Type of the last completed collection.
    #[must_use]
    pub fn last_gc_type(&self) -> GcType {
        self.gc_state.lock().last_gc_type
    }

    /// Cause of the last collection started.
    #[must_use]
    pub fn last_gc_cause(&self) -> Option<GcCause> {
        self.gc_state.lock().last_gc_cause
    }

    /// Collections completed so far.
    #[must_use]
    pub fn gc_count(&self) -> u64 {
        self.gc_count.load(Ordering::Acquire)
    }

    /// Whether collections are triggered from the background before the
    /// footprint is reached.
    #[must_use]
    pub fn is_gc_concurrent(&self) -> bool {
        self.config.collector_type == CollectorType::ConcurrentMarkSweep
    }

    /// Bytes held by live allocations outside the image space.
    #[must_use]
    pub fn get_bytes_allocated(&self) -> usize {
        self.num_bytes_allocated.load(Ordering::Acquire)
    }

    /// Current footprint: the target, or more if allocations overshot it.
    #[must_use]
    pub fn get_total_memory(&self) -> usize {
        self.target_footprint().max(self.get_bytes_allocated())
    }

    /// Bytes left before the footprint is reached.
    #[must_use]
    pub fn get_free_memory(&self) -> usize {
        self.get_total_memory().saturating_sub(self.get_bytes_allocated())
    }

    /// The most the heap may grow to.
    #[must_use]
    pub fn get_max_memory(&self) -> usize {
        self.growth_limit().max(self.get_bytes_allocated())
    }

    /// Footprint at which the next collection is due.
    #[must_use]
    pub fn target_footprint(&self) -> usize {
        self.target_footprint.load(Ordering::Acquire)
    }

    /// Bytes allocated at which a concurrent collection is requested.
    #[must_use]
    pub fn concurrent_start_bytes(&self) -> usize {
        self.concurrent_start_bytes.load(Ordering::Acquire)
    }

    /// The current growth limit.
    #[must_use]
    pub fn growth_limit(&self) -> usize {
        self.growth_limit.load(Ordering::Acquire)
    }

    /// The current capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Sets the fraction of the heap live objects should occupy after a
    /// non-sticky collection.
    ///
    /// # Panics
    ///
    /// Panics if `target` is not in `(0, 1)`.
    pub fn set_target_heap_utilization(&self, target: f64) {
        assert!(target > 0.0 && target < 1.0, "target utilization {target} is outside (0, 1)");
        self.growth.lock().target_utilization = target;
    }

    /// The fraction set by [`set_target_heap_utilization`](Self::set_target_heap_utilization).
    #[must_use]
    pub fn target_heap_utilization(&self) -> f64 {
        self.growth.lock().target_utilization
    }

    /// The current process state.
    #[must_use]
    pub fn process_state(&self) -> ProcessState {
        if self.process_state.load(Ordering::Acquire) == ProcessState::JankPerceptible as u8 {
            ProcessState::JankPerceptible
        } else {
            ProcessState::JankImperceptible
        }
    }

    /// Switches between foreground and background sizing.
    ///
    /// Coming to the foreground grows the footprint to what the last
    /// collection would have chosen with the foreground multiplier. Going to
    /// the background schedules a trim and, if configured, a homogeneous
    /// compaction.
    pub fn update_process_state(&self, state: ProcessState) {
        let old = self.process_state.swap(state as u8, Ordering::AcqRel);
        if old == state as u8 {
            return;
        }
        debug!(?state, "process state changed");
        match state {
            ProcessState::JankPerceptible => {
                let wanted = self
                    .min_foreground_target_footprint
                    .load(Ordering::Acquire)
                    .min(self.growth_limit());
                if self.target_footprint.fetch_max(wanted, Ordering::AcqRel) < wanted {
                    let policy = *self.growth.lock();
                    self.concurrent_start_bytes.store(
                        policy.default_concurrent_start(self.is_gc_concurrent(), wanted),
                        Ordering::Release,
                    );
                }
            }
            ProcessState::JankImperceptible => {
                if self.config.background_compaction {
                    self.post_task(task::HeapTask::HomogeneousCompact);
                }
                self.post_task(task::HeapTask::Trim);
            }
        }
    }

    /// Gives up the capacity above the growth limit for good.
    pub fn clamp_growth_limit(&self) {
        let growth_limit = self.growth_limit();
        self.capacity.store(growth_limit, Ordering::Release);
        let spaces = self.spaces();
        for space in spaces.malloc_spaces() {
            space.clamp_growth_limit();
        }
        info!(growth_limit, "clamped growth limit");
    }

    /// Lets the heap grow up to its capacity.
    pub fn clear_growth_limit(&self) {
        let capacity = self.capacity();
        let growth_limit = self.growth_limit.swap(capacity, Ordering::AcqRel);
        if self.target_footprint() == growth_limit && growth_limit < capacity {
            self.target_footprint.store(capacity, Ordering::Release);
            let policy = *self.growth.lock();
            self.concurrent_start_bytes.store(
                policy.default_concurrent_start(self.is_gc_concurrent(), capacity),
                Ordering::Release,
            );
        }
        let spaces = self.spaces();
        for space in spaces.malloc_spaces() {
            space.clear_growth_limit();
            space.set_footprint_limit(space.capacity());
        }
        info!(capacity, "cleared growth limit");
    }

    /// The kind of space holding `addr`, if any.
    #[must_use]
    pub fn find_space_kind(&self, addr: usize) -> Option<SpaceKind> {
        self.spaces().find(addr).map(Space::kind)
    }

    /// Returns `true` if a collection may relocate `obj`.
    #[must_use]
    pub fn is_movable_object(&self, obj: ObjectRef) -> bool {
        self.spaces()
            .find(obj.addr())
            .is_some_and(Space::can_move_objects)
    }

    /// One line per space, remembered set and mod-union table.
    #[must_use]
    pub fn dump_spaces(&self) -> String {
        self.spaces().dump()
    }

    /// Returns `true` after [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire) || self.runtime.is_shutting_down()
    }

    /// Disables collections, waits for a running one and stops the task
    /// daemon. Later collection requests return [`GcType::None`].
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wait_for_gc_to_complete(GcCause::Background);
        let daemon = self.daemon.lock().take();
        if let Some(mut daemon) = daemon {
            daemon.stop();
        }
        info!(
            collections = self.metrics.total_collections(),
            bytes_allocated = self.get_bytes_allocated(),
            "heap shut down"
        );
    }

    fn post_task(&self, task: task::HeapTask) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.daemon
            .lock()
            .as_ref()
            .is_some_and(|daemon| daemon.post(task))
    }

    // Object access.

    fn check_field(&self, obj: ObjectRef, offset: usize) -> usize {
        let addr = obj.addr() + offset;
        assert!(
            obj.addr() >= self.heap_begin && addr + HEADER_SIZE <= self.heap_end,
            "{obj} + {offset} is outside the heap"
        );
        assert_eq!(offset % HEADER_SIZE, 0, "unaligned field offset {offset}");
        addr
    }

    /// A read-only view of `obj` for the object model.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is outside the heap.
    #[must_use]
    pub fn object(&self, obj: ObjectRef) -> Object<'_> {
        self.check_field(obj, 0);
        // SAFETY: the address is inside the reservation, which stays mapped
        // for the heap's lifetime.
        unsafe { Object::new(obj) }
    }

    /// The class word `obj` was allocated with.
    #[must_use]
    pub fn class_of(&self, obj: ObjectRef) -> ClassWord {
        self.object(obj).class_word()
    }

    /// The byte size the object model reports for `obj`.
    #[must_use]
    pub fn size_of(&self, obj: ObjectRef) -> usize {
        self.model.size_of(self.object(obj))
    }

    /// Reads the reference field at byte `offset` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if the field is unaligned or outside the heap.
    #[must_use]
    pub fn read_reference(&self, obj: ObjectRef, offset: usize) -> Option<ObjectRef> {
        let addr = self.check_field(obj, offset);
        // SAFETY: checked to be an aligned word inside the reservation.
        ObjectRef::from_addr(unsafe { load_word(addr, Ordering::Acquire) })
    }

    /// Writes the reference field at byte `offset` of `obj` and dirties the
    /// card of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if the field is unaligned or outside the heap.
    pub fn write_reference(&self, obj: ObjectRef, offset: usize, value: Option<ObjectRef>) {
        let addr = self.check_field(obj, offset);
        // SAFETY: checked to be an aligned word inside the reservation.
        unsafe { store_word(addr, ObjectRef::to_word(value), Ordering::Release) };
        self.card_table.mark_card(obj);
    }

    /// Replaces the reference field at byte `offset` of `obj` with `new` if
    /// it still holds `expected`. Dirties the card on success.
    ///
    /// # Panics
    ///
    /// Panics if the field is unaligned or outside the heap.
    pub fn compare_and_set_reference(
        &self,
        obj: ObjectRef,
        offset: usize,
        expected: Option<ObjectRef>,
        new: Option<ObjectRef>,
    ) -> bool {
        let addr = self.check_field(obj, offset);
        // SAFETY: checked to be an aligned word inside the reservation.
        let cell = unsafe { word_cell(addr) };
        let swapped = cell
            .compare_exchange(
                ObjectRef::to_word(expected),
                ObjectRef::to_word(new),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if swapped {
            self.card_table.mark_card(obj);
        }
        swapped
    }

    /// Reads a plain word at byte `offset` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if the field is unaligned or outside the heap.
    #[must_use]
    pub fn read_word(&self, obj: ObjectRef, offset: usize) -> usize {
        let addr = self.check_field(obj, offset);
        // SAFETY: checked to be an aligned word inside the reservation.
        unsafe { load_word(addr, Ordering::Acquire) }
    }

    /// Writes a plain word at byte `offset` of `obj`. No barrier.
    ///
    /// # Panics
    ///
    /// Panics if the field is unaligned or outside the heap.
    pub fn write_word(&self, obj: ObjectRef, offset: usize, value: usize) {
        let addr = self.check_field(obj, offset);
        // SAFETY: checked to be an aligned word inside the reservation.
        unsafe { store_word(addr, value, Ordering::Release) };
    }

    /// Returns `true` if the card holding `obj` is dirty.
    #[must_use]
    pub fn is_card_dirty(&self, obj: ObjectRef) -> bool {
        self.card_table.is_dirty(obj.addr())
    }

    /// Roots the heap itself holds, e.g. across a collection triggered from
    /// inside the allocator.
    pub(crate) const fn heap_roots(&self) -> &RootTable {
        &self.heap_roots
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if let Some(mut daemon) = self.daemon.get_mut().take() {
            daemon.stop();
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("collector_type", &self.config.collector_type)
            .field("bytes_allocated", &self.get_bytes_allocated())
            .field("target_footprint", &self.target_footprint())
            .field("growth_limit", &self.growth_limit())
            .field("gc_count", &self.gc_count())
            .finish_non_exhaustive()
    }
}
