//! The collection slot, collections and heap sizing.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use super::growth::GrowthInput;
use super::spaces::{MainSpaces, Spaces};
use super::task::HeapTask;
use super::{GcState, Heap, ProcessState};
use crate::accounting::card_table::age_card;
use crate::collector::{
    Collector, CollectorType, CollectorVariant, CumulativeTimings, GcCause, GcContext, GcIteration, GcType,
};
use crate::error::CompactError;
use crate::metrics::GcMetrics;
use crate::runtime::{BlockingRegion, ScopedSuspendAll};
use crate::space::{AllocSpace, Space};
use crate::tracing::{next_gc_id, trace_gc_collection, GcId};

/// Keeps moving collections from starting while alive.
///
/// Returned by [`Heap::disable_moving_gc`]. Addresses of objects obtained
/// while a guard is alive stay valid until it drops.
#[must_use = "moving collections are enabled again when the guard drops"]
pub struct MovingGcDisabled<'a> {
    heap: &'a Heap,
}

impl Drop for MovingGcDisabled<'_> {
    fn drop(&mut self) {
        let mut state = self.heap.gc_state.lock();
        state.disable_moving_gc_count -= 1;
    }
}

/// What one collector run produced.
pub(super) struct RunOutcome {
    pub iteration: GcIteration,
    pub pause: Duration,
    pub duration: Duration,
    pub collector_name: String,
    pub gc_id: GcId,
}

impl Heap {
    /// Runs a collection of `gc_type` on behalf of `cause`.
    ///
    /// Returns the type that ran, or [`GcType::None`] if nothing ran: the
    /// heap is shutting down, a partial collection was asked for before a
    /// zygote space exists, or the family moves objects while moving
    /// collections are disabled.
    pub fn collect(&self, gc_type: GcType, cause: GcCause, clear_soft_references: bool) -> GcType {
        self.collect_internal(gc_type, cause, clear_soft_references)
    }

    /// Runs the broadest collection of the plan.
    pub fn collect_garbage(&self, clear_soft_references: bool) -> GcType {
        let gc_type = self.gc_plan.last().copied().unwrap_or(GcType::Full);
        self.collect_internal(gc_type, GcCause::Explicit, clear_soft_references)
    }

    pub(super) fn collect_internal(&self, gc_type: GcType, cause: GcCause, clear_soft_references: bool) -> GcType {
        if gc_type == GcType::None {
            return GcType::None;
        }
        if gc_type == GcType::Partial && !self.has_zygote_space() {
            return GcType::None;
        }
        let family = self.config.collector_type;
        if self.start_gc(family, cause).is_err() {
            return GcType::None;
        }
        if cause == GcCause::ForAlloc {
            self.metrics.record_gc_for_alloc();
            if let Some(stats) = self.runtime.stats() {
                stats.record_gc_for_alloc();
            }
        }

        let bytes_allocated_before_gc = self.get_bytes_allocated();
        let outcome = self.run_collector(
            family,
            gc_type,
            clear_soft_references,
            |collector, spaces| {
                if let (Some(ss), MainSpaces::Copying { bump_pointer, temp }) =
                    (collector.as_semi_space_mut(), &spaces.main)
                {
                    ss.set_from_space(bump_pointer.clone());
                    ss.set_to_space(temp.clone());
                    ss.set_fallback_space(Some(spaces.non_moving.clone()));
                }
            },
            |_, spaces, _| {
                if let MainSpaces::Copying { .. } = spaces.main {
                    self.publish_spaces(
                        Spaces {
                            main: spaces.main.swapped(),
                            ..spaces.clone()
                        },
                        false,
                    );
                }
            },
        );
        self.record_free(&outcome.iteration);
        self.grow_for_utilization(family, gc_type, &outcome.iteration, bytes_allocated_before_gc);
        self.record_gc(cause, family, gc_type, &outcome);
        self.finish_gc(gc_type);
        gc_type
    }

    /// Waits for the collection slot and claims it for `slot`.
    ///
    /// # Errors
    ///
    /// [`CompactError::ShuttingDown`] once the heap is shutting down and
    /// [`CompactError::Rejected`] if `slot` moves objects while moving
    /// collections are disabled. The slot is not claimed in either case.
    pub(super) fn start_gc(&self, slot: CollectorType, cause: GcCause) -> Result<(), CompactError> {
        let _blocking = BlockingRegion::new(self.runtime());
        let mut state = self.gc_state.lock();
        assert_ne!(
            state.thread_running_gc,
            Some(thread::current().id()),
            "collection requested from inside a collection"
        );
        self.wait_for_gc_to_complete_locked(cause, &mut state);
        if self.is_shutting_down() {
            return Err(CompactError::ShuttingDown);
        }
        if slot.is_moving() && state.disable_moving_gc_count > 0 {
            warn!(collector = ?slot, ?cause, "skipping collection: moving GC is disabled");
            return Err(CompactError::Rejected);
        }
        state.collector_type_running = slot;
        state.thread_running_gc = Some(thread::current().id());
        state.last_gc_cause = Some(cause);
        Ok(())
    }

    /// Releases the collection slot and wakes every waiter.
    pub(super) fn finish_gc(&self, gc_type: GcType) {
        let mut state = self.gc_state.lock();
        state.collector_type_running = CollectorType::None;
        state.thread_running_gc = None;
        if gc_type != GcType::None {
            state.last_gc_type = gc_type;
            self.gc_count.fetch_add(1, Ordering::AcqRel);
        }
        self.gc_complete.notify_all();
    }

    /// Runs one collector with every mutator suspended.
    ///
    /// Swaps the allocation stacks, revokes thread-local buffers and
    /// processes cards, then lets `prepare` configure the collector.
    /// `publish` runs after the collector, still inside the pause.
    pub(super) fn run_collector(
        &self,
        collector_type: CollectorType,
        gc_type: GcType,
        clear_soft_references: bool,
        prepare: impl FnOnce(&mut CollectorVariant, &Spaces),
        publish: impl FnOnce(&mut CollectorVariant, &Spaces, &GcIteration),
    ) -> RunOutcome {
        let gc_id = next_gc_id();
        let started = Instant::now();
        let mut collectors = self.collectors.lock();
        let Some(collector) = collectors.get_mut(collector_type, gc_type) else {
            self.spaces().dump_to_log();
            panic!("no collector registered for {collector_type:?} {gc_type:?}");
        };
        let collector_name = collector.name().to_owned();
        let _span = trace_gc_collection(&collector_name, gc_type, gc_id);

        let pause_start = Instant::now();
        let iteration = {
            let _suspend = ScopedSuspendAll::new(self.runtime());
            self.swap_stacks();
            let spaces = self.spaces();
            for space in spaces.alloc_spaces() {
                space.revoke_thread_local_buffers();
            }
            self.process_cards(&spaces, collector_type);
            prepare(&mut *collector, &spaces);
            let ctx = GcContext {
                spaces: &spaces,
                card_table: &self.card_table,
                model: self.model(),
                runtime: self.runtime(),
                heap_roots: self.heap_roots(),
                live_stack: self.live_stack(),
                clear_soft_references,
            };
            let iteration = collector.run(&ctx);
            publish(&mut *collector, &spaces, &iteration);
            iteration
        };
        let pause = pause_start.elapsed();
        RunOutcome {
            iteration,
            pause,
            duration: started.elapsed(),
            collector_name,
            gc_id,
        }
    }

    /// Moves card state into the structures each space keeps for it.
    ///
    /// Spaces with a mod-union table or remembered set drain their cards
    /// into it. Free-list spaces under mark-sweep age their cards so the
    /// next sticky collection finds the ones dirtied before this pause.
    fn process_cards(&self, spaces: &Spaces, collector_type: CollectorType) {
        let card_table = &self.card_table;
        if let Some(table) = &spaces.image_mod_union_table {
            table.process_cards(card_table);
        }
        if let Some(table) = &spaces.zygote_mod_union_table {
            table.process_cards(card_table);
        }
        match &spaces.non_moving_remembered_set {
            Some(set) => {
                set.clear_cards(card_table);
            }
            None if !collector_type.is_moving() => {
                let nm = &spaces.non_moving;
                card_table.modify_cards_atomic(nm.begin(), nm.end(), age_card, |_, _, _| {});
            }
            None => {}
        }
        match &spaces.large_object_remembered_set {
            Some(set) => {
                set.clear_cards(card_table);
            }
            None if !collector_type.is_moving() => {
                let los = &spaces.large_objects;
                card_table.modify_cards_atomic(los.begin(), los.end(), age_card, |_, _, _| {});
            }
            None => {}
        }
        if !collector_type.is_moving() {
            for space in [spaces.main.main(), spaces.main.spare()] {
                card_table.modify_cards_atomic(space.begin(), space.end(), age_card, |_, _, _| {});
            }
        }
    }

    pub(super) fn record_free(&self, iteration: &GcIteration) {
        let freed = iteration.total_freed_bytes();
        let _ = self
            .num_bytes_allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bytes| {
                Some(bytes.saturating_sub(freed))
            });
        if let Some(stats) = self.runtime.stats() {
            stats.record_free(iteration.freed_objects + iteration.freed_large_objects, freed);
        }
    }

    /// Resizes the heap after a collection of `gc_type`.
    fn grow_for_utilization(
        &self,
        collector_type: CollectorType,
        gc_type: GcType,
        iteration: &GcIteration,
        bytes_allocated_before_gc: usize,
    ) {
        let non_sticky_type = self.non_sticky_gc_type();
        let non_sticky: CumulativeTimings = self
            .collectors
            .lock()
            .get(collector_type, non_sticky_type)
            .map(|c| *c.cumulative())
            .unwrap_or_default();
        let policy = *self.growth.lock();
        let input = GrowthInput {
            gc_type,
            bytes_allocated: self.get_bytes_allocated(),
            bytes_allocated_before_gc,
            freed_bytes: iteration.total_freed_bytes(),
            target_footprint: self.target_footprint(),
            growth_limit: self.growth_limit(),
            concurrent_start_bytes: self.concurrent_start_bytes(),
            concurrent: self.is_gc_concurrent(),
            jank_perceptible: self.process_state() == ProcessState::JankPerceptible,
            throughput: iteration.estimated_throughput(),
            non_sticky_type,
            non_sticky_mean_throughput: non_sticky.estimated_mean_throughput(),
            non_sticky_iterations: non_sticky.iterations,
        };
        let decision = policy.grow_for_utilization(&input);
        let old_footprint = self
            .target_footprint
            .swap(decision.target_footprint, Ordering::AcqRel);
        self.concurrent_start_bytes
            .store(decision.concurrent_start_bytes, Ordering::Release);
        self.next_gc_type
            .store(decision.next_gc_type as u8, Ordering::Release);
        if let Some(foreground) = decision.min_foreground_target_footprint {
            self.min_foreground_target_footprint
                .store(foreground, Ordering::Release);
        }
        debug!(
            old_footprint,
            new_footprint = decision.target_footprint,
            concurrent_start_bytes = decision.concurrent_start_bytes,
            next_gc_type = ?decision.next_gc_type,
            "grew heap for utilization"
        );
    }

    /// Publishes the metrics of a finished run and logs it.
    pub(super) fn record_gc(&self, cause: GcCause, collector_type: CollectorType, gc_type: GcType, outcome: &RunOutcome) {
        let iteration = &outcome.iteration;
        let mut metrics = GcMetrics {
            gc_id: outcome.gc_id.0,
            cause,
            collector_type,
            gc_type,
            duration: outcome.duration,
            pause: outcome.pause,
            freed_objects: iteration.freed_objects,
            freed_bytes: iteration.freed_bytes,
            freed_large_objects: iteration.freed_large_objects,
            freed_large_object_bytes: iteration.freed_large_object_bytes,
            objects_surviving: iteration.objects_surviving,
            bytes_allocated: self.get_bytes_allocated(),
            target_footprint: self.target_footprint(),
            initialize_duration: iteration.phases.initialize,
            mark_duration: iteration.phases.marking,
            reclaim_duration: iteration.phases.reclaim,
            total_collections: 0,
            cleared_soft_references: iteration.cleared_soft_references,
        };
        metrics.total_collections = self.metrics.record_collection(&metrics, cause.is_blocking());
        *self.last_gc.lock() = Some(metrics);
        self.log_gc(&metrics, &outcome.collector_name);
    }

    #[allow(clippy::cast_precision_loss)]
    fn log_gc(&self, metrics: &GcMetrics, collector_name: &str) {
        let total_memory = self.get_total_memory();
        let percent_free = if total_memory == 0 {
            0.0
        } else {
            100.0 * (total_memory.saturating_sub(metrics.bytes_allocated)) as f64 / total_memory as f64
        };
        let long_pause = metrics.pause > self.config.long_pause_log_threshold;
        let long_gc = metrics.duration > self.config.long_gc_log_threshold;
        let perceptible = self.process_state() == ProcessState::JankPerceptible;
        let loud = metrics.cause == GcCause::Explicit || long_gc || (perceptible && long_pause);

        macro_rules! gc_log_line {
            ($level:ident) => {
                $level!(
                    cause = ?metrics.cause,
                    collector = collector_name,
                    freed_objects = metrics.freed_objects,
                    freed_bytes = metrics.freed_bytes,
                    freed_large_objects = metrics.freed_large_objects,
                    freed_large_object_bytes = metrics.freed_large_object_bytes,
                    percent_free = format_args!("{percent_free:.0}"),
                    bytes_allocated = metrics.bytes_allocated,
                    total_memory,
                    pause = ?metrics.pause,
                    total = ?metrics.duration,
                    cleared_soft_references = metrics.cleared_soft_references,
                    "GC log line"
                )
            };
        }
        if loud {
            gc_log_line!(info);
        } else {
            gc_log_line!(debug);
        }
    }

    /// Blocks until no collection is running. Returns the type of the last
    /// collection that finished while waiting, or [`GcType::None`] if
    /// nothing was running.
    pub fn wait_for_gc_to_complete(&self, cause: GcCause) -> GcType {
        let _blocking = BlockingRegion::new(self.runtime());
        let mut state = self.gc_state.lock();
        self.wait_for_gc_to_complete_locked(cause, &mut state)
    }

    fn wait_for_gc_to_complete_locked(&self, cause: GcCause, state: &mut MutexGuard<'_, GcState>) -> GcType {
        if state.collector_type_running == CollectorType::None {
            return GcType::None;
        }
        let running = state.collector_type_running;
        let start = Instant::now();
        let mut last_gc_type = GcType::None;
        while state.collector_type_running != CollectorType::None {
            self.gc_complete.wait(state);
            last_gc_type = state.last_gc_type;
        }
        let waited = start.elapsed();
        self.metrics.record_wait(waited);
        if waited > self.config.long_pause_log_threshold {
            info!(?running, ?cause, waited = ?waited, "wait_for_gc_to_complete blocked");
        }
        last_gc_type
    }

    /// Keeps moving collections (and compactions) from starting until the
    /// guard drops, after waiting for one already running.
    pub fn disable_moving_gc(&self) -> MovingGcDisabled<'_> {
        let _blocking = BlockingRegion::new(self.runtime());
        let mut state = self.gc_state.lock();
        state.disable_moving_gc_count += 1;
        while state.collector_type_running.is_moving() {
            self.gc_complete.wait(&mut state);
        }
        MovingGcDisabled { heap: self }
    }

    /// Asks for a background collection. Requests are coalesced until the
    /// pending one runs. Without a task daemon the collection runs on the
    /// calling thread.
    ///
    /// Returns `true` if a collection was scheduled or ran.
    pub fn request_concurrent_gc(&self, force_full: bool) -> bool {
        if !self.is_gc_concurrent() || self.is_shutting_down() {
            return false;
        }
        if self
            .concurrent_gc_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.metrics.record_concurrent_request();
        let gc_count = self.gc_count();
        if self.post_task(HeapTask::ConcurrentGc { force_full, gc_count }) {
            return true;
        }
        self.run_concurrent_gc(force_full, gc_count) != GcType::None
    }

    /// Runs the collection a concurrent request asks for: the next type in
    /// the plan, escalating if it could not run.
    pub fn concurrent_gc(&self, force_full: bool) -> GcType {
        self.run_concurrent_gc(force_full, self.gc_count())
    }

    /// Skips the collection if one completed since the request was made
    /// at `requested_gc_count`.
    pub(super) fn run_concurrent_gc(&self, force_full: bool, requested_gc_count: u64) -> GcType {
        self.concurrent_gc_pending.store(false, Ordering::Release);
        if self.is_shutting_down() || self.gc_count() != requested_gc_count {
            return GcType::None;
        }
        let mut next = self.next_gc_type();
        if force_full && next == GcType::Sticky {
            next = self.non_sticky_gc_type();
        }
        let ran = self.collect_internal(next, GcCause::Background, false);
        if ran != GcType::None {
            return ran;
        }
        for &gc_type in &self.gc_plan {
            if gc_type > next {
                let ran = self.collect_internal(gc_type, GcCause::Background, false);
                if ran != GcType::None {
                    return ran;
                }
            }
        }
        GcType::None
    }

    /// Returns unused pages of every space that can give them back. Runs in
    /// the collection slot without stopping mutators.
    ///
    /// Returns the bytes released.
    pub fn trim(&self) -> usize {
        if self.start_gc(CollectorType::HeapTrim, GcCause::Trim).is_err() {
            return 0;
        }
        let spaces = self.spaces();
        let mut released: usize = spaces.malloc_spaces().iter().map(|space| space.trim()).sum();
        released += spaces.large_objects.trim();
        if let MainSpaces::Copying { temp, .. } = &spaces.main {
            released += temp.trim();
        }
        self.finish_gc(GcType::None);
        debug!(released, "trimmed heap");
        released
    }
}
