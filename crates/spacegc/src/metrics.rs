//! Collection statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::collector::{CollectorType, GcCause, GcType};

/// Statistics from one collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Id of the collection, as logged in its `gc_collect` span.
    pub gc_id: u64,
    /// Why the collection ran.
    pub cause: GcCause,
    /// Collector that ran.
    pub collector_type: CollectorType,
    /// Scope of the collection.
    pub gc_type: GcType,
    /// Wall time of the collection body.
    pub duration: Duration,
    /// Time mutators were suspended.
    pub pause: Duration,
    /// Objects reclaimed outside the large-object space.
    pub freed_objects: usize,
    /// Bytes reclaimed outside the large-object space.
    pub freed_bytes: usize,
    /// Large objects reclaimed.
    pub freed_large_objects: usize,
    /// Large-object bytes reclaimed.
    pub freed_large_object_bytes: usize,
    /// Objects copied or marked live.
    pub objects_surviving: usize,
    /// Heap bytes allocated after the collection.
    pub bytes_allocated: usize,
    /// Target footprint after the collection.
    pub target_footprint: usize,
    /// Duration of the initialize phase.
    pub initialize_duration: Duration,
    /// Duration of the marking phase.
    pub mark_duration: Duration,
    /// Duration of the reclaim phase.
    pub reclaim_duration: Duration,
    /// Collections since the heap was created, this one included.
    pub total_collections: usize,
    /// Whether soft references were cleared.
    pub cleared_soft_references: bool,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Metrics with every field zeroed.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            gc_id: 0,
            cause: GcCause::Explicit,
            collector_type: CollectorType::None,
            gc_type: GcType::None,
            duration: Duration::ZERO,
            pause: Duration::ZERO,
            freed_objects: 0,
            freed_bytes: 0,
            freed_large_objects: 0,
            freed_large_object_bytes: 0,
            objects_surviving: 0,
            bytes_allocated: 0,
            target_footprint: 0,
            initialize_duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            reclaim_duration: Duration::ZERO,
            total_collections: 0,
            cleared_soft_references: false,
        }
    }

    /// Total bytes reclaimed, large objects included.
    #[must_use]
    pub const fn total_freed_bytes(&self) -> usize {
        self.freed_bytes + self.freed_large_object_bytes
    }
}

/// Captures per-phase durations.
///
/// ```
/// use spacegc::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... bind bitmaps, swap stacks ...
/// timer.end_initialize();
/// timer.start();
/// // ... mark ...
/// timer.end_marking();
/// timer.start();
/// // ... sweep ...
/// timer.end_reclaim();
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Initialize phase time.
    pub initialize: Duration,
    /// Marking phase time.
    pub marking: Duration,
    /// Reclaim phase time.
    pub reclaim: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// A timer with every duration zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initialize: Duration::ZERO,
            marking: Duration::ZERO,
            reclaim: Duration::ZERO,
            current_start: None,
        }
    }

    /// Starts timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// Ends the initialize phase.
    pub fn end_initialize(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.initialize = start.elapsed();
        }
    }

    /// Ends the marking phase.
    pub fn end_marking(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.marking = start.elapsed();
        }
    }

    /// Ends the reclaim phase.
    pub fn end_reclaim(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.reclaim = start.elapsed();
        }
    }
}

/// Cumulative counters for one heap.
#[derive(Debug, Default)]
pub struct HeapMetrics {
    collections: AtomicUsize,
    sticky_collections: AtomicUsize,
    partial_collections: AtomicUsize,
    full_collections: AtomicUsize,
    bytes_freed: AtomicUsize,
    objects_freed: AtomicUsize,
    pause_ns: AtomicU64,
    blocking_collections: AtomicUsize,
    blocking_time_ns: AtomicU64,
    wait_time_ns: AtomicU64,
    gc_for_alloc: AtomicUsize,
    delayed_ooms: AtomicUsize,
    homogeneous_compactions: AtomicUsize,
    homogeneous_compactions_rejected: AtomicUsize,
    concurrent_requests: AtomicUsize,
}

impl HeapMetrics {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_collection(&self, metrics: &GcMetrics, blocking: bool) -> usize {
        match metrics.gc_type {
            GcType::Sticky => &self.sticky_collections,
            GcType::Partial => &self.partial_collections,
            GcType::Full | GcType::None => &self.full_collections,
        }
        .fetch_add(1, Ordering::Relaxed);
        self.bytes_freed
            .fetch_add(metrics.total_freed_bytes(), Ordering::Relaxed);
        self.objects_freed.fetch_add(
            metrics.freed_objects + metrics.freed_large_objects,
            Ordering::Relaxed,
        );
        self.pause_ns
            .fetch_add(duration_ns(metrics.pause), Ordering::Relaxed);
        if blocking {
            self.blocking_collections.fetch_add(1, Ordering::Relaxed);
            self.blocking_time_ns
                .fetch_add(duration_ns(metrics.duration), Ordering::Relaxed);
        }
        self.collections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_wait(&self, waited: Duration) {
        self.wait_time_ns
            .fetch_add(duration_ns(waited), Ordering::Relaxed);
    }

    pub(crate) fn record_gc_for_alloc(&self) {
        self.gc_for_alloc.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delayed_oom(&self) {
        self.delayed_ooms.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_homogeneous_compaction(&self, performed: bool) {
        if performed {
            &self.homogeneous_compactions
        } else {
            &self.homogeneous_compactions_rejected
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_concurrent_request(&self) {
        self.concurrent_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Collections run.
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Sticky collections run.
    #[must_use]
    pub fn sticky_collections(&self) -> usize {
        self.sticky_collections.load(Ordering::Relaxed)
    }

    /// Partial collections run.
    #[must_use]
    pub fn partial_collections(&self) -> usize {
        self.partial_collections.load(Ordering::Relaxed)
    }

    /// Full collections run.
    #[must_use]
    pub fn full_collections(&self) -> usize {
        self.full_collections.load(Ordering::Relaxed)
    }

    /// Bytes freed by all collections.
    #[must_use]
    pub fn total_bytes_freed(&self) -> usize {
        self.bytes_freed.load(Ordering::Relaxed)
    }

    /// Objects freed by all collections.
    #[must_use]
    pub fn total_objects_freed(&self) -> usize {
        self.objects_freed.load(Ordering::Relaxed)
    }

    /// Total time mutators were suspended.
    #[must_use]
    pub fn total_pause(&self) -> Duration {
        Duration::from_nanos(self.pause_ns.load(Ordering::Relaxed))
    }

    /// Collections that ran on a mutator thread that needed memory.
    #[must_use]
    pub fn blocking_collections(&self) -> usize {
        self.blocking_collections.load(Ordering::Relaxed)
    }

    /// Time spent in blocking collections.
    #[must_use]
    pub fn blocking_time(&self) -> Duration {
        Duration::from_nanos(self.blocking_time_ns.load(Ordering::Relaxed))
    }

    /// Time threads spent waiting for another thread's collection.
    #[must_use]
    pub fn total_wait_time(&self) -> Duration {
        Duration::from_nanos(self.wait_time_ns.load(Ordering::Relaxed))
    }

    /// Collections triggered by a failed allocation.
    #[must_use]
    pub fn gc_for_alloc_count(&self) -> usize {
        self.gc_for_alloc.load(Ordering::Relaxed)
    }

    /// Allocations that only succeeded after an OOM-driven compaction.
    #[must_use]
    pub fn delayed_ooms(&self) -> usize {
        self.delayed_ooms.load(Ordering::Relaxed)
    }

    /// Homogeneous space compactions performed.
    #[must_use]
    pub fn homogeneous_compactions(&self) -> usize {
        self.homogeneous_compactions.load(Ordering::Relaxed)
    }

    /// Homogeneous space compactions rejected.
    #[must_use]
    pub fn homogeneous_compactions_rejected(&self) -> usize {
        self.homogeneous_compactions_rejected.load(Ordering::Relaxed)
    }

    /// Concurrent collections requested.
    #[must_use]
    pub fn concurrent_requests(&self) -> usize {
        self.concurrent_requests.load(Ordering::Relaxed)
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_timer_records_each_phase() {
        let mut timer = PhaseTimer::new();
        timer.start();
        timer.end_initialize();
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_marking();
        assert!(timer.marking >= Duration::from_millis(1));
        timer.end_reclaim();
        assert_eq!(timer.reclaim, Duration::ZERO);
    }

    #[test]
    fn test_record_collection_counts_by_type() {
        let metrics = HeapMetrics::new();
        let sticky = GcMetrics {
            gc_type: GcType::Sticky,
            freed_bytes: 100,
            freed_large_object_bytes: 4096,
            freed_objects: 2,
            freed_large_objects: 1,
            ..GcMetrics::new()
        };
        assert_eq!(metrics.record_collection(&sticky, true), 1);
        let full = GcMetrics {
            gc_type: GcType::Full,
            ..GcMetrics::new()
        };
        assert_eq!(metrics.record_collection(&full, false), 2);
        assert_eq!(metrics.sticky_collections(), 1);
        assert_eq!(metrics.full_collections(), 1);
        assert_eq!(metrics.total_bytes_freed(), 4196);
        assert_eq!(metrics.total_objects_freed(), 3);
        assert_eq!(metrics.blocking_collections(), 1);
    }
}
