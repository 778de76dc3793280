//! Heap configuration.

use std::time::Duration;

use crate::collector::CollectorType;
use crate::error::ConfigError;

const KB: usize = 1024;
const MB: usize = KB * KB;

/// Tuning knobs for a [`Heap`](crate::Heap).
///
/// Every field has a default suitable for a small interactive process.
/// Sizes are in bytes and are rounded up to whole pages where the heap lays
/// out memory.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Target footprint before the first collection.
    pub initial_size: usize,
    /// Soft cap on the heap. Raised to `capacity` by
    /// [`Heap::clear_growth_limit`](crate::Heap::clear_growth_limit).
    pub growth_limit: usize,
    /// Hard cap on the heap.
    pub capacity: usize,
    /// Size of each main space (and of the backup or to-space beside it).
    pub main_space_capacity: usize,
    /// Size of the non-moving space.
    pub non_moving_space_capacity: usize,
    /// Size of the large-object region.
    pub large_object_space_capacity: usize,
    /// Size of the image space. Zero means no image space.
    pub image_space_capacity: usize,
    /// Allocations of at least this many bytes go to the large-object space.
    pub large_object_threshold: usize,
    /// Minimum headroom left after a non-sticky collection.
    pub min_free: usize,
    /// Maximum headroom left after a non-sticky collection.
    pub max_free: usize,
    /// Fraction of the target footprint expected to be live after a
    /// collection.
    pub target_utilization: f64,
    /// Headroom multiplier while the process is jank perceptible.
    pub foreground_heap_growth_multiplier: f64,
    /// Collector family.
    pub collector_type: CollectorType,
    /// Smallest gap between the concurrent trigger and the target footprint.
    pub min_concurrent_remaining_bytes: usize,
    /// Largest gap between the concurrent trigger and the target footprint.
    pub max_concurrent_remaining_bytes: usize,
    /// Scales sticky throughput before comparing it with the non-sticky
    /// mean.
    pub sticky_gc_throughput_adjustment: f64,
    /// Pauses and waits longer than this are logged.
    pub long_pause_log_threshold: Duration,
    /// Collections longer than this are logged.
    pub long_gc_log_threshold: Duration,
    /// Entries in each allocation stack.
    pub allocation_stack_capacity: usize,
    /// Initial entries in the collector's mark stack.
    pub mark_stack_initial_capacity: usize,
    /// Serve small free-list allocations from thread-local buffers.
    pub use_tlab: bool,
    /// Size of one thread-local buffer.
    pub tlab_size: usize,
    /// Try a homogeneous space compaction before reporting OOM.
    pub use_homogeneous_space_compaction_for_oom: bool,
    /// Minimum time between two OOM-driven compactions.
    pub min_interval_homogeneous_space_compaction_by_oom: Duration,
    /// Schedule a compaction when the process moves to the background.
    pub background_compaction: bool,
    /// Run heap tasks on a background thread.
    pub enable_task_daemon: bool,
    /// Keep remembered sets for the non-moving and large-object spaces.
    pub use_remembered_sets: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_size: 2 * MB,
            growth_limit: 64 * MB,
            capacity: 64 * MB,
            main_space_capacity: 64 * MB,
            non_moving_space_capacity: 16 * MB,
            large_object_space_capacity: 64 * MB,
            image_space_capacity: MB,
            large_object_threshold: 12 * KB,
            min_free: 512 * KB,
            max_free: 2 * MB,
            target_utilization: 0.75,
            foreground_heap_growth_multiplier: 2.0,
            collector_type: CollectorType::SemiSpace,
            min_concurrent_remaining_bytes: 128 * KB,
            max_concurrent_remaining_bytes: 512 * KB,
            sticky_gc_throughput_adjustment: 1.0,
            long_pause_log_threshold: Duration::from_millis(5),
            long_gc_log_threshold: Duration::from_millis(100),
            allocation_stack_capacity: 128 * KB,
            mark_stack_initial_capacity: 64 * KB,
            use_tlab: false,
            tlab_size: 32 * KB,
            use_homogeneous_space_compaction_for_oom: true,
            min_interval_homogeneous_space_compaction_by_oom: Duration::from_secs(100),
            background_compaction: false,
            enable_task_daemon: true,
            use_remembered_sets: true,
        }
    }
}

impl HeapConfig {
    /// A configuration with every space sized from one heap capacity.
    /// Handy for tests and small embedders.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            initial_size: capacity.min(Self::default().initial_size),
            growth_limit: capacity,
            capacity,
            main_space_capacity: capacity,
            non_moving_space_capacity: capacity,
            large_object_space_capacity: capacity,
            ..Self::default()
        }
    }

    /// Checks the configuration for contradictions.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("capacity", self.capacity),
            ("main_space_capacity", self.main_space_capacity),
            ("non_moving_space_capacity", self.non_moving_space_capacity),
            ("large_object_space_capacity", self.large_object_space_capacity),
            ("large_object_threshold", self.large_object_threshold),
            ("allocation_stack_capacity", self.allocation_stack_capacity),
            ("mark_stack_initial_capacity", self.mark_stack_initial_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroSize(name));
            }
        }
        if self.use_tlab && self.tlab_size == 0 {
            return Err(ConfigError::ZeroSize("tlab_size"));
        }
        if !(self.target_utilization > 0.0 && self.target_utilization < 1.0) {
            return Err(ConfigError::TargetUtilization(self.target_utilization));
        }
        if self.min_free > self.max_free {
            return Err(ConfigError::FreeRange {
                min_free: self.min_free,
                max_free: self.max_free,
            });
        }
        if self.min_concurrent_remaining_bytes > self.max_concurrent_remaining_bytes {
            return Err(ConfigError::ConcurrentWindow {
                min: self.min_concurrent_remaining_bytes,
                max: self.max_concurrent_remaining_bytes,
            });
        }
        if self.initial_size > self.growth_limit || self.growth_limit > self.capacity {
            return Err(ConfigError::Limits {
                initial_size: self.initial_size,
                growth_limit: self.growth_limit,
                capacity: self.capacity,
            });
        }
        for (name, value) in [
            ("foreground_heap_growth_multiplier", self.foreground_heap_growth_multiplier),
            ("sticky_gc_throughput_adjustment", self.sticky_gc_throughput_adjustment),
        ] {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::Multiplier(name, value));
            }
        }
        match self.collector_type {
            CollectorType::SemiSpace | CollectorType::MarkSweep | CollectorType::ConcurrentMarkSweep => Ok(()),
            other => Err(ConfigError::UnsupportedCollector(other)),
        }
    }
}
