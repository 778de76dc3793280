//! Heap sizing after a collection.
//!
//! A non-sticky collection sets the target footprint so that live bytes
//! make up roughly the target utilization of the heap, within
//! `[min_free, max_free]` of headroom. A sticky collection keeps the target
//! (or shrinks it when far too much is free) and decides whether the next
//! collection may be sticky again.

use crate::collector::GcType;

/// Smallest allocation window left before a concurrent collection starts.
pub(crate) const MIN_CONCURRENT_REMAINING_BYTES: usize = 128 * 1024;
/// Largest allocation window left before a concurrent collection starts.
pub(crate) const MAX_CONCURRENT_REMAINING_BYTES: usize = 512 * 1024;

/// Tunables the policy reads; owned by the heap and adjustable at runtime.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GrowthPolicy {
    pub target_utilization: f64,
    pub min_free: usize,
    pub max_free: usize,
    pub foreground_multiplier: f64,
    pub sticky_throughput_adjustment: f64,
    pub min_concurrent_remaining: usize,
    pub max_concurrent_remaining: usize,
}

/// What the heap knows right after a collection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GrowthInput {
    pub gc_type: GcType,
    pub bytes_allocated: usize,
    pub bytes_allocated_before_gc: usize,
    pub freed_bytes: usize,
    pub target_footprint: usize,
    pub growth_limit: usize,
    pub concurrent_start_bytes: usize,
    pub concurrent: bool,
    /// Whether pauses are noticeable, which scales growth up.
    pub jank_perceptible: bool,
    pub throughput: f64,
    pub non_sticky_type: GcType,
    pub non_sticky_mean_throughput: f64,
    pub non_sticky_iterations: usize,
}

/// The new sizing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct GrowthDecision {
    pub target_footprint: usize,
    pub concurrent_start_bytes: usize,
    pub next_gc_type: GcType,
    /// Footprint to grow to when the process becomes perceptible again.
    pub min_foreground_target_footprint: Option<usize>,
}

impl GrowthPolicy {
    /// Growth multiplier for the current process state.
    pub fn multiplier(&self, jank_perceptible: bool) -> f64 {
        if jank_perceptible {
            self.foreground_multiplier
        } else {
            1.0
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn grow_for_utilization(&self, input: &GrowthInput) -> GrowthDecision {
        let bytes = input.bytes_allocated;
        let multiplier = self.multiplier(input.jank_perceptible);
        let adjusted_min_free = (self.min_free as f64 * multiplier) as usize;
        let adjusted_max_free = (self.max_free as f64 * multiplier) as usize;
        let mut min_foreground_target_footprint = None;

        let (target, next_gc_type) = if input.gc_type == GcType::Sticky {
            let keep_sticky = input.throughput * self.sticky_throughput_adjustment
                >= input.non_sticky_mean_throughput
                && input.non_sticky_iterations > 0
                && bytes
                    <= if input.concurrent {
                        input.concurrent_start_bytes
                    } else {
                        input.target_footprint
                    };
            let next = if keep_sticky {
                GcType::Sticky
            } else {
                input.non_sticky_type
            };
            let target = if bytes + adjusted_max_free < input.target_footprint {
                bytes + adjusted_max_free
            } else {
                bytes.max(input.target_footprint)
            };
            (target, next)
        } else {
            let delta = (bytes as f64 * (1.0 / self.target_utilization - 1.0)) as usize;
            let grow_bytes = ((delta as f64 * multiplier) as usize).clamp(adjusted_min_free, adjusted_max_free);
            if multiplier <= 1.0 && grow_bytes > 0 {
                let foreground = (grow_bytes as f64 * self.foreground_multiplier) as usize;
                min_foreground_target_footprint = Some((bytes + foreground).min(input.growth_limit));
            }
            (bytes + grow_bytes, GcType::Sticky)
        };

        let target_footprint = target.min(input.growth_limit).max(bytes);
        let concurrent_start_bytes = if input.concurrent {
            self.concurrent_start(input, target_footprint)
        } else {
            usize::MAX
        };
        GrowthDecision {
            target_footprint,
            concurrent_start_bytes,
            next_gc_type,
            min_foreground_target_footprint,
        }
    }

    /// Starts the next concurrent collection early enough that it finishes
    /// before the footprint is reached, assuming mutators keep allocating
    /// at the rate they did during this collection.
    fn concurrent_start(&self, input: &GrowthInput, target_footprint: usize) -> usize {
        let bytes_allocated_during_gc =
            (input.bytes_allocated + input.freed_bytes).saturating_sub(input.bytes_allocated_before_gc);
        let mut remaining =
            bytes_allocated_during_gc.clamp(self.min_concurrent_remaining, self.max_concurrent_remaining);
        if remaining > target_footprint {
            remaining = self.min_concurrent_remaining.min(target_footprint);
        }
        (target_footprint - remaining).max(input.bytes_allocated)
    }

    /// Start threshold used before any collection has run, or after the
    /// growth limit is cleared.
    pub fn default_concurrent_start(&self, concurrent: bool, target_footprint: usize) -> usize {
        if concurrent {
            target_footprint.saturating_sub(self.min_concurrent_remaining)
        } else {
            usize::MAX
        }
    }
}
