//! Structured tracing for collections.
//!
//! Every collection runs inside a `gc_collect` span and each of its phases
//! inside a `gc_phase` span, so a subscriber can attribute events to one
//! run by `gc_id`.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{span, Level};

use crate::collector::GcType;

/// Phases of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Bind bitmaps, pick immune spaces, swap allocation stacks.
    Initialize,
    /// Mark roots and drain the mark stack.
    Marking,
    /// Sweep dead objects and release the from-space.
    Reclaim,
    /// Unbind bitmaps and publish results.
    Finish,
}

/// Stable identifier for one collection, monotonically increasing from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcId(pub u64);

static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

/// Generates the next collection id.
pub fn next_gc_id() -> GcId {
    GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
}

/// Enters the span covering a whole collection.
pub(crate) fn trace_gc_collection(collector: &str, gc_type: GcType, gc_id: GcId) -> span::EnteredSpan {
    span!(
        Level::DEBUG,
        "gc_collect",
        collector = collector,
        gc_type = ?gc_type,
        gc_id = gc_id.0
    )
    .entered()
}

/// Enters the span covering one phase.
pub(crate) fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
    span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
}

pub(crate) fn log_phase_start(phase: GcPhase, bytes_before: usize) {
    tracing::debug!(phase = ?phase, bytes_before, "phase_start");
}

pub(crate) fn log_phase_end(phase: GcPhase, bytes_reclaimed: usize) {
    tracing::debug!(phase = ?phase, bytes_reclaimed, "phase_end");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_ids_increase() {
        let a = next_gc_id();
        let b = next_gc_id();
        assert!(b > a);
    }

    #[test]
    fn test_spans_nest_without_subscriber() {
        let _gc = trace_gc_collection("semi space", GcType::Full, next_gc_id());
        let _phase = trace_phase(GcPhase::Marking);
        log_phase_start(GcPhase::Marking, 10);
        log_phase_end(GcPhase::Marking, 0);
    }
}
