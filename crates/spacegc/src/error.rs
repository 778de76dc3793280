//! Error types surfaced by the heap.

use std::fmt;
use std::io;

use crate::collector::CollectorType;

/// Allocation failed after every collection in the GC plan was tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfMemoryError {
    /// Bytes requested.
    pub requested: usize,
    /// Free bytes in the heap when the allocation gave up.
    pub free_bytes: usize,
    /// Bytes left before the growth limit.
    pub until_oom: usize,
    /// Target footprint at the time of failure.
    pub target_footprint: usize,
    /// Growth limit at the time of failure.
    pub growth_limit: usize,
    /// Collector family in use.
    pub allocator: CollectorType,
}

impl fmt::Display for OutOfMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to allocate a {} byte allocation with {} free bytes and {} until OOM, \
             target footprint {}, growth limit {} ({:?})",
            self.requested,
            self.free_bytes,
            self.until_oom,
            self.target_footprint,
            self.growth_limit,
            self.allocator
        )
    }
}

impl std::error::Error for OutOfMemoryError {}

/// Why a homogeneous space compaction did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    /// Moving GC is disabled or the heap is not in a state that allows it.
    Rejected,
    /// The active collector has no backup space to compact into.
    Unsupported,
    /// The heap is shutting down.
    ShuttingDown,
}

impl fmt::Display for CompactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => f.write_str("homogeneous space compaction rejected"),
            Self::Unsupported => f.write_str("homogeneous space compaction unsupported"),
            Self::ShuttingDown => f.write_str("heap is shutting down"),
        }
    }
}

impl std::error::Error for CompactError {}

/// Invalid [`HeapConfig`](crate::HeapConfig).
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A size that must be positive is zero.
    ZeroSize(&'static str),
    /// `target_utilization` is outside `(0, 1)`.
    TargetUtilization(f64),
    /// `min_free` exceeds `max_free`.
    FreeRange { min_free: usize, max_free: usize },
    /// The concurrent trigger window is inverted.
    ConcurrentWindow { min: usize, max: usize },
    /// `initial_size <= growth_limit <= capacity` does not hold.
    Limits {
        initial_size: usize,
        growth_limit: usize,
        capacity: usize,
    },
    /// A multiplier or adjustment is not positive.
    Multiplier(&'static str, f64),
    /// The collector type cannot be the heap's main collector.
    UnsupportedCollector(CollectorType),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize(field) => write!(f, "{field} must be non-zero"),
            Self::TargetUtilization(u) => write!(f, "target utilization {u} is outside (0, 1)"),
            Self::FreeRange { min_free, max_free } => {
                write!(f, "min_free {min_free} exceeds max_free {max_free}")
            }
            Self::ConcurrentWindow { min, max } => {
                write!(f, "concurrent window minimum {min} exceeds maximum {max}")
            }
            Self::Limits {
                initial_size,
                growth_limit,
                capacity,
            } => write!(
                f,
                "expected initial size {initial_size} <= growth limit {growth_limit} <= capacity {capacity}"
            ),
            Self::Multiplier(field, v) => write!(f, "{field} must be positive, got {v}"),
            Self::UnsupportedCollector(c) => write!(f, "{c:?} is not supported as the main collector"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Heap construction failed.
#[derive(Debug)]
pub enum HeapError {
    /// The configuration was rejected.
    Config(ConfigError),
    /// Reserving memory failed.
    Map(io::Error),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid heap configuration: {e}"),
            Self::Map(e) => write!(f, "failed to map heap memory: {e}"),
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Map(e) => Some(e),
        }
    }
}

impl From<ConfigError> for HeapError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<io::Error> for HeapError {
    fn from(e: io::Error) -> Self {
        Self::Map(e)
    }
}
