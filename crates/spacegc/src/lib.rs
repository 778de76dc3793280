//! A space-partitioned managed heap with a semi-space copying collector.
//!
//! `spacegc` manages one reserved address range carved into spaces, each
//! with its own allocation strategy, and collects it with either a
//! semi-space copying collector or a mark-sweep collector. The heap is
//! language agnostic: the embedder describes object layouts through an
//! [`ObjectModel`] and its threads through a [`Runtime`].
//!
//! # Layout
//!
//! - An **image space** of boot objects that is never collected.
//! - A **non-moving space** (free list) for objects that must keep their
//!   address, later split into a frozen **zygote space** and a fresh
//!   non-moving space by [`Heap::pre_zygote_fork`].
//! - A pair of **main spaces**: bump-pointer from/to spaces for the
//!   semi-space family, a free-list main space and its backup for the
//!   mark-sweep family.
//! - A **large-object space** for allocations above a size threshold.
//!
//! One card table covers the whole reservation. Remembered sets and
//! mod-union tables record cards of spaces that are not collected in every
//! run.
//!
//! # Collections
//!
//! Collections escalate sticky → partial → full. A sticky collection only
//! looks at objects allocated since the last one, a partial one leaves the
//! zygote space alone, and a full one collects everything but the image.
//! The allocation path runs this plan, then grows the heap, then clears
//! soft references, then (for free-list heaps) compacts before reporting
//! [`OutOfMemoryError`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use spacegc::{Heap, HeapConfig, SlotModel, StandaloneRuntime};
//!
//! let runtime = Arc::new(StandaloneRuntime::new());
//! let heap = Heap::new(
//!     HeapConfig::with_capacity(4 * 1024 * 1024),
//!     Arc::new(SlotModel),
//!     runtime.clone(),
//! )
//! .unwrap();
//!
//! let _scope = runtime.mutator_scope();
//! let class = SlotModel::class(1, 0);
//! let parent = heap.allocate(class, SlotModel::object_size(1, 0)).unwrap();
//! let root = runtime.root(parent);
//! let child = heap.allocate(class, SlotModel::object_size(1, 0)).unwrap();
//! heap.write_reference(root.get().unwrap(), SlotModel::reference_offset(0), Some(child));
//!
//! heap.collect_garbage(false);
//! let parent = root.get().unwrap();
//! assert!(heap.read_reference(parent, SlotModel::reference_offset(0)).is_some());
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Card table, bitmaps, object stacks, remembered sets and mod-union tables.
///
/// This module is public for testing and advanced use cases.
pub mod accounting;
mod address;
/// Collector types and the collectors themselves.
pub mod collector;
mod config;
mod error;
mod heap;
mod metrics;
mod object;
mod roots;
mod runtime;
/// Heap spaces.
///
/// This module is public for testing and advanced use cases.
pub mod space;
mod tracing;

pub use address::{allocation_size, checked_allocation_size, ClassWord, ObjectRef, HEADER_SIZE, OBJECT_ALIGNMENT};
pub use collector::{CollectorType, GcCause, GcType};
pub use config::HeapConfig;
pub use error::{CompactError, ConfigError, HeapError, OutOfMemoryError};
pub use heap::{BadReference, Heap, MovingGcDisabled, ProcessState};
pub use metrics::{GcMetrics, HeapMetrics, PhaseTimer};
pub use object::{Object, ObjectModel, SlotModel};
pub use roots::{RootHandle, RootTable};
pub use runtime::{BlockingRegion, MutatorScope, Runtime, RuntimeStats, ScopedSuspendAll, StandaloneRuntime};
pub use space::SpaceKind;
pub use crate::tracing::{GcId, GcPhase};
