//! The heap's view of the embedding runtime.
//!
//! The heap never owns threads. It asks a [`Runtime`] to bring every mutator
//! to a safe point, to enumerate roots, and to sweep weak tables. Embedders
//! with their own thread machinery implement the trait; everyone else can
//! use [`StandaloneRuntime`].

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::address::ObjectRef;
use crate::roots::{RootHandle, RootTable};

/// Counter sink for allocation and GC activity.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    allocated_objects: AtomicUsize,
    allocated_bytes: AtomicUsize,
    freed_objects: AtomicUsize,
    freed_bytes: AtomicUsize,
    gc_for_alloc_count: AtomicUsize,
}

impl RuntimeStats {
    /// Creates a zeroed sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allocation(&self, bytes: usize) {
        self.allocated_objects.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self, objects: usize, bytes: usize) {
        self.freed_objects.fetch_add(objects, Ordering::Relaxed);
        self.freed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_gc_for_alloc(&self) {
        self.gc_for_alloc_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Objects allocated.
    #[must_use]
    pub fn allocated_objects(&self) -> usize {
        self.allocated_objects.load(Ordering::Relaxed)
    }

    /// Bytes allocated.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Objects freed by collections.
    #[must_use]
    pub fn freed_objects(&self) -> usize {
        self.freed_objects.load(Ordering::Relaxed)
    }

    /// Bytes freed by collections.
    #[must_use]
    pub fn freed_bytes(&self) -> usize {
        self.freed_bytes.load(Ordering::Relaxed)
    }

    /// Collections run because an allocation failed.
    #[must_use]
    pub fn gc_for_alloc_count(&self) -> usize {
        self.gc_for_alloc_count.load(Ordering::Relaxed)
    }
}

/// Services the heap needs from the runtime that owns the mutator threads.
pub trait Runtime: Send + Sync {
    /// Blocks until every mutator other than the caller is at a safe point.
    fn suspend_all_mutators(&self);

    /// Releases the mutators parked by [`Runtime::suspend_all_mutators`].
    fn resume_all_mutators(&self);

    /// Visits every strong root. The visitor may rewrite the reference.
    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut ObjectRef));

    /// Sweeps weak tables. `is_marked` returns the referent's current
    /// address, or `None` if it is dead.
    fn sweep_system_weaks(&self, is_marked: &mut dyn FnMut(ObjectRef) -> Option<ObjectRef>) {
        let _ = is_marked;
    }

    /// Called when the current thread is about to block inside the heap.
    /// A blocked thread counts as suspended.
    fn enter_blocking(&self) {}

    /// Called when the current thread stops blocking. May park the thread
    /// until a suspension in progress ends.
    fn exit_blocking(&self) {}

    /// Polled on the allocation path.
    fn safepoint(&self) {}

    /// Returns `true` once the runtime is tearing down.
    fn is_shutting_down(&self) -> bool {
        false
    }

    /// Counter sink, if stats are enabled.
    fn stats(&self) -> Option<&RuntimeStats> {
        None
    }
}

/// Suspends every mutator for the guard's lifetime.
pub struct ScopedSuspendAll<'a> {
    runtime: &'a dyn Runtime,
}

impl<'a> ScopedSuspendAll<'a> {
    /// Suspends all mutators other than the caller.
    #[must_use]
    pub fn new(runtime: &'a dyn Runtime) -> Self {
        runtime.suspend_all_mutators();
        Self { runtime }
    }
}

impl Drop for ScopedSuspendAll<'_> {
    fn drop(&mut self) {
        self.runtime.resume_all_mutators();
    }
}

/// Marks the current thread as blocked for the guard's lifetime.
pub struct BlockingRegion<'a> {
    runtime: &'a dyn Runtime,
}

impl<'a> BlockingRegion<'a> {
    /// Enters the blocking state.
    #[must_use]
    pub fn new(runtime: &'a dyn Runtime) -> Self {
        runtime.enter_blocking();
        Self { runtime }
    }
}

impl Drop for BlockingRegion<'_> {
    fn drop(&mut self) {
        self.runtime.exit_blocking();
    }
}

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Per-thread registration with one runtime.
#[derive(Debug, Clone, Copy)]
struct ThreadEntry {
    runtime: u64,
    depth: usize,
    blocked: usize,
}

thread_local! {
    static ENTRIES: RefCell<Vec<ThreadEntry>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Default)]
struct Rendezvous {
    /// Registered threads that are running mutator code.
    active: usize,
    suspender: Option<ThreadId>,
}

/// A self-contained [`Runtime`]: a root table, a weak table and a
/// rendezvous for threads that register with [`StandaloneRuntime::mutator_scope`].
///
/// Threads outside a mutator scope are never waited for. A thread in a
/// scope reaches a safe point on every allocation and whenever it blocks
/// inside the heap.
#[derive(Debug)]
pub struct StandaloneRuntime {
    id: u64,
    state: Mutex<Rendezvous>,
    cond: Condvar,
    roots: RootTable,
    weaks: RootTable,
    stats: RuntimeStats,
    shutting_down: std::sync::atomic::AtomicBool,
}

impl Default for StandaloneRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl StandaloneRuntime {
    /// Creates a runtime with no registered threads.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(Rendezvous::default()),
            cond: Condvar::new(),
            roots: RootTable::new(),
            weaks: RootTable::new(),
            stats: RuntimeStats::new(),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Strong roots.
    #[must_use]
    pub fn roots(&self) -> &RootTable {
        &self.roots
    }

    /// Roots `obj` strongly.
    #[must_use]
    pub fn root(&self, obj: ObjectRef) -> RootHandle {
        self.roots.root(obj)
    }

    /// Registers a weak reference to `obj`; the slot is cleared when the
    /// referent dies.
    #[must_use]
    pub fn weak(&self, obj: ObjectRef) -> RootHandle {
        self.weaks.root(obj)
    }

    /// Marks the runtime as shutting down.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Registers the current thread as a mutator until the guard drops.
    /// Scopes nest.
    #[must_use]
    pub fn mutator_scope(&self) -> MutatorScope<'_> {
        let first = self.with_entry(|entry| {
            entry.depth += 1;
            entry.depth == 1
        });
        if first {
            let mut state = self.state.lock();
            while state.suspender.is_some() {
                self.cond.wait(&mut state);
            }
            state.active += 1;
        }
        MutatorScope { runtime: self }
    }

    fn with_entry<R>(&self, f: impl FnOnce(&mut ThreadEntry) -> R) -> R {
        ENTRIES.with(|entries| {
            let mut entries = entries.borrow_mut();
            let index = match entries.iter().position(|e| e.runtime == self.id) {
                Some(index) => index,
                None => {
                    entries.push(ThreadEntry {
                        runtime: self.id,
                        depth: 0,
                        blocked: 0,
                    });
                    entries.len() - 1
                }
            };
            f(&mut entries[index])
        })
    }

    /// Returns `true` if the current thread counts toward `active`.
    fn is_running_mutator(&self) -> bool {
        self.with_entry(|entry| entry.depth > 0 && entry.blocked == 0)
    }

    fn park_until_resumed(&self, state: &mut parking_lot::MutexGuard<'_, Rendezvous>) {
        let me = thread::current().id();
        while state.suspender.is_some_and(|s| s != me) {
            self.cond.wait(state);
        }
    }

    fn exit_scope(&self) {
        let last = self.with_entry(|entry| {
            entry.depth -= 1;
            entry.depth == 0 && entry.blocked == 0
        });
        if last {
            let mut state = self.state.lock();
            state.active -= 1;
            self.cond.notify_all();
        }
    }
}

impl Runtime for StandaloneRuntime {
    fn suspend_all_mutators(&self) {
        let me = thread::current().id();
        let running = self.is_running_mutator();
        let mut state = self.state.lock();
        if state.suspender.is_some() && running {
            // Count as suspended while another thread holds the world.
            state.active -= 1;
            self.cond.notify_all();
            while state.suspender.is_some() {
                self.cond.wait(&mut state);
            }
            state.active += 1;
        }
        while state.suspender.is_some() {
            self.cond.wait(&mut state);
        }
        state.suspender = Some(me);
        while state.active > usize::from(running) {
            self.cond.wait(&mut state);
        }
    }

    fn resume_all_mutators(&self) {
        let mut state = self.state.lock();
        state.suspender = None;
        self.cond.notify_all();
    }

    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
        self.roots.visit(visitor);
    }

    fn sweep_system_weaks(&self, is_marked: &mut dyn FnMut(ObjectRef) -> Option<ObjectRef>) {
        self.weaks.sweep(is_marked);
    }

    fn enter_blocking(&self) {
        let release = self.with_entry(|entry| {
            entry.blocked += 1;
            entry.depth > 0 && entry.blocked == 1
        });
        if release {
            let mut state = self.state.lock();
            state.active -= 1;
            self.cond.notify_all();
        }
    }

    fn exit_blocking(&self) {
        let reacquire = self.with_entry(|entry| {
            entry.blocked -= 1;
            entry.depth > 0 && entry.blocked == 0
        });
        if reacquire {
            let mut state = self.state.lock();
            self.park_until_resumed(&mut state);
            state.active += 1;
        }
    }

    fn safepoint(&self) {
        if !self.is_running_mutator() {
            return;
        }
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.suspender.is_none() || state.suspender == Some(me) {
            return;
        }
        state.active -= 1;
        self.cond.notify_all();
        self.park_until_resumed(&mut state);
        state.active += 1;
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn stats(&self) -> Option<&RuntimeStats> {
        Some(&self.stats)
    }
}

/// Registration of the current thread as a mutator. See
/// [`StandaloneRuntime::mutator_scope`].
#[must_use]
pub struct MutatorScope<'a> {
    runtime: &'a StandaloneRuntime,
}

impl MutatorScope<'_> {
    /// Parks the thread if a suspension is in progress.
    pub fn safepoint(&self) {
        self.runtime.safepoint();
    }
}

impl Drop for MutatorScope<'_> {
    fn drop(&mut self) {
        self.runtime.exit_scope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_suspend_without_mutators() {
        let rt = StandaloneRuntime::new();
        let guard = ScopedSuspendAll::new(&rt);
        drop(guard);
        let _scope = rt.mutator_scope();
    }

    #[test]
    fn test_suspender_inside_scope_does_not_wait_for_itself() {
        let rt = StandaloneRuntime::new();
        let _scope = rt.mutator_scope();
        let _nested = rt.mutator_scope();
        let _guard = ScopedSuspendAll::new(&rt);
    }

    #[test]
    fn test_suspend_waits_for_safepoint() {
        let rt = Arc::new(StandaloneRuntime::new());
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let rt = Arc::clone(&rt);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let scope = rt.mutator_scope();
                while !stop.load(Ordering::Acquire) {
                    scope.safepoint();
                    thread::yield_now();
                }
            })
        };
        thread::sleep(Duration::from_millis(10));
        {
            let _guard = ScopedSuspendAll::new(&*rt);
            assert_eq!(rt.state.lock().active, 0);
        }
        stop.store(true, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn test_blocked_thread_counts_as_suspended() {
        let rt = Arc::new(StandaloneRuntime::new());
        let (tx, rx) = crossbeam::channel::bounded::<()>(0);
        let worker = {
            let rt = Arc::clone(&rt);
            thread::spawn(move || {
                let _scope = rt.mutator_scope();
                let _blocked = BlockingRegion::new(&*rt);
                rx.recv().unwrap();
            })
        };
        thread::sleep(Duration::from_millis(10));
        drop(ScopedSuspendAll::new(&*rt));
        tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_weak_sweep() {
        let rt = StandaloneRuntime::new();
        let obj = ObjectRef::from_addr(0x1000).unwrap();
        let weak = rt.weak(obj);
        rt.sweep_system_weaks(&mut |_| None);
        assert_eq!(weak.get(), None);
    }
}
