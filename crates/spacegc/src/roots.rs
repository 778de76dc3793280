//! Root slots the collector can update in place.
//!
//! A moving collection rewrites every root it visits, so embedders never hold
//! a raw [`ObjectRef`] across an allocation. They hold a [`RootHandle`]
//! instead and read the current address back after any call that may
//! collect.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::ObjectRef;

#[derive(Debug, Default)]
struct Slots {
    slots: Vec<Option<ObjectRef>>,
    live: Vec<bool>,
    free: Vec<usize>,
}

impl Slots {
    fn insert(&mut self, obj: ObjectRef) -> usize {
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(obj);
            self.live[index] = true;
            index
        } else {
            self.slots.push(Some(obj));
            self.live.push(true);
            self.slots.len() - 1
        }
    }

    fn remove(&mut self, index: usize) {
        self.slots[index] = None;
        self.live[index] = false;
        self.free.push(index);
    }
}

/// A growable table of root slots shared between mutators and the collector.
#[derive(Debug, Clone, Default)]
pub struct RootTable {
    inner: Arc<Mutex<Slots>>,
}

impl RootTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Roots `obj` until the returned handle is dropped.
    #[must_use]
    pub fn root(&self, obj: ObjectRef) -> RootHandle {
        let index = self.inner.lock().insert(obj);
        RootHandle {
            table: Arc::clone(&self.inner),
            index,
        }
    }

    /// Visits every occupied slot. The visitor may rewrite the reference.
    pub fn visit(&self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
        let mut slots = self.inner.lock();
        for obj in slots.slots.iter_mut().flatten() {
            visitor(obj);
        }
    }

    /// Treats every slot as weak: `sweeper` returns the new address of a
    /// surviving referent or `None` to clear the slot.
    pub fn sweep(&self, sweeper: &mut dyn FnMut(ObjectRef) -> Option<ObjectRef>) {
        let mut slots = self.inner.lock();
        for slot in &mut slots.slots {
            if let Some(obj) = *slot {
                *slot = sweeper(obj);
            }
        }
    }

    /// Number of handles alive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().live.iter().filter(|&&l| l).count()
    }

    /// Returns `true` if no handle is alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One slot in a [`RootTable`]. The slot is released on drop.
#[derive(Debug)]
pub struct RootHandle {
    table: Arc<Mutex<Slots>>,
    index: usize,
}

impl RootHandle {
    /// Current address of the rooted object, or `None` if the slot was
    /// cleared (weak slots whose referent died, or an explicit `clear`).
    #[must_use]
    pub fn get(&self) -> Option<ObjectRef> {
        self.table.lock().slots[self.index]
    }

    /// Points the slot at `obj`.
    pub fn set(&self, obj: ObjectRef) {
        self.table.lock().slots[self.index] = Some(obj);
    }

    /// Empties the slot without releasing it.
    pub fn clear(&self) {
        self.table.lock().slots[self.index] = None;
    }
}

impl Drop for RootHandle {
    fn drop(&mut self) {
        self.table.lock().remove(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_addr(addr).unwrap()
    }

    #[test]
    fn test_root_and_drop() {
        let table = RootTable::new();
        let a = table.root(obj(0x1000));
        let b = table.root(obj(0x2000));
        assert_eq!(table.len(), 2);
        drop(a);
        assert_eq!(table.len(), 1);
        assert_eq!(b.get(), Some(obj(0x2000)));
    }

    #[test]
    fn test_slots_are_reused() {
        let table = RootTable::new();
        let a = table.root(obj(0x1000));
        drop(a);
        let b = table.root(obj(0x3000));
        assert_eq!(b.get(), Some(obj(0x3000)));
        assert_eq!(table.inner.lock().slots.len(), 1);
    }

    #[test]
    fn test_visit_rewrites() {
        let table = RootTable::new();
        let a = table.root(obj(0x1000));
        table.visit(&mut |r| *r = obj(r.addr() + 0x100));
        assert_eq!(a.get(), Some(obj(0x1100)));
    }

    #[test]
    fn test_sweep_clears_dead() {
        let table = RootTable::new();
        let a = table.root(obj(0x1000));
        let b = table.root(obj(0x2000));
        table.sweep(&mut |o| (o.addr() == 0x2000).then_some(o));
        assert_eq!(a.get(), None);
        assert_eq!(b.get(), Some(obj(0x2000)));
        assert_eq!(table.len(), 2);
    }
}
