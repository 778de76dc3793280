//! Bounded stacks of object addresses.
//!
//! Used for the allocation stack (mutators push lock-free), the live stack
//! (the allocation stack frozen at a collection boundary) and the mark stack
//! (collector-private, grows by doubling).

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::address::ObjectRef;

/// A stack of object addresses.
///
/// Slots below `growth_limit` are available to [`atomic_push`](Self::atomic_push);
/// the slots between `growth_limit` and `capacity` are a reserve for pushes
/// that must not fail.
pub struct ObjectStack {
    name: &'static str,
    slots: Box<[AtomicUsize]>,
    top: AtomicUsize,
    growth_limit: usize,
}

fn new_slots(capacity: usize) -> Box<[AtomicUsize]> {
    (0..capacity).map(|_| AtomicUsize::new(0)).collect()
}

impl ObjectStack {
    /// Creates a stack with `growth_limit` usable slots plus `reserve`.
    #[must_use]
    pub fn new(name: &'static str, growth_limit: usize, reserve: usize) -> Self {
        Self {
            name,
            slots: new_slots(growth_limit + reserve),
            top: AtomicUsize::new(0),
            growth_limit,
        }
    }

    /// Name used in diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Pushes from any thread. Returns `false` when the growth limit is hit.
    pub fn atomic_push(&self, obj: ObjectRef) -> bool {
        self.push_bounded(obj, self.growth_limit)
    }

    /// Pushes into the reserve. Returns `false` only if the whole capacity
    /// is exhausted.
    pub fn atomic_push_ignore_growth_limit(&self, obj: ObjectRef) -> bool {
        self.push_bounded(obj, self.slots.len())
    }

    fn push_bounded(&self, obj: ObjectRef, bound: usize) -> bool {
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            if top >= bound {
                return false;
            }
            match self
                .top
                .compare_exchange_weak(top, top + 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => top = actual,
            }
        }
        self.slots[top].store(obj.addr(), Ordering::Release);
        true
    }

    /// Single-owner push that doubles the stack when full.
    pub fn push(&mut self, obj: ObjectRef) {
        let top = *self.top.get_mut();
        if top == self.slots.len() {
            let grown = new_slots((self.slots.len() * 2).max(16));
            for (dst, src) in grown.iter().zip(self.slots.iter()) {
                dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
            }
            self.growth_limit = grown.len();
            self.slots = grown;
        }
        self.slots[top].store(obj.addr(), Ordering::Relaxed);
        *self.top.get_mut() = top + 1;
    }

    /// Single-owner pop.
    pub fn pop(&mut self) -> Option<ObjectRef> {
        let top = self.top.get_mut();
        loop {
            if *top == 0 {
                return None;
            }
            *top -= 1;
            // A racing atomic push may have reserved a slot it had not yet
            // filled when ownership was taken; such slots read as null.
            if let Some(obj) = ObjectRef::from_addr(self.slots[*top].swap(0, Ordering::Relaxed)) {
                return Some(obj);
            }
        }
    }

    /// Empties the stack.
    pub fn reset(&self) {
        let top = self.top.swap(0, Ordering::AcqRel);
        for slot in &self.slots[..top.min(self.slots.len())] {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// Number of pushed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.top.load(Ordering::Acquire).min(self.slots.len())
    }

    /// Returns `true` if nothing has been pushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the growth limit is reached.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.growth_limit
    }

    /// Slots available below the growth limit.
    #[must_use]
    pub const fn growth_limit(&self) -> usize {
        self.growth_limit
    }

    /// Iterates the pushed entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.slots[..self.len()]
            .iter()
            .filter_map(|slot| ObjectRef::from_addr(slot.load(Ordering::Acquire)))
    }

    /// Linear search, for verification only.
    #[must_use]
    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.iter().any(|o| o == obj)
    }
}

impl std::fmt::Debug for ObjectStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStack")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("growth_limit", &self.growth_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn obj(i: usize) -> ObjectRef {
        ObjectRef::from_addr(0x1000 + i * 8).unwrap()
    }

    #[test]
    fn test_atomic_push_respects_growth_limit() {
        let stack = ObjectStack::new("alloc", 4, 2);
        for i in 0..4 {
            assert!(stack.atomic_push(obj(i)));
        }
        assert!(stack.is_full());
        assert!(!stack.atomic_push(obj(4)));
        assert!(stack.atomic_push_ignore_growth_limit(obj(4)));
        assert!(stack.atomic_push_ignore_growth_limit(obj(5)));
        assert!(!stack.atomic_push_ignore_growth_limit(obj(6)));
        assert_eq!(stack.len(), 6);
        assert!(stack.contains(obj(5)));
    }

    #[test]
    fn test_push_doubles() {
        let mut stack = ObjectStack::new("mark", 2, 0);
        for i in 0..100 {
            stack.push(obj(i));
        }
        assert_eq!(stack.len(), 100);
        assert_eq!(stack.pop(), Some(obj(99)));
        let mut n = 1;
        while stack.pop().is_some() {
            n += 1;
        }
        assert_eq!(n, 100);
    }

    #[test]
    fn test_reset_and_iter_order() {
        let stack = ObjectStack::new("live", 8, 0);
        stack.atomic_push(obj(1));
        stack.atomic_push(obj(2));
        assert_eq!(stack.iter().collect::<Vec<_>>(), vec![obj(1), obj(2)]);
        stack.reset();
        assert!(stack.is_empty());
        assert_eq!(stack.iter().count(), 0);
    }

    #[test]
    fn test_concurrent_pushes_are_all_recorded() {
        let stack = Arc::new(ObjectStack::new("alloc", 4000, 0));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    for i in 0..1000 {
                        assert!(stack.atomic_push(obj(t * 1000 + i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut all: Vec<_> = stack.iter().map(ObjectRef::addr).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
