use std::collections::HashMap;

use crate::address::ObjectRef;

/// Side table from an evacuated object's old address to its copy.
///
/// The from-space is left untouched while the collection runs; every lookup
/// for one address returns the same copy until the table is cleared.
#[derive(Debug, Default)]
pub struct ForwardingTable {
    entries: HashMap<usize, ObjectRef>,
}

impl ForwardingTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Where `old` was copied to, if it was.
    #[must_use]
    pub fn get(&self, old: ObjectRef) -> Option<ObjectRef> {
        self.entries.get(&old.addr()).copied()
    }

    /// Records that `old` now lives at `new`. Returns the existing copy
    /// instead if `old` was already forwarded.
    pub fn insert(&mut self, old: ObjectRef, new: ObjectRef) -> Result<(), ObjectRef> {
        match self.entries.entry(old.addr()) {
            std::collections::hash_map::Entry::Occupied(e) => Err(*e.get()),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(new);
                Ok(())
            }
        }
    }

    /// Number of forwarded objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing was forwarded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry, keeping the allocation for the next run.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
