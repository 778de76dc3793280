//! Heap walks and reference verification.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::Ordering;

use tracing::{error, info};

use super::spaces::Spaces;
use super::Heap;
use crate::address::ObjectRef;
use crate::object::{load_word, Object};
use crate::runtime::ScopedSuspendAll;

/// A reference field that does not point at the start of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadReference {
    /// The object holding the field.
    pub holder: ObjectRef,
    /// Byte offset of the field in `holder`.
    pub offset: usize,
    /// The word found in the field.
    pub referent: usize,
}

impl fmt::Display for BadReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} + {} references {:#x}, which is not an object",
            self.holder, self.offset, self.referent
        )
    }
}

impl Heap {
    /// Calls `visitor` with every object in the heap, in address order,
    /// with mutators suspended. The visitor must not allocate.
    pub fn visit_objects(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        let _suspend = ScopedSuspendAll::new(self.runtime());
        for obj in self.object_starts(&self.spaces()) {
            visitor(obj);
        }
    }

    /// Checks that every reference field of every object is null or points
    /// at the start of an object. Mutators are suspended for the walk.
    ///
    /// Returns the number of objects checked.
    ///
    /// # Errors
    ///
    /// Every bad field found, each also logged.
    pub fn verify_heap(&self) -> Result<usize, Vec<BadReference>> {
        let _suspend = ScopedSuspendAll::new(self.runtime());
        let objects = self.object_starts(&self.spaces());
        let mut bad = Vec::new();
        for &holder in &objects {
            // SAFETY: a walked object start with the world stopped.
            let object = unsafe { Object::new(holder) };
            self.model.visit_references(object, &mut |offset| {
                // SAFETY: the model reports aligned fields inside the object.
                let referent = unsafe { load_word(holder.addr() + offset, Ordering::Acquire) };
                if referent == 0 {
                    return;
                }
                let valid = ObjectRef::from_addr(referent).is_some_and(|r| objects.contains(&r));
                if !valid {
                    bad.push(BadReference {
                        holder,
                        offset,
                        referent,
                    });
                }
            });
        }
        if bad.is_empty() {
            info!(objects = objects.len(), "verified heap");
            return Ok(objects.len());
        }
        for reference in &bad {
            error!("{reference}");
        }
        self.spaces().dump_to_log();
        Err(bad)
    }

    /// Every object start: the space walks plus objects still only recorded
    /// on the allocation stacks.
    fn object_starts(&self, spaces: &Spaces) -> BTreeSet<ObjectRef> {
        let mut objects = BTreeSet::new();
        for space in spaces.all() {
            space.walk(self.model(), &mut |obj| {
                objects.insert(obj);
            });
        }
        for stack in &self.alloc_stacks {
            objects.extend(stack.iter());
        }
        objects
    }
}
