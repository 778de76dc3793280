//! The set of spaces a heap owns, as an immutable snapshot.
//!
//! Collections that change the layout (swapping semi-spaces, homogeneous
//! compaction, the zygote split) publish a new snapshot while mutators are
//! suspended. Everyone else works on an `Arc` of the current one.

use std::sync::Arc;

use crate::accounting::mod_union_table::ModUnionTable;
use crate::accounting::remembered_set::RememberedSet;
use crate::collector::MarkTarget;
use crate::space::{
    describe, AllocSpace, BumpPointerSpace, ImageSpace, LargeObjectSpace, MallocSpace, Space, SpaceKind, ZygoteSpace,
};

/// The pair of spaces that take ordinary allocations.
#[derive(Clone)]
pub(crate) enum MainSpaces {
    /// Semi-space family: allocations go to `bump_pointer`, survivors are
    /// copied into `temp` and the two swap roles.
    Copying {
        bump_pointer: Arc<BumpPointerSpace>,
        temp: Arc<BumpPointerSpace>,
    },
    /// Mark-sweep family: allocations go to `main`; `backup` stays empty
    /// except during homogeneous compaction.
    FreeList {
        main: Arc<MallocSpace>,
        backup: Arc<MallocSpace>,
    },
}

impl MainSpaces {
    /// The space ordinary allocations go to.
    pub fn main(&self) -> Arc<dyn AllocSpace> {
        match self {
            Self::Copying { bump_pointer, .. } => bump_pointer.clone(),
            Self::FreeList { main, .. } => main.clone(),
        }
    }

    /// The currently empty partner.
    pub fn spare(&self) -> Arc<dyn AllocSpace> {
        match self {
            Self::Copying { temp, .. } => temp.clone(),
            Self::FreeList { backup, .. } => backup.clone(),
        }
    }

    /// The same pair with roles exchanged.
    #[must_use]
    pub fn swapped(&self) -> Self {
        match self {
            Self::Copying { bump_pointer, temp } => Self::Copying {
                bump_pointer: Arc::clone(temp),
                temp: Arc::clone(bump_pointer),
            },
            Self::FreeList { main, backup } => Self::FreeList {
                main: Arc::clone(backup),
                backup: Arc::clone(main),
            },
        }
    }
}

#[derive(Clone)]
pub(crate) struct Spaces {
    pub image: Option<Arc<ImageSpace>>,
    pub zygote: Option<Arc<ZygoteSpace>>,
    pub non_moving: Arc<MallocSpace>,
    pub main: MainSpaces,
    pub large_objects: Arc<LargeObjectSpace>,
    pub non_moving_remembered_set: Option<Arc<RememberedSet>>,
    pub large_object_remembered_set: Option<Arc<RememberedSet>>,
    pub image_mod_union_table: Option<Arc<ModUnionTable>>,
    pub zygote_mod_union_table: Option<Arc<ModUnionTable>>,
}

impl Spaces {
    /// Every space, sorted by address.
    pub fn all(&self) -> Vec<&dyn Space> {
        let mut all: Vec<&dyn Space> = Vec::with_capacity(6);
        if let Some(image) = &self.image {
            all.push(image.as_ref());
        }
        if let Some(zygote) = &self.zygote {
            all.push(zygote.as_ref());
        }
        all.push(self.non_moving.as_ref());
        match &self.main {
            MainSpaces::Copying { bump_pointer, temp } => {
                all.push(bump_pointer.as_ref());
                all.push(temp.as_ref());
            }
            MainSpaces::FreeList { main, backup } => {
                all.push(main.as_ref());
                all.push(backup.as_ref());
            }
        }
        all.push(self.large_objects.as_ref());
        all.sort_by_key(|s| s.begin());
        all
    }

    /// Spaces that keep live and mark bitmaps.
    pub fn bitmap_spaces(&self) -> Vec<&dyn Space> {
        self.all()
            .into_iter()
            .filter(|s| s.bitmaps().is_some())
            .collect()
    }

    /// The space whose `[begin, limit)` holds `addr`.
    pub fn find(&self, addr: usize) -> Option<&dyn Space> {
        self.all().into_iter().find(|s| s.contains(addr))
    }

    /// Spaces that can hand out memory.
    pub fn alloc_spaces(&self) -> Vec<Arc<dyn AllocSpace>> {
        vec![
            self.non_moving.clone() as Arc<dyn AllocSpace>,
            self.main.main(),
            self.main.spare(),
            self.large_objects.clone() as Arc<dyn AllocSpace>,
        ]
    }

    /// The free-list spaces: non-moving plus the main pair of a mark-sweep
    /// heap.
    pub fn malloc_spaces(&self) -> Vec<&MallocSpace> {
        let mut spaces = vec![self.non_moving.as_ref()];
        if let MainSpaces::FreeList { main, backup } = &self.main {
            spaces.push(main.as_ref());
            spaces.push(backup.as_ref());
        }
        spaces
    }

    /// The free-list space holding `addr`.
    pub fn malloc_space_containing(&self, addr: usize) -> Option<&MallocSpace> {
        self.malloc_spaces().into_iter().find(|s| s.contains(addr))
    }

    /// Spaces whose allocations go through the allocation stack.
    pub fn allocation_stack_targets(&self) -> Vec<MarkTarget> {
        let mut targets: Vec<MarkTarget> = self
            .malloc_spaces()
            .into_iter()
            .filter_map(|s| MarkTarget::new(s))
            .collect();
        targets.extend(MarkTarget::new(self.large_objects.as_ref()));
        targets
    }

    /// Bytes held by live allocations, excluding the image and zygote.
    pub fn bytes_allocated(&self) -> usize {
        self.alloc_spaces().iter().map(|s| s.bytes_allocated()).sum()
    }

    /// Swaps live and mark bitmaps of every free-list and large-object space
    /// `filter` accepts.
    pub fn swap_bitmaps(&self, mut filter: impl FnMut(&dyn Space) -> bool) {
        for space in self.bitmap_spaces() {
            if matches!(space.kind(), SpaceKind::Malloc | SpaceKind::LargeObject) && filter(space) {
                if let Some(bitmaps) = space.bitmaps() {
                    bitmaps.swap();
                }
            }
        }
    }

    /// One line per space.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for space in self.all() {
            out.push_str(&describe(space));
            out.push('\n');
        }
        for set in [&self.non_moving_remembered_set, &self.large_object_remembered_set]
            .into_iter()
            .flatten()
        {
            out.push_str(&format!("{set:?}\n"));
        }
        for table in [&self.image_mod_union_table, &self.zygote_mod_union_table]
            .into_iter()
            .flatten()
        {
            out.push_str(&format!("{table:?}\n"));
        }
        out
    }

    pub fn dump_to_log(&self) {
        for line in self.dump().lines() {
            tracing::error!("{line}");
        }
    }
}
