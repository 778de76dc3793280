//! Mod-union tables for rarely collected spaces.
//!
//! The image and zygote spaces are almost never written after they are
//! created. Rather than scanning them each collection, their dirty cards are
//! folded into a card cache; the collector visits only the objects on cached
//! cards and prunes cards that no longer reference collectible spaces.

use crate::accounting::bitmap::SpaceBitmap;
use crate::accounting::card_table::CardTable;
use crate::accounting::CardCache;
use crate::address::ObjectRef;

/// A card cache for one immune-capable space.
pub struct ModUnionTable {
    name: String,
    cache: CardCache,
}

impl ModUnionTable {
    /// Creates an empty table for the space spanning `[begin, end)`.
    #[must_use]
    pub fn new(name: impl Into<String>, begin: usize, end: usize) -> Self {
        Self {
            name: name.into(),
            cache: CardCache::new(begin, end),
        }
    }

    /// Name of the owning space.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Folds the space's dirty cards into the table and ages them in the
    /// card table. Returns the number of newly cached cards.
    pub fn process_cards(&self, card_table: &CardTable) -> usize {
        self.cache.absorb_dirty_cards(card_table)
    }

    /// Visits every live object on a cached card. `visit` updates and marks
    /// the object's references and returns `true` if any still points into
    /// a collectible space; other cards are dropped.
    pub fn update_and_mark_references(
        &self,
        live: &SpaceBitmap,
        visit: impl FnMut(ObjectRef) -> bool,
    ) -> usize {
        self.cache.update(live, visit)
    }

    /// Caches every card of the space, forcing one full scan.
    pub fn set_cards(&self) {
        self.cache.set_all();
    }

    /// Forgets every cached card.
    pub fn clear_table(&self) {
        self.cache.clear();
    }

    /// Returns `true` if the card holding `addr` is cached.
    #[must_use]
    pub fn contains_card(&self, addr: usize) -> bool {
        self.cache.contains(addr)
    }

    /// Number of cached cards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns `true` if no card is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ModUnionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModUnionTable")
            .field("name", &self.name)
            .field("cards", &self.len())
            .finish()
    }
}
