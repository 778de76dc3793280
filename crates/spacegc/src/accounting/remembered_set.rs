//! Remembered sets for spaces outside the semi-space pair.
//!
//! A remembered set belongs to one non-moving or large-object space and
//! records which of its cards hold references into the bump-pointer space.
//! A from-space-only collection uses it as an extra root set instead of
//! scanning the whole owning space.

use crate::accounting::bitmap::SpaceBitmap;
use crate::accounting::card_table::CardTable;
use crate::accounting::CardCache;
use crate::address::ObjectRef;

/// Cards of one space that reference the moving space.
pub struct RememberedSet {
    name: String,
    cache: CardCache,
}

impl RememberedSet {
    /// Creates an empty set for the space spanning `[begin, end)`.
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

    /// Moves the space's dirty cards into the set and ages them in the card
    /// table. Returns the number of newly remembered cards.
    pub fn clear_cards(&self, card_table: &CardTable) -> usize {
        self.cache.absorb_dirty_cards(card_table)
    }

    /// Visits every live object on a remembered card. `visit` updates the
    /// object's references and returns `true` if it still references the
    /// target space; cards with no such object are dropped.
    pub fn update_and_mark(&self, live: &SpaceBitmap, visit: impl FnMut(ObjectRef) -> bool) -> usize {
        self.cache.update(live, visit)
    }

    /// Returns `true` if the card holding `addr` is remembered.
    #[must_use]
    pub fn contains_card(&self, addr: usize) -> bool {
        self.cache.contains(addr)
    }

    /// Number of remembered cards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns `true` if no card is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Panics
    ///
    /// Panics if a remembered card lies outside the owning space.
    pub fn assert_all_dirty_cards_within_space(&self) {
        assert!(
            self.cache.all_within(),
            "remembered set {} holds a card outside its space",
            self.name
        );
    }
}

impl std::fmt::Debug for RememberedSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RememberedSet")
            .field("name", &self.name)
            .field("cards", &self.len())
            .finish()
    }
}
