//! Heap accounting: bitmaps, the card table, object stacks, remembered sets
//! and mod-union tables.

pub mod bitmap;
pub mod card_table;
pub mod mod_union_table;
pub mod object_stack;
pub mod remembered_set;

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::accounting::bitmap::SpaceBitmap;
use crate::accounting::card_table::{age_card, CardTable, CARD_DIRTY, CARD_SIZE};
use crate::address::ObjectRef;

/// A set of card start addresses inside one space, shared by remembered
/// sets and mod-union tables.
struct CardCache {
    begin: usize,
    end: usize,
    cards: Mutex<BTreeSet<usize>>,
}

impl CardCache {
    fn new(begin: usize, end: usize) -> Self {
        Self {
            begin,
            end,
            cards: Mutex::new(BTreeSet::new()),
        }
    }

    /// Ages the space's cards and keeps the ones that were dirty.
    fn absorb_dirty_cards(&self, card_table: &CardTable) -> usize {
        let mut cards = self.cards.lock();
        let before = cards.len();
        card_table.modify_cards_atomic(self.begin, self.end, age_card, |card, old, _| {
            if old == CARD_DIRTY {
                cards.insert(card);
            }
        });
        cards.len() - before
    }

    /// Visits the objects of every cached card and drops the cards whose
    /// objects no longer report an interesting reference.
    fn update(&self, bitmap: &SpaceBitmap, mut visit: impl FnMut(ObjectRef) -> bool) -> usize {
        let mut cards = self.cards.lock();
        let mut visited = 0;
        cards.retain(|&card| {
            let mut keep = false;
            bitmap.visit_marked_range(card, card + CARD_SIZE, |obj| {
                visited += 1;
                keep |= visit(obj);
            });
            keep
        });
        visited
    }

    fn set_all(&self) {
        let mut cards = self.cards.lock();
        let mut card = CardTable::card_begin(self.begin);
        while card < self.end {
            cards.insert(card);
            card += CARD_SIZE;
        }
    }

    fn clear(&self) {
        self.cards.lock().clear();
    }

    fn contains(&self, addr: usize) -> bool {
        self.cards.lock().contains(&CardTable::card_begin(addr))
    }

    fn len(&self) -> usize {
        self.cards.lock().len()
    }

    fn all_within(&self) -> bool {
        self.cards
            .lock()
            .iter()
            .all(|&c| c + CARD_SIZE > self.begin && c < self.end)
    }
}
