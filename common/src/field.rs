use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::card::{Card, CardId, CardMarker, CardView, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sizes {
    pub rows: u8,
    pub columns: u8,
}

impl Sizes {
    pub fn total(&self) -> usize {
        self.rows as usize * self.columns as usize
    }
}

/// One rotation request. `id` is 1-based: a row number when `is_row`,
/// a column number otherwise. `forward` shifts right (rows) or down
/// (columns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movement {
    pub is_row: bool,
    pub forward: bool,
    pub id: u8,
}

/// The card grid of the deduction game: a row-major `rows × columns`
/// array of cards, a FIFO reserve of not-yet-placed cards used to
/// backfill captured identities, and a side table of transient display
/// markers keyed by card id.
///
/// The marker table is cleared wholesale at the start of every grid
/// operation, so markers always describe exactly the latest shift,
/// interrogation or capture.
#[derive(Debug, Clone)]
pub struct Field {
    cards: Vec<Card>,
    sizes: Sizes,
    reserve: VecDeque<Card>,
    markers: HashMap<CardId, CardMarker>,
}

impl Field {
    /// `cards.len()` must equal `sizes.total()`; extra cards are
    /// truncated and a short deal is refused by the caller beforehand.
    pub fn new(cards: Vec<Card>, sizes: Sizes, reserve: VecDeque<Card>) -> Self {
        debug_assert_eq!(cards.len(), sizes.total());
        Field {
            cards,
            sizes,
            reserve,
            markers: HashMap::new(),
        }
    }

    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn card(&self, id: CardId) -> Option<&Card> {
        self.cards.iter().find(|card| card.id == id)
    }

    pub fn reserve_len(&self) -> usize {
        self.reserve.len()
    }

    pub fn views(&self) -> Vec<CardView> {
        self.cards
            .iter()
            .map(|card| CardView {
                id: card.id,
                title: card.title.clone(),
                url: card.url.clone(),
                captured: card.captured,
                marker: self.markers.get(&card.id).copied().unwrap_or_default(),
            })
            .collect()
    }

    pub fn marker(&self, id: CardId) -> CardMarker {
        self.markers.get(&id).copied().unwrap_or_default()
    }

    /// Drop all transient markers.
    pub fn unmark(&mut self) {
        self.markers.clear();
    }

    fn position_of(&self, id: CardId) -> Option<usize> {
        self.cards.iter().position(|card| card.id == id)
    }

    /// Rotate one row or column by a single step, wrapping the card
    /// that falls off the end around to the opposite end. The wrapped
    /// card is marked as teleported (with the direction opposite to
    /// the shift), every other shifted card with the shift direction.
    ///
    /// Returns false and leaves the grid untouched when the index is
    /// out of range.
    pub fn shift(&mut self, movement: Movement) -> bool {
        let rows = self.sizes.rows as usize;
        let columns = self.sizes.columns as usize;
        let id = movement.id as usize;

        let (first, last, step, direction) = if movement.is_row {
            if id < 1 || id > rows {
                return false;
            }
            let first = (id - 1) * columns;
            let last = id * columns - 1;
            let direction = if movement.forward {
                Direction::Right
            } else {
                Direction::Left
            };
            (first, last, 1, direction)
        } else {
            if id < 1 || id > columns {
                return false;
            }
            let first = id - 1;
            let last = columns * rows - 1 - (columns - id);
            let direction = if movement.forward {
                Direction::Down
            } else {
                Direction::Up
            };
            (first, last, columns, direction)
        };

        self.unmark();

        let teleported_to = if movement.forward {
            let displaced = self.cards[last].clone();
            let mut i = last;
            while i > first {
                self.cards[i] = self.cards[i - step].clone();
                i -= step;
            }
            self.cards[first] = displaced;
            first
        } else {
            let displaced = self.cards[first].clone();
            let mut i = first;
            while i < last {
                self.cards[i] = self.cards[i + step].clone();
                i += step;
            }
            self.cards[last] = displaced;
            last
        };

        let mut i = first;
        loop {
            let card_id = self.cards[i].id;
            let marker = self.markers.entry(card_id).or_default();
            if i == teleported_to {
                marker.teleported = Some(direction.opposite());
            } else {
                marker.moved = Some(direction);
            }
            if i == last {
                break;
            }
            i += step;
        }

        true
    }

    /// Indices of the up-to-9 cards in the 3×3 block centered on
    /// `index`, clipped at the grid edges. Never wraps across a row or
    /// column boundary.
    pub fn around(&self, index: usize) -> Vec<usize> {
        let rows = self.sizes.rows as usize;
        let columns = self.sizes.columns as usize;
        let row = index / columns;
        let column = index % columns;
        let mut out = Vec::with_capacity(9);
        for r in row.saturating_sub(1)..=(row + 1).min(rows - 1) {
            for c in column.saturating_sub(1)..=(column + 1).min(columns - 1) {
                out.push(r * columns + c);
            }
        }
        out
    }

    /// Ids of the non-captured cards the holder of `card_id` may
    /// legally interrogate or capture this turn.
    pub fn act_card_ids(&self, card_id: CardId) -> Vec<CardId> {
        let Some(index) = self.position_of(card_id) else {
            return Vec::new();
        };
        self.around(index)
            .into_iter()
            .map(|i| &self.cards[i])
            .filter(|card| !card.captured)
            .map(|card| card.id)
            .collect()
    }

    /// True iff `target_id` lies in the 3×3 neighborhood of
    /// `source_id`'s current position (the source cell itself counts).
    pub fn check_opportunity(&self, source_id: CardId, target_id: CardId) -> bool {
        let (Some(source), Some(target)) = (self.position_of(source_id), self.position_of(target_id))
        else {
            return false;
        };
        self.around(source).contains(&target)
    }

    /// Interrogate `card_id`: count how many cards of its neighborhood
    /// are currently held as an opponent identity, and mark the whole
    /// neighborhood as asked, recording whether anything was found.
    /// Returns None for an unknown card.
    pub fn ask(&mut self, card_id: CardId, opponent_ids: &[CardId]) -> Option<usize> {
        let index = self.position_of(card_id)?;
        self.unmark();
        let around = self.around(index);
        let hits = around
            .iter()
            .filter(|&&i| opponent_ids.contains(&self.cards[i].id))
            .count();
        for &i in &around {
            let id = self.cards[i].id;
            self.markers.entry(id).or_default().asked = Some(hits > 0);
        }
        Some(hits)
    }

    /// Resolve a capture attempt on `card_id`: the outcome is marked
    /// for display, and a true capture permanently inerts the card.
    /// Returns false for an unknown card.
    pub fn capture(&mut self, card_id: CardId, captured: bool) -> bool {
        let Some(index) = self.position_of(card_id) else {
            return false;
        };
        self.unmark();
        self.markers.entry(card_id).or_default().captured = Some(captured);
        if captured {
            let card = &mut self.cards[index];
            card.captured = true;
            card.title.clear();
            card.url.clear();
        }
        true
    }

    /// Draw the next reserve card to re-deal a caught player; None
    /// once the reserve is exhausted, in which case the player keeps
    /// no card.
    pub fn redeal(&mut self) -> Option<Card> {
        self.reserve.pop_front()
    }
}
