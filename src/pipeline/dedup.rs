//! Deck-wide duplicate detection.
//!
//! Two cards are duplicates when their type and their question/answer text
//! match after lowercasing and trimming. `extra` and tags are ignored, so a
//! repeated fact with different hints is still removed.

use crate::model::{Card, CardId, CardKind, CardStatus};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    kind: CardKind,
    front: String,
    back: String,
    cloze_text: String,
}

impl DedupKey {
    fn of(card: &Card) -> Self {
        let norm = |s: Option<&str>| s.unwrap_or("").trim().to_lowercase();
        Self {
            kind: card.kind(),
            front: norm(card.content.front()),
            back: norm(card.content.back()),
            cloze_text: norm(card.content.cloze_text()),
        }
    }
}

/// Ids of `ok` cards that repeat an earlier `ok` card.
///
/// `cards` must be in scan order (source index, then creation order); the
/// first occurrence of each key survives. Cards in any other status are
/// skipped and never count as the surviving copy.
pub fn duplicate_card_ids(cards: &[Card]) -> Vec<CardId> {
    let mut seen = HashSet::new();
    cards
        .iter()
        .filter(|c| c.status == CardStatus::Ok)
        .filter(|c| !seen.insert(DedupKey::of(c)))
        .map(|c| c.id)
        .collect()
}
