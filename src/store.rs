//! Persistence port for decks, sources, cards and generation runs.
//!
//! [`DeckStore`] is the only way the generator touches state, so a database
//! adapter can replace [`MemoryDeckStore`] without changing pipeline code.
//! The in-memory adapter backs the CLI and the tests.

use crate::error::StoreError;
use crate::model::{
    Card, CardId, CardKind, CardStatus, Deck, DeckId, DeckStatus, GenerationRun, NewCard, NewDeck,
    NewRun, NewSource, Source, SourceId,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Narrowing for [`DeckStore::list_cards`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardFilter {
    /// Case-insensitive substring of front, back or cloze text.
    pub text: Option<String>,
    pub kind: Option<CardKind>,
    pub status: Option<CardStatus>,
}

impl CardFilter {
    pub fn with_status(status: CardStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, card: &Card) -> bool {
        if self.kind.is_some_and(|k| k != card.kind()) {
            return false;
        }
        if self.status.is_some_and(|s| s != card.status) {
            return false;
        }
        match self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            None => true,
            Some(needle) => {
                let needle = needle.to_lowercase();
                [card.content.front(), card.content.back(), card.content.cloze_text()]
                    .into_iter()
                    .flatten()
                    .any(|field| field.to_lowercase().contains(&needle))
            }
        }
    }
}

#[async_trait]
pub trait DeckStore: Send + Sync {
    async fn create_deck(&self, deck: NewDeck) -> Result<Deck, StoreError>;

    async fn get_deck(&self, id: DeckId) -> Result<Deck, StoreError>;

    /// Overwrite a deck; `updated_at` is stamped by the store.
    async fn update_deck(&self, deck: &Deck) -> Result<Deck, StoreError>;

    /// Remove a deck with its sources, cards and runs.
    async fn delete_deck(&self, id: DeckId) -> Result<(), StoreError>;

    async fn list_decks(&self) -> Result<Vec<Deck>, StoreError>;

    /// Remove every source, card and run of a deck ahead of a fresh run.
    async fn clear_generation(&self, deck_id: DeckId) -> Result<(), StoreError>;

    async fn insert_sources(
        &self,
        deck_id: DeckId,
        sources: Vec<NewSource>,
    ) -> Result<Vec<Source>, StoreError>;

    async fn get_source(&self, id: SourceId) -> Result<Source, StoreError>;

    /// Sources of a deck ordered by `idx`.
    async fn list_sources(&self, deck_id: DeckId) -> Result<Vec<Source>, StoreError>;

    async fn insert_cards(&self, cards: Vec<NewCard>) -> Result<Vec<Card>, StoreError>;

    async fn get_card(&self, id: CardId) -> Result<Card, StoreError>;

    /// Overwrite a card; `updated_at` is stamped by the store.
    async fn update_card(&self, card: &Card) -> Result<Card, StoreError>;

    /// Cards of a deck in creation order.
    async fn list_cards(
        &self,
        deck_id: DeckId,
        filter: &CardFilter,
    ) -> Result<Vec<Card>, StoreError>;

    /// Returns how many cards were removed.
    async fn delete_cards_for_source(&self, source_id: SourceId) -> Result<usize, StoreError>;

    async fn record_run(&self, run: NewRun) -> Result<GenerationRun, StoreError>;

    /// Runs of a deck in the order they were recorded.
    async fn list_runs(&self, deck_id: DeckId) -> Result<Vec<GenerationRun>, StoreError>;
}

// ── In-memory adapter ────────────────────────────────────────────────────

#[derive(Debug)]
struct Table<T> {
    rows: BTreeMap<u64, T>,
    next_id: u64,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl<T> Table<T> {
    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[derive(Debug, Default)]
struct Tables {
    decks: Table<Deck>,
    sources: Table<Source>,
    cards: Table<Card>,
    runs: Table<GenerationRun>,
}

/// [`DeckStore`] kept in process memory. Ids start at 1 per table.
#[derive(Debug, Default)]
pub struct MemoryDeckStore {
    tables: RwLock<Tables>,
}

impl MemoryDeckStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(entity: &'static str, id: u64) -> StoreError {
    StoreError::NotFound { entity, id }
}

#[async_trait]
impl DeckStore for MemoryDeckStore {
    async fn create_deck(&self, deck: NewDeck) -> Result<Deck, StoreError> {
        let mut t = self.tables.write().await;
        let now = Utc::now();
        let id = t.decks.allocate();
        let deck = Deck {
            id,
            title: deck.title,
            card_style: deck.card_style,
            status: DeckStatus::Draft,
            source_text: deck.source_text,
            source_kind: deck.source_kind,
            settings: deck.settings,
            created_at: now,
            updated_at: now,
        };
        t.decks.rows.insert(id, deck.clone());
        Ok(deck)
    }

    async fn get_deck(&self, id: DeckId) -> Result<Deck, StoreError> {
        let t = self.tables.read().await;
        t.decks.rows.get(&id).cloned().ok_or_else(|| not_found("Deck", id))
    }

    async fn update_deck(&self, deck: &Deck) -> Result<Deck, StoreError> {
        let mut t = self.tables.write().await;
        let slot = t.decks.rows.get_mut(&deck.id).ok_or_else(|| not_found("Deck", deck.id))?;
        *slot = Deck {
            updated_at: Utc::now(),
            ..deck.clone()
        };
        Ok(slot.clone())
    }

    async fn delete_deck(&self, id: DeckId) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        t.decks.rows.remove(&id).ok_or_else(|| not_found("Deck", id))?;
        t.sources.rows.retain(|_, s| s.deck_id != id);
        t.cards.rows.retain(|_, c| c.deck_id != id);
        t.runs.rows.retain(|_, r| r.deck_id != id);
        Ok(())
    }

    async fn list_decks(&self) -> Result<Vec<Deck>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.decks.rows.values().cloned().collect())
    }

    async fn clear_generation(&self, deck_id: DeckId) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        if !t.decks.rows.contains_key(&deck_id) {
            return Err(not_found("Deck", deck_id));
        }
        t.sources.rows.retain(|_, s| s.deck_id != deck_id);
        t.cards.rows.retain(|_, c| c.deck_id != deck_id);
        t.runs.rows.retain(|_, r| r.deck_id != deck_id);
        Ok(())
    }

    async fn insert_sources(
        &self,
        deck_id: DeckId,
        sources: Vec<NewSource>,
    ) -> Result<Vec<Source>, StoreError> {
        let mut t = self.tables.write().await;
        if !t.decks.rows.contains_key(&deck_id) {
            return Err(not_found("Deck", deck_id));
        }
        let mut out = Vec::with_capacity(sources.len());
        for s in sources {
            let id = t.sources.allocate();
            let source = Source {
                id,
                deck_id,
                idx: s.idx,
                title: s.title,
                text: s.text,
                hash: s.hash,
            };
            t.sources.rows.insert(id, source.clone());
            out.push(source);
        }
        Ok(out)
    }

    async fn get_source(&self, id: SourceId) -> Result<Source, StoreError> {
        let t = self.tables.read().await;
        t.sources.rows.get(&id).cloned().ok_or_else(|| not_found("Source", id))
    }

    async fn list_sources(&self, deck_id: DeckId) -> Result<Vec<Source>, StoreError> {
        let t = self.tables.read().await;
        let mut sources: Vec<Source> = t
            .sources
            .rows
            .values()
            .filter(|s| s.deck_id == deck_id)
            .cloned()
            .collect();
        sources.sort_by_key(|s| (s.idx, s.id));
        Ok(sources)
    }

    async fn insert_cards(&self, cards: Vec<NewCard>) -> Result<Vec<Card>, StoreError> {
        let mut t = self.tables.write().await;
        let now = Utc::now();
        let mut out = Vec::with_capacity(cards.len());
        for c in cards {
            if !t.decks.rows.contains_key(&c.deck_id) {
                return Err(not_found("Deck", c.deck_id));
            }
            let id = t.cards.allocate();
            let card = Card {
                id,
                deck_id: c.deck_id,
                source_id: c.source_id,
                content: c.content,
                tags: c.tags,
                status: c.status,
                created_at: now,
                updated_at: now,
            };
            t.cards.rows.insert(id, card.clone());
            out.push(card);
        }
        Ok(out)
    }

    async fn get_card(&self, id: CardId) -> Result<Card, StoreError> {
        let t = self.tables.read().await;
        t.cards.rows.get(&id).cloned().ok_or_else(|| not_found("Card", id))
    }

    async fn update_card(&self, card: &Card) -> Result<Card, StoreError> {
        let mut t = self.tables.write().await;
        let slot = t.cards.rows.get_mut(&card.id).ok_or_else(|| not_found("Card", card.id))?;
        *slot = Card {
            updated_at: Utc::now(),
            ..card.clone()
        };
        Ok(slot.clone())
    }

    async fn list_cards(
        &self,
        deck_id: DeckId,
        filter: &CardFilter,
    ) -> Result<Vec<Card>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.cards
            .rows
            .values()
            .filter(|c| c.deck_id == deck_id && filter.matches(c))
            .cloned()
            .collect())
    }

    async fn delete_cards_for_source(&self, source_id: SourceId) -> Result<usize, StoreError> {
        let mut t = self.tables.write().await;
        let before = t.cards.rows.len();
        t.cards.rows.retain(|_, c| c.source_id != Some(source_id));
        Ok(before - t.cards.rows.len())
    }

    async fn record_run(&self, run: NewRun) -> Result<GenerationRun, StoreError> {
        let mut t = self.tables.write().await;
        let id = t.runs.allocate();
        let run = GenerationRun {
            id,
            deck_id: run.deck_id,
            source_id: run.source_id,
            model: run.model,
            prompt_version: run.prompt_version,
            input_tokens: run.input_tokens,
            output_tokens: run.output_tokens,
            cost_estimate: run.cost_estimate,
            request: run.request,
            response_text: run.response_text,
            parsed: run.parsed,
            error: run.error,
            created_at: Utc::now(),
        };
        t.runs.rows.insert(id, run.clone());
        Ok(run)
    }

    async fn list_runs(&self, deck_id: DeckId) -> Result<Vec<GenerationRun>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.runs.rows.values().filter(|r| r.deck_id == deck_id).cloned().collect())
    }
}
