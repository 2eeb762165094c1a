//! Deck generation: drive the pipeline over a deck's chunks and persist the
//! results.
//!
//! [`DeckGenerator`] owns the gateway, the store and the configuration. A
//! full run walks the chunks in order; the first chunk that fails stops the
//! run, marks the deck `failed` and records `"Chunk N: <message>"` as its
//! `last_error`. Cards the quality filter rejects are stored as `deleted`
//! with `validation:*` tags rather than dropped, so nothing disappears
//! silently.
//!
//! Besides full generation the generator serves the per-card operations of
//! a deck editor: regenerating one chunk, rewriting a card with the model,
//! manual edits, bulk status and tag changes, and card queries.

use crate::config::{Credentials, GenerationConfig};
use crate::error::{ClassifiedError, DeckGenError};
use crate::model::{
    Card, CardContent, CardId, CardStatus, Deck, DeckId, DeckSettings, DeckStatus, NewCard, NewDeck,
    NewRun, NewSource, Source, SourceId,
};
use crate::pipeline::chunk::{chunk_text, hash_text};
use crate::pipeline::dedup::duplicate_card_ids;
use crate::pipeline::gateway::{ChatRequest, LlmGateway, Usage};
use crate::pipeline::normalize::prepare_source_text;
use crate::pipeline::quality::{
    apply_validation_tags, dedup_tags, is_valid_cloze, normalize_content, normalize_math,
    normalize_text, tagify, validation_issues,
};
use crate::pipeline::schema::{extract_json, parse_cards_with_correction};
use crate::prompts::{chunk_messages, improve_messages, PROMPT_VERSION};
use crate::store::{CardFilter, DeckStore};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

// ── Results ──────────────────────────────────────────────────────────────

/// Summary of a successful [`DeckGenerator::generate_deck`] run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationReport {
    pub deck_id: DeckId,
    pub chunks: usize,
    /// Every stored card, whatever its status.
    pub cards_created: usize,
    /// Cards still `ok` after filtering and dedupe.
    pub ok_cards: usize,
    /// Cards the quality filter rejected.
    pub auto_deleted: usize,
    pub duplicates_removed: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_estimate: Option<f64>,
    pub duration_ms: u64,
}

/// Cards produced for one chunk, ready to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutcome {
    pub cards: Vec<NewCard>,
    /// How many of `cards` were rejected by the quality filter.
    pub auto_deleted: usize,
    pub usage: Usage,
}

/// Result of processing one chunk plus the run record to persist either way.
#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub run: NewRun,
    pub outcome: Result<ChunkOutcome, ClassifiedError>,
}

/// Snapshot for polling a deck while it generates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationProgress {
    pub deck_id: DeckId,
    pub status: DeckStatus,
    pub total_chunks: usize,
    /// `min(runs, chunks)`: a chunk counts as done once its run is recorded.
    pub completed_chunks: usize,
    pub last_error: Option<String>,
    pub auto_deleted_cards: Option<usize>,
}

/// A manual change to a card. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardEdit {
    pub front: Option<String>,
    pub back: Option<String>,
    pub cloze_text: Option<String>,
    pub extra: Option<String>,
    pub tags: Option<Vec<String>>,
}

// ── Generator ────────────────────────────────────────────────────────────

pub struct DeckGenerator {
    gateway: Arc<dyn LlmGateway>,
    store: Arc<dyn DeckStore>,
    config: GenerationConfig,
}

impl std::fmt::Debug for DeckGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeckGenerator")
            .field("gateway", &"<dyn LlmGateway>")
            .field("store", &"<dyn DeckStore>")
            .field("config", &self.config)
            .finish()
    }
}

impl DeckGenerator {
    pub fn new(
        gateway: Arc<dyn LlmGateway>,
        store: Arc<dyn DeckStore>,
        config: GenerationConfig,
    ) -> Self {
        Self { gateway, store, config }
    }

    pub fn store(&self) -> &Arc<dyn DeckStore> {
        &self.store
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub async fn create_deck(&self, deck: NewDeck) -> Result<Deck, DeckGenError> {
        let deck = self.store.create_deck(deck).await?;
        info!("Created deck {} '{}'", deck.id, deck.title);
        Ok(deck)
    }

    /// Replace a deck's focus, exclude, glossary and chunk budget ahead of a
    /// run. Diagnostics from the previous run are kept.
    pub async fn update_settings(
        &self,
        deck_id: DeckId,
        settings: DeckSettings,
    ) -> Result<Deck, DeckGenError> {
        let mut deck = self.store.get_deck(deck_id).await?;
        deck.settings = DeckSettings {
            last_error: deck.settings.last_error.take(),
            auto_deleted_cards: deck.settings.auto_deleted_cards.take(),
            ..settings
        };
        Ok(self.store.update_deck(&deck).await?)
    }

    // ── Full generation ──────────────────────────────────────────────────

    /// Generate all cards for a deck, replacing any earlier run.
    ///
    /// Once the deck is `processing`, any error ends with the deck `failed`
    /// and the error text in `last_error`, including store failures.
    ///
    /// # Errors
    /// [`DeckGenError::GenerationFailed`] when a chunk fails, or the store
    /// error that interrupted the run.
    pub async fn generate_deck(
        &self,
        deck_id: DeckId,
        credentials: &Credentials,
    ) -> Result<GenerationReport, DeckGenError> {
        let start = Instant::now();

        // ── Step 1: Reset deck state ─────────────────────────────────────
        let mut deck = self.store.get_deck(deck_id).await?;
        deck.status = DeckStatus::Processing;
        deck.settings.last_error = None;
        deck.settings.auto_deleted_cards = None;
        deck = self.store.update_deck(&deck).await?;
        info!("Generating deck {} '{}'", deck_id, deck.title);

        match self.run_generation(&mut deck, credentials, start).await {
            Ok(report) => Ok(report),
            Err(e) => {
                let message = match &e {
                    DeckGenError::GenerationFailed { error, .. } => error.to_string(),
                    other => other.to_string(),
                };
                error!("Deck {} failed: {}", deck_id, message);
                deck.status = DeckStatus::Failed;
                deck.settings.last_error = Some(message);
                if let Err(store_err) = self.store.update_deck(&deck).await {
                    error!("Deck {}: could not record failure: {}", deck_id, store_err);
                }
                Err(e)
            }
        }
    }

    /// Steps 2 to 4 of [`Self::generate_deck`]. Leaves the failed state to
    /// the caller.
    async fn run_generation(
        &self,
        deck: &mut Deck,
        credentials: &Credentials,
        start: Instant,
    ) -> Result<GenerationReport, DeckGenError> {
        let deck_id = deck.id;
        self.store.clear_generation(deck_id).await?;

        // ── Step 2: Normalise and chunk ──────────────────────────────────
        let text = prepare_source_text(&deck.source_text, deck.source_kind);
        let max_chars = deck.settings.max_chars.unwrap_or(self.config.max_chunk_chars);
        let chunks = chunk_text(&text, max_chars);
        if chunks.is_empty() {
            warn!("Deck {}: no text left after cleaning", deck_id);
        }

        let new_sources = chunks
            .into_iter()
            .enumerate()
            .map(|(idx, chunk)| NewSource {
                idx,
                hash: hash_text(&chunk.text),
                title: chunk.title,
                text: chunk.text,
            })
            .collect();
        let sources = self.store.insert_sources(deck_id, new_sources).await?;
        let total = sources.len();
        debug!("Deck {}: {} chunks of ≤{} chars", deck_id, total, max_chars);

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_generation_start(deck_id, total);
        }

        // ── Step 3: Process chunks in order ──────────────────────────────
        let mut report = GenerationReport {
            deck_id,
            chunks: total,
            ..GenerationReport::default()
        };
        let mut usage = Usage::default();

        for source in &sources {
            let chunk_num = source.idx + 1;
            if let Some(ref cb) = self.config.progress_callback {
                cb.on_chunk_start(chunk_num, total);
            }
            info!("Deck {}: chunk {}/{}", deck_id, chunk_num, total);

            let chunk = self.process_chunk(deck, source, credentials).await;
            self.store.record_run(chunk.run).await?;

            match chunk.outcome {
                Ok(outcome) => {
                    usage = usage.merge(outcome.usage);
                    report.auto_deleted += outcome.auto_deleted;
                    let stored = self.store.insert_cards(outcome.cards).await?;
                    report.cards_created += stored.len();
                    if let Some(ref cb) = self.config.progress_callback {
                        cb.on_chunk_complete(chunk_num, total, stored.len());
                    }
                }
                Err(err) => {
                    warn!("Deck {}: {} ({})", deck_id, err, err.detail);
                    if let Some(ref cb) = self.config.progress_callback {
                        cb.on_chunk_error(chunk_num, total, &err.message);
                    }
                    return Err(DeckGenError::GenerationFailed { deck_id, error: err });
                }
            }
        }

        // ── Step 4: Dedupe and finish ────────────────────────────────────
        report.duplicates_removed = self.dedupe_deck(deck_id).await?;
        report.ok_cards = self
            .store
            .list_cards(deck_id, &CardFilter::with_status(CardStatus::Ok))
            .await?
            .len();

        deck.settings.auto_deleted_cards = (report.auto_deleted > 0).then_some(report.auto_deleted);
        deck.status = DeckStatus::Ready;
        self.store.update_deck(deck).await?;

        report.input_tokens = usage.prompt_tokens.unwrap_or(0);
        report.output_tokens = usage.completion_tokens.unwrap_or(0);
        report.cost_estimate = usage.total_cost;
        report.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Deck {} ready: {} ok cards, {} auto-deleted, {} duplicates, {}ms",
            deck_id,
            report.ok_cards,
            report.auto_deleted,
            report.duplicates_removed,
            report.duration_ms
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_generation_complete(deck_id, report.ok_cards, report.auto_deleted);
        }

        Ok(report)
    }

    /// Run one chunk through prompt, gateway, schema and quality checks.
    ///
    /// Nothing is persisted here; the returned run record describes the
    /// attempt whether it succeeded or not.
    pub async fn process_chunk(
        &self,
        deck: &Deck,
        source: &Source,
        credentials: &Credentials,
    ) -> ChunkReport {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: chunk_messages(
                source.title.as_deref(),
                &source.text,
                &deck.settings,
                deck.card_style,
                self.config.system_prompt.as_deref(),
            ),
            temperature: self.config.temperature,
        };
        let mut run = self.new_run(deck.id, Some(source.id), &request);
        let policy = self.config.retry_policy();

        let response = match self.gateway.chat(&request, credentials, &policy).await {
            Ok(response) => response,
            Err(e) => {
                let err = ClassifiedError::from_gateway(&e).for_chunk(source.idx);
                run.error = Some(err.to_string());
                return ChunkReport {
                    run,
                    outcome: Err(err),
                };
            }
        };
        run.response_text = Some(response.content.clone());

        let parsed = match parse_cards_with_correction(
            &response.content,
            self.gateway.as_ref(),
            &self.config.model,
            credentials,
            &policy,
        )
        .await
        {
            Ok(parsed) => parsed,
            Err(e) => {
                let err = ClassifiedError::from_schema(&e).for_chunk(source.idx);
                let usage = response.usage;
                run.input_tokens = usage.prompt_tokens;
                run.output_tokens = usage.completion_tokens;
                run.cost_estimate = usage.total_cost;
                run.error = Some(err.to_string());
                return ChunkReport {
                    run,
                    outcome: Err(err),
                };
            }
        };

        let usage = match parsed.correction_usage {
            Some(extra) => response.usage.merge(extra),
            None => response.usage,
        };
        run.input_tokens = usage.prompt_tokens;
        run.output_tokens = usage.completion_tokens;
        run.cost_estimate = usage.total_cost;
        run.parsed = Some(parsed.parsed);

        let mut auto_deleted = 0;
        let cards = parsed
            .cards
            .into_iter()
            .map(|draft| {
                let content = normalize_content(&draft.content);
                let issues = validation_issues(&content, &source.text, &self.config.scope);
                let mut tags = draft.tags;
                tags.push(format!("section:{}", source.idx + 1));
                if let Some(title) = source.title.as_deref().map(tagify).filter(|t| !t.is_empty()) {
                    tags.push(format!("title:{title}"));
                }
                let status = if issues.is_empty() {
                    CardStatus::Ok
                } else {
                    auto_deleted += 1;
                    let names: Vec<&str> = issues.iter().map(|i| i.as_str()).collect();
                    warn!("Chunk {}: card rejected ({})", source.idx + 1, names.join(", "));
                    CardStatus::Deleted
                };
                NewCard {
                    deck_id: deck.id,
                    source_id: Some(source.id),
                    content,
                    tags: apply_validation_tags(&tags, &issues),
                    status,
                }
            })
            .collect::<Vec<_>>();

        debug!(
            "Chunk {}: {} cards, {} rejected, {:?} in / {:?} out tokens",
            source.idx + 1,
            cards.len(),
            auto_deleted,
            usage.prompt_tokens,
            usage.completion_tokens
        );

        ChunkReport {
            run,
            outcome: Ok(ChunkOutcome {
                cards,
                auto_deleted,
                usage,
            }),
        }
    }

    fn new_run(
        &self,
        deck_id: DeckId,
        source_id: Option<SourceId>,
        request: &ChatRequest,
    ) -> NewRun {
        NewRun {
            deck_id,
            source_id,
            model: request.model.clone(),
            prompt_version: PROMPT_VERSION.to_string(),
            input_tokens: None,
            output_tokens: None,
            cost_estimate: None,
            request: serde_json::to_value(request).unwrap_or_default(),
            response_text: None,
            parsed: None,
            error: None,
        }
    }

    /// Delete later copies of repeated `ok` cards. Returns how many went.
    async fn dedupe_deck(&self, deck_id: DeckId) -> Result<usize, DeckGenError> {
        let source_order: HashMap<SourceId, usize> = self
            .store
            .list_sources(deck_id)
            .await?
            .into_iter()
            .map(|s| (s.id, s.idx))
            .collect();
        let mut cards = self.store.list_cards(deck_id, &CardFilter::default()).await?;
        cards.sort_by_key(|c| {
            let idx = c.source_id.and_then(|id| source_order.get(&id).copied());
            (idx.unwrap_or(usize::MAX), c.id)
        });

        let duplicates = duplicate_card_ids(&cards);
        for id in &duplicates {
            if let Some(card) = cards.iter().find(|c| c.id == *id) {
                let mut card = card.clone();
                card.status = CardStatus::Deleted;
                self.store.update_card(&card).await?;
            }
        }
        if !duplicates.is_empty() {
            info!("Deck {}: removed {} duplicate cards", deck_id, duplicates.len());
        }
        Ok(duplicates.len())
    }

    // ── Single-chunk and single-card operations ──────────────────────────

    /// Replace the cards of one chunk with a fresh generation.
    ///
    /// The old cards are removed first. On failure a failed run is recorded
    /// and the deck's status is left alone.
    pub async fn regenerate_source(
        &self,
        source_id: SourceId,
        credentials: &Credentials,
    ) -> Result<Vec<Card>, DeckGenError> {
        let source = self.store.get_source(source_id).await?;
        let deck = self.store.get_deck(source.deck_id).await?;

        let removed = self.store.delete_cards_for_source(source_id).await?;
        info!(
            "Regenerating chunk {} of deck {} ({} old cards removed)",
            source.idx + 1,
            deck.id,
            removed
        );

        let chunk = self.process_chunk(&deck, &source, credentials).await;
        self.store.record_run(chunk.run).await?;
        match chunk.outcome {
            Ok(outcome) => Ok(self.store.insert_cards(outcome.cards).await?),
            Err(err) => {
                error!("Regeneration of chunk {} failed: {}", source.idx + 1, err);
                Err(DeckGenError::Chunk(err))
            }
        }
    }

    /// Regenerate every chunk the given cards came from, in chunk order.
    pub async fn regenerate_cards(
        &self,
        card_ids: &[CardId],
        credentials: &Credentials,
    ) -> Result<Vec<Card>, DeckGenError> {
        let mut source_ids = BTreeSet::new();
        for id in card_ids {
            if let Some(source_id) = self.store.get_card(*id).await?.source_id {
                source_ids.insert(source_id);
            }
        }
        let mut created = Vec::new();
        for source_id in source_ids {
            created.extend(self.regenerate_source(source_id, credentials).await?);
        }
        Ok(created)
    }

    /// Ask the model to rewrite a card for clarity, in place.
    ///
    /// Fields the model leaves out or blank keep their old value. A cloze
    /// card whose new text has no valid deletion goes to `needs_review`.
    pub async fn improve_card(
        &self,
        card_id: CardId,
        credentials: &Credentials,
    ) -> Result<Card, DeckGenError> {
        let mut card = self.store.get_card(card_id).await?;
        self.store.get_deck(card.deck_id).await?;

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: improve_messages(&card.content, self.config.system_prompt.as_deref()),
            temperature: self.config.temperature,
        };
        let mut run = self.new_run(card.deck_id, card.source_id, &request);

        let result = match self
            .gateway
            .chat(&request, credentials, &self.config.retry_policy())
            .await
        {
            Ok(response) => {
                run.input_tokens = response.usage.prompt_tokens;
                run.output_tokens = response.usage.completion_tokens;
                run.cost_estimate = response.usage.total_cost;
                run.response_text = Some(response.content.clone());
                extract_json(&response.content).map_err(|e| ClassifiedError::from_schema(&e))
            }
            Err(e) => Err(ClassifiedError::from_gateway(&e)),
        };

        let data = match result {
            Ok(data) => data,
            Err(err) => {
                run.error = Some(err.to_string());
                self.store.record_run(run).await?;
                warn!("Improving card {} failed: {}", card_id, err);
                return Err(DeckGenError::Chunk(err));
            }
        };

        card.content = improved_content(&card.content, &data);
        if let CardContent::Cloze { ref text, .. } = card.content {
            if !is_valid_cloze(text) {
                card.status = CardStatus::NeedsReview;
            }
        }
        run.parsed = Some(data);
        self.store.record_run(run).await?;

        debug!("Improved card {}", card_id);
        Ok(self.store.update_card(&card).await?)
    }

    /// Apply a manual edit. Text is trimmed but not otherwise rewritten.
    ///
    /// A card left without a valid question (blank basic side, cloze text
    /// with no deletion) goes to `needs_review`; a valid edit of a card in
    /// review returns it to `ok`. Deleted cards stay deleted.
    pub async fn edit_card(&self, card_id: CardId, edit: CardEdit) -> Result<Card, DeckGenError> {
        let mut card = self.store.get_card(card_id).await?;
        let set = |target: &mut String, value: Option<String>| {
            if let Some(v) = value {
                *target = v.trim().to_string();
            }
        };

        let valid = match card.content {
            CardContent::Basic {
                ref mut front,
                ref mut back,
            } => {
                set(front, edit.front);
                set(back, edit.back);
                !front.is_empty() && !back.is_empty()
            }
            CardContent::Cloze {
                ref mut text,
                ref mut extra,
            } => {
                set(text, edit.cloze_text);
                set(extra, edit.extra);
                is_valid_cloze(text)
            }
        };
        if let Some(tags) = edit.tags {
            card.tags = dedup_tags(tags);
        }

        card.status = match (card.status, valid) {
            (CardStatus::Deleted, _) => CardStatus::Deleted,
            (_, false) => CardStatus::NeedsReview,
            (_, true) => CardStatus::Ok,
        };
        Ok(self.store.update_card(&card).await?)
    }

    /// Bulk delete or restore. Returns how many cards changed.
    pub async fn set_card_status(
        &self,
        card_ids: &[CardId],
        status: CardStatus,
    ) -> Result<usize, DeckGenError> {
        let mut changed = 0;
        for id in card_ids {
            let mut card = self.store.get_card(*id).await?;
            if card.status != status {
                card.status = status;
                self.store.update_card(&card).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Bulk-add a tag. Blank tags are ignored.
    pub async fn add_tag(&self, card_ids: &[CardId], tag: &str) -> Result<usize, DeckGenError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Ok(0);
        }
        let mut changed = 0;
        for id in card_ids {
            let mut card = self.store.get_card(*id).await?;
            if !card.tags.iter().any(|t| t == tag) {
                card.tags.push(tag.to_string());
                self.store.update_card(&card).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn generation_progress(
        &self,
        deck_id: DeckId,
    ) -> Result<GenerationProgress, DeckGenError> {
        let deck = self.store.get_deck(deck_id).await?;
        let total_chunks = self.store.list_sources(deck_id).await?.len();
        let runs = self.store.list_runs(deck_id).await?.len();
        Ok(GenerationProgress {
            deck_id,
            status: deck.status,
            total_chunks,
            completed_chunks: runs.min(total_chunks),
            last_error: deck.settings.last_error,
            auto_deleted_cards: deck.settings.auto_deleted_cards,
        })
    }

    pub async fn query_cards(
        &self,
        deck_id: DeckId,
        filter: &CardFilter,
    ) -> Result<Vec<Card>, DeckGenError> {
        self.store.get_deck(deck_id).await?;
        Ok(self.store.list_cards(deck_id, filter).await?)
    }
}

/// Merge a rewrite reply into existing card content.
fn improved_content(old: &CardContent, data: &Value) -> CardContent {
    let pick = |key: &str, current: &str| -> String {
        let value = data
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(current);
        normalize_math(&normalize_text(value))
    };
    match old {
        CardContent::Basic { front, back } => CardContent::Basic {
            front: pick("front", front),
            back: pick("back", back),
        },
        CardContent::Cloze { text, extra } => CardContent::Cloze {
            text: pick("cloze_text", text),
            extra: pick("extra", extra),
        },
    }
}
