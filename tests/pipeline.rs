//! Integration tests for edgequake-deckgen.
//!
//! Generation runs against a scripted [`LlmGateway`] that replays canned
//! replies, or against `HttpGateway` talking to an in-process TCP stub. No
//! test touches the network.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use edgequake_deckgen::model::{GenerationRun, NewCard, NewRun, NewSource};
use edgequake_deckgen::pipeline::gateway::{ChatRequest, ChatResponse, Usage};
use edgequake_deckgen::{
    export_to_file, AnkiTextExporter, Card, CardContent, CardEdit, CardFilter, CardId, CardKind,
    CardStatus, Credentials, Deck, DeckGenError, DeckGenerator, DeckId, DeckSettings, DeckStatus,
    DeckStore, ErrorKind, GatewayError, GenerationConfig, GenerationQueue, HttpGateway, JobState,
    LlmGateway, MemoryDeckStore, NewDeck, RetryPolicy, Source, SourceId, StoreError,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ── Test helpers ─────────────────────────────────────────────────────────────

const CELL_TEXT: &str = "Mitochondria are organelles that produce ATP through cellular respiration.\n\n\
The inner membrane of mitochondria is folded into cristae, which increase surface area.\n\n\
Ribosomes synthesize proteins by translating messenger RNA.";

/// Two short paragraphs that land in separate chunks at an 80-char budget.
const PLANT_TEXT: &str = "Photosynthesis converts light energy into chemical energy in chloroplasts.\n\n\
Chloroplasts contain chlorophyll, which absorbs light for photosynthesis.";

fn cell_cards_json() -> String {
    json!({
        "cards": [
            {"type": "basic", "front": "What do mitochondria produce?", "back": "ATP through cellular respiration", "tags": ["bio"]},
            {"type": "cloze", "cloze_text": "The inner membrane of mitochondria is folded into {{c1::cristae}}.", "extra": ""},
            {"type": "cloze", "cloze_text": "Ribosomes synthesize proteins", "extra": ""}
        ]
    })
    .to_string()
}

fn plant_card_json() -> String {
    json!({
        "cards": [
            {"type": "basic", "front": "Where does photosynthesis happen?", "back": "In chloroplasts"}
        ]
    })
    .to_string()
}

fn http_error(status: u16, detail: &str) -> GatewayError {
    GatewayError::Http {
        status,
        code: None,
        detail: detail.into(),
        attempts: 1,
    }
}

/// Replays queued replies in order and records every request.
#[derive(Default)]
struct ScriptedGateway {
    replies: Mutex<VecDeque<Result<String, GatewayError>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedGateway {
    fn new(replies: Vec<Result<String, GatewayError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::default(),
        })
    }

    fn push(&self, reply: Result<String, GatewayError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn chat(
        &self,
        request: &ChatRequest,
        _credentials: &Credentials,
        _policy: &RetryPolicy,
    ) -> Result<ChatResponse, GatewayError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(GatewayError::Connection {
                detail: "script exhausted".into(),
                attempts: 1,
            })
        });
        reply.map(|content| ChatResponse {
            content,
            usage: Usage {
                prompt_tokens: Some(100),
                completion_tokens: Some(40),
                total_cost: Some(0.001),
            },
            model: Some("test/model".into()),
            raw: serde_json::Value::Null,
        })
    }
}

fn setup(gateway: Arc<ScriptedGateway>) -> (DeckGenerator, Arc<MemoryDeckStore>) {
    let config = GenerationConfig::builder()
        .model("test/model")
        .max_retries(0)
        .build()
        .unwrap();
    let store = Arc::new(MemoryDeckStore::new());
    (DeckGenerator::new(gateway, store.clone(), config), store)
}

fn creds() -> Credentials {
    Credentials::new("sk-test")
}

fn plant_deck() -> NewDeck {
    NewDeck::new("Plants", PLANT_TEXT).settings(DeckSettings {
        max_chars: Some(80),
        ..DeckSettings::default()
    })
}

// ── Full generation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_three_paragraphs_generate_and_export() {
    let gateway = ScriptedGateway::new(vec![Ok(cell_cards_json())]);
    let (generator, store) = setup(gateway.clone());
    let deck = generator.create_deck(NewDeck::new("Cell Biology", CELL_TEXT)).await.unwrap();
    assert_eq!(deck.status, DeckStatus::Draft);

    let report = generator.generate_deck(deck.id, &creds()).await.unwrap();
    assert_eq!(report.chunks, 1);
    assert_eq!(report.cards_created, 3);
    assert_eq!(report.ok_cards, 2);
    assert_eq!(report.auto_deleted, 1);
    assert_eq!(report.duplicates_removed, 0);
    assert_eq!(report.input_tokens, 100);
    assert_eq!(report.output_tokens, 40);
    assert_eq!(gateway.requests().len(), 1);

    let deck = store.get_deck(deck.id).await.unwrap();
    assert_eq!(deck.status, DeckStatus::Ready);
    assert_eq!(deck.settings.auto_deleted_cards, Some(1));
    assert_eq!(deck.settings.last_error, None);

    let cards = store.list_cards(deck.id, &CardFilter::default()).await.unwrap();
    assert_eq!(cards.len(), 3);
    assert_eq!(cards[0].status, CardStatus::Ok);
    assert_eq!(cards[0].tags, vec!["bio", "section:1"]);
    assert_eq!(cards[1].status, CardStatus::Ok);
    assert_eq!(cards[2].status, CardStatus::Deleted);
    assert!(cards[2].tags.contains(&"validation:invalid_cloze".to_string()));
    assert!(cards[2].tags.contains(&"auto_deleted".to_string()));

    let sources = store.list_sources(deck.id).await.unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].hash.len(), 64);
    let runs = store.list_runs(deck.id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].source_id, Some(sources[0].id));
    assert!(runs[0].parsed.is_some());
    assert_eq!(runs[0].error, None);

    let dir = tempfile::tempdir().unwrap();
    let path = export_to_file(store.as_ref(), deck.id, &AnkiTextExporter, dir.path())
        .await
        .unwrap();
    assert_eq!(path.file_name().unwrap(), format!("cell_biology_{}.txt", deck.id).as_str());
    let exported = std::fs::read_to_string(&path).unwrap();
    let notes: Vec<&str> = exported.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(notes.len(), 2);
    assert!(notes[0].starts_with("Basic\tWhat do mitochondria produce?"));
    assert!(notes[1].starts_with("Cloze\t"));
    assert!(!exported.contains("Ribosomes"));
}

#[tokio::test]
async fn test_invalid_output_gets_one_correction() {
    let gateway = ScriptedGateway::new(vec![
        Ok("Sure! Here are your cards.".into()),
        Ok(cell_cards_json()),
    ]);
    let (generator, store) = setup(gateway.clone());
    let deck = generator.create_deck(NewDeck::new("Cells", CELL_TEXT)).await.unwrap();

    let report = generator.generate_deck(deck.id, &creds()).await.unwrap();
    assert_eq!(report.ok_cards, 2);
    assert_eq!(report.input_tokens, 200);

    let requests = gateway.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].temperature, 0.0);
    assert!(requests[1].messages.iter().any(|m| m.content.contains("Sure! Here are your cards.")));

    let runs = store.list_runs(deck.id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].input_tokens, Some(200));
}

#[tokio::test]
async fn test_second_failure_after_correction_fails_deck() {
    let gateway = ScriptedGateway::new(vec![Ok("nope".into()), Ok("still nope".into())]);
    let (generator, store) = setup(gateway);
    let deck = generator.create_deck(NewDeck::new("Cells", CELL_TEXT)).await.unwrap();

    let err = generator.generate_deck(deck.id, &creds()).await.unwrap_err();
    match err {
        DeckGenError::GenerationFailed { error, .. } => {
            assert_eq!(error.kind, ErrorKind::InvalidOutput)
        }
        other => panic!("unexpected {other:?}"),
    }
    let deck = store.get_deck(deck.id).await.unwrap();
    assert_eq!(deck.status, DeckStatus::Failed);
    assert!(deck.settings.last_error.unwrap().starts_with("Chunk 1:"));
}

#[tokio::test]
async fn test_failing_chunk_stops_generation() {
    let gateway = ScriptedGateway::new(vec![
        Ok(plant_card_json()),
        Err(http_error(401, "invalid key")),
    ]);
    let (generator, store) = setup(gateway.clone());
    let deck = generator.create_deck(plant_deck()).await.unwrap();

    let err = generator.generate_deck(deck.id, &creds()).await.unwrap_err();
    match err {
        DeckGenError::GenerationFailed { deck_id, error } => {
            assert_eq!(deck_id, deck.id);
            assert_eq!(error.kind, ErrorKind::Auth);
            assert_eq!(error.chunk, Some(2));
        }
        other => panic!("unexpected {other:?}"),
    }

    let deck = store.get_deck(deck.id).await.unwrap();
    assert_eq!(deck.status, DeckStatus::Failed);
    let last_error = deck.settings.last_error.clone().unwrap();
    assert!(last_error.starts_with("Chunk 2: Authentication failed"), "got: {last_error}");

    let progress = generator.generation_progress(deck.id).await.unwrap();
    assert_eq!(progress.status, DeckStatus::Failed);
    assert_eq!(progress.total_chunks, 2);
    assert_eq!(progress.completed_chunks, 2);
    assert_eq!(progress.last_error, Some(last_error));

    // Cards from the first chunk are kept.
    let cards = store.list_cards(deck.id, &CardFilter::default()).await.unwrap();
    assert_eq!(cards.len(), 1);
    let runs = store.list_runs(deck.id).await.unwrap();
    assert!(runs[1].error.as_deref().unwrap().contains("Chunk 2"));
}

#[tokio::test]
async fn test_duplicates_across_chunks_keep_first() {
    let gateway = ScriptedGateway::new(vec![Ok(plant_card_json()), Ok(plant_card_json())]);
    let (generator, store) = setup(gateway);
    let deck = generator.create_deck(plant_deck()).await.unwrap();

    let report = generator.generate_deck(deck.id, &creds()).await.unwrap();
    assert_eq!(report.chunks, 2);
    assert_eq!(report.cards_created, 2);
    assert_eq!(report.duplicates_removed, 1);
    assert_eq!(report.ok_cards, 1);
    assert_eq!(report.auto_deleted, 0);

    let sources = store.list_sources(deck.id).await.unwrap();
    let ok = store
        .list_cards(deck.id, &CardFilter::with_status(CardStatus::Ok))
        .await
        .unwrap();
    assert_eq!(ok[0].source_id, Some(sources[0].id));
    let deck = store.get_deck(deck.id).await.unwrap();
    assert_eq!(deck.settings.auto_deleted_cards, None);
}

#[tokio::test]
async fn test_rerun_replaces_previous_generation() {
    let gateway = ScriptedGateway::new(vec![Ok(cell_cards_json()), Ok(cell_cards_json())]);
    let (generator, store) = setup(gateway);
    let deck = generator.create_deck(NewDeck::new("Cells", CELL_TEXT)).await.unwrap();

    generator.generate_deck(deck.id, &creds()).await.unwrap();
    generator.generate_deck(deck.id, &creds()).await.unwrap();

    assert_eq!(store.list_sources(deck.id).await.unwrap().len(), 1);
    assert_eq!(store.list_cards(deck.id, &CardFilter::default()).await.unwrap().len(), 3);
    assert_eq!(store.list_runs(deck.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_deck() {
    let (generator, _store) = setup(ScriptedGateway::new(vec![]));
    let err = generator.generate_deck(42, &creds()).await.unwrap_err();
    assert!(matches!(err, DeckGenError::DeckNotFound(42)));
}

/// Delegates to [`MemoryDeckStore`] but fails every `insert_cards` call.
#[derive(Default)]
struct DiskFullStore {
    inner: MemoryDeckStore,
}

#[async_trait]
impl DeckStore for DiskFullStore {
    async fn create_deck(&self, deck: NewDeck) -> Result<Deck, StoreError> {
        self.inner.create_deck(deck).await
    }

    async fn get_deck(&self, id: DeckId) -> Result<Deck, StoreError> {
        self.inner.get_deck(id).await
    }

    async fn update_deck(&self, deck: &Deck) -> Result<Deck, StoreError> {
        self.inner.update_deck(deck).await
    }

    async fn delete_deck(&self, id: DeckId) -> Result<(), StoreError> {
        self.inner.delete_deck(id).await
    }

    async fn list_decks(&self) -> Result<Vec<Deck>, StoreError> {
        self.inner.list_decks().await
    }

    async fn clear_generation(&self, deck_id: DeckId) -> Result<(), StoreError> {
        self.inner.clear_generation(deck_id).await
    }

    async fn insert_sources(
        &self,
        deck_id: DeckId,
        sources: Vec<NewSource>,
    ) -> Result<Vec<Source>, StoreError> {
        self.inner.insert_sources(deck_id, sources).await
    }

    async fn get_source(&self, id: SourceId) -> Result<Source, StoreError> {
        self.inner.get_source(id).await
    }

    async fn list_sources(&self, deck_id: DeckId) -> Result<Vec<Source>, StoreError> {
        self.inner.list_sources(deck_id).await
    }

    async fn insert_cards(&self, _cards: Vec<NewCard>) -> Result<Vec<Card>, StoreError> {
        Err(StoreError::Backend("disk full".into()))
    }

    async fn get_card(&self, id: CardId) -> Result<Card, StoreError> {
        self.inner.get_card(id).await
    }

    async fn update_card(&self, card: &Card) -> Result<Card, StoreError> {
        self.inner.update_card(card).await
    }

    async fn list_cards(
        &self,
        deck_id: DeckId,
        filter: &CardFilter,
    ) -> Result<Vec<Card>, StoreError> {
        self.inner.list_cards(deck_id, filter).await
    }

    async fn delete_cards_for_source(&self, source_id: SourceId) -> Result<usize, StoreError> {
        self.inner.delete_cards_for_source(source_id).await
    }

    async fn record_run(&self, run: NewRun) -> Result<GenerationRun, StoreError> {
        self.inner.record_run(run).await
    }

    async fn list_runs(&self, deck_id: DeckId) -> Result<Vec<GenerationRun>, StoreError> {
        self.inner.list_runs(deck_id).await
    }
}

#[tokio::test]
async fn test_store_failure_mid_run_fails_deck() {
    let gateway = ScriptedGateway::new(vec![Ok(cell_cards_json())]);
    let store = Arc::new(DiskFullStore::default());
    let config = GenerationConfig::builder()
        .model("test/model")
        .max_retries(0)
        .build()
        .unwrap();
    let generator = DeckGenerator::new(gateway, store.clone(), config);
    let deck = generator.create_deck(NewDeck::new("Cells", CELL_TEXT)).await.unwrap();

    let err = generator.generate_deck(deck.id, &creds()).await.unwrap_err();
    assert!(matches!(err, DeckGenError::Store(StoreError::Backend(_))));

    let deck = store.get_deck(deck.id).await.unwrap();
    assert_eq!(deck.status, DeckStatus::Failed);
    assert!(deck.settings.last_error.unwrap().contains("disk full"));

    let progress = generator.generation_progress(deck.id).await.unwrap();
    assert_eq!(progress.status, DeckStatus::Failed);
    assert_eq!(progress.completed_chunks, 1);
}

// ── Single-chunk and single-card operations ──────────────────────────────────

#[tokio::test]
async fn test_regenerate_source_replaces_its_cards() {
    let gateway = ScriptedGateway::new(vec![Ok(cell_cards_json())]);
    let (generator, store) = setup(gateway.clone());
    let deck = generator.create_deck(NewDeck::new("Cells", CELL_TEXT)).await.unwrap();
    generator.generate_deck(deck.id, &creds()).await.unwrap();
    let source = store.list_sources(deck.id).await.unwrap().remove(0);

    gateway.push(Ok(json!({
        "cards": [{"type": "basic", "front": "What are cristae?", "back": "Folds of the inner mitochondrial membrane"}]
    })
    .to_string()));
    let created = generator.regenerate_source(source.id, &creds()).await.unwrap();
    assert_eq!(created.len(), 1);

    let cards = store.list_cards(deck.id, &CardFilter::default()).await.unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].content.front(), Some("What are cristae?"));
    assert_eq!(store.list_runs(deck.id).await.unwrap().len(), 2);

    // A failed regeneration leaves the deck status alone.
    gateway.push(Err(http_error(503, "overloaded")));
    let err = generator.regenerate_source(source.id, &creds()).await.unwrap_err();
    match err {
        DeckGenError::Chunk(e) => assert_eq!(e.kind, ErrorKind::Unavailable),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(store.get_deck(deck.id).await.unwrap().status, DeckStatus::Ready);
    assert_eq!(store.list_runs(deck.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_regenerate_cards_by_id() {
    let gateway = ScriptedGateway::new(vec![Ok(plant_card_json()), Ok(plant_card_json())]);
    let (generator, store) = setup(gateway.clone());
    let deck = generator.create_deck(plant_deck()).await.unwrap();
    generator.generate_deck(deck.id, &creds()).await.unwrap();
    let first = store.list_cards(deck.id, &CardFilter::default()).await.unwrap().remove(0);

    gateway.push(Ok(plant_card_json()));
    let created = generator.regenerate_cards(&[first.id, first.id], &creds()).await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(gateway.requests().len(), 3);
}

#[tokio::test]
async fn test_improve_card() {
    let gateway = ScriptedGateway::new(vec![Ok(cell_cards_json())]);
    let (generator, store) = setup(gateway.clone());
    let deck = generator.create_deck(NewDeck::new("Cells", CELL_TEXT)).await.unwrap();
    generator.generate_deck(deck.id, &creds()).await.unwrap();
    let card = store.list_cards(deck.id, &CardFilter::default()).await.unwrap().remove(0);

    gateway.push(Ok(
        r#"{"front": "What do mitochondria make through respiration?", "back": "ATP"}"#.into(),
    ));
    let improved = generator.improve_card(card.id, &creds()).await.unwrap();
    assert_eq!(
        improved.content,
        CardContent::Basic {
            front: "What do mitochondria make through respiration?".into(),
            back: "ATP".into(),
        }
    );
    assert_eq!(improved.status, CardStatus::Ok);
    assert_eq!(store.list_runs(deck.id).await.unwrap().len(), 2);

    gateway.push(Err(http_error(429, "Insufficient credits")));
    let err = generator.improve_card(card.id, &creds()).await.unwrap_err();
    match err {
        DeckGenError::Chunk(e) => assert_eq!(e.kind, ErrorKind::QuotaExhausted),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(store.get_card(card.id).await.unwrap().content, improved.content);
}

#[tokio::test]
async fn test_improve_cloze_without_deletion_needs_review() {
    let gateway = ScriptedGateway::new(vec![Ok(cell_cards_json())]);
    let (generator, store) = setup(gateway.clone());
    let deck = generator.create_deck(NewDeck::new("Cells", CELL_TEXT)).await.unwrap();
    generator.generate_deck(deck.id, &creds()).await.unwrap();
    let cloze = store.list_cards(deck.id, &CardFilter::default()).await.unwrap().remove(1);

    gateway.push(Ok(r#"{"cloze_text": "The inner membrane is folded into cristae."}"#.into()));
    let improved = generator.improve_card(cloze.id, &creds()).await.unwrap();
    assert_eq!(improved.status, CardStatus::NeedsReview);
}

#[tokio::test]
async fn test_edit_card_status_rules() {
    let gateway = ScriptedGateway::new(vec![Ok(cell_cards_json())]);
    let (generator, store) = setup(gateway);
    let deck = generator.create_deck(NewDeck::new("Cells", CELL_TEXT)).await.unwrap();
    generator.generate_deck(deck.id, &creds()).await.unwrap();
    let cards = store.list_cards(deck.id, &CardFilter::default()).await.unwrap();
    let (cloze, deleted) = (&cards[1], &cards[2]);

    let edited = generator
        .edit_card(
            cloze.id,
            CardEdit {
                cloze_text: Some("no deletion here".into()),
                ..CardEdit::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.status, CardStatus::NeedsReview);

    let edited = generator
        .edit_card(
            cloze.id,
            CardEdit {
                cloze_text: Some("  {{c1::Cristae}} increase surface area  ".into()),
                tags: Some(vec!["mito".into(), "mito".into(), " ".into()]),
                ..CardEdit::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.status, CardStatus::Ok);
    assert_eq!(edited.content.cloze_text(), Some("{{c1::Cristae}} increase surface area"));
    assert_eq!(edited.tags, vec!["mito"]);

    let still_deleted = generator
        .edit_card(
            deleted.id,
            CardEdit {
                cloze_text: Some("{{c1::Ribosomes}} synthesize proteins".into()),
                ..CardEdit::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(still_deleted.status, CardStatus::Deleted);

    let err = generator.edit_card(999, CardEdit::default()).await.unwrap_err();
    assert!(matches!(err, DeckGenError::CardNotFound(999)));
}

#[tokio::test]
async fn test_bulk_operations_and_queries() {
    let gateway = ScriptedGateway::new(vec![Ok(cell_cards_json())]);
    let (generator, store) = setup(gateway);
    let deck = generator.create_deck(NewDeck::new("Cells", CELL_TEXT)).await.unwrap();
    generator.generate_deck(deck.id, &creds()).await.unwrap();
    let ids: Vec<u64> = store
        .list_cards(deck.id, &CardFilter::default())
        .await
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();

    assert_eq!(generator.add_tag(&ids, "exam").await.unwrap(), 3);
    assert_eq!(generator.add_tag(&ids, "exam").await.unwrap(), 0);
    assert_eq!(generator.add_tag(&ids, "   ").await.unwrap(), 0);

    let found = generator
        .query_cards(
            deck.id,
            &CardFilter {
                text: Some("CRISTAE".into()),
                ..CardFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].tags.contains(&"exam".to_string()));

    let cloze = generator
        .query_cards(
            deck.id,
            &CardFilter {
                kind: Some(CardKind::Cloze),
                status: Some(CardStatus::Ok),
                ..CardFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cloze.len(), 1);

    // Restore the auto-deleted card, then delete everything.
    assert_eq!(generator.set_card_status(&ids[2..], CardStatus::Ok).await.unwrap(), 1);
    assert_eq!(generator.set_card_status(&ids, CardStatus::Deleted).await.unwrap(), 3);
    assert_eq!(generator.set_card_status(&ids, CardStatus::Deleted).await.unwrap(), 0);

    let dir = tempfile::tempdir().unwrap();
    let err = export_to_file(store.as_ref(), deck.id, &AnkiTextExporter, dir.path())
        .await
        .unwrap_err();
    assert!(matches!(err, DeckGenError::NothingToExport { .. }));

    assert!(matches!(
        generator.query_cards(77, &CardFilter::default()).await.unwrap_err(),
        DeckGenError::DeckNotFound(77)
    ));
}

// ── Job queue ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_generation_queue_runs_jobs() {
    let gateway = ScriptedGateway::new(vec![
        Ok(cell_cards_json()),
        Err(http_error(401, "bad key")),
    ]);
    let (generator, _store) = setup(gateway);
    let generator = Arc::new(generator);
    let first = generator.create_deck(NewDeck::new("One", CELL_TEXT)).await.unwrap();
    let second = generator.create_deck(NewDeck::new("Two", CELL_TEXT)).await.unwrap();

    let queue = GenerationQueue::start(generator.clone(), 4);
    let job_a = queue.start_generation(first.id, creds()).await.unwrap();
    let job_b = queue.start_generation(second.id, creds()).await.unwrap();

    let done = queue.wait(job_a).await.unwrap();
    assert_eq!(done.state, JobState::Done);
    assert_eq!(done.deck_id, first.id);
    assert_eq!(done.report.unwrap().ok_cards, 2);

    let failed = queue.wait(job_b).await.unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.error.unwrap().contains("Chunk 1"));

    let forgotten = queue.forget(job_a).await.unwrap();
    assert_eq!(forgotten.state, JobState::Done);
    assert!(queue.job_state(job_a).await.is_none());
    assert!(queue.forget(job_a).await.is_none());
    assert_eq!(queue.prune_finished().await, 1);
    assert!(queue.job_state(job_b).await.is_none());

    assert!(matches!(
        queue.start_generation(999, creds()).await.unwrap_err(),
        DeckGenError::DeckNotFound(999)
    ));
    assert!(queue.job_state(uuid::Uuid::new_v4()).await.is_none());
    queue.shutdown().await;
}

// ── HTTP gateway against a local stub ────────────────────────────────────────

/// Serve `replies` in order (the last one repeats) and count requests.
async fn spawn_stub(replies: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let (status, body) = replies[n.min(replies.len() - 1)].clone();
            tokio::spawn(async move {
                if read_request(&mut stream).await.is_err() {
                    return;
                }
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (format!("http://{addr}/api/v1/chat/completions"), hits)
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let body_len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < end + 4 + body_len {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            return Ok(());
        }
    }
}

fn completion_body(content: &str) -> String {
    json!({
        "model": "test/model",
        "choices": [{"message": {"role": "assistant", "content": content}}],
        "usage": {"prompt_tokens": 321, "completion_tokens": 123, "cost": 0.002}
    })
    .to_string()
}

fn http_setup(url: &str) -> (DeckGenerator, Arc<MemoryDeckStore>) {
    let config = GenerationConfig::builder()
        .api_url(url)
        .max_retries(2)
        .retry_backoff_ms(10)
        .api_timeout_secs(5)
        .build()
        .unwrap();
    let store = Arc::new(MemoryDeckStore::new());
    let gateway = Arc::new(HttpGateway::new(url));
    (DeckGenerator::new(gateway, store.clone(), config), store)
}

#[tokio::test]
async fn test_insufficient_credits_fails_without_retry() {
    let body = json!({
        "error": {"message": "Insufficient credits. Add more to continue.", "code": 429}
    })
    .to_string();
    let (url, hits) = spawn_stub(vec![(429, body)]).await;
    let (generator, store) = http_setup(&url);
    let deck = generator.create_deck(NewDeck::new("Cells", CELL_TEXT)).await.unwrap();

    let err = generator.generate_deck(deck.id, &creds()).await.unwrap_err();
    match err {
        DeckGenError::GenerationFailed { error, .. } => {
            assert_eq!(error.kind, ErrorKind::QuotaExhausted)
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let deck = store.get_deck(deck.id).await.unwrap();
    assert_eq!(deck.status, DeckStatus::Failed);
    let last_error = deck.settings.last_error.unwrap().to_lowercase();
    assert!(last_error.contains("credits") || last_error.contains("quota"), "got: {last_error}");
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let (url, hits) = spawn_stub(vec![
        (503, r#"{"error": {"message": "upstream overloaded"}}"#.into()),
        (200, completion_body(&cell_cards_json())),
    ])
    .await;
    let (generator, store) = http_setup(&url);
    let deck = generator.create_deck(NewDeck::new("Cells", CELL_TEXT)).await.unwrap();

    let report = generator.generate_deck(deck.id, &creds()).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(report.ok_cards, 2);
    assert_eq!(report.input_tokens, 321);
    assert_eq!(report.output_tokens, 123);
    assert_eq!(report.cost_estimate, Some(0.002));

    let runs = store.list_runs(deck.id).await.unwrap();
    assert_eq!(runs[0].request["model"], GenerationConfig::default().model);
}

#[tokio::test]
async fn test_missing_api_key_never_hits_the_network() {
    let (url, hits) = spawn_stub(vec![(200, completion_body("{}"))]).await;
    let (generator, store) = http_setup(&url);
    let deck = generator.create_deck(NewDeck::new("Cells", CELL_TEXT)).await.unwrap();

    let err = generator.generate_deck(deck.id, &Credentials::default()).await.unwrap_err();
    match err {
        DeckGenError::GenerationFailed { error, .. } => assert_eq!(error.kind, ErrorKind::Auth),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(store.get_deck(deck.id).await.unwrap().status, DeckStatus::Failed);
}
