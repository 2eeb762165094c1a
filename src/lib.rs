//! # edgequake-deckgen
//!
//! Turn study material (plain text or PDF) into validated Anki flashcard
//! decks using an LLM.
//!
//! ## Why this crate?
//!
//! Asking a model for flashcards is easy; getting a deck you can import
//! without cleanup is not. Models return broken JSON (unescaped LaTeX),
//! malformed cloze deletions, cards about things the source never says, and
//! the same card three times. This crate wraps each model call in a pipeline
//! that repairs, validates, filters and dedupes, and keeps every rejected card
//! (tagged with why) instead of dropping it.
//!
//! ## Pipeline Overview
//!
//! ```text
//! source text / PDF
//!  │
//!  ├─ 1. Normalise  ligatures, invisible chars, PDF line reflow
//!  ├─ 2. Chunk      paragraph-packed chunks with guessed titles
//!  ├─ 3. Gateway    chat completion per chunk, retry + backoff
//!  ├─ 4. Schema     JSON escape repair, one corrective call
//!  ├─ 5. Quality    cloze/math/scope checks, validation:* tags
//!  ├─ 6. Dedupe     later duplicates → deleted
//!  └─ 7. Export     ok cards → Anki text import file
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_deckgen::{
//!     export_to_file, AnkiTextExporter, Credentials, DeckGenerator, GenerationConfig,
//!     HttpGateway, MemoryDeckStore, NewDeck,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GenerationConfig::default();
//!     let gateway = Arc::new(HttpGateway::new(config.api_url.clone()));
//!     let store = Arc::new(MemoryDeckStore::new());
//!     let generator = DeckGenerator::new(gateway, store.clone(), config);
//!
//!     let text = std::fs::read_to_string("notes.txt")?;
//!     let deck = generator.create_deck(NewDeck::new("Cell Biology", text)).await?;
//!     let report = generator.generate_deck(deck.id, &Credentials::from_env()).await?;
//!     eprintln!("{} ok cards, {} auto-deleted", report.ok_cards, report.auto_deleted);
//!
//!     let path = export_to_file(store.as_ref(), deck.id, &AnkiTextExporter, "out").await?;
//!     println!("{}", path.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `deckgen` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-deckgen = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod export;
pub mod generate;
pub mod jobs;
pub mod model;
pub mod pdf;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{Credentials, GenerationConfig, GenerationConfigBuilder};
pub use error::{ClassifiedError, DeckGenError, ErrorKind, GatewayError, SchemaError, StoreError};
pub use export::{
    build_package, export_to_file, AnkiTextExporter, DeckExporter, DeckPackage, ExportNote,
};
pub use generate::{CardEdit, DeckGenerator, GenerationProgress, GenerationReport};
pub use jobs::{GenerationQueue, JobId, JobState, JobStatus};
pub use model::{
    Card, CardContent, CardId, CardKind, CardStatus, CardStyle, Deck, DeckId, DeckSettings,
    DeckStatus, GenerationRun, NewDeck, Source, SourceId, SourceKind,
};
pub use pdf::{extract_pdf_text, extract_pdf_text_from_bytes, PdfText};
pub use pipeline::gateway::{HttpGateway, LlmGateway, RetryPolicy};
pub use progress::{GenerationProgressCallback, NoopProgressCallback, ProgressCallback};
pub use store::{CardFilter, DeckStore, MemoryDeckStore};
