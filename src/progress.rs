//! Progress-callback trait for per-chunk generation events.
//!
//! Inject an [`Arc<dyn GenerationProgressCallback>`] via
//! [`crate::config::GenerationConfigBuilder::progress_callback`] to receive
//! events as the generator works through a deck's chunks. For polling, use
//! [`crate::generate::DeckGenerator::generation_progress`] instead.
//!
//! # Example
//!
//! ```rust
//! use edgequake_deckgen::{GenerationConfig, GenerationProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CardCounter {
//!     cards: AtomicUsize,
//! }
//!
//! impl GenerationProgressCallback for CardCounter {
//!     fn on_chunk_complete(&self, chunk: usize, total: usize, cards: usize) {
//!         self.cards.fetch_add(cards, Ordering::SeqCst);
//!         eprintln!("chunk {chunk}/{total}: {cards} cards");
//!     }
//! }
//!
//! let counter = Arc::new(CardCounter { cards: AtomicUsize::new(0) });
//!
//! let config = GenerationConfig::builder()
//!     .progress_callback(counter as Arc<dyn GenerationProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the generator as it processes each chunk of a deck.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Chunk numbers are 1-indexed.
pub trait GenerationProgressCallback: Send + Sync {
    /// Called once after chunking, before the first model call.
    fn on_generation_start(&self, deck_id: u64, total_chunks: usize) {
        let _ = (deck_id, total_chunks);
    }

    /// Called just before the request for a chunk is sent.
    fn on_chunk_start(&self, chunk: usize, total_chunks: usize) {
        let _ = (chunk, total_chunks);
    }

    /// Called when a chunk's cards have been validated and stored.
    ///
    /// `cards` counts every stored card, including ones the quality filter
    /// marked deleted.
    fn on_chunk_complete(&self, chunk: usize, total_chunks: usize, cards: usize) {
        let _ = (chunk, total_chunks, cards);
    }

    /// Called when a chunk fails. Generation stops after this.
    fn on_chunk_error(&self, chunk: usize, total_chunks: usize, error: &str) {
        let _ = (chunk, total_chunks, error);
    }

    /// Called once when the deck reaches `ready`.
    fn on_generation_complete(&self, deck_id: u64, ok_cards: usize, auto_deleted: usize) {
        let _ = (deck_id, ok_cards, auto_deleted);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl GenerationProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::GenerationConfig`].
pub type ProgressCallback = Arc<dyn GenerationProgressCallback>;
