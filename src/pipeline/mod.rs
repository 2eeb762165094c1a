//! Pipeline stages for turning study text into validated cards.
//!
//! Each submodule implements exactly one step. Only the gateway does I/O,
//! and the schema stage reaches it solely for its corrective call.
//! [`crate::generate`] wires them together per chunk.
//!
//! ## Data Flow
//!
//! ```text
//! normalize ──▶ chunk ──▶ gateway ──▶ schema ──▶ quality ──▶ dedup
//! (cleanup)   (split)    (LLM)      (JSON)     (filters)   (deck-wide)
//! ```
//!
//! 1. [`normalize`]: clean extraction artefacts; reflow soft-wrapped PDF text
//! 2. [`chunk`]    : split at paragraph boundaries into titled chunks
//! 3. [`gateway`]  : one chat-completion call with retry/backoff; the only
//!    stage with network I/O
//! 4. [`schema`]   : recover JSON, validate cards, at most one correction
//! 5. [`quality`]  : normalise text and math, flag bad or off-topic cards
//! 6. [`dedup`]    : drop repeated cards across the whole deck

pub mod chunk;
pub mod dedup;
pub mod gateway;
pub mod normalize;
pub mod quality;
pub mod schema;
