//! Error types for the edgequake-deckgen library.
//!
//! Errors come in three layers that mirror the pipeline:
//!
//! * [`GatewayError`] and [`SchemaError`] are raised by the network and
//!   parsing stages for a single chunk.
//!
//! * [`ClassifiedError`] is what a failed chunk turns into: a stable
//!   [`ErrorKind`] plus a human-readable message suitable for showing to the
//!   person who owns the deck. It is recorded on the deck (`last_error`) and in
//!   the chunk's [`crate::model::GenerationRun`].
//!
//! * [`DeckGenError`] is **fatal** for the public operation that returned it
//!   (missing deck, store failure, unreadable PDF, or a chunk that aborted
//!   the whole generation).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-deckgen library.
#[derive(Debug, Error)]
pub enum DeckGenError {
    // ── Lookup errors ─────────────────────────────────────────────────────
    #[error("Deck {0} not found")]
    DeckNotFound(u64),

    #[error("Source {0} not found")]
    SourceNotFound(u64),

    #[error("Card {0} not found")]
    CardNotFound(u64),

    // ── Generation errors ─────────────────────────────────────────────────
    /// A chunk failed during a full deck generation. The deck is already
    /// marked `failed` with `last_error` set when this is returned.
    #[error("Generation of deck {deck_id} failed: {error}")]
    GenerationFailed {
        deck_id: u64,
        error: ClassifiedError,
    },

    /// A single-chunk or single-card operation (regenerate, improve) failed.
    #[error("{0}")]
    Chunk(ClassifiedError),

    /// The deck has no `ok` cards, so there is nothing to export.
    #[error("Deck {deck_id} has no exportable cards")]
    NothingToExport { deck_id: u64 },

    // ── Persistence errors ────────────────────────────────────────────────
    /// Backend failure. Missing rows convert to the `*NotFound` variants.
    #[error(transparent)]
    Store(StoreError),

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("File not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// The input text file is not valid UTF-8.
    #[error("Could not read text from '{path}': {detail}")]
    UnreadableText { path: PathBuf, detail: String },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}\nTry repairing with: qpdf --decrypt input.pdf output.pdf")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.")]
    PasswordRequired { path: PathBuf },

    /// pdfium-render returned an error while extracting a page's text.
    #[error("Text extraction failed for page {page}: {detail}")]
    TextExtractionFailed { page: usize, detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the exported deck file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Text input does not need pdfium. For PDF input you can:\n\
  • Install libpdfium system-wide.\n\
  • Set PDFIUM_LIB_PATH=/path/to/dir-containing-libpdfium.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single chat-completion call, after retries.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// No API key was supplied with the request credentials.
    #[error("No API key configured for the completion endpoint")]
    MissingCredentials,

    /// Every attempt timed out.
    #[error("Request timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    /// The endpoint could not be reached.
    #[error("Connection failed after {attempts} attempt(s): {detail}")]
    Connection { detail: String, attempts: u32 },

    /// The endpoint answered with a non-success status.
    #[error("HTTP {status}{}: {detail}", .code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Http {
        status: u16,
        code: Option<String>,
        detail: String,
        attempts: u32,
    },

    /// The success body was not JSON.
    #[error("Completion response is not valid JSON: {detail}")]
    InvalidJson { detail: String },

    /// The success body was JSON but lacked `choices[0].message.content`.
    #[error("Completion response is missing message content: {detail}")]
    MalformedResponse { detail: String },
}

impl GatewayError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// The model's output could not be turned into valid cards.
#[derive(Debug, Clone, Error)]
pub enum SchemaError {
    /// No JSON object could be recovered from the text.
    #[error("Model output is not valid JSON: {0}")]
    Unparseable(String),

    /// JSON was recovered but does not match the card schema.
    #[error("Model output does not match the card schema: {0}")]
    Invalid(String),

    /// The corrective round trip itself failed at the gateway.
    #[error("Corrective request failed: {0}")]
    Correction(#[from] GatewayError),
}

/// Failure of a [`crate::store::DeckStore`] backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    #[error("Store backend error: {0}")]
    Backend(String),
}

// ── Classification ───────────────────────────────────────────────────────

/// Stable category of a chunk failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    QuotaExhausted,
    Auth,
    PayloadTooLarge,
    Rejected,
    Unavailable,
    InvalidOutput,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::Auth => "auth",
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::InvalidOutput => "invalid_output",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk failure reduced to something a user can act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    /// 1-indexed chunk number, when the failure belongs to a chunk.
    pub chunk: Option<usize>,
    /// Short, user-facing explanation.
    pub message: String,
    /// Underlying error text, kept for the run audit log.
    pub detail: String,
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.chunk {
            Some(n) => write!(f, "Chunk {}: {}", n, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ClassifiedError {}

/// Body fragments that turn a 429 from "slow down" into "stop".
pub(crate) const TERMINAL_429_MARKERS: &[&str] =
    &["insufficient", "credit", "quota", "billing", "payment"];

pub(crate) fn is_terminal_429(detail: &str) -> bool {
    let lowered = detail.to_lowercase();
    TERMINAL_429_MARKERS.iter().any(|m| lowered.contains(m))
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            chunk: None,
            message: message.into(),
            detail: detail.into(),
        }
    }

    /// Attach the 0-indexed chunk position this failure belongs to.
    pub fn for_chunk(mut self, index: usize) -> Self {
        self.chunk = Some(index + 1);
        self
    }

    pub fn from_gateway(err: &GatewayError) -> Self {
        let detail = err.to_string();
        match err {
            GatewayError::Http { status: 429, detail: body, .. } if is_terminal_429(body) => {
                Self::new(
                    ErrorKind::QuotaExhausted,
                    "The completion provider reports insufficient credits or an exhausted quota. \
                     Add credits or switch API key, then retry.",
                    detail,
                )
            }
            GatewayError::Http { status: 402, .. } => Self::new(
                ErrorKind::QuotaExhausted,
                "The completion provider reports insufficient credits or an exhausted quota. \
                 Add credits or switch API key, then retry.",
                detail,
            ),
            GatewayError::Http { status: 429, .. } => Self::new(
                ErrorKind::RateLimited,
                "Rate limit reached at the completion provider. Wait a moment and retry.",
                detail,
            ),
            GatewayError::Http { status: 401 | 403, .. } | GatewayError::MissingCredentials => {
                Self::new(
                    ErrorKind::Auth,
                    "Authentication failed. Check the API key.",
                    detail,
                )
            }
            GatewayError::Http { status: 413, .. } => Self::new(
                ErrorKind::PayloadTooLarge,
                "The chunk is too large for the model. Lower the chunk size and retry.",
                detail,
            ),
            GatewayError::Http { status: 400, detail: body, .. } => {
                let lowered = body.to_lowercase();
                if ["context", "token", "too long"].iter().any(|m| lowered.contains(m)) {
                    Self::new(
                        ErrorKind::PayloadTooLarge,
                        "The chunk is too large for the model. Lower the chunk size and retry.",
                        detail,
                    )
                } else {
                    Self::new(
                        ErrorKind::Rejected,
                        "The completion provider rejected the request.",
                        detail,
                    )
                }
            }
            GatewayError::Http { status, .. } if *status >= 500 => Self::new(
                ErrorKind::Unavailable,
                "The completion provider is temporarily unavailable. Try again later.",
                detail,
            ),
            GatewayError::Timeout { .. } | GatewayError::Connection { .. } => Self::new(
                ErrorKind::Unavailable,
                "The completion provider could not be reached. Try again later.",
                detail,
            ),
            GatewayError::InvalidJson { .. } | GatewayError::MalformedResponse { .. } => {
                Self::new(
                    ErrorKind::InvalidOutput,
                    "The completion provider returned an unreadable response.",
                    detail,
                )
            }
            GatewayError::Http { .. } => Self::new(
                ErrorKind::Other,
                "The completion request failed.",
                detail,
            ),
        }
    }

    pub fn from_schema(err: &SchemaError) -> Self {
        match err {
            SchemaError::Correction(inner) => {
                let mut classified = Self::from_gateway(inner);
                classified.detail = err.to_string();
                classified
            }
            _ => Self::new(
                ErrorKind::InvalidOutput,
                "The model returned cards that could not be parsed, even after one correction.",
                err.to_string(),
            ),
        }
    }
}

impl From<GatewayError> for ClassifiedError {
    fn from(err: GatewayError) -> Self {
        Self::from_gateway(&err)
    }
}

impl From<SchemaError> for ClassifiedError {
    fn from(err: SchemaError) -> Self {
        Self::from_schema(&err)
    }
}

impl From<StoreError> for DeckGenError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity: "Deck", id } => DeckGenError::DeckNotFound(id),
            StoreError::NotFound { entity: "Source", id } => DeckGenError::SourceNotFound(id),
            StoreError::NotFound { entity: "Card", id } => DeckGenError::CardNotFound(id),
            other => DeckGenError::Store(other),
        }
    }
}
