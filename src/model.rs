//! Domain records: decks, their source chunks, cards, and generation runs.
//!
//! These are plain data. Persistence lives behind [`crate::store::DeckStore`],
//! and every state change goes through [`crate::generate::DeckGenerator`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type DeckId = u64;
pub type SourceId = u64;
pub type CardId = u64;
pub type RunId = u64;

// ── Enums ────────────────────────────────────────────────────────────────

/// Which card type the model is asked to produce for a deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStyle {
    #[default]
    Basic,
    Cloze,
}

/// Lifecycle of a deck: `draft → processing → ready | failed`.
///
/// Starting a new generation always moves the deck back to `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeckStatus {
    #[default]
    Draft,
    Processing,
    Ready,
    Failed,
}

/// Where the deck's source text came from. PDF text gets reflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Text,
    Pdf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Basic,
    Cloze,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    #[default]
    Ok,
    NeedsReview,
    Deleted,
}

/// Error returned when a status or kind string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError(pub String);

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognised value: {}", self.0)
    }
}

impl std::error::Error for ParseEnumError {}

macro_rules! string_enum {
    ($ty:ty { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($s => Ok(Self::$variant),)+
                    other => Err(ParseEnumError(other.to_string())),
                }
            }
        }
    };
}

string_enum!(CardStyle { Basic => "basic", Cloze => "cloze" });
string_enum!(DeckStatus {
    Draft => "draft",
    Processing => "processing",
    Ready => "ready",
    Failed => "failed",
});
string_enum!(SourceKind { Text => "text", Pdf => "pdf" });
string_enum!(CardKind { Basic => "basic", Cloze => "cloze" });
string_enum!(CardStatus {
    Ok => "ok",
    NeedsReview => "needs_review",
    Deleted => "deleted",
});

// ── Deck ─────────────────────────────────────────────────────────────────

/// Per-deck generation settings plus the diagnostics of the last run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeckSettings {
    /// Topics to emphasise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
    /// Topics to leave out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
    /// Terms and definitions the model should use verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glossary: Option<String>,
    /// Chunk budget in characters; falls back to the generator default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chars: Option<usize>,
    /// `"Chunk N: <message>"` of the most recent failed generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Cards the quality filter auto-deleted in the last run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_deleted_cards: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deck {
    pub id: DeckId,
    pub title: String,
    pub card_style: CardStyle,
    pub status: DeckStatus,
    pub source_text: String,
    pub source_kind: SourceKind,
    pub settings: DeckSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`crate::store::DeckStore::create_deck`].
#[derive(Debug, Clone, Default)]
pub struct NewDeck {
    pub title: String,
    pub card_style: CardStyle,
    pub source_text: String,
    pub source_kind: SourceKind,
    pub settings: DeckSettings,
}

impl NewDeck {
    pub fn new(title: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            source_text: source_text.into(),
            ..Default::default()
        }
    }

    pub fn card_style(mut self, style: CardStyle) -> Self {
        self.card_style = style;
        self
    }

    pub fn source_kind(mut self, kind: SourceKind) -> Self {
        self.source_kind = kind;
        self
    }

    pub fn settings(mut self, settings: DeckSettings) -> Self {
        self.settings = settings;
        self
    }
}

// ── Source ───────────────────────────────────────────────────────────────

/// One chunk of the deck's text, persisted before any model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub deck_id: DeckId,
    /// 0-indexed position of the chunk in the deck.
    pub idx: usize,
    pub title: Option<String>,
    pub text: String,
    /// Lowercase hex SHA-256 of `text`.
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct NewSource {
    pub idx: usize,
    pub title: Option<String>,
    pub text: String,
    pub hash: String,
}

// ── Card ─────────────────────────────────────────────────────────────────

/// The text fields of a card, by type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CardContent {
    Basic {
        front: String,
        back: String,
    },
    Cloze {
        #[serde(rename = "cloze_text")]
        text: String,
        #[serde(default)]
        extra: String,
    },
}

impl CardContent {
    pub fn kind(&self) -> CardKind {
        match self {
            CardContent::Basic { .. } => CardKind::Basic,
            CardContent::Cloze { .. } => CardKind::Cloze,
        }
    }

    /// All user-visible text of the card, used for scope and math checks.
    pub fn scope_text(&self) -> String {
        match self {
            CardContent::Basic { front, back } => format!("{front} {back}"),
            CardContent::Cloze { text, extra } => format!("{text} {extra}"),
        }
    }

    pub fn front(&self) -> Option<&str> {
        match self {
            CardContent::Basic { front, .. } => Some(front),
            CardContent::Cloze { .. } => None,
        }
    }

    pub fn back(&self) -> Option<&str> {
        match self {
            CardContent::Basic { back, .. } => Some(back),
            CardContent::Cloze { .. } => None,
        }
    }

    pub fn cloze_text(&self) -> Option<&str> {
        match self {
            CardContent::Cloze { text, .. } => Some(text),
            CardContent::Basic { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub deck_id: DeckId,
    pub source_id: Option<SourceId>,
    #[serde(flatten)]
    pub content: CardContent,
    pub tags: Vec<String>,
    pub status: CardStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    pub fn kind(&self) -> CardKind {
        self.content.kind()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCard {
    pub deck_id: DeckId,
    pub source_id: Option<SourceId>,
    pub content: CardContent,
    pub tags: Vec<String>,
    pub status: CardStatus,
}

// ── Generation runs ──────────────────────────────────────────────────────

/// Immutable audit record of one model call for a deck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRun {
    pub id: RunId,
    pub deck_id: DeckId,
    pub source_id: Option<SourceId>,
    pub model: String,
    pub prompt_version: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cost_estimate: Option<f64>,
    pub request: serde_json::Value,
    pub response_text: Option<String>,
    pub parsed: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub deck_id: DeckId,
    pub source_id: Option<SourceId>,
    pub model: String,
    pub prompt_version: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cost_estimate: Option<f64>,
    pub request: serde_json::Value,
    pub response_text: Option<String>,
    pub parsed: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        assert_eq!(CardStatus::NeedsReview.as_str(), "needs_review");
        assert_eq!("needs_review".parse::<CardStatus>(), Ok(CardStatus::NeedsReview));
        assert_eq!(" Processing ".parse::<DeckStatus>(), Ok(DeckStatus::Processing));
        assert!("archived".parse::<DeckStatus>().is_err());
    }

    #[test]
    fn card_content_serializes_with_type_tag() {
        let content = CardContent::Cloze {
            text: "{{c1::Paris}} is the capital".into(),
            extra: String::new(),
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["type"], "cloze");
        assert_eq!(json["cloze_text"], "{{c1::Paris}} is the capital");
    }

    #[test]
    fn scope_text_joins_fields() {
        let basic = CardContent::Basic {
            front: "Q".into(),
            back: "A".into(),
        };
        assert_eq!(basic.scope_text(), "Q A");
        assert_eq!(basic.front(), Some("Q"));
        assert_eq!(basic.cloze_text(), None);
    }

    #[test]
    fn settings_skip_empty_fields() {
        let json = serde_json::to_string(&DeckSettings::default()).unwrap();
        assert_eq!(json, "{}");
    }
}
