//! Deck export: turn a deck's `ok` cards into an importable file.
//!
//! Export is split in two. [`build_package`] maps stored cards to notes
//! (HTML line breaks, tag cleanup) and is format-agnostic; a
//! [`DeckExporter`] then serialises the package. The shipped sink,
//! [`AnkiTextExporter`], writes Anki's tab-separated text import format.

use crate::error::DeckGenError;
use crate::model::{Card, CardContent, CardKind, CardStatus, Deck, DeckId};
use crate::store::{CardFilter, DeckStore};
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Filename stem used when a deck title has nothing usable in it.
const FALLBACK_FILENAME: &str = "ankigpt_deck";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportNote {
    pub kind: CardKind,
    /// Front/Back for basic notes, Text/Extra for cloze notes.
    pub fields: [String; 2],
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeckPackage {
    pub deck_id: DeckId,
    pub title: String,
    pub notes: Vec<ExportNote>,
}

/// A deck file format.
pub trait DeckExporter: Send + Sync {
    /// Extension without the dot.
    fn file_extension(&self) -> &'static str;

    fn write_package(&self, package: &DeckPackage, out: &mut dyn Write) -> io::Result<()>;
}

// ── Package building ─────────────────────────────────────────────────────

/// Map the `ok` cards among `cards` to notes. Other statuses are skipped.
pub fn build_package(deck: &Deck, cards: &[Card]) -> DeckPackage {
    let notes = cards
        .iter()
        .filter(|c| c.status == CardStatus::Ok)
        .map(|card| {
            let fields = match &card.content {
                CardContent::Basic { front, back } => [sanitize(front), sanitize(back)],
                CardContent::Cloze { text, extra } => [sanitize(text), sanitize(extra)],
            };
            ExportNote {
                kind: card.kind(),
                fields,
                tags: card.tags.iter().filter_map(|t| sanitize_tag(t)).collect(),
            }
        })
        .collect();

    DeckPackage {
        deck_id: deck.id,
        title: deck.title.clone(),
        notes,
    }
}

/// Newlines become `<br>` since notes are imported as HTML.
pub fn sanitize(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "<br>")
}

/// Lowercase; anything but alphanumerics, `-`, `_` and `:` becomes `_`.
/// Returns `None` when nothing is left.
pub fn sanitize_tag(tag: &str) -> Option<String> {
    let clean: String = tag
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | ':') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let clean = clean.trim_matches('_');
    (!clean.is_empty()).then(|| clean.to_string())
}

/// Lowercase filename stem from a deck title.
pub fn safe_filename(title: &str) -> String {
    let clean: String = title
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let clean = clean.trim_matches('_');
    if clean.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        clean.to_string()
    }
}

// ── Anki text import ─────────────────────────────────────────────────────

/// Anki's "Notes in Plain Text" format with file headers.
///
/// Columns are note type (`Basic` or `Cloze`), the two fields, and
/// space-separated tags. Fields are HTML.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnkiTextExporter;

impl AnkiTextExporter {
    fn notetype(kind: CardKind) -> &'static str {
        match kind {
            CardKind::Basic => "Basic",
            CardKind::Cloze => "Cloze",
        }
    }
}

impl DeckExporter for AnkiTextExporter {
    fn file_extension(&self) -> &'static str {
        "txt"
    }

    fn write_package(&self, package: &DeckPackage, out: &mut dyn Write) -> io::Result<()> {
        let deck_name = package.title.replace(['\n', '\r', '\t'], " ");
        writeln!(out, "#separator:tab")?;
        writeln!(out, "#html:true")?;
        writeln!(out, "#notetype column:1")?;
        writeln!(out, "#deck:{}", deck_name.trim())?;
        writeln!(out, "#tags column:4")?;

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(out);
        for note in &package.notes {
            writer.write_record([
                Self::notetype(note.kind),
                note.fields[0].as_str(),
                note.fields[1].as_str(),
                note.tags.join(" ").as_str(),
            ])?;
        }
        writer.flush()
    }
}

// ── File output ──────────────────────────────────────────────────────────

/// Export a deck's `ok` cards to `<dir>/<safe_title>_<deck_id>.<ext>`.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
///
/// # Errors
/// [`DeckGenError::NothingToExport`] when the deck has no `ok` cards.
pub async fn export_to_file(
    store: &dyn DeckStore,
    deck_id: DeckId,
    exporter: &dyn DeckExporter,
    dir: impl AsRef<Path>,
) -> Result<PathBuf, DeckGenError> {
    let deck = store.get_deck(deck_id).await?;
    let cards = store
        .list_cards(deck_id, &CardFilter::with_status(CardStatus::Ok))
        .await?;
    let package = build_package(&deck, &cards);
    if package.notes.is_empty() {
        return Err(DeckGenError::NothingToExport { deck_id });
    }

    let dir = dir.as_ref();
    let ext = exporter.file_extension();
    let path = dir.join(format!("{}_{}.{}", safe_filename(&deck.title), deck_id, ext));
    let write_err = |source: io::Error| DeckGenError::OutputWriteFailed {
        path: path.clone(),
        source,
    };

    let mut buffer = Vec::new();
    exporter.write_package(&package, &mut buffer).map_err(write_err)?;

    tokio::fs::create_dir_all(dir).await.map_err(write_err)?;
    let tmp_path = path.with_extension(format!("{ext}.tmp"));
    tokio::fs::write(&tmp_path, &buffer).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, &path).await.map_err(write_err)?;

    info!("Exported {} notes to {}", package.notes.len(), path.display());
    Ok(path)
}
