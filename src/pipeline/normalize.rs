//! Text normalisation: deterministic cleanup of raw study material.
//!
//! Input arrives either as pasted text or as text pulled out of a PDF. PDF
//! text is the messy case: every visual line ends in a newline, words are
//! split with hyphens at line ends, ligature glyphs leak through as single
//! code points, and headings are indistinguishable from body text.
//!
//! [`clean_text`] runs on everything. [`reflow_text`] runs on PDF text only
//! and rebuilds paragraphs, headings and list items so the chunker sees
//! blank-line-delimited blocks.
//!
//! ## Rule Order
//!
//! Line endings are normalised first so every later rule can assume `\n`.
//! Invisible characters are stripped before trailing-whitespace trimming so a
//! line consisting of a lone zero-width space becomes blank.

use crate::model::SourceKind;
use once_cell::sync::Lazy;
use regex::Regex;

/// Clean `raw` and, for PDF sources, reflow it into paragraphs.
pub fn prepare_source_text(raw: &str, kind: SourceKind) -> String {
    let cleaned = clean_text(raw);
    match kind {
        SourceKind::Pdf => reflow_text(&cleaned),
        SourceKind::Text => cleaned,
    }
}

/// Apply all cleanup rules to raw text.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF, CR and form feed → LF)
/// 2. Replace typographic ligatures with their ASCII letters
/// 3. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens, …)
/// 4. Trim trailing whitespace per line
/// 5. Collapse runs of blank lines to at most two
/// 6. Trim leading and trailing blank lines
pub fn clean_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = replace_ligatures(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim_matches('\n').to_string()
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input
        .replace("\r\n", "\n")
        .replace(['\r', '\u{000C}'], "\n")
}

// ── Rule 2: Ligatures ────────────────────────────────────────────────────────

const LIGATURES: &[(char, &str)] = &[
    ('\u{FB00}', "ff"),
    ('\u{FB01}', "fi"),
    ('\u{FB02}', "fl"),
    ('\u{FB03}', "ffi"),
    ('\u{FB04}', "ffl"),
    ('\u{FB05}', "st"),
    ('\u{FB06}', "st"),
];

fn replace_ligatures(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match LIGATURES.iter().find(|(lig, _)| *lig == c) {
            Some((_, ascii)) => out.push_str(ascii),
            None => out.push(c),
        }
    }
    out
}

// ── Rule 3: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Reflow ───────────────────────────────────────────────────────────────────
//
// A line-by-line state machine over cleaned PDF text. Each non-blank line is
// classified as a heading, a list item, or body text; body text is glued onto
// the open block unless a sentence boundary says otherwise.

/// Longest line (in chars) that can still be a heading.
const MAX_HEADING_CHARS: usize = 80;
/// Most words a short, unpunctuated line may have to count as a heading.
const MAX_HEADING_WORDS: usize = 8;

#[derive(Debug, PartialEq)]
enum Block {
    Heading(String),
    Item(String),
    Paragraph(String),
}

#[derive(Debug, PartialEq)]
enum Join {
    /// Drop the trailing hyphen and glue directly: `per-` + `form`.
    Dehyphenate,
    /// Soft wrap: join with a single space.
    Space,
    /// Sentence boundary: start a new paragraph.
    Break,
}

/// Merge soft-wrapped PDF lines into paragraphs.
///
/// Headings are emitted as `## Heading`, list items as `- item` (numbered
/// items keep `N.`), and blocks are separated by a blank line. Consecutive
/// list items stay on adjacent lines.
pub fn reflow_text(input: &str) -> String {
    let mut blocks: Vec<Block> = Vec::new();
    let mut current: Option<Block> = None;

    for raw in input.lines() {
        let line = raw.trim();
        if line.is_empty() {
            blocks.extend(current.take());
            continue;
        }

        let at_boundary = match &current {
            Some(Block::Item(text)) | Some(Block::Paragraph(text)) => ends_sentence(text),
            _ => true,
        };

        if let Some(item) = list_item(line) {
            blocks.extend(current.take());
            current = Some(Block::Item(item));
            continue;
        }

        if let Some(heading) = heading_text(line, at_boundary) {
            blocks.extend(current.take());
            blocks.push(Block::Heading(heading));
            continue;
        }

        let join = match &current {
            Some(Block::Item(text)) | Some(Block::Paragraph(text)) => join_mode(text, line),
            _ => Join::Break,
        };

        match (join, current.as_mut()) {
            (Join::Dehyphenate, Some(Block::Item(text)))
            | (Join::Dehyphenate, Some(Block::Paragraph(text))) => {
                text.pop();
                text.push_str(line);
            }
            (Join::Space, Some(Block::Item(text)))
            | (Join::Space, Some(Block::Paragraph(text))) => {
                text.push(' ');
                text.push_str(line);
            }
            _ => {
                blocks.extend(current.take());
                current = Some(Block::Paragraph(line.to_string()));
            }
        }
    }
    blocks.extend(current);

    render_blocks(&blocks)
}

fn render_blocks(blocks: &[Block]) -> String {
    let mut out = String::new();
    let mut prev_item = false;
    for (i, block) in blocks.iter().enumerate() {
        let is_item = matches!(block, Block::Item(_));
        if i > 0 {
            out.push_str(if prev_item && is_item { "\n" } else { "\n\n" });
        }
        match block {
            Block::Heading(text) => {
                out.push_str("## ");
                out.push_str(text);
            }
            Block::Item(text) | Block::Paragraph(text) => out.push_str(text),
        }
        prev_item = is_item;
    }
    out
}

static RE_MD_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s+(.+)$").unwrap());

/// Classify `line` as a heading, returning its text without markers.
fn heading_text(line: &str, at_boundary: bool) -> Option<String> {
    if let Some(caps) = RE_MD_HEADING.captures(line) {
        return Some(caps[1].trim().to_string());
    }
    if line.chars().count() > MAX_HEADING_CHARS {
        return None;
    }
    if is_all_caps(line) {
        return Some(line.to_string());
    }
    if let Some(stripped) = line.strip_suffix(':').map(str::trim_end) {
        if !stripped.is_empty() {
            return Some(stripped.to_string());
        }
    }
    if !at_boundary || !starts_uppercase(line) {
        return None;
    }
    let words = line.split_whitespace().count();
    let unpunctuated = !line.ends_with(['.', '!', '?', ',', ';', '-', ')']);
    if words <= MAX_HEADING_WORDS && unpunctuated && !line.contains(". ") {
        return Some(line.to_string());
    }
    None
}

static RE_BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[-*•◦▪–·]\s+(.+)$").unwrap());
static RE_NUMBERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,2})[.)]\s+(.+)$").unwrap());
static RE_LETTERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z]\)\s+(.+)$").unwrap());

/// Classify `line` as a list item, returning it with a normalised marker.
fn list_item(line: &str) -> Option<String> {
    if let Some(caps) = RE_BULLET.captures(line) {
        return Some(format!("- {}", caps[1].trim()));
    }
    if let Some(caps) = RE_NUMBERED.captures(line) {
        return Some(format!("{}. {}", &caps[1], caps[2].trim()));
    }
    RE_LETTERED
        .captures(line)
        .map(|caps| format!("- {}", caps[1].trim()))
}

fn join_mode(text: &str, line: &str) -> Join {
    let mut tail = text.chars().rev();
    let hyphenated = tail.next() == Some('-') && tail.next().is_some_and(char::is_alphabetic);
    if hyphenated && starts_lowercase(line) {
        Join::Dehyphenate
    } else if ends_sentence(text) && starts_uppercase(line) {
        Join::Break
    } else {
        Join::Space
    }
}

fn ends_sentence(text: &str) -> bool {
    text.trim_end_matches(['"', '\'', ')', ']', '\u{201D}', '\u{2019}'])
        .ends_with(['.', '!', '?'])
}

fn starts_uppercase(line: &str) -> bool {
    line.chars().next().is_some_and(char::is_uppercase)
}

fn starts_lowercase(line: &str) -> bool {
    line.chars().next().is_some_and(char::is_lowercase)
}

/// At least two letters and no lowercase ones.
pub(crate) fn is_all_caps(line: &str) -> bool {
    let letters = line.chars().filter(|c| c.is_alphabetic()).count();
    letters >= 2 && !line.chars().any(char::is_lowercase)
}

// ── Tests ────────────────────────────────────────────────────────────────────
