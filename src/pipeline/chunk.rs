//! Chunking: split normalised text into titled, size-bounded chunks.
//!
//! A chunk is the unit of work for one model call, so its size is a direct
//! trade-off between prompt cost and context. Splits only ever happen at
//! paragraph boundaries; a single paragraph longer than the budget becomes
//! its own oversized chunk rather than being cut mid-sentence.

use crate::pipeline::normalize::is_all_caps;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Separator placed between paragraphs inside a chunk body.
pub const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// Longest paragraph (in chars) that may be read as a title.
const MAX_TITLE_CHARS: usize = 80;

/// One contiguous slice of the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub title: Option<String>,
    pub text: String,
}

static RE_PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\n").unwrap());
static RE_MD_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s+(.+)$").unwrap());

/// Split `text` into non-empty, trimmed paragraphs.
pub fn split_paragraphs(text: &str) -> Vec<&str> {
    RE_PARAGRAPH_BREAK
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Recognise a paragraph that is only a section title.
///
/// Markdown headings, short ALL-CAPS lines (returned in Title Case) and short
/// colon-terminated lines (colon stripped) qualify.
pub fn guess_title(paragraph: &str) -> Option<String> {
    let line = paragraph.trim();
    if line.is_empty() || line.contains('\n') {
        return None;
    }
    if let Some(caps) = RE_MD_HEADING.captures(line) {
        let title = caps[1].trim();
        return Some(if is_all_caps(title) {
            title_case(title)
        } else {
            title.to_string()
        });
    }
    if line.chars().count() > MAX_TITLE_CHARS {
        return None;
    }
    if is_all_caps(line) {
        return Some(title_case(line));
    }
    line.strip_suffix(':')
        .map(str::trim_end)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Uppercase the first letter of every alphabetic run, lowercase the rest.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_alpha = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// Split `text` into chunks of at most `max_chars` characters.
///
/// A title paragraph met while the current chunk is still empty becomes that
/// chunk's title and is not part of its body. When the next paragraph would
/// push the body past `max_chars`, the current chunk is closed; if that
/// paragraph is itself a title it seeds the next chunk's title instead of its
/// body.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut title: Option<String> = None;
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;
    let sep_len = PARAGRAPH_SEPARATOR.chars().count();

    for paragraph in split_paragraphs(text) {
        let heading = guess_title(paragraph);
        if heading.is_some() && current.is_empty() {
            title = heading;
            continue;
        }

        let para_len = paragraph.chars().count();
        if !current.is_empty() && current_len + sep_len + para_len > max_chars {
            chunks.push(Chunk {
                title: title.take(),
                text: current.join(PARAGRAPH_SEPARATOR),
            });
            current.clear();
            current_len = 0;
            if heading.is_some() {
                title = heading;
                continue;
            }
        }

        if !current.is_empty() {
            current_len += sep_len;
        }
        current.push(paragraph);
        current_len += para_len;
    }

    if !current.is_empty() {
        chunks.push(Chunk {
            title,
            text: current.join(PARAGRAPH_SEPARATOR),
        });
    }

    chunks
}

/// Lowercase hex SHA-256 of `text`.
pub fn hash_text(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}
