//! Content quality filter: card normalisation and the three rejection checks.
//!
//! Every card the model returns goes through [`normalize_content`] and then
//! [`validation_issues`]. A card with issues is not dropped; it is persisted
//! as `deleted` and tagged with `auto_deleted` plus one
//! `validation:<issue>` tag per failed check, so a reviewer can restore it.

use crate::model::CardContent;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Tag added to every card rejected by the filter.
pub const AUTO_DELETED_TAG: &str = "auto_deleted";

// ── Text ─────────────────────────────────────────────────────────────────────

/// Collapse every whitespace run (newlines included) to one space and trim.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Math ─────────────────────────────────────────────────────────────────────

/// Display-math environments rewritten to `\[ … \]`.
const DISPLAY_ENVIRONMENTS: &[&str] = &[
    "equation",
    "equation*",
    "align",
    "align*",
    "gather",
    "gather*",
    "multline",
    "multline*",
    "displaymath",
];

static RE_ENVIRONMENTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    DISPLAY_ENVIRONMENTS
        .iter()
        .map(|env| {
            let env = regex::escape(env);
            Regex::new(&format!(r"(?s)\\begin\{{{env}\}}(.+?)\\end\{{{env}\}}")).unwrap()
        })
        .collect()
});

static RE_DISPLAY_DOLLARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\$\$(.+?)\$\$").unwrap());

/// Rewrite TeX math delimiters to `\( … \)` and `\[ … \]`.
///
/// Equation-like environments and `$$…$$` become display math, unescaped
/// single-line `$…$` becomes inline math, and any `$` left over is removed.
/// Passes repeat until the text stops changing, so nested environments are
/// fully converted and a removed `$` cannot leave a fresh environment behind.
/// The result never contains `$`, and applying the function twice gives the
/// same output as applying it once.
pub fn normalize_math(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = normalize_math_pass(&current);
        if next == current {
            return next;
        }
        current = next;
    }
}

/// One rewrite pass. Every pass that changes its input removes a `$` or an
/// environment, so [`normalize_math`] always reaches a fixed point.
fn normalize_math_pass(text: &str) -> String {
    let mut out = text.to_string();
    for re in RE_ENVIRONMENTS.iter() {
        out = re
            .replace_all(&out, |caps: &regex::Captures<'_>| {
                format!(r"\[{}\]", caps[1].trim())
            })
            .into_owned();
    }
    let out = RE_DISPLAY_DOLLARS
        .replace_all(&out, |caps: &regex::Captures<'_>| {
            format!(r"\[{}\]", caps[1].trim())
        })
        .into_owned();
    replace_inline_dollars(&out).replace('$', "")
}

/// Replace `$…$` pairs whose dollars are not backslash-escaped.
///
/// The pair must be on one line and enclose at least one character.
fn replace_inline_dollars(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let is_delim = |i: usize| chars[i] == '$' && (i == 0 || chars[i - 1] != '\\');

    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if is_delim(i) {
            let close = (i + 2..chars.len())
                .take_while(|&j| chars[j] != '\n')
                .find(|&j| is_delim(j));
            if let Some(j) = close.filter(|_| chars[i + 1] != '\n') {
                let inner: String = chars[i + 1..j].iter().collect();
                out.push_str(r"\(");
                out.push_str(inner.trim());
                out.push_str(r"\)");
                i = j + 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Math delimiters are balanced and no raw TeX markers remain.
pub fn is_math_valid(text: &str) -> bool {
    if text.contains('$') || text.contains(r"\begin{") || text.contains(r"\end{") {
        return false;
    }
    text.matches(r"\(").count() == text.matches(r"\)").count()
        && text.matches(r"\[").count() == text.matches(r"\]").count()
}

// ── Cloze ────────────────────────────────────────────────────────────────────

static RE_CLOZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{c\d+::.+?\}\}").unwrap());

/// Braces are balanced and at least one `{{cN::…}}` deletion is present.
pub fn is_valid_cloze(text: &str) -> bool {
    !text.is_empty()
        && text.matches("{{").count() == text.matches("}}").count()
        && RE_CLOZE.is_match(text)
}

// ── Scope ────────────────────────────────────────────────────────────────────

/// Tunables for the lexical-overlap grounding heuristic.
///
/// A card is out of scope when it has many distinctive words that the chunk
/// never mentions. Only alphabetic tokens of at least `min_token_len`
/// characters are considered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScopeThresholds {
    pub min_token_len: usize,
    /// Tokens at least this long count as "long".
    pub long_token_len: usize,
    pub min_long_tokens: usize,
    /// Reject when there are `min_long_tokens` or more long tokens and the
    /// overlap ratio is below this.
    pub long_overlap: f64,
    pub min_tokens: usize,
    /// Reject when there are `min_tokens` or more tokens and the overlap
    /// ratio is below this.
    pub token_overlap: f64,
}

impl Default for ScopeThresholds {
    fn default() -> Self {
        Self {
            min_token_len: 4,
            long_token_len: 7,
            min_long_tokens: 4,
            long_overlap: 0.20,
            min_tokens: 8,
            token_overlap: 0.08,
        }
    }
}

static RE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z]+").unwrap());

fn tokens(text: &str, min_len: usize) -> HashSet<String> {
    let lowered = text.to_lowercase();
    RE_WORD
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .filter(|w| w.len() >= min_len)
        .map(str::to_string)
        .collect()
}

/// Whether `card_text` is grounded in `chunk_text` by word overlap.
///
/// Empty token sets on either side pass.
pub fn is_in_scope(card_text: &str, chunk_text: &str, thresholds: &ScopeThresholds) -> bool {
    let card = tokens(card_text, thresholds.min_token_len);
    let chunk = tokens(chunk_text, thresholds.min_token_len);
    if card.is_empty() || chunk.is_empty() {
        return true;
    }

    let overlap = card.intersection(&chunk).count() as f64 / card.len() as f64;
    let long = card
        .iter()
        .filter(|t| t.len() >= thresholds.long_token_len)
        .count();

    if long >= thresholds.min_long_tokens && overlap < thresholds.long_overlap {
        return false;
    }
    !(card.len() >= thresholds.min_tokens && overlap < thresholds.token_overlap)
}

// ── Card-level checks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationIssue {
    InvalidCloze,
    InvalidMath,
    OutOfScope,
}

impl ValidationIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationIssue::InvalidCloze => "invalid_cloze",
            ValidationIssue::InvalidMath => "invalid_math",
            ValidationIssue::OutOfScope => "out_of_scope",
        }
    }

    pub fn tag(&self) -> String {
        format!("validation:{}", self.as_str())
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whitespace- and math-normalise every text field of a card.
pub fn normalize_content(content: &CardContent) -> CardContent {
    let clean = |s: &str| normalize_math(&normalize_text(s));
    match content {
        CardContent::Basic { front, back } => CardContent::Basic {
            front: clean(front),
            back: clean(back),
        },
        CardContent::Cloze { text, extra } => CardContent::Cloze {
            text: clean(text),
            extra: clean(extra),
        },
    }
}

/// Run all checks against an already normalised card.
pub fn validation_issues(
    content: &CardContent,
    source_text: &str,
    thresholds: &ScopeThresholds,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if let CardContent::Cloze { text, .. } = content {
        if !is_valid_cloze(text) {
            issues.push(ValidationIssue::InvalidCloze);
        }
    }
    let scope_text = content.scope_text();
    if !is_math_valid(&scope_text) {
        issues.push(ValidationIssue::InvalidMath);
    }
    if !is_in_scope(&scope_text, source_text, thresholds) {
        issues.push(ValidationIssue::OutOfScope);
    }
    issues
}

/// Append `auto_deleted` and one `validation:<issue>` tag per issue.
///
/// Order is preserved and duplicates are dropped.
pub fn apply_validation_tags(tags: &[String], issues: &[ValidationIssue]) -> Vec<String> {
    let mut all: Vec<String> = tags.to_vec();
    if !issues.is_empty() {
        all.push(AUTO_DELETED_TAG.to_string());
        all.extend(issues.iter().map(ValidationIssue::tag));
    }
    dedup_tags(all)
}

/// Drop blank and repeated tags, keeping first-seen order.
pub fn dedup_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

/// Turn a section title into a tag-safe slug.
///
/// Lowercases, replaces anything but alphanumerics, `-` and `_` with `_`, and
/// trims leading and trailing underscores.
pub fn tagify(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}
