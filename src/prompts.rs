//! Prompts for card generation, JSON correction and card rewrites.
//!
//! Every prompt lives here so that a wording change is a one-file edit and
//! tests can inspect the exact messages without a model. Bump
//! [`PROMPT_VERSION`] whenever generation prompts change; it is stored on
//! every [`crate::model::GenerationRun`].
//!
//! Callers can override the system message through
//! [`crate::config::GenerationConfig::system_prompt`]; the user message with
//! its rules and schema is always built here.

use crate::model::{CardContent, CardStyle, DeckSettings};
use crate::pipeline::gateway::ChatMessage;

/// Version tag recorded with each generation run.
pub const PROMPT_VERSION: &str = "v3";

/// Default system message for generation and rewrite calls.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You output strict JSON only. No prose.";

/// System message for the corrective JSON round trip.
pub const REPAIR_SYSTEM_PROMPT: &str = "You fix invalid JSON outputs.";

/// Fixed card-writing rules, one per line in the user message.
pub const CARD_RULES: &[&str] = &[
    "Output strict JSON only.",
    "Scope: ONLY use facts explicitly stated in the chunk.",
    "Coverage: be exhaustive for all main topics and key details; exam prep.",
    "Cards are self-contained; no references to tables/figures/diagrams.",
    "Style: clean, minimal formatting, consistent wording.",
    "Input may include Markdown headings/lists from PDF conversion; use that structure for coverage.",
    "Basic: concise Q -> A. Cloze: use {{c1::...}} (1-2 deletions).",
    r"Math: only \( ... \) inline and \[ ... \] display.",
    "Avoid ambiguity; include subject, scope, conditions; no vague pronouns.",
    "Prefer list-style cards when content is a list; include full list on one card.",
    "Cover: definitions, equations + variable meanings, steps, constraints, edge cases, contrasts, pitfalls.",
];

/// Shape of the payload the model must return.
pub const CARD_SCHEMA: &str = r#"{"cards": [{"type": "basic|cloze", "front": string?, "back": string?, "cloze_text": string?, "extra": string?, "tags": [string]}]}"#;

/// Messages asking the model for cards from one chunk.
pub fn chunk_messages(
    title: Option<&str>,
    text: &str,
    settings: &DeckSettings,
    style: CardStyle,
    system_prompt: Option<&str>,
) -> Vec<ChatMessage> {
    let or = |value: &Option<String>, fallback: &'static str| -> String {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(fallback)
            .to_string()
    };
    let title = title.map(str::trim).filter(|t| !t.is_empty()).unwrap_or("Untitled");

    let user = format!(
        "Generate Anki cards from this chunk.\n\n\
         Title: {title}\n\
         Content:\n{text}\n\n\
         Card style: {style}\n\
         Focus: {focus}\n\
         Exclude: {exclude}\n\
         Glossary: {glossary}\n\n\
         Rules:\n{rules}\n\n\
         Return only JSON: {CARD_SCHEMA}",
        focus = or(&settings.focus, "general coverage"),
        exclude = or(&settings.exclude, "none"),
        glossary = or(&settings.glossary, "none"),
        rules = CARD_RULES.join("\n"),
    );

    vec![
        ChatMessage::system(system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT)),
        ChatMessage::user(user.trim()),
    ]
}

/// Messages for the single corrective call after unusable output.
pub fn repair_messages(raw: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(REPAIR_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Fix the JSON to match this schema: {CARD_SCHEMA}. Return only valid JSON.\n\n\
             Invalid JSON:\n{raw}"
        )),
    ]
}

/// Messages asking the model to rewrite one card for clarity.
pub fn improve_messages(content: &CardContent, system_prompt: Option<&str>) -> Vec<ChatMessage> {
    let user = match content {
        CardContent::Basic { front, back } => format!(
            "Improve this Anki basic card for clarity and concision. \
             Return only JSON: {{\"front\": \"...\", \"back\": \"...\"}}.\n\n\
             Front: {front}\nBack: {back}"
        ),
        CardContent::Cloze { text, extra } => format!(
            "Improve this Anki cloze card for clarity and concision. \
             Preserve valid cloze syntax. Return only JSON: \
             {{\"cloze_text\": \"...\", \"extra\": \"...\"}}.\n\n\
             Cloze: {text}\nExtra: {extra}"
        ),
    };
    vec![
        ChatMessage::system(system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT)),
        ChatMessage::user(user),
    ]
}
