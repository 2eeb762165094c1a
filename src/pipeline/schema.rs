//! Card schema validation: turn raw model output into typed draft cards.
//!
//! Models often return almost-JSON: LaTeX backslashes that are not valid
//! escapes (`\sqrt`, `\(`), raw newlines inside strings, or prose around the
//! object. [`extract_json`] recovers what it can locally; only when that and
//! [`validate_cards`] fail does [`parse_cards_with_correction`] spend one
//! extra model call asking for a fixed payload.

use crate::config::Credentials;
use crate::error::SchemaError;
use crate::model::CardContent;
use crate::pipeline::gateway::{ChatRequest, LlmGateway, RetryPolicy, Usage};
use crate::pipeline::quality::dedup_tags;
use crate::prompts::repair_messages;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

// ── Escape repair ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Outside,
    InString,
    AfterBackslash,
}

/// Make backslashes and control characters inside JSON strings legal.
///
/// Invalid escapes get their backslash doubled, so `\sqrt` survives as the
/// literal text `\sqrt`. Raw newlines, carriage returns and tabs become
/// `\n`, `\r`, `\t`; other control characters become `\u00XX`. Text outside
/// string literals is copied unchanged.
pub fn repair_json_escapes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut state = ScanState::Outside;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match state {
            ScanState::Outside => {
                if c == '"' {
                    state = ScanState::InString;
                }
                out.push(c);
            }
            ScanState::InString => match c {
                '"' => {
                    out.push(c);
                    state = ScanState::Outside;
                }
                '\\' => state = ScanState::AfterBackslash,
                c if (c as u32) < 0x20 => push_control(&mut out, c),
                c => out.push(c),
            },
            ScanState::AfterBackslash => {
                state = ScanState::InString;
                match c {
                    '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' => {
                        out.push('\\');
                        out.push(c);
                    }
                    'u' if is_unicode_escape(&chars[i + 1..]) => out.push_str("\\u"),
                    _ => {
                        out.push_str("\\\\");
                        // Re-scan the character as ordinary string content.
                        continue;
                    }
                }
            }
        }
        i += 1;
    }

    if state == ScanState::AfterBackslash {
        out.push_str("\\\\");
    }
    out
}

fn is_unicode_escape(rest: &[char]) -> bool {
    rest.len() >= 4 && rest[..4].iter().all(char::is_ascii_hexdigit)
}

fn push_control(out: &mut String, c: char) {
    match c {
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        c => out.push_str(&format!("\\u{:04x}", c as u32)),
    }
}

// ── Extraction ───────────────────────────────────────────────────────────

/// Recover a JSON value from model output.
///
/// Tries the text as-is, then with escapes repaired, then both again on the
/// slice between the first `{` and the last `}`.
pub fn extract_json(text: &str) -> Result<Value, SchemaError> {
    let first_error = match parse_lenient(text) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            if let Ok(value) = parse_lenient(&text[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(SchemaError::Unparseable(first_error.to_string()))
}

fn parse_lenient(text: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(text).or_else(|_| serde_json::from_str(&repair_json_escapes(text)))
}

// ── Validation ───────────────────────────────────────────────────────────

/// A validated card before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftCard {
    pub content: CardContent,
    pub tags: Vec<String>,
}

#[derive(Deserialize)]
struct RawPayload {
    cards: Vec<RawCard>,
}

#[derive(Deserialize)]
struct RawCard {
    #[serde(rename = "type")]
    kind: String,
    front: Option<String>,
    back: Option<String>,
    cloze_text: Option<String>,
    extra: Option<String>,
    tags: Option<Vec<String>>,
}

/// Check a `{"cards": [...]}` payload against the card schema.
///
/// One bad card rejects the whole payload.
pub fn validate_cards(value: &Value) -> Result<Vec<DraftCard>, SchemaError> {
    let payload = RawPayload::deserialize(value).map_err(|e| SchemaError::Invalid(e.to_string()))?;

    payload
        .cards
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            validate_card(raw).map_err(|msg| SchemaError::Invalid(format!("card {i}: {msg}")))
        })
        .collect()
}

fn validate_card(raw: RawCard) -> Result<DraftCard, String> {
    let required = |field: Option<String>, name: &str| -> Result<String, String> {
        field
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| format!("missing or blank '{name}'"))
    };

    let content = match raw.kind.trim().to_lowercase().as_str() {
        "basic" => CardContent::Basic {
            front: required(raw.front, "front")?,
            back: required(raw.back, "back")?,
        },
        "cloze" => CardContent::Cloze {
            text: required(raw.cloze_text, "cloze_text")?,
            extra: raw.extra.map(|e| e.trim().to_string()).unwrap_or_default(),
        },
        other => return Err(format!("unknown card type '{other}'")),
    };

    Ok(DraftCard {
        content,
        tags: dedup_tags(raw.tags.unwrap_or_default()),
    })
}

fn parse_and_validate(raw: &str) -> Result<(Vec<DraftCard>, Value), SchemaError> {
    let value = extract_json(raw)?;
    let cards = validate_cards(&value)?;
    Ok((cards, value))
}

// ── Correction ───────────────────────────────────────────────────────────

/// Outcome of [`parse_cards_with_correction`].
#[derive(Debug, Clone)]
pub struct ParsedCards {
    pub cards: Vec<DraftCard>,
    /// The JSON the cards were validated from.
    pub parsed: Value,
    /// Usage of the corrective call, if one was needed.
    pub correction_usage: Option<Usage>,
}

/// Parse and validate model output, spending at most one corrective call.
///
/// The corrective request runs at temperature 0 against the same model. A
/// second failure is final for the chunk.
pub async fn parse_cards_with_correction(
    raw: &str,
    gateway: &dyn LlmGateway,
    model: &str,
    credentials: &Credentials,
    policy: &RetryPolicy,
) -> Result<ParsedCards, SchemaError> {
    let first = match parse_and_validate(raw) {
        Ok((cards, parsed)) => {
            return Ok(ParsedCards {
                cards,
                parsed,
                correction_usage: None,
            })
        }
        Err(e) => e,
    };

    warn!("Model output rejected ({first}); requesting one correction");
    let request = ChatRequest {
        model: model.to_string(),
        messages: repair_messages(raw),
        temperature: 0.0,
    };
    let response = gateway.chat(&request, credentials, policy).await?;
    debug!("Correction returned {} chars", response.content.len());

    let (cards, parsed) = parse_and_validate(&response.content)?;
    Ok(ParsedCards {
        cards,
        parsed,
        correction_usage: Some(response.usage),
    })
}
