//! CLI binary for edgequake-deckgen.
//!
//! A thin shim over the library crate: reads a text or PDF file, runs one
//! deck generation against an in-memory store, and writes the Anki export.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_deckgen::{
    export_to_file, extract_pdf_text, AnkiTextExporter, CardStyle, Credentials, DeckGenError,
    DeckGenerator, DeckSettings, GenerationConfig, GenerationProgressCallback, HttpGateway,
    MemoryDeckStore, NewDeck, ProgressCallback, SourceKind,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per chunk.
struct CliProgressCallback {
    bar: ProgressBar,
    /// Start of the chunk currently in flight. Chunks run one at a time.
    chunk_started: Mutex<Option<Instant>>,
    cards: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner until `on_generation_start` reports the chunk count.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Chunking source…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            chunk_started: Mutex::new(None),
            cards: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} chunks  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Generating");
        self.bar.reset_eta();
    }

    fn chunk_elapsed_secs(&self) -> f64 {
        self.chunk_started
            .lock()
            .ok()
            .and_then(|mut started| started.take())
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl GenerationProgressCallback for CliProgressCallback {
    fn on_generation_start(&self, _deck_id: u64, total_chunks: usize) {
        self.activate_bar(total_chunks);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Generating cards from {total_chunks} chunks…"))
        ));
    }

    fn on_chunk_start(&self, chunk: usize, _total_chunks: usize) {
        if let Ok(mut started) = self.chunk_started.lock() {
            *started = Some(Instant::now());
        }
        self.bar.set_message(format!("chunk {chunk}"));
    }

    fn on_chunk_complete(&self, chunk: usize, total_chunks: usize, cards: usize) {
        let elapsed = self.chunk_elapsed_secs();
        self.cards.fetch_add(cards, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {:<9}  {}",
            green("✓"),
            chunk,
            total_chunks,
            dim(&format!("{cards:>3} cards")),
            dim(&format!("{elapsed:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_chunk_error(&self, chunk: usize, total_chunks: usize, error: &str) {
        let elapsed = self.chunk_elapsed_secs();
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {}  {}",
            red("✗"),
            chunk,
            total_chunks,
            red(&msg),
            dim(&format!("{elapsed:.1}s")),
        ));
        self.bar.abandon();
    }

    fn on_generation_complete(&self, _deck_id: u64, ok_cards: usize, auto_deleted: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} cards ready  {}",
            green("✔"),
            bold(&ok_cards.to_string()),
            dim(&format!(
                "({} generated, {} auto-deleted)",
                self.cards.load(Ordering::SeqCst),
                auto_deleted
            )),
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Basic cards from a text file, export to the current directory
  deckgen notes.txt

  # Cloze cards from pages 3-10 of a PDF
  deckgen --style cloze --pages 3-10 lecture.pdf -o decks/

  # Steer the model
  deckgen --focus "enzyme kinetics" --exclude "history" --glossary glossary.txt notes.md

  # Machine-readable report
  deckgen --json notes.txt > report.json

OUTPUT:
  <title>_<deck id>.txt in Anki's text import format (File → Import).
  Only cards that passed validation and dedupe are exported.

ENVIRONMENT VARIABLES:
  OPENROUTER_API_KEY      API key for the completion endpoint (or OPENROUTER_KEY)
  OPENROUTER_SITE_URL     Sent as HTTP-Referer
  OPENROUTER_APP_NAME     Sent as X-Title
  DECKGEN_MODEL           Override model ID
  DECKGEN_API_URL         Any OpenAI-compatible chat-completions URL
  PDFIUM_LIB_PATH         libpdfium file or the directory containing it
  RUST_LOG                Log filter (overrides --verbose / --quiet)
"#;

/// Generate Anki flashcard decks from study material using LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "deckgen",
    version,
    about = "Generate Anki flashcard decks from text or PDF files using LLMs",
    long_about = "Generate validated Anki flashcards from study material. Text is cleaned and \
chunked, each chunk is sent to an OpenAI-compatible chat-completions endpoint (OpenRouter by \
default), and the returned cards are repaired, validated, filtered and deduplicated before export.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Text, Markdown or PDF file.
    input: PathBuf,

    /// Directory for the exported deck.
    #[arg(short, long, env = "DECKGEN_OUTPUT", default_value = ".")]
    output: PathBuf,

    /// Deck title. Default: the input file name.
    #[arg(long, env = "DECKGEN_TITLE")]
    title: Option<String>,

    /// Card type to generate.
    #[arg(long, env = "DECKGEN_STYLE", value_enum, default_value = "basic")]
    style: StyleArg,

    /// Topics to emphasise.
    #[arg(long, env = "DECKGEN_FOCUS")]
    focus: Option<String>,

    /// Topics to leave out.
    #[arg(long, env = "DECKGEN_EXCLUDE")]
    exclude: Option<String>,

    /// Glossary terms, inline or as a path to a text file.
    #[arg(long, env = "DECKGEN_GLOSSARY")]
    glossary: Option<String>,

    /// Chunk budget in characters.
    #[arg(long, env = "DECKGEN_MAX_CHARS", default_value_t = 3500)]
    max_chars: usize,

    /// PDF page selection: all, 5, or 3-10.
    #[arg(long, env = "DECKGEN_PAGES", default_value = "all")]
    pages: String,

    /// Model ID (e.g. google/gemini-3-flash-preview, openai/gpt-4.1-mini).
    #[arg(long, env = "DECKGEN_MODEL")]
    model: Option<String>,

    /// Chat-completions URL.
    #[arg(long, env = "DECKGEN_API_URL")]
    api_url: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "DECKGEN_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Retries per request on transient failures.
    #[arg(long, env = "DECKGEN_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per-request timeout in seconds.
    #[arg(long, env = "DECKGEN_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "DECKGEN_TEMPERATURE", default_value_t = 0.2)]
    temperature: f32,

    /// Print the generation report as JSON on stdout.
    #[arg(long, env = "DECKGEN_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "DECKGEN_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DECKGEN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DECKGEN_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum StyleArg {
    Basic,
    Cloze,
}

impl From<StyleArg> for CardStyle {
    fn from(v: StyleArg) -> Self {
        match v {
            StyleArg::Basic => CardStyle::Basic,
            StyleArg::Cloze => CardStyle::Cloze,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose asks for them.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let credentials = Credentials::from_env();
    if !credentials.has_key() {
        anyhow::bail!("No API key found. Set OPENROUTER_API_KEY (see --help).");
    }

    // ── Read input ───────────────────────────────────────────────────────
    let (source_text, source_kind) = read_input(&cli.input, &cli.pages).await?;
    let title = cli.title.clone().unwrap_or_else(|| default_title(&cli.input));

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new_dynamic() as Arc<dyn GenerationProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;
    let settings = DeckSettings {
        focus: cli.focus.clone(),
        exclude: cli.exclude.clone(),
        glossary: read_glossary(cli.glossary.as_deref()).await?,
        ..DeckSettings::default()
    };

    // ── Generate ─────────────────────────────────────────────────────────
    let gateway = Arc::new(HttpGateway::new(config.api_url.clone()));
    let store = Arc::new(MemoryDeckStore::new());
    let generator = DeckGenerator::new(gateway, store.clone(), config);

    let deck = generator
        .create_deck(
            NewDeck::new(title, source_text)
                .card_style(cli.style.into())
                .source_kind(source_kind)
                .settings(settings),
        )
        .await?;
    let report = generator
        .generate_deck(deck.id, &credentials)
        .await
        .context("Generation failed")?;

    // ── Export ───────────────────────────────────────────────────────────
    let exported = match export_to_file(store.as_ref(), deck.id, &AnkiTextExporter, &cli.output)
        .await
    {
        Ok(path) => Some(path),
        Err(DeckGenError::NothingToExport { .. }) => None,
        Err(e) => return Err(e).context("Export failed"),
    };

    if cli.json {
        let json = serde_json::to_string_pretty(&serde_json::json!({
            "report": report,
            "output": exported,
        }))
        .context("Failed to serialise report")?;
        println!("{json}");
        return Ok(());
    }

    if !cli.quiet {
        match exported {
            Some(ref path) => eprintln!(
                "{}  {} cards  {}ms  →  {}",
                green("✔"),
                report.ok_cards,
                report.duration_ms,
                bold(&path.display().to_string()),
            ),
            None => eprintln!("{}  No cards passed validation; nothing exported.", cyan("⚠")),
        }
        eprintln!(
            "   {} chunks  /  {} auto-deleted  /  {} duplicates",
            dim(&report.chunks.to_string()),
            dim(&report.auto_deleted.to_string()),
            dim(&report.duplicates_removed.to_string()),
        );
        let cost = report
            .cost_estimate
            .map(|c| format!("  /  ${c:.4}"))
            .unwrap_or_default();
        eprintln!(
            "   {} tokens in  /  {} tokens out{}",
            dim(&report.input_tokens.to_string()),
            dim(&report.output_tokens.to_string()),
            dim(&cost),
        );
    }

    Ok(())
}

/// Map CLI args to `GenerationConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<GenerationConfig> {
    let mut builder = GenerationConfig::builder()
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .temperature(cli.temperature)
        .max_chunk_chars(cli.max_chars);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref url) = cli.api_url {
        builder = builder.api_url(url);
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// PDFs go through pdfium; anything else must be UTF-8 text.
async fn read_input(path: &Path, pages: &str) -> Result<(String, SourceKind)> {
    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));

    if is_pdf {
        let (start, end) = parse_pages(pages)?;
        let pdf = extract_pdf_text(path, start, end)
            .await
            .context("Failed to extract PDF text")?;
        tracing::info!("Extracted {} chars from {} pages", pdf.text.len(), pdf.total_pages);
        return Ok((pdf.text, SourceKind::Pdf));
    }

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(DeckGenError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into())
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return Err(DeckGenError::PermissionDenied {
                path: path.to_path_buf(),
            }
            .into())
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
    };
    let text = String::from_utf8(bytes).map_err(|e| DeckGenError::UnreadableText {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    Ok((text, SourceKind::Text))
}

/// `--glossary` may name a file; otherwise it is the glossary itself.
async fn read_glossary(arg: Option<&str>) -> Result<Option<String>> {
    let Some(arg) = arg.map(str::trim).filter(|a| !a.is_empty()) else {
        return Ok(None);
    };
    let path = Path::new(arg);
    if path.is_file() {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read glossary from {:?}", path))?;
        return Ok(Some(text));
    }
    Ok(Some(arg.to_string()))
}

fn default_title(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.replace(['_', '-'], " "))
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "Untitled deck".to_string())
}

/// Parse `--pages` into 1-indexed inclusive bounds.
fn parse_pages(s: &str) -> Result<(Option<usize>, Option<usize>)> {
    let s = s.trim().to_lowercase();

    if s == "all" {
        return Ok((None, None));
    }

    // Range: "3-10"
    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start.trim().parse().context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;

        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", start);
        }
        if start > end {
            anyhow::bail!("Invalid page range '{}-{}': start must be <= end", start, end);
        }
        return Ok((Some(start), Some(end)));
    }

    // Single page: "5"
    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }
    Ok((Some(page), Some(page)))
}
