//! PDF text extraction via pdfium.
//!
//! Study material often arrives as a PDF. We pull the embedded text layer of
//! each page and hand it to the normaliser, which reflows the hard line
//! breaks (decks created from PDFs use [`crate::model::SourceKind::Pdf`]).
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state and no async story.
//! Extraction runs on Tokio's blocking pool so worker threads never stall.
//!
//! ## Library lookup
//!
//! `PDFIUM_LIB_PATH` may name the library file or the directory holding it.
//! Without it, the system library is used.

use crate::error::DeckGenError;
use pdfium_render::prelude::*;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Text of the selected pages plus the document's page count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfText {
    /// Page texts joined by a blank line.
    pub text: String,
    pub total_pages: usize,
}

/// Extract text from pages `page_start..=page_end` (1-indexed, inclusive).
///
/// `None` bounds mean the first or last page. Bounds past the end are
/// clamped; an empty range yields empty text.
pub async fn extract_pdf_text(
    path: impl AsRef<Path>,
    page_start: Option<usize>,
    page_end: Option<usize>,
) -> Result<PdfText, DeckGenError> {
    let path = path.as_ref().to_path_buf();
    validate_pdf_file(&path)?;

    tokio::task::spawn_blocking(move || extract_blocking(&path, page_start, page_end))
        .await
        .map_err(|e| DeckGenError::Internal(format!("PDF extraction task panicked: {}", e)))?
}

/// Extract text from an uploaded PDF held in memory.
///
/// pdfium needs a file path, so the bytes go to a temporary file that is
/// removed when extraction finishes.
pub async fn extract_pdf_text_from_bytes(
    bytes: &[u8],
    page_start: Option<usize>,
    page_end: Option<usize>,
) -> Result<PdfText, DeckGenError> {
    let temp_dir = tempfile::TempDir::new().map_err(|e| DeckGenError::Internal(e.to_string()))?;
    let path = temp_dir.path().join("upload.pdf");
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| DeckGenError::Internal(format!("Failed to write temp file: {}", e)))?;

    let result = extract_pdf_text(&path, page_start, page_end).await;
    drop(temp_dir);
    result
}

/// Check existence, readability and the `%PDF` magic bytes.
fn validate_pdf_file(path: &Path) -> Result<(), DeckGenError> {
    if !path.exists() {
        return Err(DeckGenError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    match std::fs::File::open(path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_err() || &magic != b"%PDF" {
                return Err(DeckGenError::NotAPdf {
                    path: path.to_path_buf(),
                    magic,
                });
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(DeckGenError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }
        Err(_) => Err(DeckGenError::FileNotFound {
            path: path.to_path_buf(),
        }),
    }
}

/// Bind to pdfium, honouring `PDFIUM_LIB_PATH`.
fn bind_pdfium() -> Result<Pdfium, DeckGenError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(p) if !p.trim().is_empty() => {
            let p = PathBuf::from(p);
            let lib = if p.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&p)
            } else {
                p
            };
            debug!("Binding pdfium from {}", lib.display());
            Pdfium::bind_to_library(&lib)
        }
        _ => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| DeckGenError::PdfiumBindingFailed(format!("{:?}", e)))?;

    Ok(Pdfium::new(bindings))
}

/// Resolve 1-indexed inclusive bounds to a 0-indexed page range.
fn page_range(
    page_start: Option<usize>,
    page_end: Option<usize>,
    total: usize,
) -> std::ops::Range<usize> {
    let start = page_start.unwrap_or(1).max(1) - 1;
    let end = page_end.unwrap_or(total).min(total);
    start.min(end)..end
}

fn extract_blocking(
    pdf_path: &Path,
    page_start: Option<usize>,
    page_end: Option<usize>,
) -> Result<PdfText, DeckGenError> {
    let pdfium = bind_pdfium()?;

    let document = pdfium.load_pdf_from_file(pdf_path, None).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.to_lowercase().contains("password") {
            DeckGenError::PasswordRequired {
                path: pdf_path.to_path_buf(),
            }
        } else {
            DeckGenError::CorruptPdf {
                path: pdf_path.to_path_buf(),
                detail: err_str,
            }
        }
    })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    let range = page_range(page_start, page_end, total_pages);
    info!(
        "PDF loaded: {} pages, extracting {}..={}",
        total_pages,
        range.start + 1,
        range.end
    );

    let mut texts = Vec::with_capacity(range.len());
    for idx in range {
        let page = pages
            .get(idx as u16)
            .map_err(|e| DeckGenError::TextExtractionFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?;
        let text = page
            .text()
            .map_err(|e| DeckGenError::TextExtractionFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            })?
            .all();

        if text.trim().is_empty() {
            warn!("Page {} has no text layer (scanned?)", idx + 1);
            continue;
        }
        debug!("Page {}: {} chars", idx + 1, text.chars().count());
        texts.push(text);
    }

    Ok(PdfText {
        text: texts.join("\n\n"),
        total_pages,
    })
}
