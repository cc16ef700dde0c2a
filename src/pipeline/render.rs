//! pdfium access: page text for the prompt, page images on request.
//!
//! pdfium is a blocking C library with thread-local state, so every call
//! runs inside `tokio::task::spawn_blocking`. Nothing here is fatal to a
//! run: the sandboxed parser reads the PDF itself, pdfium only feeds the
//! prompt. Failures are returned as a reason string and logged.

use image::DynamicImage;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Text pulled from the first pages of the sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentText {
    /// Per-page text of the pages that were read, in order.
    pub pages: Vec<String>,
    /// Total pages in the document, when pdfium could open it.
    pub page_count: Option<usize>,
    /// Why text is missing, when it is.
    pub error: Option<String>,
}

impl DocumentText {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Page texts joined with form feeds, cut to `max_chars`.
    ///
    /// `None` when nothing but whitespace was extracted (scanned statements).
    pub fn joined(&self, max_chars: usize) -> Option<String> {
        let all = self
            .pages
            .iter()
            .map(|p| p.trim_end())
            .collect::<Vec<_>>()
            .join("\n\u{000C}\n");
        if all.trim().is_empty() {
            return None;
        }
        if all.chars().count() <= max_chars {
            return Some(all);
        }
        let head: String = all.chars().take(max_chars).collect();
        Some(format!("{head}\n[… truncated]"))
    }

    /// Reason to show the model when [`Self::joined`] is `None`.
    pub fn missing_reason(&self) -> Option<String> {
        match (&self.error, self.page_count) {
            (Some(e), _) => Some(format!("text extraction failed: {e}")),
            (None, Some(n)) if n > 0 => {
                Some("the pages contain no text layer, the statement may be scanned".to_string())
            }
            (None, Some(_)) => Some("the document has no pages".to_string()),
            (None, None) => None,
        }
    }
}

/// Bind pdfium from `lib_dir`, the working directory or the system.
fn bind_pdfium(lib_dir: Option<&Path>) -> Result<Pdfium, PdfiumError> {
    let local = lib_dir.unwrap_or_else(|| Path::new("./"));
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(local))
        .or_else(|_| Pdfium::bind_to_system_library())?;
    Ok(Pdfium::new(bindings))
}

/// Extract the text of the first `max_pages` pages.
pub async fn extract_text(pdf_path: &Path, max_pages: usize, lib_dir: Option<PathBuf>) -> DocumentText {
    let path = pdf_path.to_path_buf();
    match tokio::task::spawn_blocking(move || extract_text_blocking(&path, max_pages, lib_dir.as_deref()))
        .await
    {
        Ok(Ok(text)) => text,
        Ok(Err(reason)) => {
            warn!("Text extraction failed: {}", reason);
            DocumentText::failed(reason)
        }
        Err(e) => DocumentText::failed(format!("text task panicked: {e}")),
    }
}

fn extract_text_blocking(
    pdf_path: &Path,
    max_pages: usize,
    lib_dir: Option<&Path>,
) -> Result<DocumentText, String> {
    let pdfium = bind_pdfium(lib_dir).map_err(|e| format!("pdfium unavailable: {e:?}"))?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| format!("{e:?}"))?;

    let pages = document.pages();
    let page_count = pages.len() as usize;
    let mut texts = Vec::with_capacity(max_pages.min(page_count));

    for (idx, page) in pages.iter().enumerate().take(max_pages) {
        match page.text() {
            Ok(text) => texts.push(text.all()),
            Err(e) => {
                warn!("Page {}: no text ({:?})", idx + 1, e);
                texts.push(String::new());
            }
        }
    }

    debug!(
        "Extracted text from {}/{} pages ({} chars)",
        texts.len(),
        page_count,
        texts.iter().map(String::len).sum::<usize>()
    );

    Ok(DocumentText {
        pages: texts,
        page_count: Some(page_count),
        error: None,
    })
}

/// Rasterise the first `max_pages` pages, longest edge capped at `max_pixels`.
pub async fn render_pages(
    pdf_path: &Path,
    max_pages: usize,
    max_pixels: u32,
    lib_dir: Option<PathBuf>,
) -> Result<Vec<(usize, DynamicImage)>, String> {
    let path = pdf_path.to_path_buf();
    tokio::task::spawn_blocking(move || render_pages_blocking(&path, max_pages, max_pixels, lib_dir.as_deref()))
        .await
        .map_err(|e| format!("render task panicked: {e}"))?
}

fn render_pages_blocking(
    pdf_path: &Path,
    max_pages: usize,
    max_pixels: u32,
    lib_dir: Option<&Path>,
) -> Result<Vec<(usize, DynamicImage)>, String> {
    let pdfium = bind_pdfium(lib_dir).map_err(|e| format!("pdfium unavailable: {e:?}"))?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| format!("{e:?}"))?;

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::new();
    for (idx, page) in document.pages().iter().enumerate().take(max_pages) {
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| format!("page {}: {e:?}", idx + 1))?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        results.push((idx, image));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joined_skips_blank_documents() {
        let t = DocumentText {
            pages: vec!["  ".into(), "\n".into()],
            page_count: Some(2),
            error: None,
        };
        assert_eq!(t.joined(100), None);
        assert!(t.missing_reason().unwrap().contains("scanned"));
    }

    #[test]
    fn joined_truncates_on_char_boundary() {
        let t = DocumentText {
            pages: vec!["ééééé".into()],
            page_count: Some(1),
            error: None,
        };
        let s = t.joined(3).unwrap();
        assert!(s.starts_with("ééé\n"));
        assert!(s.ends_with("[… truncated]"));
    }

    #[test]
    fn pages_are_separated() {
        let t = DocumentText {
            pages: vec!["one".into(), "two".into()],
            page_count: Some(2),
            error: None,
        };
        assert_eq!(t.joined(100).unwrap(), "one\n\u{000C}\ntwo");
    }

    #[test]
    fn failure_reason_is_reported() {
        let t = DocumentText::failed("pdfium unavailable");
        assert_eq!(t.joined(10), None);
        assert!(t.missing_reason().unwrap().contains("pdfium unavailable"));
    }

    #[tokio::test]
    async fn garbage_file_never_panics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pdf");
        std::fs::write(&path, b"%PDF-garbage").unwrap();
        let text = extract_text(&path, 2, None).await;
        assert!(text.error.is_some() || text.joined(100).is_none());
    }
}
