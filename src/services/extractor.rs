use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use lopdf::Document;

/// Pulls the plain text of an invoice document.
#[async_trait]
pub trait InvoiceExtractor: Send + Sync {
    async fn extract(&self, document: &Path) -> Result<String>;
}

/// Text extraction from PDF content streams via `lopdf`.
///
/// Scanned invoices without a text layer produce no text and are rejected.
#[derive(Debug, Clone, Default)]
pub struct PdfTextExtractor;

#[async_trait]
impl InvoiceExtractor for PdfTextExtractor {
    async fn extract(&self, document: &Path) -> Result<String> {
        let path = document.to_path_buf();
        tokio::task::spawn_blocking(move || extract_pdf_text(&path))
            .await
            .context("pdf extraction task failed")?
    }
}

pub fn extract_pdf_text(path: &Path) -> Result<String> {
    let doc = Document::load(path)
        .with_context(|| format!("cannot parse PDF {}", path.display()))?;
    if doc.is_encrypted() {
        bail!("PDF {} is encrypted", path.display());
    }

    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    if pages.is_empty() {
        bail!("PDF {} has no pages", path.display());
    }

    let mut text = String::new();
    for page in &pages {
        match doc.extract_text(&[*page]) {
            Ok(page_text) => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(page_text.trim_end());
            }
            Err(e) => tracing::warn!("Skipping unreadable page {} of {}: {}", page, path.display(), e),
        }
    }

    let text = normalize_whitespace(&text);
    if text.is_empty() {
        bail!("PDF {} contains no extractable text", path.display());
    }

    tracing::debug!("Extracted {} chars from {} page(s)", text.len(), pages.len());
    Ok(text)
}

/// Collapses runs of blank lines and trailing spaces left by content streams.
fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_invoice_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invoice.pdf");
        std::fs::write(
            &path,
            testing::pdf_with_lines(&["INVOICE 2024-117", "Office Supplies 250000"]),
        )
        .unwrap();

        let text = extract_pdf_text(&path).unwrap();
        assert!(text.contains("INVOICE 2024-117"));
        assert!(text.contains("Office Supplies 250000"));
    }

    #[test]
    fn test_rejects_non_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invoice.pdf");
        std::fs::write(&path, b"this is not a pdf").unwrap();

        assert!(extract_pdf_text(&path).is_err());
    }

    #[test]
    fn test_rejects_pdf_without_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.pdf");
        std::fs::write(&path, testing::pdf_with_lines(&[])).unwrap();

        let err = extract_pdf_text(&path).unwrap_err();
        assert!(err.to_string().contains("no extractable text"));
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("a  \n\n\n\nb\n"), "a\n\nb");
    }
}
