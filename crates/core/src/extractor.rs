use crate::error::LoadError;
use crate::models::{Page, UploadedPdf};
use lopdf::Document;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub trait PdfExtractor: Send + Sync {
    fn extract_pages(&self, name: &str, bytes: &[u8]) -> Result<Vec<Page>, LoadError>;
}

/// Parses PDFs in memory with `lopdf`. Nothing is staged on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, name: &str, bytes: &[u8]) -> Result<Vec<Page>, LoadError> {
        if bytes.is_empty() {
            return Err(LoadError::EmptyInput {
                name: name.to_string(),
            });
        }

        let document = Document::load_mem(bytes).map_err(|error| LoadError::PdfParse {
            name: name.to_string(),
            details: error.to_string(),
        })?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| LoadError::PdfParse {
                    name: name.to_string(),
                    details: format!("page {page_no}: {error}"),
                })?;

            pages.push(Page {
                document_name: name.to_string(),
                number: page_no,
                text,
            });
        }

        if pages.is_empty() {
            return Err(LoadError::PdfParse {
                name: name.to_string(),
                details: "pdf has no pages".to_string(),
            });
        }

        Ok(pages)
    }
}

/// Extracts every upload in order and concatenates their pages.
pub fn load_documents(
    uploads: &[UploadedPdf],
    extractor: &dyn PdfExtractor,
) -> Result<Vec<Page>, LoadError> {
    if uploads.is_empty() {
        return Err(LoadError::NoDocuments);
    }

    let mut pages = Vec::new();
    for upload in uploads {
        let extracted = extractor.extract_pages(&upload.name, &upload.bytes)?;
        debug!(document = %upload.name, pages = extracted.len(), "extracted pdf");
        pages.extend(extracted);
    }

    Ok(pages)
}

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}
