//! Page-range splitting: document → sub-documents → page windows.
//!
//! A 1 000-page scanned book cannot be uploaded or transcribed in one call.
//! The same stride algorithm is applied twice: once to cut the book into
//! uploadable sub-documents, once to cut each sub-document into windows small
//! enough for one OCR response.
//!
//! ```text
//! pages 1..=10, size 6, overlap 2 (stride 4)
//!   [1 ─────── 6]
//!           [5 ─────── 10]
//! ```
//!
//! A final remainder shorter than the overlap is folded into the previous
//! unit instead of becoming a sliver of one or two pages.

use crate::error::DongyError;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A loaded source document. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: PathBuf,
    pub total_pages: usize,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>, total_pages: usize) -> Self {
        Self {
            path: path.into(),
            total_pages,
        }
    }

    /// Open the PDF with pdfium and read its page count.
    pub async fn load(path: &Path) -> Result<Self, DongyError> {
        let owned = path.to_path_buf();
        let total_pages = tokio::task::spawn_blocking(move || count_pages_blocking(&owned))
            .await
            .map_err(|e| DongyError::Internal(format!("Page-count task panicked: {}", e)))??;
        if total_pages == 0 {
            return Err(DongyError::EmptyDocument {
                path: path.to_path_buf(),
            });
        }
        Ok(Self::new(path, total_pages))
    }

    /// File stem used to derive sub-document ids and checkpoint names.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "document".to_string())
    }
}

fn count_pages_blocking(path: &Path) -> Result<usize, DongyError> {
    let pdfium = Pdfium::default();
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| DongyError::CorruptPdf {
            path: path.to_path_buf(),
            detail: format!("{:?}", e),
        })?;
    Ok(document.pages().len() as usize)
}

/// A contiguous page range of a [`Document`], the unit of upload and of
/// checkpoint resumability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDocument {
    /// 0-based position in processing order.
    pub index: usize,
    pub start_page: usize,
    pub end_page: usize,
    /// Pages shared with the previous sub-document.
    pub overlap_pages: usize,
    /// Stable id derived from the file name and range.
    pub id: String,
}

impl SubDocument {
    pub fn page_count(&self) -> usize {
        self.end_page + 1 - self.start_page
    }
}

/// A window of pages inside a sub-document, transcribed by one OCR call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageWindow {
    pub start_page: usize,
    pub end_page: usize,
    /// 0-based position within the sub-document.
    pub position: usize,
}

/// Split `first..=last` into inclusive ranges of `size` pages sharing
/// `overlap` pages with their neighbour.
pub fn split_range(
    first: usize,
    last: usize,
    size: usize,
    overlap: usize,
) -> Result<Vec<(usize, usize)>, DongyError> {
    if size == 0 || overlap >= size {
        return Err(DongyError::InvalidRange { size, overlap });
    }
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    if last < first {
        return Ok(ranges);
    }

    let stride = size - overlap;
    let mut start = first;
    loop {
        let end = (start + size - 1).min(last);
        ranges.push((start, end));
        if end == last {
            break;
        }
        let remainder = last - end;
        if remainder < overlap {
            if let Some(tail) = ranges.last_mut() {
                tail.1 = last;
            }
            break;
        }
        start += stride;
    }
    Ok(ranges)
}

/// Partition a document into overlapping sub-documents.
pub fn split_document(
    document: &Document,
    pages_per_chunk: usize,
    overlap_pages: usize,
) -> Result<Vec<SubDocument>, DongyError> {
    let stem = document.stem();
    let ranges = split_range(1, document.total_pages, pages_per_chunk, overlap_pages)?;
    Ok(ranges
        .into_iter()
        .enumerate()
        .map(|(index, (start_page, end_page))| SubDocument {
            index,
            start_page,
            end_page,
            overlap_pages: if index == 0 { 0 } else { overlap_pages },
            id: format!("{}_part{:03}_p{}-{}", stem, index + 1, start_page, end_page),
        })
        .collect())
}

/// Partition a sub-document into OCR windows.
pub fn page_windows(
    sub: &SubDocument,
    pages_per_request: usize,
    overlap_pages: usize,
) -> Result<Vec<PageWindow>, DongyError> {
    let ranges = split_range(sub.start_page, sub.end_page, pages_per_request, overlap_pages)?;
    Ok(ranges
        .into_iter()
        .enumerate()
        .map(|(position, (start_page, end_page))| PageWindow {
            start_page,
            end_page,
            position,
        })
        .collect())
}
