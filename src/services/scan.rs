//! Image link detection.
//!
//! Walks every cell of a document once and indexes the cells whose text is an
//! HTTP(S) URL pointing at an image file.

use std::collections::HashMap;

use url::Url;

use crate::models::{Document, ImageExtension};

/// A cell whose text is an image URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub url: String,
    /// Index of the sheet within the document.
    pub sheet: usize,
    /// 1-based row of the cell.
    pub row: u32,
    /// 1-based column of the cell.
    pub col: u32,
    pub extension: ImageExtension,
}

/// Image references grouped by URL, in first-seen order.
///
/// Every URL key holds at least one reference.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    entries: Vec<(String, Vec<ImageReference>)>,
    positions: HashMap<String, usize>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: ImageReference) {
        match self.positions.get(&reference.url) {
            Some(&pos) => self.entries[pos].1.push(reference),
            None => {
                self.positions
                    .insert(reference.url.clone(), self.entries.len());
                self.entries
                    .push((reference.url.clone(), vec![reference]));
            }
        }
    }

    /// References for `url`, in document order.
    pub fn get(&self, url: &str) -> Option<&[ImageReference]> {
        self.positions
            .get(url)
            .map(|&pos| self.entries[pos].1.as_slice())
    }

    /// Distinct URLs in first-seen order.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(url, _)| url.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ImageReference])> {
        self.entries
            .iter()
            .map(|(url, refs)| (url.as_str(), refs.as_slice()))
    }

    /// Number of distinct URLs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of referencing cells across all URLs.
    pub fn reference_count(&self) -> usize {
        self.entries.iter().map(|(_, refs)| refs.len()).sum()
    }
}

/// Extension of the image a URL points at, if it is a recognised image type.
///
/// Only the URL path is considered, so query strings and fragments are ignored.
pub fn detect_extension(url: &str) -> Option<ImageExtension> {
    let parsed = Url::parse(url).ok()?;
    let file_name = parsed.path().rsplit('/').next()?;
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    ImageExtension::parse(ext)
}

/// Build the reference index for `document`.
pub fn scan_document(document: &Document) -> ReferenceIndex {
    let mut index = ReferenceIndex::new();

    for (sheet_idx, sheet) in document.sheets.iter().enumerate() {
        for cell in sheet.cells() {
            let Some(text) = cell.value.as_text() else {
                continue;
            };
            if !text.starts_with("http") {
                continue;
            }
            let Some(extension) = detect_extension(text) else {
                continue;
            };

            index.insert(ImageReference {
                url: text.to_string(),
                sheet: sheet_idx,
                row: cell.row,
                col: cell.col,
                extension,
            });
        }
    }

    tracing::debug!(
        "Scanned {} sheets: {} image references, {} distinct URLs",
        document.sheets.len(),
        index.reference_count(),
        index.len()
    );
    index
}
