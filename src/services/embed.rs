//! Replaces image-URL cells with the downloaded images.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use super::progress::ProgressBus;
use super::scan::{ImageReference, ReferenceIndex};
use crate::fetch::{FetchOutcome, FetchResult};
use crate::models::{Document, EmbeddedImage, ImageAnchor, ImageExtension, Stage, EMBED_BAND};
use crate::workbook;

/// Why a single reference could not be embedded.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("sheet {sheet} has no cell at row {row}, column {col}")]
    MissingCell { sheet: usize, row: u32, col: u32 },

    #[error("cell already holds an image")]
    AlreadyEmbedded,

    #[error("cell text no longer matches the scanned URL")]
    TextChanged,

    #[error("{0}")]
    Image(String),
}

/// Counts from one embedding pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedReport {
    /// References belonging to successfully fetched URLs.
    pub total: usize,
    pub embedded: usize,
    pub skipped: usize,
}

/// Embed every successfully fetched image into all cells that referenced it.
///
/// References are visited in index order. A failing reference is logged and
/// skipped; it still counts as processed for progress. Cells whose URL failed
/// to download are left untouched.
pub fn embed_images(
    job_id: &str,
    document: &mut Document,
    index: &ReferenceIndex,
    results: &[FetchResult],
    bus: &ProgressBus,
) -> EmbedReport {
    let fetched: HashMap<&str, &Arc<[u8]>> = results
        .iter()
        .filter_map(|r| match &r.outcome {
            FetchOutcome::Fetched(data) => Some((r.url.as_str(), data)),
            FetchOutcome::Failed { .. } => None,
        })
        .collect();

    let mut report = EmbedReport {
        total: index
            .iter()
            .filter(|(url, _)| fetched.contains_key(url))
            .map(|(_, refs)| refs.len())
            .sum(),
        ..Default::default()
    };

    for (url, references) in index.iter() {
        let Some(data) = fetched.get(url) else {
            continue;
        };
        let format = workbook::detect_image_format(data).map_err(|e| e.to_string());

        for reference in references {
            let outcome = match &format {
                Ok(extension) => embed_reference(document, reference, data, *extension),
                Err(reason) => Err(EmbedError::Image(reason.clone())),
            };

            match outcome {
                Ok(()) => report.embedded += 1,
                Err(e) => {
                    warn!(
                        "Failed to embed {} at sheet {} row {} col {}: {}",
                        url, reference.sheet, reference.row, reference.col, e
                    );
                    report.skipped += 1;
                }
            }

            let processed = report.embedded + report.skipped;
            bus.publish(
                job_id,
                Stage::Embedding,
                format!("embedding images {}/{}", processed, report.total),
                EMBED_BAND.at(processed, report.total),
            );
        }
    }

    report
}

fn embed_reference(
    document: &mut Document,
    reference: &ImageReference,
    data: &Arc<[u8]>,
    extension: ImageExtension,
) -> Result<(), EmbedError> {
    let cell = document
        .sheets
        .get_mut(reference.sheet)
        .and_then(|sheet| sheet.cell_mut(reference.row, reference.col))
        .ok_or(EmbedError::MissingCell {
            sheet: reference.sheet,
            row: reference.row,
            col: reference.col,
        })?;

    if cell.value.is_image() {
        return Err(EmbedError::AlreadyEmbedded);
    }
    if cell.value.as_text() != Some(reference.url.as_str()) {
        return Err(EmbedError::TextChanged);
    }

    cell.embed_image(EmbeddedImage {
        data: Arc::clone(data),
        extension,
        anchor: ImageAnchor::for_cell(reference.row, reference.col),
    });
    Ok(())
}
