//! Data models for imagesheet.

mod document;
mod progress;

pub use document::{
    Cell, CellValue, Document, EmbeddedImage, ImageAnchor, ImageExtension, Row, Sheet,
    ANCHOR_SIZE_PX,
};
pub use progress::{ProgressBand, ProgressEvent, Stage, DOWNLOAD_BAND, EMBED_BAND};
