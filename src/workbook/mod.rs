//! `.xlsx` access for the in-memory [`Document`](crate::models::Document).
//!
//! Reading goes through calamine, which yields cell values only. Saving does
//! not regenerate the workbook: [`save_workbook`] edits the uploaded package
//! in place with zip and quick-xml, so everything the value model cannot
//! represent survives.

mod drawing;
mod package;
mod reader;
mod writer;

use thiserror::Error;

use crate::models::ImageExtension;

pub use reader::read_workbook;
pub use writer::save_workbook;

/// Errors raised while reading or saving a workbook.
#[derive(Debug, Error)]
pub enum WorkbookError {
    #[error("Failed to read workbook: {0}")]
    Read(#[from] calamine::XlsxError),

    #[error("Invalid workbook package: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Invalid workbook XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Workbook has no sheets")]
    NoSheets,

    #[error("Workbook part {0} is missing")]
    MissingPart(String),

    #[error("Sheet {0} is not in the workbook")]
    UnknownSheet(String),

    #[error("Unsupported image data: {0}")]
    UnsupportedImage(String),
}

/// Detect the format of downloaded image bytes.
///
/// Only PNG, JPEG, GIF and WebP are embedded. Anything else (HTML error
/// pages, unknown or truncated data) is rejected before the document is
/// touched.
pub fn detect_image_format(data: &[u8]) -> Result<ImageExtension, WorkbookError> {
    let mime = infer::get(data)
        .map(|kind| kind.mime_type())
        .ok_or_else(|| WorkbookError::UnsupportedImage("unrecognised content".to_string()))?;

    ImageExtension::from_mime_type(mime)
        .ok_or_else(|| WorkbookError::UnsupportedImage(mime.to_string()))
}

/// Smallest valid PNG (1x1 transparent pixel), shared by tests.
#[cfg(test)]
pub(crate) const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// Smallest lossless WebP (1x1), shared by tests.
#[cfg(test)]
pub(crate) const TINY_WEBP: &[u8] = &[
    0x52, 0x49, 0x46, 0x46, 0x1A, 0x00, 0x00, 0x00, 0x57, 0x45, 0x42, 0x50, 0x56, 0x50, 0x38,
    0x4C, 0x0D, 0x00, 0x00, 0x00, 0x2F, 0x00, 0x00, 0x00, 0x10, 0x07, 0x10, 0x11, 0x11, 0x88,
    0x88, 0xFE, 0x07, 0x00,
];

/// Build an `.xlsx` holding the text, number and boolean cells of
/// `document`, the way a spreadsheet application would save it.
#[cfg(test)]
pub(crate) fn build_workbook(document: &crate::models::Document) -> Vec<u8> {
    use crate::models::CellValue;

    let mut workbook = rust_xlsxwriter::Workbook::new();
    for sheet in &document.sheets {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(sheet.name.as_str()).unwrap();
        for cell in sheet.cells() {
            let (row, col) = (cell.row - 1, (cell.col - 1) as u16);
            match &cell.value {
                CellValue::Text(s) | CellValue::RichText(s) => {
                    worksheet.write_string(row, col, s.as_str()).unwrap();
                }
                CellValue::Number(n) => {
                    worksheet.write_number(row, col, *n).unwrap();
                }
                CellValue::Bool(b) => {
                    worksheet.write_boolean(row, col, *b).unwrap();
                }
                CellValue::Empty | CellValue::Image(_) => {}
            }
        }
    }
    workbook.save_to_buffer().unwrap()
}
