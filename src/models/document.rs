//! In-memory spreadsheet model.
//!
//! A [`Document`] is an ordered list of sheets, each holding sparse rows of
//! cells addressed by 1-based row/column numbers (the same numbering users see
//! in a spreadsheet application). Rows and cells are kept sorted so iteration
//! order is stable and reproducible.

use std::fmt;
use std::sync::Arc;

/// Width and height, in pixels, of every embedded image.
pub const ANCHOR_SIZE_PX: u32 = 100;

/// Image file extensions recognised in cell URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageExtension {
    Jpg,
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageExtension {
    /// Parse an extension (without the leading dot), ignoring case.
    pub fn parse(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" => Some(Self::Jpg),
            "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    /// Format reported by content sniffing, for the formats that can be
    /// embedded.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime {
            "image/png" => Some(Self::Png),
            "image/jpeg" => Some(Self::Jpeg),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpg | Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpg => "jpg",
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }
}

impl fmt::Display for ImageExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position and size binding an embedded image to a cell.
///
/// `row` and `col` are zero-based, so the image's top-left corner sits on the
/// top-left corner of the 1-based cell `(row + 1, col + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageAnchor {
    pub row: u32,
    pub col: u32,
    pub width: u32,
    pub height: u32,
}

impl ImageAnchor {
    /// Anchor for the 1-based cell at `(row, col)` using the fixed image size.
    pub fn for_cell(row: u32, col: u32) -> Self {
        Self {
            row: row.saturating_sub(1),
            col: col.saturating_sub(1),
            width: ANCHOR_SIZE_PX,
            height: ANCHOR_SIZE_PX,
        }
    }
}

/// Image bytes placed in a cell.
#[derive(Clone, PartialEq)]
pub struct EmbeddedImage {
    pub data: Arc<[u8]>,
    pub extension: ImageExtension,
    pub anchor: ImageAnchor,
}

impl fmt::Debug for EmbeddedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedImage")
            .field("bytes", &self.data.len())
            .field("extension", &self.extension)
            .field("anchor", &self.anchor)
            .finish()
    }
}

/// Value held by a cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    /// Formatted or hyperlinked text; only its plain content is kept.
    RichText(String),
    Number(f64),
    Bool(bool),
    Image(EmbeddedImage),
}

impl CellValue {
    /// Plain text of the value, if it is textual.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) | CellValue::RichText(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, CellValue::Image(_))
    }
}

/// A single addressed cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub row: u32,
    pub col: u32,
    pub value: CellValue,
}

impl Cell {
    /// Replace the cell's value with an embedded image, returning the old value.
    pub fn embed_image(&mut self, image: EmbeddedImage) -> CellValue {
        std::mem::replace(&mut self.value, CellValue::Image(image))
    }
}

/// A row of cells sorted by column.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub index: u32,
    pub cells: Vec<Cell>,
}

/// A named worksheet.
#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Row>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
        }
    }

    /// Set the value of the 1-based cell `(row, col)`, creating it if needed.
    pub fn set_value(&mut self, row: u32, col: u32, value: CellValue) {
        let row_pos = match self.rows.binary_search_by_key(&row, |r| r.index) {
            Ok(pos) => pos,
            Err(pos) => {
                self.rows.insert(
                    pos,
                    Row {
                        index: row,
                        cells: Vec::new(),
                    },
                );
                pos
            }
        };

        let cells = &mut self.rows[row_pos].cells;
        match cells.binary_search_by_key(&col, |c| c.col) {
            Ok(pos) => cells[pos].value = value,
            Err(pos) => cells.insert(pos, Cell { row, col, value }),
        }
    }

    pub fn cell(&self, row: u32, col: u32) -> Option<&Cell> {
        let r = self.rows.binary_search_by_key(&row, |r| r.index).ok()?;
        let cells = &self.rows[r].cells;
        let c = cells.binary_search_by_key(&col, |c| c.col).ok()?;
        Some(&cells[c])
    }

    pub fn cell_mut(&mut self, row: u32, col: u32) -> Option<&mut Cell> {
        let r = self.rows.binary_search_by_key(&row, |r| r.index).ok()?;
        let cells = &mut self.rows[r].cells;
        let c = cells.binary_search_by_key(&col, |c| c.col).ok()?;
        Some(&mut cells[c])
    }

    /// All cells in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.rows.iter().flat_map(|r| r.cells.iter())
    }
}

/// A workbook: an ordered list of sheets.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub sheets: Vec<Sheet>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_sheet(&mut self, sheet: Sheet) {
        self.sheets.push(sheet);
    }

    /// Total number of cells holding an embedded image.
    pub fn image_count(&self) -> usize {
        self.sheets
            .iter()
            .flat_map(|s| s.cells())
            .filter(|c| c.value.is_image())
            .count()
    }
}
