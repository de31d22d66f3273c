//! Workbook loading via calamine.

use std::io::Cursor;

use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};

use super::WorkbookError;
use crate::models::{CellValue, Document, Sheet};

/// Parse `.xlsx` bytes into a [`Document`].
///
/// Cell coordinates are converted to 1-based numbering. Empty cells are not
/// materialised.
pub fn read_workbook(bytes: &[u8]) -> Result<Document, WorkbookError> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))?;

    let names = workbook.sheet_names();
    if names.is_empty() {
        return Err(WorkbookError::NoSheets);
    }

    let mut document = Document::new();
    for name in names {
        let range = workbook.worksheet_range(&name)?;
        let mut sheet = Sheet::new(name);

        if let Some((first_row, first_col)) = range.start() {
            for (row, col, data) in range.used_cells() {
                let value = cell_value(data);
                if value == CellValue::Empty {
                    continue;
                }
                sheet.set_value(first_row + row as u32 + 1, first_col + col as u32 + 1, value);
            }
        }

        tracing::debug!(
            "Loaded sheet '{}' with {} rows",
            sheet.name,
            sheet.rows.len()
        );
        document.push_sheet(sheet);
    }

    Ok(document)
}

fn cell_value(data: &Data) -> CellValue {
    match data {
        Data::Empty => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => CellValue::Number(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(e) => CellValue::Text(e.to_string()),
    }
}
