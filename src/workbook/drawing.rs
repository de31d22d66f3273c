//! Worksheet and drawing XML edits for embedded pictures.

use std::collections::HashSet;
use std::io::{BufRead, Write};

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use super::package::{attribute, relationship_id, XML_DECLARATION};
use super::WorkbookError;
use crate::models::ImageAnchor;

const SPREADSHEET_DRAWING_NS: &str =
    "http://schemas.openxmlformats.org/drawingml/2006/spreadsheetDrawing";
const DRAWINGML_NS: &str = "http://schemas.openxmlformats.org/drawingml/2006/main";
const RELATIONSHIPS_NS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

pub(crate) const DRAWING_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.drawing+xml";

/// English Metric Units per screen pixel at 96 dpi.
const EMU_PER_PIXEL: u64 = 9525;

/// Worksheet children that must come after `<drawing>`.
const AFTER_DRAWING: &[&[u8]] = &[
    b"legacyDrawing",
    b"legacyDrawingHF",
    b"drawingHF",
    b"picture",
    b"oleObjects",
    b"controls",
    b"webPublishItems",
    b"tableParts",
    b"extLst",
];

/// Result of rewriting one worksheet part.
#[derive(Debug)]
pub(crate) struct SheetPatch {
    pub xml: Vec<u8>,
    /// Whether a cleared cell carried a formula.
    pub removed_formula: bool,
}

/// Relationship id of the worksheet's `<drawing>`, if it has one.
pub(crate) fn drawing_rel_id(sheet_xml: &[u8]) -> Result<Option<String>, WorkbookError> {
    let mut reader = Reader::from_reader(sheet_xml);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"drawing" => {
                return relationship_id(&reader, &e);
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
        buf.clear();
    }
}

/// Empty the cells in `cleared` (1-based `(row, col)`), keeping their style,
/// and reference `drawing_rel` from a new `<drawing>` element when given.
pub(crate) fn patch_sheet(
    sheet_xml: &[u8],
    cleared: &HashSet<(u32, u32)>,
    drawing_rel: Option<&str>,
) -> Result<SheetPatch, WorkbookError> {
    let mut reader = Reader::from_reader(sheet_xml);
    let mut writer = Writer::new(Vec::with_capacity(sheet_xml.len() + 256));
    let mut buf = Vec::new();
    let mut skipped = Vec::new();

    let mut drawing_rel = drawing_rel;
    let mut prefix: Option<String> = None;
    let mut depth = 0usize;
    let mut row = 0u32;
    let mut next_col = 1u32;
    let mut removed_formula = false;

    loop {
        let event = reader.read_event_into(&mut buf)?;

        if depth == 1 {
            let before_this = match &event {
                Event::Start(e) | Event::Empty(e) => {
                    AFTER_DRAWING.contains(&e.local_name().as_ref())
                }
                Event::End(_) => true,
                _ => false,
            };
            if before_this {
                if let Some(rel_id) = drawing_rel.take() {
                    write_drawing_ref(&mut writer, prefix.as_deref(), rel_id)?;
                }
            }
        }

        let mut replacement = None;
        match &event {
            Event::Eof => break,
            Event::Start(e) => {
                if depth == 0 {
                    prefix = element_prefix(e);
                }
                match e.local_name().as_ref() {
                    b"row" => {
                        row = row_number(&reader, e, row)?;
                        next_col = 1;
                    }
                    b"c" => {
                        let (r, c) = cell_position(&reader, e, row, next_col)?;
                        next_col = c + 1;
                        if cleared.contains(&(r, c)) {
                            replacement = Some(Event::Empty(cleared_cell(e)));
                            removed_formula |= skip_cell(&mut reader, &mut skipped)?;
                        }
                    }
                    _ => {}
                }
                if replacement.is_none() {
                    depth += 1;
                }
            }
            Event::Empty(e) => match e.local_name().as_ref() {
                b"row" => {
                    row = row_number(&reader, e, row)?;
                    next_col = 1;
                }
                b"c" => {
                    let (r, c) = cell_position(&reader, e, row, next_col)?;
                    next_col = c + 1;
                    if cleared.contains(&(r, c)) {
                        replacement = Some(Event::Empty(cleared_cell(e)));
                    }
                }
                _ => {}
            },
            Event::End(_) => depth = depth.saturating_sub(1),
            _ => {}
        }

        match replacement {
            Some(event) => writer.write_event(event)?,
            None => writer.write_event(event)?,
        }
        buf.clear();
    }

    Ok(SheetPatch {
        xml: writer.into_inner(),
        removed_formula,
    })
}

fn element_prefix(element: &BytesStart<'_>) -> Option<String> {
    element
        .name()
        .prefix()
        .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned())
}

fn write_drawing_ref(
    writer: &mut Writer<Vec<u8>>,
    prefix: Option<&str>,
    rel_id: &str,
) -> Result<(), WorkbookError> {
    let name = match prefix {
        Some(p) => format!("{}:drawing", p),
        None => "drawing".to_string(),
    };
    let element = BytesStart::new(name)
        .with_attributes([("xmlns:r", RELATIONSHIPS_NS), ("r:id", rel_id)]);
    writer.write_event(Event::Empty(element))?;
    Ok(())
}

fn row_number<B>(
    reader: &Reader<B>,
    element: &BytesStart<'_>,
    previous: u32,
) -> Result<u32, WorkbookError> {
    Ok(attribute(reader, element, b"r")?
        .and_then(|r| r.parse().ok())
        .unwrap_or(previous + 1))
}

/// 1-based `(row, col)` of a `<c>` element. Cells without an `r` attribute
/// follow the previous cell in the row.
fn cell_position<B>(
    reader: &Reader<B>,
    element: &BytesStart<'_>,
    row: u32,
    next_col: u32,
) -> Result<(u32, u32), WorkbookError> {
    Ok(attribute(reader, element, b"r")?
        .and_then(|r| parse_cell_ref(&r))
        .unwrap_or((row, next_col)))
}

/// Parse an A1-style reference such as `AB12` into 1-based `(row, col)`.
pub(crate) fn parse_cell_ref(reference: &str) -> Option<(u32, u32)> {
    let reference = reference.replace('$', "");
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }

    let col = letters.chars().try_fold(0u32, |acc, c| {
        let digit = c.to_ascii_uppercase() as u32 - 'A' as u32 + 1;
        acc.checked_mul(26)?.checked_add(digit)
    })?;
    let row = digits.parse().ok()?;
    Some((row, col))
}

/// Copy of a `<c>` element with only its reference and style.
fn cleared_cell(cell: &BytesStart<'_>) -> BytesStart<'static> {
    let name = String::from_utf8_lossy(cell.name().as_ref()).into_owned();
    let mut empty = BytesStart::new(name);
    for attr in cell.attributes().flatten() {
        if matches!(attr.key.as_ref(), b"r" | b"s") {
            empty.push_attribute(attr);
        }
    }
    empty
}

/// Consume a cell's children up to its end tag. Returns whether it held a
/// formula.
fn skip_cell<R: BufRead>(
    reader: &mut Reader<R>,
    buf: &mut Vec<u8>,
) -> Result<bool, WorkbookError> {
    let mut depth = 1usize;
    let mut formula = false;

    loop {
        match reader.read_event_into(buf)? {
            Event::Start(e) => {
                formula |= e.local_name().as_ref() == b"f";
                depth += 1;
            }
            Event::Empty(e) => formula |= e.local_name().as_ref() == b"f",
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    buf.clear();
    Ok(formula)
}

/// Highest `cNvPr` id in a drawing part, or 0.
pub(crate) fn max_shape_id(drawing_xml: &[u8]) -> Result<u32, WorkbookError> {
    let mut reader = Reader::from_reader(drawing_xml);
    let mut buf = Vec::new();
    let mut max = 0u32;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"cNvPr" => {
                let id = attribute(&reader, &e, b"id")?.and_then(|v| v.parse::<u32>().ok());
                max = max.max(id.unwrap_or(0));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(max)
}

/// A one-cell picture anchor for `anchor`, showing the image behind
/// `rel_id`. The anchor declares its own namespaces so it can be dropped
/// into any drawing part.
pub(crate) fn picture_anchor(shape_id: u32, rel_id: &str, anchor: &ImageAnchor) -> String {
    let cx = u64::from(anchor.width) * EMU_PER_PIXEL;
    let cy = u64::from(anchor.height) * EMU_PER_PIXEL;
    format!(
        concat!(
            r#"<xdr:oneCellAnchor xmlns:xdr="{xdr}" xmlns:a="{a}" xmlns:r="{r}">"#,
            r#"<xdr:from><xdr:col>{col}</xdr:col><xdr:colOff>0</xdr:colOff>"#,
            r#"<xdr:row>{row}</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from>"#,
            r#"<xdr:ext cx="{cx}" cy="{cy}"/>"#,
            r#"<xdr:pic><xdr:nvPicPr><xdr:cNvPr id="{id}" name="Picture {id}"/>"#,
            r#"<xdr:cNvPicPr><a:picLocks noChangeAspect="1"/></xdr:cNvPicPr></xdr:nvPicPr>"#,
            r#"<xdr:blipFill><a:blip r:embed="{rel}"/><a:stretch><a:fillRect/></a:stretch>"#,
            r#"</xdr:blipFill><xdr:spPr><a:xfrm><a:off x="0" y="0"/>"#,
            r#"<a:ext cx="{cx}" cy="{cy}"/></a:xfrm><a:prstGeom prst="rect"><a:avLst/>"#,
            r#"</a:prstGeom></xdr:spPr></xdr:pic><xdr:clientData/></xdr:oneCellAnchor>"#,
        ),
        xdr = SPREADSHEET_DRAWING_NS,
        a = DRAWINGML_NS,
        r = RELATIONSHIPS_NS,
        col = anchor.col,
        row = anchor.row,
        cx = cx,
        cy = cy,
        id = shape_id,
        rel = rel_id,
    )
}

/// A drawing part holding `anchors`.
pub(crate) fn new_drawing(anchors: &str) -> Vec<u8> {
    format!(
        "{}\n<xdr:wsDr xmlns:xdr=\"{}\" xmlns:a=\"{}\">{}</xdr:wsDr>",
        XML_DECLARATION, SPREADSHEET_DRAWING_NS, DRAWINGML_NS, anchors
    )
    .into_bytes()
}

/// Append `anchors` as the last children of an existing drawing part.
pub(crate) fn append_anchors(
    drawing_xml: &[u8],
    anchors: &str,
) -> Result<Vec<u8>, WorkbookError> {
    let mut reader = Reader::from_reader(drawing_xml);
    let mut writer = Writer::new(Vec::with_capacity(drawing_xml.len() + anchors.len()));
    let mut buf = Vec::new();
    let mut depth = 0usize;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        let mut copy = true;
        match &event {
            Event::Eof => break,
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                if depth == 1 {
                    writer.get_mut().write_all(anchors.as_bytes())?;
                }
                depth = depth.saturating_sub(1);
            }
            // `<xdr:wsDr/>` with no shapes yet.
            Event::Empty(root) if depth == 0 => {
                let name = String::from_utf8_lossy(root.name().as_ref()).into_owned();
                writer.write_event(Event::Start(root.clone()))?;
                writer.get_mut().write_all(anchors.as_bytes())?;
                writer.write_event(Event::End(BytesEnd::new(name)))?;
                copy = false;
            }
            _ => {}
        }
        if copy {
            writer.write_event(event)?;
        }
        buf.clear();
    }

    Ok(writer.into_inner())
}
