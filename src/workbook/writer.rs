//! Saves embedded images back into the uploaded package.
//!
//! The original `.xlsx` is edited in place: each image cell is emptied (its
//! style stays), a one-cell picture anchor is added to the sheet's drawing,
//! and the image bytes become a media part. Every other part, including
//! styles, formulas, merges, and existing drawings, is carried over untouched.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::drawing::{self, DRAWING_CONTENT_TYPE};
use super::package::{
    patch_content_types, relative_target, resolve_target, workbook_sheets, ContentTypeChanges,
    Package, Relationships, CONTENT_TYPES_PART, DRAWING_REL, IMAGE_REL, RELS_CONTENT_TYPE,
};
use super::WorkbookError;
use crate::models::{CellValue, Document, EmbeddedImage};

const DEFAULT_WORKBOOK_PART: &str = "xl/workbook.xml";

/// Write the images held by `document` into `original`.
///
/// `document` must have been read from `original`. Only cells holding
/// [`CellValue::Image`] change; a document without images returns
/// `original` as is.
pub fn save_workbook(original: &[u8], document: &Document) -> Result<Vec<u8>, WorkbookError> {
    let placements: Vec<(&str, Vec<Placement<'_>>)> = document
        .sheets
        .iter()
        .filter_map(|sheet| {
            let images: Vec<Placement<'_>> = sheet
                .cells()
                .filter_map(|cell| match &cell.value {
                    CellValue::Image(image) => Some(Placement {
                        row: cell.row,
                        col: cell.col,
                        image,
                    }),
                    _ => None,
                })
                .collect();
            (!images.is_empty()).then_some((sheet.name.as_str(), images))
        })
        .collect();

    if placements.is_empty() {
        return Ok(original.to_vec());
    }

    let mut package = Package::open(original)?;
    let workbook_part = workbook_part(&mut package)?;
    let sheet_parts = sheet_parts(&mut package, &workbook_part)?;

    let mut media = MediaParts::default();
    let mut changes = ContentTypeChanges::default();
    let mut removed_formula = false;

    for (name, images) in &placements {
        let part = sheet_parts
            .get(*name)
            .ok_or_else(|| WorkbookError::UnknownSheet(name.to_string()))?;
        let sheet = embed_in_sheet(&mut package, part, images, &mut media)?;
        if let Some(drawing) = sheet.new_drawing {
            changes
                .overrides
                .push((drawing, DRAWING_CONTENT_TYPE.to_string()));
        }
        removed_formula |= sheet.removed_formula;
        debug!("Placed {} images on sheet {}", images.len(), name);
    }

    if removed_formula {
        drop_calc_chain(&mut package, &workbook_part, &mut changes)?;
    }

    changes
        .defaults
        .insert("rels".to_string(), RELS_CONTENT_TYPE.to_string());
    for (ext, mime) in media.extensions {
        changes.defaults.insert(ext.to_string(), mime.to_string());
    }
    let content_types = package.read(CONTENT_TYPES_PART)?;
    package.put(
        CONTENT_TYPES_PART,
        patch_content_types(&content_types, &changes)?,
    );

    package.finish()
}

struct Placement<'a> {
    row: u32,
    col: u32,
    image: &'a EmbeddedImage,
}

struct SheetResult {
    new_drawing: Option<String>,
    removed_formula: bool,
}

/// Media parts written so far. Images sharing one buffer share one part.
#[derive(Default)]
struct MediaParts {
    by_buffer: HashMap<*const u8, String>,
    extensions: BTreeMap<&'static str, &'static str>,
}

impl MediaParts {
    fn part_for(&mut self, package: &mut Package<'_>, image: &EmbeddedImage) -> String {
        let key = Arc::as_ptr(&image.data) as *const u8;
        if let Some(part) = self.by_buffer.get(&key) {
            return part.clone();
        }

        let ext = image.extension.as_str();
        let part = package.unused_name("xl/media/image", ext);
        package.put(&part, image.data.to_vec());
        self.extensions.insert(ext, image.extension.mime_type());
        self.by_buffer.insert(key, part.clone());
        part
    }
}

fn embed_in_sheet(
    package: &mut Package<'_>,
    sheet_part: &str,
    images: &[Placement<'_>],
    media: &mut MediaParts,
) -> Result<SheetResult, WorkbookError> {
    let sheet_xml = package.read(sheet_part)?;
    let mut sheet_rels = Relationships::for_part(package, sheet_part)?;

    let existing = match drawing::drawing_rel_id(&sheet_xml)? {
        Some(id) => {
            let rel = sheet_rels
                .get(&id)
                .ok_or_else(|| WorkbookError::MissingPart(format!("{} {}", sheet_part, id)))?;
            Some(resolve_target(sheet_part, &rel.target))
        }
        None => None,
    };

    let (drawing_part, drawing_xml) = match &existing {
        Some(part) => (part.clone(), Some(package.read(part)?)),
        None => (package.unused_name("xl/drawings/drawing", "xml"), None),
    };
    let mut drawing_rels = Relationships::for_part(package, &drawing_part)?;

    let mut shape_id = match &drawing_xml {
        Some(xml) => drawing::max_shape_id(xml)?,
        None => 0,
    };
    let mut anchors = String::new();
    let mut cleared = HashSet::new();
    for placement in images {
        let media_part = media.part_for(package, placement.image);
        let rel_id = drawing_rels.add(IMAGE_REL, &relative_target(&drawing_part, &media_part));
        shape_id += 1;
        anchors.push_str(&drawing::picture_anchor(
            shape_id,
            &rel_id,
            &placement.image.anchor,
        ));
        cleared.insert((placement.row, placement.col));
    }

    let drawing_xml = match drawing_xml {
        Some(xml) => drawing::append_anchors(&xml, &anchors)?,
        None => drawing::new_drawing(&anchors),
    };
    package.put(&drawing_part, drawing_xml);
    drawing_rels.store(package, &drawing_part);

    let new_rel = match existing {
        Some(_) => None,
        None => {
            let target = relative_target(sheet_part, &drawing_part);
            let id = sheet_rels.add(DRAWING_REL, &target);
            sheet_rels.store(package, sheet_part);
            Some(id)
        }
    };

    let patch = drawing::patch_sheet(&sheet_xml, &cleared, new_rel.as_deref())?;
    package.put(sheet_part, patch.xml);

    Ok(SheetResult {
        new_drawing: new_rel.map(|_| drawing_part),
        removed_formula: patch.removed_formula,
    })
}

/// Main workbook part named by the package relationships.
fn workbook_part(package: &mut Package<'_>) -> Result<String, WorkbookError> {
    let root = Relationships::for_part(package, "")?;
    Ok(root
        .find_type("officeDocument")
        .map(|rel| resolve_target("", &rel.target))
        .unwrap_or_else(|| DEFAULT_WORKBOOK_PART.to_string()))
}

/// Worksheet part for each sheet name.
fn sheet_parts(
    package: &mut Package<'_>,
    workbook_part: &str,
) -> Result<HashMap<String, String>, WorkbookError> {
    let rels = Relationships::for_part(package, workbook_part)?;
    let sheets = workbook_sheets(&package.read(workbook_part)?)?;

    Ok(sheets
        .into_iter()
        .filter_map(|(name, id)| {
            let rel = rels.get(&id)?;
            Some((name, resolve_target(workbook_part, &rel.target)))
        })
        .collect())
}

/// Remove the calculation chain so Excel rebuilds it instead of tripping
/// over cells whose formulas were cleared.
fn drop_calc_chain(
    package: &mut Package<'_>,
    workbook_part: &str,
    changes: &mut ContentTypeChanges,
) -> Result<(), WorkbookError> {
    let mut rels = Relationships::for_part(package, workbook_part)?;
    let Some(calc_chain) = rels
        .find_type("calcChain")
        .map(|rel| resolve_target(workbook_part, &rel.target))
    else {
        return Ok(());
    };

    rels.remove_type("calcChain");
    rels.store(package, workbook_part);
    if package.contains(&calc_chain) {
        package.remove(&calc_chain);
    }
    changes.removed.push(calc_chain);
    Ok(())
}
