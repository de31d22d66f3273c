//! Zip-level access to an OOXML package plus its plumbing parts:
//! relationships and `[Content_Types].xml`.
//!
//! Entries that are not replaced are copied byte for byte, compressed data
//! included, so everything the editor does not touch survives unchanged.

use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read, Write};

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::WorkbookError;

pub(crate) const XML_DECLARATION: &str =
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;
pub(crate) const CONTENT_TYPES_PART: &str = "[Content_Types].xml";

const PACKAGE_RELS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
pub(crate) const RELS_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-package.relationships+xml";

pub(crate) const DRAWING_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/drawing";
pub(crate) const IMAGE_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";

/// An opened package with pending part changes.
pub(crate) struct Package<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
    original: HashSet<String>,
    names: HashSet<String>,
    replaced: BTreeMap<String, Vec<u8>>,
    added: BTreeMap<String, Vec<u8>>,
    removed: HashSet<String>,
}

impl<'a> Package<'a> {
    pub fn open(bytes: &'a [u8]) -> Result<Self, WorkbookError> {
        let archive = ZipArchive::new(Cursor::new(bytes))?;
        let original: HashSet<String> = archive.file_names().map(str::to_string).collect();
        Ok(Self {
            archive,
            names: original.clone(),
            original,
            replaced: BTreeMap::new(),
            added: BTreeMap::new(),
            removed: HashSet::new(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name) && !self.removed.contains(name)
    }

    /// Current contents of a part, including pending changes.
    pub fn read_optional(&mut self, name: &str) -> Result<Option<Vec<u8>>, WorkbookError> {
        if self.removed.contains(name) {
            return Ok(None);
        }
        if let Some(bytes) = self.replaced.get(name).or_else(|| self.added.get(name)) {
            return Ok(Some(bytes.clone()));
        }
        match self.archive.by_name(name) {
            Ok(mut entry) => {
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut bytes)?;
                Ok(Some(bytes))
            }
            Err(ZipError::FileNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read(&mut self, name: &str) -> Result<Vec<u8>, WorkbookError> {
        self.read_optional(name)?
            .ok_or_else(|| WorkbookError::MissingPart(name.to_string()))
    }

    /// Replace an existing part or add a new one.
    pub fn put(&mut self, name: &str, bytes: Vec<u8>) {
        self.removed.remove(name);
        if self.original.contains(name) {
            self.replaced.insert(name.to_string(), bytes);
        } else {
            self.names.insert(name.to_string());
            self.added.insert(name.to_string(), bytes);
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.replaced.remove(name);
        self.added.remove(name);
        self.removed.insert(name.to_string());
    }

    /// First `<prefix><n>.<extension>` (n counting from 1) not yet in the
    /// package.
    pub fn unused_name(&self, prefix: &str, extension: &str) -> String {
        (1..)
            .map(|n| format!("{}{}.{}", prefix, n, extension))
            .find(|name| !self.names.contains(name))
            .unwrap_or_else(|| format!("{}0.{}", prefix, extension))
    }

    /// Write the package with all pending changes applied.
    pub fn finish(self) -> Result<Vec<u8>, WorkbookError> {
        let Self {
            mut archive,
            replaced,
            added,
            removed,
            ..
        } = self;

        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

        for i in 0..archive.len() {
            let entry = archive.by_index_raw(i)?;
            let name = entry.name().to_string();
            if removed.contains(&name) {
                continue;
            }
            match replaced.get(&name) {
                Some(bytes) => {
                    writer.start_file(name.as_str(), options)?;
                    writer.write_all(bytes)?;
                }
                None => writer.raw_copy_file(entry)?,
            }
        }

        for (name, bytes) in &added {
            writer.start_file(name.as_str(), options)?;
            writer.write_all(bytes)?;
        }

        Ok(writer.finish()?.into_inner())
    }
}

/// Path of the relationships part belonging to `part`.
pub(crate) fn rels_part(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
        None => format!("_rels/{}.rels", part),
    }
}

/// Resolve a relationship target against the part that owns it.
///
/// An empty `source_part` means the package root.
pub(crate) fn resolve_target(source_part: &str, target: &str) -> String {
    let target = target.replace('\\', "/");
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }

    let mut parts: Vec<&str> = match source_part.rsplit_once('/') {
        Some((dir, _)) => dir.split('/').collect(),
        None => Vec::new(),
    };
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Relative target pointing from `source_part` to `target_part`.
pub(crate) fn relative_target(source_part: &str, target_part: &str) -> String {
    let from: Vec<&str> = source_part.split('/').collect();
    let from_dir = &from[..from.len() - 1];
    let to: Vec<&str> = target_part.split('/').collect();

    let common = from_dir
        .iter()
        .zip(&to)
        .take_while(|(a, b)| a == b)
        .count()
        .min(to.len() - 1);

    let mut parts = vec![".."; from_dir.len() - common];
    parts.extend(to[common..].iter().copied());
    parts.join("/")
}

/// Unescaped value of the attribute named exactly `key`.
pub(crate) fn attribute<B>(
    reader: &Reader<B>,
    element: &BytesStart<'_>,
    key: &[u8],
) -> Result<Option<String>, WorkbookError> {
    for attr in element.attributes().flatten() {
        if attr.key.as_ref() == key {
            return Ok(Some(attr.decode_and_unescape_value(reader)?.into_owned()));
        }
    }
    Ok(None)
}

/// Value of a namespaced `id` attribute such as `r:id`.
pub(crate) fn relationship_id<B>(
    reader: &Reader<B>,
    element: &BytesStart<'_>,
) -> Result<Option<String>, WorkbookError> {
    for attr in element.attributes().flatten() {
        if attr.key.local_name().as_ref() == b"id" && attr.key.prefix().is_some() {
            return Ok(Some(attr.decode_and_unescape_value(reader)?.into_owned()));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub target: String,
    pub external: bool,
}

/// Parsed contents of a `.rels` part.
#[derive(Debug, Clone, Default)]
pub(crate) struct Relationships {
    items: Vec<Relationship>,
}

impl Relationships {
    pub fn parse(xml: &[u8]) -> Result<Self, WorkbookError> {
        let mut reader = Reader::from_reader(xml);
        reader.trim_text(true);
        let mut buf = Vec::new();
        let mut items = Vec::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) | Event::Empty(e)
                    if e.local_name().as_ref() == b"Relationship" =>
                {
                    let id = attribute(&reader, &e, b"Id")?;
                    let rel_type = attribute(&reader, &e, b"Type")?;
                    let target = attribute(&reader, &e, b"Target")?;
                    let mode = attribute(&reader, &e, b"TargetMode")?;
                    if let (Some(id), Some(rel_type), Some(target)) = (id, rel_type, target) {
                        items.push(Relationship {
                            id,
                            rel_type,
                            target,
                            external: mode.is_some_and(|m| m.eq_ignore_ascii_case("External")),
                        });
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(Self { items })
    }

    /// Read and parse `part`'s relationships, or start an empty set.
    pub fn for_part(package: &mut Package<'_>, part: &str) -> Result<Self, WorkbookError> {
        match package.read_optional(&rels_part(part))? {
            Some(xml) => Self::parse(&xml),
            None => Ok(Self::default()),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Relationship> {
        self.items.iter().find(|r| r.id == id)
    }

    /// First relationship whose type ends with `/<suffix>`.
    pub fn find_type(&self, suffix: &str) -> Option<&Relationship> {
        self.items.iter().find(|r| type_matches(&r.rel_type, suffix))
    }

    /// Drop every relationship whose type ends with `/<suffix>`.
    pub fn remove_type(&mut self, suffix: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|r| !type_matches(&r.rel_type, suffix));
        self.items.len() != before
    }

    /// Add an internal relationship and return its new id.
    pub fn add(&mut self, rel_type: &str, target: &str) -> String {
        let id = (1..)
            .map(|n| format!("rId{}", n))
            .find(|id| self.get(id).is_none())
            .unwrap_or_default();
        self.items.push(Relationship {
            id: id.clone(),
            rel_type: rel_type.to_string(),
            target: target.to_string(),
            external: false,
        });
        id
    }

    pub fn to_xml(&self) -> Vec<u8> {
        let mut xml = format!(
            "{}\n<Relationships xmlns=\"{}\">",
            XML_DECLARATION, PACKAGE_RELS_NS
        );
        for r in &self.items {
            xml.push_str(&format!(
                r#"<Relationship Id="{}" Type="{}" Target="{}"{}/>"#,
                escape(&r.id),
                escape(&r.rel_type),
                escape(&r.target),
                if r.external {
                    r#" TargetMode="External""#
                } else {
                    ""
                }
            ));
        }
        xml.push_str("</Relationships>");
        xml.into_bytes()
    }

    /// Write these relationships as `part`'s `.rels`.
    pub fn store(&self, package: &mut Package<'_>, part: &str) {
        package.put(&rels_part(part), self.to_xml());
    }
}

fn type_matches(rel_type: &str, suffix: &str) -> bool {
    rel_type
        .rsplit_once('/')
        .is_some_and(|(_, last)| last.eq_ignore_ascii_case(suffix))
}

/// Sheet names and relationship ids, in workbook order.
pub(crate) fn workbook_sheets(xml: &[u8]) -> Result<Vec<(String, String)>, WorkbookError> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut sheets = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                let name = attribute(&reader, &e, b"name")?;
                let id = relationship_id(&reader, &e)?;
                if let (Some(name), Some(id)) = (name, id) {
                    sheets.push((name, id));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(sheets)
}

/// Changes to apply to `[Content_Types].xml`.
#[derive(Debug, Default)]
pub(crate) struct ContentTypeChanges {
    /// `(extension, content type)` pairs to declare if missing.
    pub defaults: BTreeMap<String, String>,
    /// `(part, content type)` overrides to add.
    pub overrides: Vec<(String, String)>,
    /// Parts whose overrides should be dropped.
    pub removed: Vec<String>,
}

/// Apply `changes` to a content types document.
pub(crate) fn patch_content_types(
    xml: &[u8],
    changes: &ContentTypeChanges,
) -> Result<Vec<u8>, WorkbookError> {
    let declared = declared_extensions(xml)?;
    let removed: HashSet<String> = changes.removed.iter().map(|p| part_name(p)).collect();

    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + 512));
    let mut buf = Vec::new();
    let mut depth = 0usize;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        let mut keep = true;
        match &event {
            Event::Eof => break,
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                if depth == 1 {
                    write_content_types(&mut writer, &declared, changes)?;
                }
                depth = depth.saturating_sub(1);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"Override" => {
                let part = attribute(&reader, e, b"PartName")?;
                keep = !part.is_some_and(|p| removed.contains(&p));
            }
            _ => {}
        }
        if keep {
            writer.write_event(event)?;
        }
        buf.clear();
    }

    Ok(writer.into_inner())
}

fn declared_extensions(xml: &[u8]) -> Result<HashSet<String>, WorkbookError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut extensions = HashSet::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Default" => {
                if let Some(ext) = attribute(&reader, &e, b"Extension")? {
                    extensions.insert(ext.to_ascii_lowercase());
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(extensions)
}

fn write_content_types(
    writer: &mut Writer<Vec<u8>>,
    declared: &HashSet<String>,
    changes: &ContentTypeChanges,
) -> Result<(), WorkbookError> {
    for (ext, content_type) in &changes.defaults {
        if declared.contains(&ext.to_ascii_lowercase()) {
            continue;
        }
        let default = BytesStart::new("Default").with_attributes([
            ("Extension", ext.as_str()),
            ("ContentType", content_type.as_str()),
        ]);
        writer.write_event(Event::Empty(default))?;
    }
    for (part, content_type) in &changes.overrides {
        let name = part_name(part);
        let element = BytesStart::new("Override").with_attributes([
            ("PartName", name.as_str()),
            ("ContentType", content_type.as_str()),
        ]);
        writer.write_event(Event::Empty(element))?;
    }
    Ok(())
}

/// Zip entry name as a content-type part name (`/xl/...`).
fn part_name(part: &str) -> String {
    format!("/{}", part.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rels_part() {
        assert_eq!(
            rels_part("xl/worksheets/sheet1.xml"),
            "xl/worksheets/_rels/sheet1.xml.rels"
        );
        assert_eq!(rels_part("xl/workbook.xml"), "xl/_rels/workbook.xml.rels");
    }

    #[test]
    fn test_resolve_target() {
        assert_eq!(
            resolve_target("xl/worksheets/sheet1.xml", "../drawings/drawing1.xml"),
            "xl/drawings/drawing1.xml"
        );
        assert_eq!(
            resolve_target("xl/workbook.xml", "worksheets/sheet2.xml"),
            "xl/worksheets/sheet2.xml"
        );
        assert_eq!(
            resolve_target("xl/workbook.xml", "/xl/worksheets/sheet2.xml"),
            "xl/worksheets/sheet2.xml"
        );
        assert_eq!(resolve_target("", "xl/workbook.xml"), "xl/workbook.xml");
    }

    #[test]
    fn test_relative_target() {
        assert_eq!(
            relative_target("xl/worksheets/sheet1.xml", "xl/drawings/drawing1.xml"),
            "../drawings/drawing1.xml"
        );
        assert_eq!(
            relative_target("xl/drawings/drawing1.xml", "xl/media/image3.png"),
            "../media/image3.png"
        );
        assert_eq!(
            relative_target("xl/workbook.xml", "xl/worksheets/sheet1.xml"),
            "worksheets/sheet1.xml"
        );
    }

    #[test]
    fn test_relationships_add_picks_free_id() {
        let xml = br#"<?xml version="1.0"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://x/hyperlink" Target="https://example.com/?a=1&amp;b=2" TargetMode="External"/>
<Relationship Id="rId3" Type="http://x/drawing" Target="../drawings/drawing1.xml"/>
</Relationships>"#;
        let mut rels = Relationships::parse(xml).unwrap();

        assert!(rels.get("rId1").unwrap().external);
        assert_eq!(
            rels.get("rId1").unwrap().target,
            "https://example.com/?a=1&b=2"
        );
        assert_eq!(rels.find_type("drawing").unwrap().id, "rId3");
        assert_eq!(rels.add(IMAGE_REL, "../media/image1.png"), "rId2");
        assert_eq!(rels.add(IMAGE_REL, "../media/image2.png"), "rId4");

        let reparsed = Relationships::parse(&rels.to_xml()).unwrap();
        assert_eq!(reparsed.items, rels.items);
    }

    #[test]
    fn test_patch_content_types_adds_missing_entries_only() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="PNG" ContentType="image/png"/><Override PartName="/xl/calcChain.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.calcChain+xml"/></Types>"#;
        let mut changes = ContentTypeChanges::default();
        changes
            .defaults
            .insert("png".to_string(), "image/png".to_string());
        changes
            .defaults
            .insert("webp".to_string(), "image/webp".to_string());
        changes.overrides.push((
            "xl/drawings/drawing1.xml".to_string(),
            "application/vnd.openxmlformats-officedocument.drawing+xml".to_string(),
        ));
        changes.removed.push("xl/calcChain.xml".to_string());

        let patched = String::from_utf8(patch_content_types(xml, &changes).unwrap()).unwrap();

        assert_eq!(patched.matches("Extension=\"PNG\"").count(), 1);
        assert!(!patched.contains("Extension=\"png\""));
        assert!(patched.contains(r#"<Default Extension="webp" ContentType="image/webp"/>"#));
        assert!(patched.contains(r#"<Override PartName="/xl/drawings/drawing1.xml""#));
        assert!(!patched.contains("calcChain"));
        assert!(patched.ends_with("</Types>"));
    }

    #[test]
    fn test_workbook_sheets_unescapes_names() {
        let xml = br#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Q&amp;A" sheetId="1" r:id="rId1"/><sheet name="Data" sheetId="2" r:id="rId2"/></sheets></workbook>"#;
        assert_eq!(
            workbook_sheets(xml).unwrap(),
            vec![
                ("Q&A".to_string(), "rId1".to_string()),
                ("Data".to_string(), "rId2".to_string())
            ]
        );
    }
}
