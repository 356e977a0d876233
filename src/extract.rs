//! Multi-format text extraction.
//!
//! The drive connector supplies bytes plus a [`FileFormat`]; this module
//! returns plain UTF-8 text. Document formats are handled by pure functions
//! ([`extract_text`]); images go through an [`OcrEngine`].
//!
//! Multi-part formats are flattened in source order: PDF pages are
//! concatenated, and each spreadsheet sheet is preceded by a
//! `=== Sheet: <name> ===` marker line.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use quick_xml::events::Event;

use crate::error::{PipelineError, Result};
use crate::models::{FetchedContent, FileFormat};
use crate::ocr::OcrEngine;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_DOC: &str = "application/msword";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_XLS: &str = "application/vnd.ms-excel";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_PNG: &str = "image/png";
pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_GOOGLE_DOC: &str = "application/vnd.google-apps.document";
pub const MIME_GOOGLE_SHEET: &str = "application/vnd.google-apps.spreadsheet";

/// MIME types that carry no format information of their own.
const GENERIC_MIME_TYPES: &[&str] = &["", "application/octet-stream", "binary/octet-stream"];

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Highest column a worksheet may have (`XFD`).
const XLSX_MAX_COLUMNS: usize = 16_384;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

impl FileFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence {
            MIME_PDF => Some(FileFormat::Pdf),
            MIME_DOCX | MIME_DOC => Some(FileFormat::Word),
            MIME_XLSX | MIME_XLS => Some(FileFormat::Spreadsheet),
            MIME_TEXT => Some(FileFormat::PlainText),
            MIME_MARKDOWN => Some(FileFormat::Markdown),
            MIME_PNG | MIME_JPEG => Some(FileFormat::Image),
            MIME_GOOGLE_DOC => Some(FileFormat::GoogleDoc),
            MIME_GOOGLE_SHEET => Some(FileFormat::GoogleSheet),
            _ => None,
        }
    }

    pub fn from_extension(name: &str) -> Option<Self> {
        let ext = Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())?;
        match ext.as_str() {
            "pdf" => Some(FileFormat::Pdf),
            "docx" | "doc" => Some(FileFormat::Word),
            "xlsx" | "xls" => Some(FileFormat::Spreadsheet),
            "txt" => Some(FileFormat::PlainText),
            "md" | "markdown" => Some(FileFormat::Markdown),
            "png" | "jpg" | "jpeg" => Some(FileFormat::Image),
            _ => None,
        }
    }

    /// Resolve the format of a listed file.
    ///
    /// The declared MIME type wins. The extension is consulted only when the
    /// MIME type is empty or generic; anything still undetermined is
    /// [`PipelineError::UnsupportedFormat`].
    pub fn resolve(mime: &str, name: &str) -> Result<Self> {
        if let Some(format) = Self::from_mime(mime) {
            return Ok(format);
        }
        if GENERIC_MIME_TYPES.contains(&mime.trim()) {
            if let Some(format) = Self::from_extension(name) {
                return Ok(format);
            }
        }
        Err(PipelineError::UnsupportedFormat(if mime.is_empty() {
            format!("{} (no MIME type)", name)
        } else {
            format!("{} ({})", name, mime)
        }))
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            FileFormat::Pdf => "PDF",
            FileFormat::Word => "Word Document",
            FileFormat::Spreadsheet => "Excel Spreadsheet",
            FileFormat::PlainText => "Text File",
            FileFormat::Markdown => "Markdown File",
            FileFormat::Image => "Image",
            FileFormat::GoogleDoc => "Google Doc",
            FileFormat::GoogleSheet => "Google Sheet",
        }
    }

    /// MIME type to request when exporting a cloud-native document.
    pub fn export_mime(&self) -> Option<&'static str> {
        match self {
            FileFormat::GoogleDoc => Some(MIME_TEXT),
            FileFormat::GoogleSheet => Some(MIME_XLSX),
            _ => None,
        }
    }
}

/// Format-dispatching extractor, holding the OCR collaborator for images.
pub struct Extractor {
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl Extractor {
    pub fn new(ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        Self { ocr }
    }

    /// Extract trimmed text from fetched content.
    ///
    /// Document parsing runs on the blocking pool.
    pub async fn extract(&self, content: FetchedContent) -> Result<String> {
        if content.format == FileFormat::Image {
            let ocr = self.ocr.as_ref().ok_or_else(|| {
                PipelineError::UnsupportedFormat("image (OCR is disabled)".to_string())
            })?;
            let text = ocr.recognize(&content.bytes).await?;
            return Ok(text.trim().to_string());
        }

        tokio::task::spawn_blocking(move || extract_text(&content.bytes, content.format))
            .await
            .map_err(|e| PipelineError::Extraction(format!("extraction task failed: {}", e)))?
    }
}

/// Extracts trimmed plain text from document bytes.
pub fn extract_text(bytes: &[u8], format: FileFormat) -> Result<String> {
    let text = match format {
        FileFormat::Pdf => extract_pdf(bytes)?,
        FileFormat::Word => extract_docx(bytes)?,
        FileFormat::Spreadsheet | FileFormat::GoogleSheet => extract_xlsx(bytes)?,
        FileFormat::PlainText | FileFormat::Markdown | FileFormat::GoogleDoc => {
            decode_text(bytes)
        }
        FileFormat::Image => {
            return Err(PipelineError::UnsupportedFormat(
                "image content requires OCR".to_string(),
            ))
        }
    };
    Ok(text.trim().to_string())
}

/// Decode UTF-8, dropping invalid byte sequences.
pub fn decode_text(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
    }
    out
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    // pdf-extract panics on some malformed inputs.
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(PipelineError::Extraction(format!("PDF: {}", e))),
        Err(_) => Err(PipelineError::Extraction(
            "PDF: parser panicked on malformed input".to_string(),
        )),
    }
}

fn ooxml_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Extraction(format!("OOXML: {}", e))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_err)
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>> {
    let entry = archive.by_name(name).map_err(ooxml_err)?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml_err)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml_err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    extract_docx_paragraphs(&xml)
}

/// Collect `w:t` runs, one output line per `w:p` paragraph.
fn extract_docx_paragraphs(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().map_err(ooxml_err)?.as_ref());
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" | b"cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_xlsx(bytes: &[u8]) -> Result<String> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheets = list_sheets(&mut archive)?;

    let mut out = String::new();
    for (name, path) in sheets.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_zip_entry_bounded(&mut archive, &path)?;
        out.push_str(&format!("\n=== Sheet: {} ===\n", name));
        for row in extract_sheet_rows(&xml, &shared_strings)? {
            out.push_str(&row);
            out.push('\n');
        }
    }
    Ok(out)
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>> {
    // Workbooks without any text cells omit the shared string table.
    if archive.index_for_name("xl/sharedStrings.xml").is_none() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().map_err(ooxml_err)?.as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.push(current.take().unwrap_or_default()),
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Sheet `(name, zip path)` pairs in workbook order.
fn list_sheets(archive: &mut Archive<'_>) -> Result<Vec<(String, String)>> {
    if archive.index_for_name("xl/workbook.xml").is_none()
        || archive.index_for_name("xl/_rels/workbook.xml.rels").is_none()
    {
        return Ok(fallback_sheet_paths(archive));
    }

    let workbook = read_zip_entry_bounded(archive, "xl/workbook.xml")?;
    let rels = read_zip_entry_bounded(archive, "xl/_rels/workbook.xml.rels")?;

    let mut targets: HashMap<String, String> = HashMap::new();
    for attrs in elements_with_attrs(&rels, b"Relationship")? {
        if let (Some(id), Some(target)) = (attrs.get("Id"), attrs.get("Target")) {
            let path = match target.strip_prefix('/') {
                Some(absolute) => absolute.to_string(),
                None => format!("xl/{}", target),
            };
            targets.insert(id.clone(), path);
        }
    }

    let mut sheets = Vec::new();
    for attrs in elements_with_attrs(&workbook, b"sheet")? {
        let name = attrs.get("name").cloned().unwrap_or_default();
        if let Some(path) = attrs.get("id").and_then(|rid| targets.get(rid)) {
            sheets.push((name, path.clone()));
        }
    }
    Ok(sheets)
}

/// Attributes (keyed by local name) of every element named `local`.
fn elements_with_attrs(xml: &[u8], local: &[u8]) -> Result<Vec<HashMap<String, String>>> {
    let mut found = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == local => {
                let mut attrs = HashMap::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
                    let value = attr.unescape_value().map_err(ooxml_err)?.into_owned();
                    attrs.insert(key, value);
                }
                found.push(attrs);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(found)
}

fn fallback_sheet_paths(archive: &Archive<'_>) -> Vec<(String, String)> {
    let mut paths: Vec<(u32, String)> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|n| {
            let number = n
                .trim_start_matches("xl/worksheets/sheet")
                .trim_end_matches(".xml")
                .parse::<u32>()
                .unwrap_or(u32::MAX);
            (number, n.to_string())
        })
        .collect();
    paths.sort();
    paths
        .into_iter()
        .map(|(number, path)| (format!("Sheet{}", number), path))
        .collect()
}

#[derive(Default)]
struct CellState {
    column: Option<usize>,
    kind: Option<String>,
    value: String,
}

/// Tab-separated rows of one worksheet, empty rows dropped.
fn extract_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<String>> {
    let mut rows = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut row: Vec<String> = Vec::new();
    let mut cell: Option<CellState> = None;
    let mut in_value = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    let mut state = CellState::default();
                    for attr in e.attributes().flatten() {
                        let value = String::from_utf8_lossy(attr.value.as_ref()).into_owned();
                        match attr.key.local_name().as_ref() {
                            b"r" => state.column = column_index(&value)?,
                            b"t" => state.kind = Some(value),
                            _ => {}
                        }
                    }
                    cell = Some(state);
                }
                b"v" | b"t" => in_value = cell.is_some(),
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                if let Some(state) = cell.as_mut() {
                    state.value.push_str(te.unescape().map_err(ooxml_err)?.as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    if let Some(state) = cell.take() {
                        let text = cell_text(&state, shared_strings);
                        let column = state.column.unwrap_or(row.len());
                        if row.len() <= column {
                            row.resize(column + 1, String::new());
                        }
                        row[column] = text;
                        cell_count += 1;
                    }
                }
                b"row" => {
                    let line = row.join("\t");
                    if !line.trim().is_empty() {
                        rows.push(line);
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

fn cell_text(cell: &CellState, shared_strings: &[String]) -> String {
    let raw = cell.value.trim();
    match cell.kind.as_deref() {
        Some("s") => raw
            .parse::<usize>()
            .ok()
            .and_then(|i| shared_strings.get(i).cloned())
            .unwrap_or_default(),
        Some("b") => match raw {
            "1" => "TRUE".to_string(),
            "0" => "FALSE".to_string(),
            other => other.to_string(),
        },
        Some("inlineStr") => cell.value.clone(),
        _ => raw.to_string(),
    }
}

/// Zero-based column of a cell reference such as `"AB12"`.
///
/// `None` when the reference has no column letters; an error when the
/// column lies past `XFD`.
fn column_index(reference: &str) -> Result<Option<usize>> {
    let letters = reference
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .map(|b| b.to_ascii_uppercase());
    let mut number = 0usize;
    for b in letters {
        number = number * 26 + (b - b'A' + 1) as usize;
        if number > XLSX_MAX_COLUMNS {
            return Err(PipelineError::Extraction(format!(
                "OOXML: cell reference {:?} is past the last column",
                reference
            )));
        }
    }
    Ok(number.checked_sub(1))
}
