//! Core data models used throughout the pipeline.
//!
//! These types represent the remote files, ledger entries, and chunk
//! records that flow from the drive listing to the search index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a remote file as returned by the drive listing.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub id: String,
    pub name: String,
    pub modified_time: DateTime<Utc>,
    /// Checksum reported by the listing, already tagged (`md5:<hex>`).
    /// Cloud-native documents have none.
    pub content_hash: Option<String>,
    pub mime_type: String,
    pub web_link: String,
    /// Folder path below the listed root, `/`-separated; empty at the root.
    pub path: String,
}

/// Raw bytes of a file together with the format they should be parsed as.
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub bytes: Vec<u8>,
    pub format: FileFormat,
}

/// Last-known state of a file, persisted across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub modified_time: DateTime<Utc>,
    pub content_hash: String,
}

/// Document formats the extractor knows how to turn into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    Pdf,
    Word,
    Spreadsheet,
    PlainText,
    Markdown,
    Image,
    /// Cloud-native document, fetched pre-converted to plain text.
    GoogleDoc,
    /// Cloud-native spreadsheet, fetched pre-converted to XLSX.
    GoogleSheet,
}

/// One chunk of one document, as written to the warehouse and the export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// `{document_id}_chunk_{chunk_index}`.
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub chunk_text: String,
    pub embedding: Vec<f32>,
    pub document_type: String,
    pub source_name: String,
    pub web_link: String,
    pub document_path: String,
    pub file_mtime: DateTime<Utc>,
    pub content_hash: String,
    pub chunk_size: i64,
}

impl ChunkRecord {
    pub fn record_id(document_id: &str, chunk_index: i64) -> String {
        format!("{}_chunk_{}", document_id, chunk_index)
    }
}
