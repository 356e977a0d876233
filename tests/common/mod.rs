//! In-process fakes for the external collaborators.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use drive_ingest::change::content_hash;
use drive_ingest::chunk::ChunkerConfig;
use drive_ingest::config::EmbeddingConfig;
use drive_ingest::drive::DriveSource;
use drive_ingest::embedding::{EmbeddingRequester, EmbeddingService};
use drive_ingest::error::{PipelineError, Result};
use drive_ingest::extract::Extractor;
use drive_ingest::index::{IndexSchema, Operation, SearchIndex};
use drive_ingest::ledger::Ledger;
use drive_ingest::models::{ChunkRecord, FileFormat, SourceFile};
use drive_ingest::process::{DocumentProcessor, ProcessorSettings};
use drive_ingest::retry::RetryPolicy;
use drive_ingest::warehouse::WarehouseSink;

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// A binary file as the listing reports it, checksum included.
pub fn listed_file(id: &str, name: &str, mime: &str, modified: &str, body: &[u8]) -> SourceFile {
    let digest = content_hash(body);
    SourceFile {
        id: id.to_string(),
        name: name.to_string(),
        modified_time: ts(modified),
        content_hash: Some(format!("md5:{}", &digest["sha256:".len()..])),
        mime_type: mime.to_string(),
        web_link: format!("https://drive.example/{}", id),
        path: "Operations".to_string(),
    }
}

/// A cloud-native document: the listing carries no checksum.
pub fn native_doc(id: &str, name: &str, modified: &str) -> SourceFile {
    SourceFile {
        id: id.to_string(),
        name: name.to_string(),
        modified_time: ts(modified),
        content_hash: None,
        mime_type: "application/vnd.google-apps.document".to_string(),
        web_link: format!("https://docs.example/{}", id),
        path: String::new(),
    }
}

/// `len` characters of sentence-structured text.
pub fn prose(len: usize) -> String {
    let mut text = String::new();
    let mut i = 0;
    while text.len() < len {
        text.push_str(&format!("Escalation step {:04} pages the secondary on-call. ", i));
        i += 1;
    }
    text.truncate(len);
    text
}

#[derive(Default)]
pub struct FakeDrive {
    files: Mutex<Vec<SourceFile>>,
    contents: Mutex<HashMap<String, Vec<u8>>>,
    pub fetches: AtomicUsize,
    pub fail_listing: AtomicBool,
}

impl FakeDrive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add or replace a file and its content.
    pub fn put(&self, file: SourceFile, body: &[u8]) {
        let mut files = self.files.lock().unwrap();
        files.retain(|f| f.id != file.id);
        self.contents
            .lock()
            .unwrap()
            .insert(file.id.clone(), body.to_vec());
        files.push(file);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DriveSource for FakeDrive {
    async fn list_files(&self, _folder_id: &str) -> Result<Vec<SourceFile>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(PipelineError::TransientNetwork {
                service: "drive".into(),
                message: "connection reset".into(),
            });
        }
        Ok(self.files.lock().unwrap().clone())
    }

    async fn fetch_content(&self, file: &SourceFile, _format: FileFormat) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.contents
            .lock()
            .unwrap()
            .get(&file.id)
            .cloned()
            .ok_or_else(|| PipelineError::Remote {
                service: "drive".into(),
                status: 404,
                message: format!("{} not found", file.id),
            })
    }
}

/// Deterministic 4-dim vectors; batches containing `poison` are rate limited.
pub struct FakeEmbedder {
    pub calls: AtomicUsize,
    poison: Option<String>,
}

impl FakeEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            poison: None,
        })
    }

    pub fn poisoned(marker: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            poison: Some(marker.to_string()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingService for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-embedder"
    }

    fn dims(&self) -> usize {
        4
    }

    fn max_batch_size(&self) -> usize {
        250
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.poison {
            if texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(PipelineError::RateLimited {
                    service: "fake-embedder".into(),
                    message: "quota exceeded".into(),
                });
            }
        }
        Ok(texts
            .iter()
            .map(|t| vec![t.chars().count() as f32, 1.0, 0.0, 0.0])
            .collect())
    }
}

pub fn processor(
    drive: Arc<FakeDrive>,
    ledger: Arc<dyn Ledger>,
    embedder: Arc<FakeEmbedder>,
    warehouse: Arc<dyn WarehouseSink>,
    export_dir: &Path,
    batch_size: usize,
) -> DocumentProcessor {
    let embedding = EmbeddingConfig {
        batch_size,
        ..EmbeddingConfig::default()
    };
    let requester = EmbeddingRequester::new(embedder, &embedding)
        .with_retry_policy(RetryPolicy::immediate(3));
    DocumentProcessor::new(
        drive,
        ledger,
        Extractor::new(None),
        requester,
        warehouse,
        ProcessorSettings {
            folder_id: "root-folder".to_string(),
            chunker: ChunkerConfig::new(1500, 200).unwrap(),
            export_dir: export_dir.to_path_buf(),
            concurrency: 4,
        },
    )
}

/// Search index whose operations finish on the first poll. `imported`
/// holds the ids currently in the index.
#[derive(Default)]
pub struct FakeIndex {
    pub schema: Mutex<Option<IndexSchema>>,
    pub updates: AtomicUsize,
    pub imported: Mutex<Vec<String>>,
    pub import_batches: AtomicUsize,
    pub reject_imports: AtomicBool,
    pub deleted: Mutex<Vec<String>>,
    pending_schema: Mutex<Option<IndexSchema>>,
}

impl FakeIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SearchIndex for FakeIndex {
    async fn get_schema(&self) -> Result<Option<IndexSchema>> {
        Ok(self.schema.lock().unwrap().clone())
    }

    async fn update_schema(&self, schema: &IndexSchema) -> Result<Operation> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        *self.pending_schema.lock().unwrap() = Some(schema.clone());
        Ok(Operation {
            name: "operations/schema-1".into(),
            ..Operation::default()
        })
    }

    async fn get_operation(&self, name: &str) -> Result<Operation> {
        if let Some(schema) = self.pending_schema.lock().unwrap().take() {
            *self.schema.lock().unwrap() = Some(schema);
        }
        let failed = name.starts_with("operations/import") && self.reject_imports.load(Ordering::SeqCst);
        Ok(Operation {
            name: name.to_string(),
            done: true,
            error: failed.then(|| "INVALID_ARGUMENT: embedding has wrong type".to_string()),
            failure_count: 0,
        })
    }

    async fn import_documents(&self, records: &[ChunkRecord]) -> Result<Operation> {
        let n = self.import_batches.fetch_add(1, Ordering::SeqCst);
        let mut imported = self.imported.lock().unwrap();
        for record in records {
            if !imported.contains(&record.id) {
                imported.push(record.id.clone());
            }
        }
        Ok(Operation {
            name: format!("operations/import-{}", n),
            ..Operation::default()
        })
    }

    async fn delete_documents(&self, ids: &[String]) -> Result<usize> {
        let mut imported = self.imported.lock().unwrap();
        let before = imported.len();
        imported.retain(|id| !ids.contains(id));
        self.deleted.lock().unwrap().extend(ids.iter().cloned());
        Ok(before - imported.len())
    }
}
