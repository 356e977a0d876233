//! End-to-end runs of both stages against in-process fakes.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use drive_ingest::db;
use drive_ingest::error::PipelineError;
use drive_ingest::export::{read_artifact, ExportWriter};
use drive_ingest::index::IndexSchema;
use drive_ingest::ingest::IndexIngestor;
use drive_ingest::ledger::{InMemoryLedger, Ledger, SqliteLedger};
use drive_ingest::migrate;
use drive_ingest::models::ChunkRecord;
use drive_ingest::reconcile::{PollPolicy, ReconcileOutcome};
use drive_ingest::warehouse::SqliteWarehouse;
use sqlx::SqlitePool;
use tempfile::TempDir;

const TEXT: &str = "text/plain";
const MARKDOWN: &str = "text/markdown";

async fn store(tmp: &TempDir) -> SqlitePool {
    let pool = db::connect(&tmp.path().join("data/pipeline.sqlite"))
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    pool
}

#[tokio::test]
async fn test_new_file_is_chunked_embedded_and_committed() {
    let tmp = TempDir::new().unwrap();
    let pool = store(&tmp).await;
    let warehouse = Arc::new(SqliteWarehouse::new(pool.clone()));
    let ledger = Arc::new(SqliteLedger::new(pool.clone()));
    let drive = FakeDrive::new();
    let embedder = FakeEmbedder::new();

    let body = prose(3000);
    drive.put(
        listed_file("f1", "runbook.txt", TEXT, "2024-03-01T09:00:00Z", body.as_bytes()),
        body.as_bytes(),
    );

    let report = processor(
        drive.clone(),
        ledger.clone(),
        embedder.clone(),
        warehouse.clone(),
        &tmp.path().join("exports"),
        250,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.listed, 1);
    assert_eq!(report.detection.new, 1);
    assert_eq!(report.committed, 1);
    assert_eq!(report.chunks_written, 3);
    assert!(report.failures.is_empty());

    let rows = warehouse.document_records("f1").await.unwrap();
    let indices: Vec<i64> = rows.iter().map(|r| r.chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(rows[1].id, "f1_chunk_1");
    assert_eq!(rows[0].source_name, "runbook.txt");
    assert_eq!(rows[0].embedding.len(), 4);

    let exported = read_artifact(&report.artifact.path).unwrap();
    assert_eq!(exported.len(), 3);
    assert_eq!(report.artifact.records, 3);

    let entry = ledger.get("f1").await.unwrap().unwrap();
    assert_eq!(entry.modified_time, ts("2024-03-01T09:00:00Z"));
    assert!(entry.content_hash.starts_with("md5:"));

    // Nothing was fetched twice: the listing checksum made fetching unnecessary
    // for detection.
    assert_eq!(drive.fetch_count(), 1);
}

#[tokio::test]
async fn test_unchanged_listing_is_skipped_without_fetch_or_embedding() {
    let tmp = TempDir::new().unwrap();
    let pool = store(&tmp).await;
    let warehouse = Arc::new(SqliteWarehouse::new(pool.clone()));
    let ledger = Arc::new(InMemoryLedger::new());
    let drive = FakeDrive::new();
    let embedder = FakeEmbedder::new();

    let body = b"Quarterly targets.\n\nShip the importer.";
    drive.put(
        listed_file("f1", "targets.md", MARKDOWN, "2024-03-01T09:00:00Z", body),
        body,
    );

    let run = || {
        processor(
            drive.clone(),
            ledger.clone(),
            embedder.clone(),
            warehouse.clone(),
            &tmp.path().join("exports"),
            250,
        )
    };

    run().run().await.unwrap();
    let fetches = drive.fetch_count();
    let calls = embedder.call_count();

    let second = run().run().await.unwrap();
    assert_eq!(second.detection.unchanged, 1);
    assert_eq!(second.committed, 0);
    assert_eq!(second.artifact.records, 0);
    assert_eq!(drive.fetch_count(), fetches);
    assert_eq!(embedder.call_count(), calls);
}

#[tokio::test]
async fn test_touched_file_with_same_content_only_refreshes_ledger() {
    let tmp = TempDir::new().unwrap();
    let pool = store(&tmp).await;
    let warehouse = Arc::new(SqliteWarehouse::new(pool.clone()));
    let ledger = Arc::new(InMemoryLedger::new());
    let drive = FakeDrive::new();
    let embedder = FakeEmbedder::new();

    let body = b"Shared drive etiquette.";
    drive.put(
        listed_file("f1", "etiquette.txt", TEXT, "2024-03-01T09:00:00Z", body),
        body,
    );
    processor(
        drive.clone(),
        ledger.clone(),
        embedder.clone(),
        warehouse.clone(),
        &tmp.path().join("exports"),
        250,
    )
    .run()
    .await
    .unwrap();

    drive.put(
        listed_file("f1", "etiquette.txt", TEXT, "2024-03-05T12:30:00Z", body),
        body,
    );
    let fetches = drive.fetch_count();
    let calls = embedder.call_count();

    let report = processor(
        drive.clone(),
        ledger.clone(),
        embedder.clone(),
        warehouse.clone(),
        &tmp.path().join("exports"),
        250,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.detection.metadata_only, 1);
    assert_eq!(report.committed, 0);
    assert_eq!(drive.fetch_count(), fetches);
    assert_eq!(embedder.call_count(), calls);

    let entry = ledger.get("f1").await.unwrap().unwrap();
    assert_eq!(entry.modified_time, ts("2024-03-05T12:30:00Z"));
}

#[tokio::test]
async fn test_native_doc_is_fetched_once_per_run() {
    let tmp = TempDir::new().unwrap();
    let pool = store(&tmp).await;
    let warehouse = Arc::new(SqliteWarehouse::new(pool.clone()));
    let ledger = Arc::new(InMemoryLedger::new());
    let drive = FakeDrive::new();

    drive.put(
        native_doc("d1", "Onboarding", "2024-03-01T09:00:00Z"),
        b"Welcome aboard. Badge pickup is at reception.",
    );

    let report = processor(
        drive.clone(),
        ledger.clone(),
        FakeEmbedder::new(),
        warehouse.clone(),
        &tmp.path().join("exports"),
        250,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.committed, 1);
    assert_eq!(drive.fetch_count(), 1);

    let rows = warehouse.document_records("d1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].document_type, "Google Doc");

    let entry = ledger.get("d1").await.unwrap().unwrap();
    assert!(entry.content_hash.starts_with("sha256:"));
}

#[tokio::test]
async fn test_rate_limited_batch_leaves_file_for_next_run() {
    let tmp = TempDir::new().unwrap();
    let pool = store(&tmp).await;
    let warehouse = Arc::new(SqliteWarehouse::new(pool.clone()));
    let ledger = Arc::new(InMemoryLedger::new());
    let drive = FakeDrive::new();
    let embedder = FakeEmbedder::poisoned("POISON");

    let good = prose(3000);
    let bad = b"POISON pill memo. Do not embed.";
    drive.put(
        listed_file("good", "good.txt", TEXT, "2024-03-01T09:00:00Z", good.as_bytes()),
        good.as_bytes(),
    );
    drive.put(
        listed_file("bad", "bad.txt", TEXT, "2024-03-01T09:00:00Z", bad),
        bad,
    );

    // Batch size 3: the good file's three chunks, then the bad file's one.
    let report = processor(
        drive.clone(),
        ledger.clone(),
        embedder.clone(),
        warehouse.clone(),
        &tmp.path().join("exports"),
        3,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.chunks_written, 3);
    assert_eq!(report.chunks_missing, 1);
    assert_eq!(report.committed, 1);
    assert_eq!(report.incomplete, 1);
    // One good batch, then three attempts at the rate-limited one.
    assert_eq!(embedder.call_count(), 4);

    assert_eq!(warehouse.document_records("good").await.unwrap().len(), 3);
    assert!(warehouse.document_records("bad").await.unwrap().is_empty());
    assert!(ledger.get("good").await.unwrap().is_some());
    assert!(ledger.get("bad").await.unwrap().is_none());

    let exported = read_artifact(&report.artifact.path).unwrap();
    assert!(exported.iter().all(|r| r.document_id == "good"));
}

#[tokio::test]
async fn test_shrunk_document_is_pruned() {
    let tmp = TempDir::new().unwrap();
    let pool = store(&tmp).await;
    let warehouse = Arc::new(SqliteWarehouse::new(pool.clone()));
    let ledger = Arc::new(InMemoryLedger::new());
    let drive = FakeDrive::new();

    let long = prose(3000);
    drive.put(
        listed_file("f1", "plan.txt", TEXT, "2024-03-01T09:00:00Z", long.as_bytes()),
        long.as_bytes(),
    );
    let run = || {
        processor(
            drive.clone(),
            ledger.clone(),
            FakeEmbedder::new(),
            warehouse.clone(),
            &tmp.path().join("exports"),
            250,
        )
    };
    let index = FakeIndex::new();
    let first = run().run().await.unwrap();
    assert_eq!(warehouse.document_records("f1").await.unwrap().len(), 3);
    ingestor(index.clone()).ingest(&first.artifact.path).await.unwrap();
    assert_eq!(index.imported.lock().unwrap().len(), 3);

    let short = b"Plan cancelled.";
    drive.put(
        listed_file("f1", "plan.txt", TEXT, "2024-03-02T09:00:00Z", short),
        short,
    );
    let report = run().run().await.unwrap();

    assert_eq!(report.detection.modified, 1);
    let rows = warehouse.document_records("f1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].chunk_text, "Plan cancelled.");
    assert_eq!(report.artifact.removed, 2);

    // The chunks that no longer exist leave the search index too.
    let ingest = ingestor(index.clone()).ingest(&report.artifact.path).await.unwrap();
    assert_eq!(ingest.deleted, 2);
    assert_eq!(*index.imported.lock().unwrap(), vec!["f1_chunk_0".to_string()]);
    assert_eq!(
        *index.deleted.lock().unwrap(),
        vec!["f1_chunk_1".to_string(), "f1_chunk_2".to_string()]
    );
}

#[tokio::test]
async fn test_unsupported_file_is_reported_and_run_continues() {
    let tmp = TempDir::new().unwrap();
    let pool = store(&tmp).await;
    let warehouse = Arc::new(SqliteWarehouse::new(pool.clone()));
    let ledger = Arc::new(InMemoryLedger::new());
    let drive = FakeDrive::new();

    drive.put(
        listed_file("v1", "allhands.mp4", "video/mp4", "2024-03-01T09:00:00Z", b"\x00\x00"),
        b"\x00\x00",
    );
    drive.put(
        listed_file("t1", "notes.txt", TEXT, "2024-03-01T09:00:00Z", b"Notes."),
        b"Notes.",
    );

    let report = processor(
        drive.clone(),
        ledger.clone(),
        FakeEmbedder::new(),
        warehouse.clone(),
        &tmp.path().join("exports"),
        250,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].file_id, "v1");
    assert_eq!(report.committed, 1);
    assert!(ledger.get("v1").await.unwrap().is_none());
    assert_eq!(ledger.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_listing_failure_fails_the_run() {
    let tmp = TempDir::new().unwrap();
    let pool = store(&tmp).await;
    let drive = FakeDrive::new();
    drive.fail_listing.store(true, Ordering::SeqCst);

    let result = processor(
        drive,
        Arc::new(InMemoryLedger::new()),
        FakeEmbedder::new(),
        Arc::new(SqliteWarehouse::new(pool)),
        &tmp.path().join("exports"),
        250,
    )
    .run()
    .await;

    assert!(matches!(result, Err(PipelineError::TransientNetwork { .. })));
}

fn records(n: usize) -> Vec<ChunkRecord> {
    (0..n)
        .map(|i| ChunkRecord {
            id: ChunkRecord::record_id("doc", i as i64),
            document_id: "doc".into(),
            chunk_index: i as i64,
            chunk_text: format!("chunk {}", i),
            embedding: vec![0.5; 4],
            document_type: "Text".into(),
            source_name: "doc.txt".into(),
            web_link: "https://drive.example/doc".into(),
            document_path: "Plans".into(),
            file_mtime: ts("2024-03-01T09:00:00Z"),
            content_hash: "md5:abc".into(),
            chunk_size: 7,
        })
        .collect()
}

fn write_artifact(tmp: &TempDir, n: usize) -> std::path::PathBuf {
    let mut writer = ExportWriter::create(tmp.path(), ts("2024-03-01T09:05:07Z")).unwrap();
    writer.write_all(&records(n)).unwrap();
    writer.finish().unwrap().path
}

fn ingestor(index: Arc<FakeIndex>) -> IndexIngestor {
    IndexIngestor::new(
        index,
        IndexSchema::for_chunk_records("embedding"),
        PollPolicy::new(Duration::ZERO, 5),
        100,
    )
}

#[tokio::test]
async fn test_ingest_imports_in_batches_and_reconciles_once() {
    let tmp = TempDir::new().unwrap();
    let artifact = write_artifact(&tmp, 250);
    let index = FakeIndex::new();

    let first = ingestor(index.clone()).ingest(&artifact).await.unwrap();
    assert_eq!(first.schema, ReconcileOutcome::Updated);
    assert_eq!(first.documents, 250);
    assert_eq!(first.operations.len(), 3);
    assert_eq!(index.imported.lock().unwrap().len(), 250);

    let second = ingestor(index.clone()).ingest(&artifact).await.unwrap();
    assert_eq!(second.schema, ReconcileOutcome::AlreadyCurrent);
    assert_eq!(index.updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_artifact_still_reconciles_schema() {
    let tmp = TempDir::new().unwrap();
    let artifact = write_artifact(&tmp, 0);
    let index = FakeIndex::new();

    let report = ingestor(index.clone()).ingest(&artifact).await.unwrap();
    assert_eq!(report.documents, 0);
    assert!(report.operations.is_empty());
    assert_eq!(index.updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_import_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let artifact = write_artifact(&tmp, 10);
    let index = FakeIndex::new();
    index.reject_imports.store(true, Ordering::SeqCst);

    let err = ingestor(index).ingest(&artifact).await.unwrap_err();
    assert!(matches!(err, PipelineError::OperationFailed { .. }));
}
