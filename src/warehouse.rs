//! Warehouse sinks for chunk records.
//!
//! Both implementations key rows by `(document_id, chunk_index)`: writing a
//! record twice leaves one row. When a document shrinks on re-processing,
//! [`WarehouseSink::prune_document`] removes the rows past its new chunk
//! count.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{PipelineError, Result};
use crate::gcp::GcpHttp;
use crate::models::ChunkRecord;
use crate::reconcile::PollPolicy;
use crate::retry::{with_retry, RetryPolicy};

#[async_trait]
pub trait WarehouseSink: Send + Sync {
    /// Insert or replace each record. Returns the number written.
    async fn upsert_chunks(&self, records: &[ChunkRecord]) -> Result<usize>;

    /// Delete rows of `document_id` with `chunk_index >= keep_chunks`.
    /// Returns the record ids removed.
    async fn prune_document(&self, document_id: &str, keep_chunks: i64) -> Result<Vec<String>>;
}

/// Local warehouse table in the pipeline database.
pub struct SqliteWarehouse {
    pool: SqlitePool,
}

impl SqliteWarehouse {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunk_records")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Records of one document ordered by chunk index.
    pub async fn document_records(&self, document_id: &str) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, chunk_index, chunk_text, embedding, document_type,
                   source_name, web_link, document_path, file_mtime_ms, content_hash,
                   chunk_size
            FROM chunk_records
            WHERE document_id = ?
            ORDER BY chunk_index
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let mtime_ms: i64 = row.get("file_mtime_ms");
                let blob: Vec<u8> = row.get("embedding");
                Ok(ChunkRecord {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    chunk_text: row.get("chunk_text"),
                    embedding: blob_to_vec(&blob),
                    document_type: row.get("document_type"),
                    source_name: row.get("source_name"),
                    web_link: row.get("web_link"),
                    document_path: row.get("document_path"),
                    file_mtime: Utc.timestamp_millis_opt(mtime_ms).single().ok_or_else(|| {
                        PipelineError::Config(format!("invalid stored timestamp: {}", mtime_ms))
                    })?,
                    content_hash: row.get("content_hash"),
                    chunk_size: row.get("chunk_size"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl WarehouseSink for SqliteWarehouse {
    async fn upsert_chunks(&self, records: &[ChunkRecord]) -> Result<usize> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO chunk_records (id, document_id, chunk_index, chunk_text, embedding,
                    document_type, source_name, web_link, document_path, file_mtime_ms,
                    content_hash, chunk_size, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(document_id, chunk_index) DO UPDATE SET
                    id = excluded.id,
                    chunk_text = excluded.chunk_text,
                    embedding = excluded.embedding,
                    document_type = excluded.document_type,
                    source_name = excluded.source_name,
                    web_link = excluded.web_link,
                    document_path = excluded.document_path,
                    file_mtime_ms = excluded.file_mtime_ms,
                    content_hash = excluded.content_hash,
                    chunk_size = excluded.chunk_size,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&record.id)
            .bind(&record.document_id)
            .bind(record.chunk_index)
            .bind(&record.chunk_text)
            .bind(vec_to_blob(&record.embedding))
            .bind(&record.document_type)
            .bind(&record.source_name)
            .bind(&record.web_link)
            .bind(&record.document_path)
            .bind(record.file_mtime.timestamp_millis())
            .bind(&record.content_hash)
            .bind(record.chunk_size)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn prune_document(&self, document_id: &str, keep_chunks: i64) -> Result<Vec<String>> {
        let mut removed: Vec<String> = sqlx::query_scalar(
            "DELETE FROM chunk_records WHERE document_id = ? AND chunk_index >= ? RETURNING id",
        )
        .bind(document_id)
        .bind(keep_chunks)
        .fetch_all(&self.pool)
        .await?;
        removed.sort();
        Ok(removed)
    }
}

/// BigQuery table written with parameterized DML through `jobs.query`.
///
/// Rows are upserted with a `MERGE` keyed by `(document_id, chunk_index)`,
/// so re-processing a document replaces its rows. A query the service has
/// not finished within `timeoutMs` is polled through `getQueryResults`
/// until it completes or the poll budget runs out.
pub struct BigQueryWarehouse {
    http: GcpHttp,
    project_id: String,
    dataset: String,
    table: String,
    retry: RetryPolicy,
    poll: PollPolicy,
}

const BIGQUERY_API: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Rows sent as one `MERGE` statement.
const MERGE_BATCH_ROWS: usize = 100;

const QUERY_TIMEOUT_MS: u64 = 30_000;

/// Warehouse columns and their BigQuery types, in record field order.
const COLUMNS: [(&str, &str); 12] = [
    ("id", "STRING"),
    ("document_id", "STRING"),
    ("chunk_index", "INT64"),
    ("chunk_text", "STRING"),
    ("embedding", "ARRAY<FLOAT64>"),
    ("document_type", "STRING"),
    ("source_name", "STRING"),
    ("web_link", "STRING"),
    ("document_path", "STRING"),
    ("file_mtime", "TIMESTAMP"),
    ("content_hash", "STRING"),
    ("chunk_size", "INT64"),
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    num_dml_affected_rows: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
    #[serde(default)]
    rows: Vec<TableRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: Option<Value>,
}

#[derive(Debug)]
enum QueryStatus {
    Done(QueryResponse),
    Pending(JobReference),
}

impl QueryResponse {
    fn into_status(self) -> Result<QueryStatus> {
        if self.job_complete {
            if let Some(first) = self.errors.first() {
                let name = self
                    .job_reference
                    .as_ref()
                    .map(|job| job.job_id.clone())
                    .unwrap_or_else(|| "bigquery query".to_string());
                return Err(PipelineError::OperationFailed {
                    name,
                    message: format!("{}: {}", first.reason, first.message),
                });
            }
            return Ok(QueryStatus::Done(self));
        }
        match self.job_reference {
            Some(job) => Ok(QueryStatus::Pending(job)),
            None => Err(PipelineError::Remote {
                service: "bigquery".to_string(),
                status: 200,
                message: "unfinished query without a job reference".to_string(),
            }),
        }
    }

    fn affected_rows(&self) -> u64 {
        self.num_dml_affected_rows
            .as_deref()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    /// First column of every result row, as strings.
    fn first_column(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| row.f.first()?.v.as_ref()?.as_str().map(str::to_string))
            .collect()
    }
}

impl BigQueryWarehouse {
    pub fn new(
        http: GcpHttp,
        project_id: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            project_id: project_id.into(),
            dataset: dataset.into(),
            table: table.into(),
            retry,
            poll: PollPolicy::new(Duration::from_secs(2), 90),
        }
    }

    fn table_ref(&self) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset, self.table)
    }

    fn query_url(&self) -> String {
        format!("{}/projects/{}/queries", BIGQUERY_API, self.project_id)
    }

    fn results_url(&self, job_id: &str) -> String {
        format!("{}/projects/{}/queries/{}", BIGQUERY_API, self.project_id, job_id)
    }

    /// Run a statement to completion.
    async fn run_query(&self, body: &Value) -> Result<QueryResponse> {
        let url = self.query_url();
        let mut response: QueryResponse = with_retry(&self.retry, "bigquery.jobs.query", || {
            self.http.send_json(Method::POST, &url, &[], body)
        })
        .await?;

        let mut polls = 0u32;
        loop {
            let job = match response.into_status()? {
                QueryStatus::Done(done) => return Ok(done),
                QueryStatus::Pending(job) => job,
            };
            if polls >= self.poll.max_polls {
                return Err(PipelineError::OperationFailed {
                    name: job.job_id,
                    message: format!("not finished after {} polls", self.poll.max_polls),
                });
            }
            polls += 1;
            debug!(job_id = %job.job_id, polls, "waiting for BigQuery job");
            tokio::time::sleep(self.poll.interval).await;

            let url = self.results_url(&job.job_id);
            let mut query = vec![("timeoutMs", QUERY_TIMEOUT_MS.to_string())];
            if let Some(location) = &job.location {
                query.push(("location", location.clone()));
            }
            response = with_retry(&self.retry, "bigquery.jobs.getQueryResults", || {
                self.http.get_json(&url, &query)
            })
            .await?;
        }
    }
}

fn param_type(ty: &str) -> Value {
    match ty {
        "ARRAY<FLOAT64>" => json!({ "type": "ARRAY", "arrayType": { "type": "FLOAT64" } }),
        other => json!({ "type": other }),
    }
}

fn scalar(value: impl ToString) -> Value {
    json!({ "value": value.to_string() })
}

fn struct_value(record: &ChunkRecord) -> Value {
    let embedding: Vec<Value> = record.embedding.iter().map(scalar).collect();
    json!({
        "structValues": {
            "id": scalar(&record.id),
            "document_id": scalar(&record.document_id),
            "chunk_index": scalar(record.chunk_index),
            "chunk_text": scalar(&record.chunk_text),
            "embedding": { "arrayValues": embedding },
            "document_type": scalar(&record.document_type),
            "source_name": scalar(&record.source_name),
            "web_link": scalar(&record.web_link),
            "document_path": scalar(&record.document_path),
            "file_mtime": scalar(record.file_mtime.format("%Y-%m-%d %H:%M:%S%.6f+00:00")),
            "content_hash": scalar(&record.content_hash),
            "chunk_size": scalar(record.chunk_size),
        }
    })
}

/// `MERGE` of `records` into `table`, keyed by `(document_id, chunk_index)`.
fn merge_body(table: &str, records: &[ChunkRecord]) -> Value {
    let names: Vec<&str> = COLUMNS.iter().map(|(name, _)| *name).collect();
    let updates: Vec<String> = names
        .iter()
        .filter(|name| !matches!(**name, "document_id" | "chunk_index"))
        .map(|name| format!("{0} = S.{0}", name))
        .collect();
    let sources: Vec<String> = names.iter().map(|name| format!("S.{}", name)).collect();
    let statement = format!(
        "MERGE `{}` T USING UNNEST(@rows) S \
         ON T.document_id = S.document_id AND T.chunk_index = S.chunk_index \
         WHEN MATCHED THEN UPDATE SET {} \
         WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
        table,
        updates.join(", "),
        names.join(", "),
        sources.join(", ")
    );
    let struct_types: Vec<Value> = COLUMNS
        .iter()
        .map(|(name, ty)| json!({ "name": name, "type": param_type(ty) }))
        .collect();
    let rows: Vec<Value> = records.iter().map(struct_value).collect();
    json!({
        "query": statement,
        "useLegacySql": false,
        "parameterMode": "NAMED",
        "timeoutMs": QUERY_TIMEOUT_MS,
        "queryParameters": [{
            "name": "rows",
            "parameterType": {
                "type": "ARRAY",
                "arrayType": { "type": "STRUCT", "structTypes": struct_types }
            },
            "parameterValue": { "arrayValues": rows }
        }]
    })
}

/// A statement over the rows of one document past `keep_chunks`.
fn trailing_rows_body(statement: String, document_id: &str, keep_chunks: i64) -> Value {
    json!({
        "query": statement,
        "useLegacySql": false,
        "parameterMode": "NAMED",
        "timeoutMs": QUERY_TIMEOUT_MS,
        "queryParameters": [
            {
                "name": "document_id",
                "parameterType": { "type": "STRING" },
                "parameterValue": { "value": document_id }
            },
            {
                "name": "keep",
                "parameterType": { "type": "INT64" },
                "parameterValue": { "value": keep_chunks.to_string() }
            }
        ]
    })
}

#[async_trait]
impl WarehouseSink for BigQueryWarehouse {
    async fn upsert_chunks(&self, records: &[ChunkRecord]) -> Result<usize> {
        let table = self.table_ref();
        for batch in records.chunks(MERGE_BATCH_ROWS) {
            let response = self.run_query(&merge_body(&table, batch)).await?;
            debug!(
                rows = batch.len(),
                affected = response.affected_rows(),
                table = %self.table,
                "merged rows into BigQuery"
            );
        }
        Ok(records.len())
    }

    async fn prune_document(&self, document_id: &str, keep_chunks: i64) -> Result<Vec<String>> {
        let table = self.table_ref();
        let select = trailing_rows_body(
            format!(
                "SELECT id FROM `{}` WHERE document_id = @document_id AND chunk_index >= @keep \
                 ORDER BY chunk_index",
                table
            ),
            document_id,
            keep_chunks,
        );
        let removed = self.run_query(&select).await?.first_column();
        if removed.is_empty() {
            return Ok(removed);
        }

        let delete = trailing_rows_body(
            format!(
                "DELETE FROM `{}` WHERE document_id = @document_id AND chunk_index >= @keep",
                table
            ),
            document_id,
            keep_chunks,
        );
        let response = self.run_query(&delete).await?;
        debug!(document_id, deleted = response.affected_rows(), "pruned trailing rows");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn record(doc: &str, index: i64, text: &str) -> ChunkRecord {
        ChunkRecord {
            id: ChunkRecord::record_id(doc, index),
            document_id: doc.to_string(),
            chunk_index: index,
            chunk_text: text.to_string(),
            embedding: vec![0.5, -1.0, 2.0],
            document_type: "Text File".to_string(),
            source_name: "notes.txt".to_string(),
            web_link: "https://drive.example/f".to_string(),
            document_path: "Runbooks/Network".to_string(),
            file_mtime: DateTime::parse_from_rfc3339("2024-03-01T10:00:00.125Z")
                .unwrap()
                .with_timezone(&Utc),
            content_hash: "md5:aa".to_string(),
            chunk_size: text.chars().count() as i64,
        }
    }

    async fn warehouse() -> (SqliteWarehouse, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect(&dir.path().join("wh.sqlite")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (SqliteWarehouse::new(pool), dir)
    }

    #[tokio::test]
    async fn test_upsert_is_keyed_by_document_and_index() {
        let (wh, _dir) = warehouse().await;
        wh.upsert_chunks(&[record("f1", 0, "old"), record("f1", 1, "b")])
            .await
            .unwrap();
        wh.upsert_chunks(&[record("f1", 0, "new")]).await.unwrap();

        assert_eq!(wh.count().await.unwrap(), 2);
        let rows = wh.document_records("f1").await.unwrap();
        assert_eq!(rows[0].chunk_text, "new");
        assert_eq!(rows[0], record("f1", 0, "new"));
    }

    #[tokio::test]
    async fn test_prune_removes_trailing_chunks() {
        let (wh, _dir) = warehouse().await;
        let records: Vec<_> = (0..5).map(|i| record("f1", i, "x")).collect();
        wh.upsert_chunks(&records).await.unwrap();
        wh.upsert_chunks(&[record("f2", 0, "y")]).await.unwrap();

        assert_eq!(
            wh.prune_document("f1", 2).await.unwrap(),
            vec!["f1_chunk_2", "f1_chunk_3", "f1_chunk_4"]
        );
        assert!(wh.prune_document("f1", 2).await.unwrap().is_empty());
        assert_eq!(wh.document_records("f1").await.unwrap().len(), 2);
        assert_eq!(wh.document_records("f2").await.unwrap().len(), 1);
    }

    #[test]
    fn test_merge_replaces_rows_by_document_and_index() {
        let body = merge_body("p.d.chunks", &[record("f1", 3, "text"), record("f1", 4, "more")]);
        let statement = body["query"].as_str().unwrap();
        assert!(statement.starts_with("MERGE `p.d.chunks` T USING UNNEST(@rows) S"));
        assert!(statement.contains("ON T.document_id = S.document_id AND T.chunk_index = S.chunk_index"));
        assert!(statement.contains("WHEN MATCHED THEN UPDATE SET id = S.id"));
        assert!(!statement.contains("chunk_index = S.chunk_index,"));
        assert!(statement.contains("WHEN NOT MATCHED THEN INSERT (id, document_id, chunk_index"));
        assert_eq!(body["parameterMode"], "NAMED");
        assert_eq!(body["useLegacySql"], false);

        let param = &body["queryParameters"][0];
        assert_eq!(param["name"], "rows");
        let types = param["parameterType"]["arrayType"]["structTypes"].as_array().unwrap();
        let record_fields = serde_json::to_value(record("f1", 0, "x")).unwrap();
        assert_eq!(types.len(), record_fields.as_object().unwrap().len());
        assert_eq!(types[4]["type"]["arrayType"]["type"], "FLOAT64");

        let rows = param["parameterValue"]["arrayValues"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        let row = &rows[0]["structValues"];
        assert_eq!(row["id"]["value"], "f1_chunk_3");
        assert_eq!(row["chunk_index"]["value"], "3");
        assert_eq!(row["document_path"]["value"], "Runbooks/Network");
        assert_eq!(row["file_mtime"]["value"], "2024-03-01 10:00:00.125000+00:00");
        assert_eq!(
            row["embedding"]["arrayValues"],
            json!([{ "value": "0.5" }, { "value": "-1" }, { "value": "2" }])
        );
    }

    #[test]
    fn test_unfinished_query_is_polled_by_job() {
        let response: QueryResponse = serde_json::from_str(
            r#"{"kind": "bigquery#queryResponse", "jobComplete": false,
                "jobReference": {"projectId": "p", "jobId": "job_42", "location": "EU"}}"#,
        )
        .unwrap();
        match response.into_status().unwrap() {
            QueryStatus::Pending(job) => {
                assert_eq!(job.job_id, "job_42");
                assert_eq!(job.location.as_deref(), Some("EU"));
            }
            other => panic!("expected pending, got {:?}", other),
        }

        let orphan: QueryResponse = serde_json::from_str(r#"{"jobComplete": false}"#).unwrap();
        assert!(matches!(orphan.into_status(), Err(PipelineError::Remote { .. })));
    }

    #[test]
    fn test_completed_query_with_errors_fails() {
        let response: QueryResponse = serde_json::from_str(
            r#"{"jobComplete": true, "jobReference": {"jobId": "job_7"},
                "errors": [{"reason": "invalidQuery", "message": "Column embedding has wrong type"}]}"#,
        )
        .unwrap();
        let err = response.into_status().unwrap_err();
        match err {
            PipelineError::OperationFailed { name, message } => {
                assert_eq!(name, "job_7");
                assert!(message.contains("invalidQuery"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_completed_query_results() {
        let dml: QueryResponse =
            serde_json::from_str(r#"{"jobComplete": true, "numDmlAffectedRows": "3"}"#).unwrap();
        match dml.into_status().unwrap() {
            QueryStatus::Done(done) => assert_eq!(done.affected_rows(), 3),
            other => panic!("expected done, got {:?}", other),
        }

        let select: QueryResponse = serde_json::from_str(
            r#"{"jobComplete": true, "totalRows": "2",
                "rows": [{"f": [{"v": "f1_chunk_2"}]}, {"f": [{"v": "f1_chunk_3"}]}]}"#,
        )
        .unwrap();
        assert_eq!(select.first_column(), vec!["f1_chunk_2", "f1_chunk_3"]);
    }
}
