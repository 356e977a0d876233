//! Managed search index: schema, long-running operations, and document
//! import.
//!
//! [`SearchIndex`] is the narrow contract the reconciler and the ingestor
//! use. [`DiscoveryEngineIndex`] implements it against the Vertex AI Search
//! (Discovery Engine) v1 REST API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::gcp::GcpHttp;
use crate::models::ChunkRecord;
use crate::retry::{with_retry, RetryPolicy};

const DISCOVERY_API: &str = "https://discoveryengine.googleapis.com/v1";

/// Property name to JSON-schema type description.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexSchema {
    pub properties: BTreeMap<String, Value>,
}

impl IndexSchema {
    /// The shape of an exported [`ChunkRecord`], with the embedding stored
    /// under `embedding_field`.
    pub fn for_chunk_records(embedding_field: &str) -> Self {
        let string = || json!({ "type": "string" });
        let integer = || json!({ "type": "integer" });
        let mut properties = BTreeMap::new();
        for name in [
            "id",
            "document_id",
            "chunk_text",
            "document_type",
            "source_name",
            "web_link",
            "document_path",
            "file_mtime",
            "content_hash",
        ] {
            properties.insert(name.to_string(), string());
        }
        properties.insert("chunk_index".to_string(), integer());
        properties.insert("chunk_size".to_string(), integer());
        properties.insert(
            embedding_field.to_string(),
            json!({ "type": "array", "items": { "type": "number" } }),
        );
        Self { properties }
    }

    /// True when every property of `desired` is present here with the same
    /// type description. Extra properties are allowed.
    pub fn satisfies(&self, desired: &IndexSchema) -> bool {
        desired
            .properties
            .iter()
            .all(|(name, ty)| self.properties.get(name) == Some(ty))
    }

    pub fn to_struct_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "type": "object",
            "properties": properties,
        })
    }

    pub fn from_struct_schema(value: &Value) -> Self {
        let properties = value
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self { properties }
    }
}

/// A long-running operation handle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Operation {
    pub name: String,
    pub done: bool,
    pub error: Option<String>,
    /// Documents the service rejected, for import operations.
    pub failure_count: u64,
}

impl Operation {
    /// Fails a finished operation that reported an error or rejected documents.
    pub fn check(&self) -> Result<()> {
        if let Some(message) = &self.error {
            return Err(PipelineError::OperationFailed {
                name: self.name.clone(),
                message: message.clone(),
            });
        }
        if self.failure_count > 0 {
            return Err(PipelineError::OperationFailed {
                name: self.name.clone(),
                message: format!("{} documents failed to import", self.failure_count),
            });
        }
        Ok(())
    }
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// The live schema, or `None` if the data store has none yet.
    async fn get_schema(&self) -> Result<Option<IndexSchema>>;

    /// Start replacing the schema. Fails with
    /// [`PipelineError::SchemaConflict`] while another update is running.
    async fn update_schema(&self, schema: &IndexSchema) -> Result<Operation>;

    async fn get_operation(&self, name: &str) -> Result<Operation>;

    /// Start an incremental import of `records`, upserting by record id.
    async fn import_documents(&self, records: &[ChunkRecord]) -> Result<Operation>;

    /// Delete documents by record id. Ids the index does not hold are
    /// ignored. Returns the number actually deleted.
    async fn delete_documents(&self, ids: &[String]) -> Result<usize>;
}

pub struct DiscoveryEngineIndex {
    http: GcpHttp,
    data_store: String,
    embedding_field: String,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaResource {
    struct_schema: Option<Value>,
    json_schema: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationResource {
    #[serde(default)]
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<OperationStatus>,
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    #[serde(default)]
    message: String,
}

impl From<OperationResource> for Operation {
    fn from(op: OperationResource) -> Self {
        // int64 counters arrive as JSON strings.
        let failure_count = op
            .metadata
            .as_ref()
            .and_then(|m| m.get("failureCount"))
            .and_then(|v| match v {
                Value::String(s) => s.parse().ok(),
                other => other.as_u64(),
            })
            .unwrap_or(0);
        Operation {
            name: op.name,
            done: op.done,
            error: op.error.map(|e| e.message),
            failure_count,
        }
    }
}

impl DiscoveryEngineIndex {
    pub fn new(
        http: GcpHttp,
        project_id: &str,
        location: &str,
        data_store_id: &str,
        embedding_field: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            data_store: format!(
                "projects/{}/locations/{}/collections/default_collection/dataStores/{}",
                project_id, location, data_store_id
            ),
            embedding_field: embedding_field.into(),
            retry,
        }
    }

    fn schema_url(&self) -> String {
        format!("{}/{}/schemas/default_schema", DISCOVERY_API, self.data_store)
    }

    fn document_url(&self, id: &str) -> String {
        format!(
            "{}/{}/branches/default_branch/documents/{}",
            DISCOVERY_API, self.data_store, id
        )
    }

    fn import_url(&self) -> String {
        format!(
            "{}/{}/branches/default_branch/documents:import",
            DISCOVERY_API, self.data_store
        )
    }

    /// Inline import body for `records`.
    fn import_body(&self, records: &[ChunkRecord]) -> Result<Value> {
        let documents = records
            .iter()
            .map(|record| {
                let json_data = document_json(record, &self.embedding_field)?;
                Ok(json!({
                    "id": record.id,
                    "jsonData": serde_json::to_string(&json_data)?,
                }))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(json!({
            "inlineSource": { "documents": documents },
            "reconciliationMode": "INCREMENTAL",
        }))
    }
}

/// The record as an index document, embedding under `embedding_field`.
pub fn document_json(record: &ChunkRecord, embedding_field: &str) -> Result<Value> {
    let mut value = serde_json::to_value(record)?;
    if let Some(obj) = value.as_object_mut() {
        if embedding_field != "embedding" {
            if let Some(embedding) = obj.remove("embedding") {
                obj.insert(embedding_field.to_string(), embedding);
            }
        }
    }
    Ok(value)
}

#[async_trait]
impl SearchIndex for DiscoveryEngineIndex {
    async fn get_schema(&self) -> Result<Option<IndexSchema>> {
        let url = self.schema_url();
        let result: Result<SchemaResource> = with_retry(&self.retry, "discovery.schemas.get", || {
            self.http.get_json(&url, &[])
        })
        .await;
        let resource = match result {
            Ok(resource) => resource,
            Err(PipelineError::Remote { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let struct_schema = match (resource.struct_schema, resource.json_schema) {
            (Some(value), _) => value,
            (None, Some(text)) => serde_json::from_str(&text)?,
            (None, None) => return Ok(None),
        };
        Ok(Some(IndexSchema::from_struct_schema(&struct_schema)))
    }

    async fn update_schema(&self, schema: &IndexSchema) -> Result<Operation> {
        let url = self.schema_url();
        let body = json!({ "structSchema": schema.to_struct_schema() });
        let query = [("allowMissing", "true".to_string())];
        let result: Result<OperationResource> =
            with_retry(&self.retry, "discovery.schemas.patch", || {
                self.http.send_json(Method::PATCH, &url, &query, &body)
            })
            .await;
        match result {
            Ok(op) => Ok(op.into()),
            Err(PipelineError::Remote {
                status: 409,
                message,
                ..
            }) => Err(PipelineError::SchemaConflict(message)),
            Err(e) => Err(e),
        }
    }

    async fn get_operation(&self, name: &str) -> Result<Operation> {
        let url = format!("{}/{}", DISCOVERY_API, name);
        let op: OperationResource = with_retry(&self.retry, "discovery.operations.get", || {
            self.http.get_json(&url, &[])
        })
        .await?;
        Ok(op.into())
    }

    async fn import_documents(&self, records: &[ChunkRecord]) -> Result<Operation> {
        let url = self.import_url();
        let body = self.import_body(records)?;
        let op: OperationResource = with_retry(&self.retry, "discovery.documents.import", || {
            self.http.send_json(Method::POST, &url, &[], &body)
        })
        .await?;
        Ok(op.into())
    }

    async fn delete_documents(&self, ids: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for id in ids {
            let url = self.document_url(id);
            match with_retry(&self.retry, "discovery.documents.delete", || self.http.delete(&url))
                .await
            {
                Ok(()) => deleted += 1,
                Err(PipelineError::Remote { status: 404, .. }) => {
                    debug!(id = %id, "document already absent");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}
