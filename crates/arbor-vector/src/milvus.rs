// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Milvus driver speaking the v2 REST JSON API.
//!
//! Collections are created lazily through `ensure_*`; the declared
//! dimension is cached per process so repeat ensures cost nothing and
//! dimension-mismatched inserts are rejected before they reach the wire.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use arbor_config::MilvusConfig;

use crate::{
    filter::Filter,
    store::{MemoryRow, SearchHit, StoredMemory, ToolHit, ToolRow, VectorError, VectorStore},
};

pub struct MilvusStore {
    base_url: String,
    client: reqwest::Client,
    /// Collections ensured in this process: name → declared dimension.
    ensured: Mutex<HashMap<String, usize>>,
}

impl MilvusStore {
    pub fn new(cfg: &MilvusConfig) -> Self {
        Self {
            base_url: cfg.base_url(),
            client: reqwest::Client::new(),
            ensured: Mutex::new(HashMap::new()),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, VectorError> {
        let url = format!("{}/v2/vectordb{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::Unavailable(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| VectorError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(VectorError::Server {
                code: i64::from(status.as_u16()),
                message: text.chars().take(300).collect(),
            });
        }
        let v: Value =
            serde_json::from_str(&text).map_err(|e| VectorError::Protocol(e.to_string()))?;
        parse_response(v)
    }

    fn registered_dim(&self, collection: &str) -> Result<usize, VectorError> {
        self.ensured
            .lock()
            .unwrap()
            .get(collection)
            .copied()
            .ok_or_else(|| VectorError::NotFound(format!("collection not ensured: {collection}")))
    }

    fn check_dim(&self, collection: &str, len: usize) -> Result<(), VectorError> {
        let dim = self.registered_dim(collection)?;
        if len != dim {
            return Err(VectorError::Validation(format!(
                "vector length {len} does not match collection dimension {dim}"
            )));
        }
        Ok(())
    }

    async fn ensure(&self, name: &str, dim: usize, schema: Value) -> Result<(), VectorError> {
        if self.ensured.lock().unwrap().contains_key(name) {
            return Ok(());
        }
        let has = self.post("/collections/has", json!({ "collectionName": name })).await?;
        let exists = has.get("has").and_then(Value::as_bool).unwrap_or(false);
        if !exists {
            info!(collection = name, dim, "creating collection");
            self.post("/collections/create", schema).await?;
        } else {
            debug!(collection = name, "collection already present");
        }
        self.ensured.lock().unwrap().insert(name.to_string(), dim);
        Ok(())
    }
}

/// Unwrap the standard `{code, message?, data?}` envelope.
fn parse_response(v: Value) -> Result<Value, VectorError> {
    let code = v.get("code").and_then(Value::as_i64).unwrap_or(0);
    if code != 0 {
        let message =
            v.get("message").and_then(Value::as_str).unwrap_or("unknown error").to_string();
        return Err(VectorError::Server { code, message });
    }
    Ok(v.get("data").cloned().unwrap_or(Value::Null))
}

/// Schema + index definition for a memory collection.
fn create_collection_body(name: &str, dim: usize) -> Value {
    json!({
        "collectionName": name,
        "schema": {
            "autoId": true,
            "enableDynamicField": false,
            "fields": [
                { "fieldName": "id", "dataType": "Int64", "isPrimary": true },
                { "fieldName": "user_id", "dataType": "VarChar",
                  "elementTypeParams": { "max_length": "64" } },
                { "fieldName": "session_id", "dataType": "VarChar",
                  "elementTypeParams": { "max_length": "64" } },
                { "fieldName": "content", "dataType": "VarChar",
                  "elementTypeParams": { "max_length": "4096" } },
                { "fieldName": "memory_type", "dataType": "VarChar",
                  "elementTypeParams": { "max_length": "32" } },
                { "fieldName": "importance", "dataType": "Float" },
                { "fieldName": "create_time_ms", "dataType": "Int64" },
                { "fieldName": "embedding", "dataType": "FloatVector",
                  "elementTypeParams": { "dim": dim.to_string() } }
            ]
        },
        "indexParams": [
            { "fieldName": "embedding", "indexName": "embedding_hnsw",
              "metricType": "IP",
              "params": { "index_type": "HNSW", "M": "16", "efConstruction": "200" } },
            { "fieldName": "session_id", "indexName": "session_id_trie",
              "params": { "index_type": "Trie" } }
        ]
    })
}

/// Schema + index definition for the tool index (varchar primary key).
fn create_tool_index_body(name: &str, dim: usize) -> Value {
    json!({
        "collectionName": name,
        "schema": {
            "autoId": false,
            "enableDynamicField": false,
            "fields": [
                { "fieldName": "tool_id", "dataType": "VarChar", "isPrimary": true,
                  "elementTypeParams": { "max_length": "128" } },
                { "fieldName": "tool_name", "dataType": "VarChar",
                  "elementTypeParams": { "max_length": "128" } },
                { "fieldName": "description", "dataType": "VarChar",
                  "elementTypeParams": { "max_length": "2048" } },
                { "fieldName": "schema_text", "dataType": "VarChar",
                  "elementTypeParams": { "max_length": "4096" } },
                { "fieldName": "embedding", "dataType": "FloatVector",
                  "elementTypeParams": { "dim": dim.to_string() } }
            ]
        },
        "indexParams": [
            { "fieldName": "embedding", "indexName": "embedding_hnsw",
              "metricType": "IP",
              "params": { "index_type": "HNSW", "M": "16", "efConstruction": "200" } }
        ]
    })
}

const MEMORY_OUTPUT_FIELDS: [&str; 7] =
    ["id", "user_id", "session_id", "content", "memory_type", "importance", "create_time_ms"];

fn row_from_value(v: &Value) -> Result<StoredMemory, VectorError> {
    serde_json::from_value(v.clone()).map_err(|e| VectorError::Protocol(e.to_string()))
}

#[async_trait]
impl VectorStore for MilvusStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), VectorError> {
        self.ensure(name, dim, create_collection_body(name, dim)).await
    }

    async fn ensure_tool_index_collection(
        &self,
        name: &str,
        dim: usize,
    ) -> Result<(), VectorError> {
        self.ensure(name, dim, create_tool_index_body(name, dim)).await
    }

    async fn insert(&self, collection: &str, row: MemoryRow) -> Result<(), VectorError> {
        self.check_dim(collection, row.embedding.len())?;
        let body = json!({ "collectionName": collection, "data": [row] });
        self.post("/entities/insert", body).await?;
        Ok(())
    }

    async fn insert_tool(&self, collection: &str, row: ToolRow) -> Result<(), VectorError> {
        self.check_dim(collection, row.embedding.len())?;
        let body = json!({ "collectionName": collection, "data": [row] });
        self.post("/entities/insert", body).await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchHit>, VectorError> {
        self.check_dim(collection, vector.len())?;
        let mut body = json!({
            "collectionName": collection,
            "data": [vector],
            "annsField": "embedding",
            "limit": k,
            "outputFields": MEMORY_OUTPUT_FIELDS,
        });
        if let Some(f) = filter.filter(|f| !f.is_empty()) {
            body["filter"] = json!(f.to_expr());
        }
        let data = self.post("/entities/search", body).await?;
        let rows = data.as_array().cloned().unwrap_or_default();
        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let score = row.get("distance").and_then(Value::as_f64).unwrap_or(0.0) as f32;
            hits.push(SearchHit { score, record: row_from_value(row)? });
        }
        Ok(hits)
    }

    async fn search_tools(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ToolHit>, VectorError> {
        self.check_dim(collection, vector.len())?;
        let body = json!({
            "collectionName": collection,
            "data": [vector],
            "annsField": "embedding",
            "limit": k,
            "outputFields": ["tool_id"],
        });
        let data = self.post("/entities/search", body).await?;
        let rows = data.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| {
                let tool_id = row.get("tool_id")?.as_str()?.to_string();
                let score = row.get("distance").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                Some(ToolHit { tool_id, score })
            })
            .collect())
    }

    async fn query(
        &self,
        collection: &str,
        filter: &Filter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredMemory>, VectorError> {
        let body = json!({
            "collectionName": collection,
            "filter": filter.to_expr(),
            "outputFields": MEMORY_OUTPUT_FIELDS,
            "offset": offset,
            "limit": limit,
        });
        let data = self.post("/entities/query", body).await?;
        data.as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(row_from_value)
            .collect()
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, VectorError> {
        let body = json!({
            "collectionName": collection,
            "filter": filter.to_expr(),
            "outputFields": ["count(*)"],
        });
        let data = self.post("/entities/query", body).await?;
        Ok(data
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("count(*)"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[i64]) -> Result<(), VectorError> {
        if ids.is_empty() {
            return Ok(());
        }
        let list =
            ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
        let body = json!({
            "collectionName": collection,
            "filter": format!("id in [{list}]"),
        });
        self.post("/entities/delete", body).await?;
        Ok(())
    }

    async fn delete_by_filter(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<(), VectorError> {
        let body = json!({
            "collectionName": collection,
            "filter": filter.to_expr(),
        });
        self.post("/entities/delete", body).await?;
        Ok(())
    }

    async fn delete_tool(&self, collection: &str, tool_id: &str) -> Result<(), VectorError> {
        let filter = Filter::new().eq("tool_id", tool_id);
        self.delete_by_filter(collection, &filter).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MilvusStore {
        MilvusStore::new(&MilvusConfig {
            host: "localhost".into(),
            port: 19530,
            ..Default::default()
        })
    }

    #[test]
    fn base_url_from_config() {
        assert_eq!(store().base_url, "http://localhost:19530");
    }

    #[test]
    fn unensured_collection_is_rejected() {
        let s = store();
        let err = s.check_dim("memories_m_8", 8).unwrap_err();
        assert!(matches!(err, VectorError::NotFound(_)));
    }

    #[test]
    fn dim_mismatch_is_validation_error() {
        let s = store();
        s.ensured.lock().unwrap().insert("memories_m_8".into(), 8);
        assert!(s.check_dim("memories_m_8", 8).is_ok());
        let err = s.check_dim("memories_m_8", 4).unwrap_err();
        assert!(matches!(err, VectorError::Validation(_)));
    }

    #[test]
    fn envelope_code_zero_yields_data() {
        let data = parse_response(json!({ "code": 0, "data": [1, 2] })).unwrap();
        assert_eq!(data, json!([1, 2]));
    }

    #[test]
    fn envelope_nonzero_code_is_server_error() {
        let err =
            parse_response(json!({ "code": 1100, "message": "schema mismatch" })).unwrap_err();
        match err {
            VectorError::Server { code, message } => {
                assert_eq!(code, 1100);
                assert_eq!(message, "schema mismatch");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn memory_schema_declares_all_fields() {
        let body = create_collection_body("memories_m_1536", 1536);
        let fields = body["schema"]["fields"].as_array().unwrap();
        let names: Vec<&str> =
            fields.iter().map(|f| f["fieldName"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            vec![
                "id",
                "user_id",
                "session_id",
                "content",
                "memory_type",
                "importance",
                "create_time_ms",
                "embedding"
            ]
        );
        assert_eq!(body["schema"]["autoId"], true);
        assert_eq!(body["indexParams"][0]["metricType"], "IP");
        assert_eq!(fields[7]["elementTypeParams"]["dim"], "1536");
    }

    #[test]
    fn tool_index_schema_uses_varchar_primary_key() {
        let body = create_tool_index_body("agent_tools_index_768", 768);
        let fields = body["schema"]["fields"].as_array().unwrap();
        assert_eq!(fields[0]["fieldName"], "tool_id");
        assert_eq!(fields[0]["isPrimary"], true);
        assert_eq!(body["schema"]["autoId"], false);
    }

    #[test]
    fn stored_memory_parses_from_search_row() {
        let row = json!({
            "distance": 0.92,
            "id": 7,
            "user_id": "u1",
            "session_id": "s1",
            "content": "c",
            "memory_type": "SEMANTIC",
            "importance": 0.8,
            "create_time_ms": 1700000000000i64
        });
        let rec = row_from_value(&row).unwrap();
        assert_eq!(rec.id, 7);
        assert_eq!(rec.memory_type, "SEMANTIC");
    }
}
