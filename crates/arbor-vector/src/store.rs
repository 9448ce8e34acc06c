// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Filter;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },
}

/// One memory row as inserted.  The primary id is assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRow {
    pub user_id: String,
    pub session_id: String,
    pub content: String,
    pub memory_type: String,
    pub importance: f32,
    pub create_time_ms: i64,
    pub embedding: Vec<f32>,
}

/// Scalar projection of a stored memory (no vector).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMemory {
    pub id: i64,
    pub user_id: String,
    pub session_id: String,
    pub content: String,
    pub memory_type: String,
    pub importance: f32,
    pub create_time_ms: i64,
}

/// An ANN hit: the stored scalars plus the inner-product score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f32,
    pub record: StoredMemory,
}

/// One tool-index row; `tool_id` is the primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRow {
    pub tool_id: String,
    pub tool_name: String,
    pub description: String,
    pub schema_text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ToolHit {
    pub tool_id: String,
    pub score: f32,
}

/// An ANN-capable vector database with scalar filtering.
///
/// `ensure_collection` / `ensure_tool_index_collection` are idempotent and
/// must precede any write to that collection; the store remembers the
/// declared dimension and rejects vectors of any other length.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), VectorError>;

    async fn ensure_tool_index_collection(&self, name: &str, dim: usize)
        -> Result<(), VectorError>;

    async fn insert(&self, collection: &str, row: MemoryRow) -> Result<(), VectorError>;

    async fn insert_tool(&self, collection: &str, row: ToolRow) -> Result<(), VectorError>;

    /// ANN search over a memory collection; up to `k` hits in descending
    /// score order.  Callers may threshold on score or not.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchHit>, VectorError>;

    /// ANN search over a tool-index collection.
    async fn search_tools(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ToolHit>, VectorError>;

    /// Scalar query without vectors.
    async fn query(
        &self,
        collection: &str,
        filter: &Filter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredMemory>, VectorError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, VectorError>;

    async fn delete_by_ids(&self, collection: &str, ids: &[i64]) -> Result<(), VectorError>;

    async fn delete_by_filter(&self, collection: &str, filter: &Filter)
        -> Result<(), VectorError>;

    /// Remove one tool-index row by primary key (no-op when absent).
    async fn delete_tool(&self, collection: &str, tool_id: &str) -> Result<(), VectorError>;
}
