// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory [`VectorStore`] with real inner-product scoring and the same
//! filter semantics as the Milvus driver.  The standard test double; also
//! constructible in an "unavailable" mode to exercise degraded paths.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    filter::Filter,
    store::{MemoryRow, SearchHit, StoredMemory, ToolHit, ToolRow, VectorError, VectorStore},
};

#[derive(Default)]
struct MemCollection {
    dim: usize,
    next_id: i64,
    rows: Vec<(i64, MemoryRow)>,
}

#[derive(Default)]
struct ToolCollection {
    dim: usize,
    rows: Vec<ToolRow>,
}

#[derive(Default)]
struct Inner {
    memories: HashMap<String, MemCollection>,
    tools: HashMap<String, ToolCollection>,
}

#[derive(Default)]
pub struct MemoryVectorStore {
    inner: Mutex<Inner>,
    unavailable: bool,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose every operation fails with [`VectorError::Unavailable`].
    pub fn unavailable() -> Self {
        Self { unavailable: true, ..Self::default() }
    }

    fn check_available(&self) -> Result<(), VectorError> {
        if self.unavailable {
            return Err(VectorError::Unavailable("vector store offline".into()));
        }
        Ok(())
    }

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    fn scalar(id: i64, row: &MemoryRow) -> StoredMemory {
        StoredMemory {
            id,
            user_id: row.user_id.clone(),
            session_id: row.session_id.clone(),
            content: row.content.clone(),
            memory_type: row.memory_type.clone(),
            importance: row.importance,
            create_time_ms: row.create_time_ms,
        }
    }

    fn row_matches(filter: &Filter, id: i64, row: &MemoryRow) -> bool {
        filter.matches(&|field| match field {
            "id" => Some(id.to_string()),
            "user_id" => Some(row.user_id.clone()),
            "session_id" => Some(row.session_id.clone()),
            "content" => Some(row.content.clone()),
            "memory_type" => Some(row.memory_type.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<(), VectorError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        inner
            .memories
            .entry(name.to_string())
            .or_insert_with(|| MemCollection { dim, next_id: 1, rows: Vec::new() });
        Ok(())
    }

    async fn ensure_tool_index_collection(
        &self,
        name: &str,
        dim: usize,
    ) -> Result<(), VectorError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        inner
            .tools
            .entry(name.to_string())
            .or_insert_with(|| ToolCollection { dim, rows: Vec::new() });
        Ok(())
    }

    async fn insert(&self, collection: &str, row: MemoryRow) -> Result<(), VectorError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        let col = inner
            .memories
            .get_mut(collection)
            .ok_or_else(|| VectorError::NotFound(format!("collection not ensured: {collection}")))?;
        if row.embedding.len() != col.dim {
            return Err(VectorError::Validation(format!(
                "vector length {} does not match collection dimension {}",
                row.embedding.len(),
                col.dim
            )));
        }
        let id = col.next_id;
        col.next_id += 1;
        col.rows.push((id, row));
        Ok(())
    }

    async fn insert_tool(&self, collection: &str, row: ToolRow) -> Result<(), VectorError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        let col = inner
            .tools
            .get_mut(collection)
            .ok_or_else(|| VectorError::NotFound(format!("collection not ensured: {collection}")))?;
        if row.embedding.len() != col.dim {
            return Err(VectorError::Validation(format!(
                "vector length {} does not match collection dimension {}",
                row.embedding.len(),
                col.dim
            )));
        }
        // Varchar primary key: a row with the same tool_id replaces the old one.
        col.rows.retain(|r| r.tool_id != row.tool_id);
        col.rows.push(row);
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchHit>, VectorError> {
        self.check_available()?;
        let inner = self.inner.lock().unwrap();
        let col = inner
            .memories
            .get(collection)
            .ok_or_else(|| VectorError::NotFound(format!("collection not ensured: {collection}")))?;
        if vector.len() != col.dim {
            return Err(VectorError::Validation(format!(
                "query vector length {} does not match collection dimension {}",
                vector.len(),
                col.dim
            )));
        }
        let mut hits: Vec<SearchHit> = col
            .rows
            .iter()
            .filter(|(id, row)| filter.map(|f| Self::row_matches(f, *id, row)).unwrap_or(true))
            .map(|(id, row)| SearchHit {
                score: Self::dot(vector, &row.embedding),
                record: Self::scalar(*id, row),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn search_tools(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ToolHit>, VectorError> {
        self.check_available()?;
        let inner = self.inner.lock().unwrap();
        let col = inner
            .tools
            .get(collection)
            .ok_or_else(|| VectorError::NotFound(format!("collection not ensured: {collection}")))?;
        let mut hits: Vec<ToolHit> = col
            .rows
            .iter()
            .map(|row| ToolHit {
                tool_id: row.tool_id.clone(),
                score: Self::dot(vector, &row.embedding),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn query(
        &self,
        collection: &str,
        filter: &Filter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredMemory>, VectorError> {
        self.check_available()?;
        let inner = self.inner.lock().unwrap();
        let col = inner
            .memories
            .get(collection)
            .ok_or_else(|| VectorError::NotFound(format!("collection not ensured: {collection}")))?;
        Ok(col
            .rows
            .iter()
            .filter(|(id, row)| Self::row_matches(filter, *id, row))
            .skip(offset)
            .take(limit)
            .map(|(id, row)| Self::scalar(*id, row))
            .collect())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, VectorError> {
        self.check_available()?;
        let inner = self.inner.lock().unwrap();
        let col = inner
            .memories
            .get(collection)
            .ok_or_else(|| VectorError::NotFound(format!("collection not ensured: {collection}")))?;
        Ok(col.rows.iter().filter(|(id, row)| Self::row_matches(filter, *id, row)).count() as u64)
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[i64]) -> Result<(), VectorError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        let col = inner
            .memories
            .get_mut(collection)
            .ok_or_else(|| VectorError::NotFound(format!("collection not ensured: {collection}")))?;
        col.rows.retain(|(id, _)| !ids.contains(id));
        Ok(())
    }

    async fn delete_by_filter(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<(), VectorError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        let col = inner
            .memories
            .get_mut(collection)
            .ok_or_else(|| VectorError::NotFound(format!("collection not ensured: {collection}")))?;
        col.rows.retain(|(id, row)| !Self::row_matches(filter, *id, row));
        Ok(())
    }

    async fn delete_tool(&self, collection: &str, tool_id: &str) -> Result<(), VectorError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        let col = inner
            .tools
            .get_mut(collection)
            .ok_or_else(|| VectorError::NotFound(format!("collection not ensured: {collection}")))?;
        col.rows.retain(|r| r.tool_id != tool_id);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
