// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Long-term memory over the vector store.
//!
//! Every operation resolves the caller's embedding config (user default →
//! system default); the resolved model and dimension route to
//! `memories_{model}_{dim}`, so memories embedded by different models never
//! mix.  Vector-store unavailability degrades reads to empty results and
//! writes to warn-and-skip no-ops — the agent proceeds without memories
//! rather than failing the session.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use arbor_config::EmbeddingSettings;
use arbor_model::{Embedder, EmbedderProvider, ModelError};
use arbor_store::{KeyResolver, StoreError};
use arbor_vector::{
    memory_collection_name, Filter, MemoryRow, StoredMemory, VectorError, VectorStore,
};

use crate::types::{MemoryItem, MemoryType};

/// Stored content is clipped to this length before embedding and insert.
pub(crate) const MAX_CONTENT_LEN: usize = 4000;
/// Listing fetches at most this many rows before the in-memory sort.
const LIST_FETCH_CAP: usize = 1000;
/// Listing never returns more than this many items per page.
const LIST_MAX_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("compression response not parseable: {0}")]
    Compression(String),
}

pub struct MemoryService {
    pub(crate) store: Arc<dyn VectorStore>,
    resolver: Arc<KeyResolver>,
    system_embedding: EmbeddingSettings,
    embedders: Arc<dyn EmbedderProvider>,
    min_recall_score: f32,
}

impl MemoryService {
    pub fn new(
        store: Arc<dyn VectorStore>,
        resolver: Arc<KeyResolver>,
        system_embedding: EmbeddingSettings,
        embedders: Arc<dyn EmbedderProvider>,
        min_recall_score: f32,
    ) -> Self {
        Self { store, resolver, system_embedding, embedders, min_recall_score }
    }

    /// Resolve the caller's embedder and the collection it routes to.
    pub(crate) async fn resolve(
        &self,
        user_id: Option<&str>,
    ) -> Result<(Arc<dyn Embedder>, String), MemoryError> {
        let settings = self
            .resolver
            .resolve_embedding(user_id)
            .await?
            .unwrap_or_else(|| self.system_embedding.clone());
        let embedder = self.embedders.embedder_for(&settings);
        let collection = memory_collection_name(embedder.model_name(), embedder.dimension());
        Ok((embedder, collection))
    }

    pub(crate) fn owner_key(user_id: Option<&str>) -> String {
        user_id.unwrap_or_default().to_string()
    }

    fn clip(content: &str) -> String {
        match content.char_indices().nth(MAX_CONTENT_LEN) {
            Some((idx, _)) => content[..idx].to_string(),
            None => content.to_string(),
        }
    }

    /// Persist one memory.  Returns `false` when the vector store is down
    /// and the write was skipped.
    pub async fn remember(
        &self,
        session_id: &str,
        content: &str,
        memory_type: MemoryType,
        importance: f32,
        user_id: Option<&str>,
    ) -> Result<bool, MemoryError> {
        let (embedder, collection) = self.resolve(user_id).await?;
        let content = Self::clip(content);
        let embedding = embedder.embed(&content).await?;
        let row = MemoryRow {
            user_id: Self::owner_key(user_id),
            session_id: session_id.to_string(),
            content,
            memory_type: memory_type.as_str().to_string(),
            importance: importance.clamp(0.0, 1.0),
            create_time_ms: arbor_store::now_ms(),
            embedding,
        };
        let result = async {
            self.store.ensure_collection(&collection, embedder.dimension()).await?;
            self.store.insert(&collection, row).await
        }
        .await;
        match result {
            Ok(()) => Ok(true),
            Err(VectorError::Unavailable(msg)) => {
                warn!(%msg, "vector store unavailable; memory not stored");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn vector_search(
        &self,
        query: &str,
        k: usize,
        user_id: Option<&str>,
        extra: Option<Filter>,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let (embedder, collection) = self.resolve(user_id).await?;
        let vector = embedder.embed(query).await?;
        let mut filter = Filter::new().eq("user_id", Self::owner_key(user_id));
        if let Some(extra) = extra {
            filter = filter.merge(extra);
        }
        let result = async {
            self.store.ensure_collection(&collection, embedder.dimension()).await?;
            self.store.search(&collection, &vector, k, Some(&filter)).await
        }
        .await;
        let hits = match result {
            Ok(hits) => hits,
            Err(VectorError::Unavailable(msg)) => {
                warn!(%msg, "vector store unavailable; recall degraded to empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(hits
            .into_iter()
            .map(|h| MemoryItem::from_stored(h.record, Some(h.score)))
            .collect())
    }

    /// Semantic recall sorted by descending score; hits below the
    /// configured minimum score are suppressed.
    pub async fn recall(
        &self,
        query: &str,
        k: usize,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let items = self.vector_search(query, k, user_id, None).await?;
        let threshold = self.min_recall_score;
        Ok(items.into_iter().filter(|i| i.score.unwrap_or(0.0) >= threshold).collect())
    }

    /// Recall restricted to one session's memories.
    pub async fn recall_from_session(
        &self,
        query: &str,
        session_id: &str,
        k: usize,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let extra = Filter::new().eq("session_id", session_id);
        let items = self.vector_search(query, k, user_id, Some(extra)).await?;
        let threshold = self.min_recall_score;
        Ok(items.into_iter().filter(|i| i.score.unwrap_or(0.0) >= threshold).collect())
    }

    /// Browse-path semantic search: same shape as recall, no threshold.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        self.vector_search(query, k, user_id, None).await
    }

    fn browse_filter(
        user_id: Option<&str>,
        memory_type: Option<MemoryType>,
        session_id: Option<&str>,
        keyword: Option<&str>,
    ) -> Filter {
        let mut filter = Filter::new().eq("user_id", Self::owner_key(user_id));
        if let Some(t) = memory_type {
            filter = filter.eq("memory_type", t.as_str());
        }
        if let Some(s) = session_id {
            filter = filter.eq("session_id", s);
        }
        if let Some(kw) = keyword {
            filter = filter.like("content", kw);
        }
        filter
    }

    /// Scalar listing, newest first.
    pub async fn list(
        &self,
        memory_type: Option<MemoryType>,
        session_id: Option<&str>,
        keyword: Option<&str>,
        offset: usize,
        limit: usize,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let (_, collection) = self.resolve(user_id).await?;
        let filter = Self::browse_filter(user_id, memory_type, session_id, keyword);
        let rows = match self.store.query(&collection, &filter, 0, LIST_FETCH_CAP).await {
            Ok(rows) => rows,
            Err(VectorError::Unavailable(msg)) | Err(VectorError::NotFound(msg)) => {
                warn!(%msg, "listing degraded to empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let mut rows: Vec<StoredMemory> = rows;
        rows.sort_by(|a, b| b.create_time_ms.cmp(&a.create_time_ms));
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit.min(LIST_MAX_LIMIT))
            .map(|r| MemoryItem::from_stored(r, None))
            .collect())
    }

    pub async fn count(
        &self,
        memory_type: Option<MemoryType>,
        session_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<u64, MemoryError> {
        let (_, collection) = self.resolve(user_id).await?;
        let filter = Self::browse_filter(user_id, memory_type, session_id, None);
        match self.store.count(&collection, &filter).await {
            Ok(n) => Ok(n),
            Err(VectorError::Unavailable(_)) | Err(VectorError::NotFound(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete one memory, owner-scoped.
    pub async fn delete_by_id(&self, id: i64, user_id: Option<&str>) -> Result<(), MemoryError> {
        let (_, collection) = self.resolve(user_id).await?;
        let filter =
            Filter::new().eq_int("id", id).eq("user_id", Self::owner_key(user_id));
        self.store.delete_by_filter(&collection, &filter).await?;
        Ok(())
    }

    pub async fn delete_by_session(
        &self,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<(), MemoryError> {
        let (_, collection) = self.resolve(user_id).await?;
        let filter = Filter::new()
            .eq("user_id", Self::owner_key(user_id))
            .eq("session_id", session_id);
        self.store.delete_by_filter(&collection, &filter).await?;
        Ok(())
    }

    pub async fn delete_by_type(
        &self,
        memory_type: MemoryType,
        user_id: Option<&str>,
    ) -> Result<(), MemoryError> {
        let (_, collection) = self.resolve(user_id).await?;
        let filter = Filter::new()
            .eq("user_id", Self::owner_key(user_id))
            .eq("memory_type", memory_type.as_str());
        self.store.delete_by_filter(&collection, &filter).await?;
        Ok(())
    }

    /// Fetch up to `cap` rows for compression, bypassing the browse limit.
    pub(crate) async fn fetch_for_compression(
        &self,
        user_id: Option<&str>,
        cap: usize,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let (_, collection) = self.resolve(user_id).await?;
        let filter = Filter::new().eq("user_id", Self::owner_key(user_id));
        let rows = match self.store.query(&collection, &filter, 0, cap).await {
            Ok(rows) => rows,
            Err(VectorError::Unavailable(_)) | Err(VectorError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(rows.into_iter().map(|r| MemoryItem::from_stored(r, None)).collect())
    }

    /// Render recalled memories as the prompt block injected before the
    /// model call.
    pub fn format_for_prompt(items: &[MemoryItem]) -> String {
        let mut out = String::from("Relevant memories from past experience:\n");
        for item in items {
            out.push_str("- ");
            out.push_str(&item.content);
            out.push('\n');
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_model::MockEmbedderProvider;
    use arbor_store::{ApiKeyRecord, ApiKeyStore, KeyPurpose, MemoryApiKeyStore};
    use arbor_vector::MemoryVectorStore;

    fn system_embedding() -> EmbeddingSettings {
        EmbeddingSettings {
            model: "system-embed".into(),
            dimensions: 16,
            ..EmbeddingSettings::default()
        }
    }

    fn service_over(store: Arc<dyn VectorStore>) -> MemoryService {
        MemoryService::new(
            store,
            Arc::new(KeyResolver::new(Arc::new(MemoryApiKeyStore::new()))),
            system_embedding(),
            Arc::new(MockEmbedderProvider::default()),
            0.0,
        )
    }

    fn service() -> MemoryService {
        service_over(Arc::new(MemoryVectorStore::new()))
    }

    #[tokio::test]
    async fn remember_then_recall_round_trips() {
        let svc = service();
        svc.remember("s1", "the user's name is Zed", MemoryType::Semantic, 0.9, Some("u1"))
            .await
            .unwrap();
        let items = svc.recall("the user's name is Zed", 5, Some("u1")).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "the user's name is Zed");
        assert!(items[0].score.unwrap() > 0.9, "exact match scores near 1");
    }

    #[tokio::test]
    async fn recall_is_owner_scoped() {
        let svc = service();
        svc.remember("s1", "alpha fact", MemoryType::Semantic, 0.5, Some("u1")).await.unwrap();
        svc.remember("s2", "alpha fact", MemoryType::Semantic, 0.5, Some("u2")).await.unwrap();
        let items = svc.recall("alpha fact", 10, Some("u1")).await.unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn recall_from_session_filters_by_session() {
        let svc = service();
        svc.remember("s1", "from s1", MemoryType::Episodic, 0.5, Some("u1")).await.unwrap();
        svc.remember("s2", "from s2", MemoryType::Episodic, 0.5, Some("u1")).await.unwrap();
        let items = svc.recall_from_session("from", "s2", 10, Some("u1")).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].session_id, "s2");
    }

    #[tokio::test]
    async fn content_clipped_to_limit() {
        let svc = service();
        let long = "x".repeat(5000);
        svc.remember("s1", &long, MemoryType::Semantic, 0.5, Some("u1")).await.unwrap();
        let items = svc.list(None, None, None, 0, 10, Some("u1")).await.unwrap();
        assert_eq!(items[0].content.len(), MAX_CONTENT_LEN);
    }

    #[tokio::test]
    async fn importance_clamped_to_unit_interval() {
        let svc = service();
        svc.remember("s1", "fact", MemoryType::Semantic, 7.5, Some("u1")).await.unwrap();
        let items = svc.list(None, None, None, 0, 10, Some("u1")).await.unwrap();
        assert_eq!(items[0].importance, 1.0);
    }

    #[tokio::test]
    async fn list_filters_by_type_and_keyword() {
        let svc = service();
        svc.remember("s1", "likes rust", MemoryType::Semantic, 0.5, Some("u1")).await.unwrap();
        svc.remember("s1", "ran a build", MemoryType::Episodic, 0.5, Some("u1")).await.unwrap();

        let semantic = svc
            .list(Some(MemoryType::Semantic), None, None, 0, 10, Some("u1"))
            .await
            .unwrap();
        assert_eq!(semantic.len(), 1);
        assert_eq!(semantic[0].memory_type, "SEMANTIC");

        let keyword =
            svc.list(None, None, Some("rust"), 0, 10, Some("u1")).await.unwrap();
        assert_eq!(keyword.len(), 1);
        assert!(keyword[0].content.contains("rust"));
    }

    #[tokio::test]
    async fn list_limit_capped_at_hundred() {
        let svc = service();
        svc.remember("s1", "one", MemoryType::Semantic, 0.5, Some("u1")).await.unwrap();
        // A limit far above the cap must not error; the cap applies.
        let items = svc.list(None, None, None, 0, 100_000, Some("u1")).await.unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn count_matches_filters() {
        let svc = service();
        svc.remember("s1", "a", MemoryType::Semantic, 0.5, Some("u1")).await.unwrap();
        svc.remember("s1", "b", MemoryType::Episodic, 0.5, Some("u1")).await.unwrap();
        assert_eq!(svc.count(None, None, Some("u1")).await.unwrap(), 2);
        assert_eq!(svc.count(Some(MemoryType::Episodic), None, Some("u1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_by_id_only_removes_own_memory() {
        let svc = service();
        svc.remember("s1", "mine", MemoryType::Semantic, 0.5, Some("u1")).await.unwrap();
        svc.remember("s1", "theirs", MemoryType::Semantic, 0.5, Some("u2")).await.unwrap();
        let theirs = svc.list(None, None, None, 0, 10, Some("u2")).await.unwrap();

        // u1 attempting to delete u2's memory is a silent no-op.
        svc.delete_by_id(theirs[0].id, Some("u1")).await.unwrap();
        assert_eq!(svc.count(None, None, Some("u2")).await.unwrap(), 1);

        svc.delete_by_id(theirs[0].id, Some("u2")).await.unwrap();
        assert_eq!(svc.count(None, None, Some("u2")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_by_session_and_type() {
        let svc = service();
        svc.remember("s1", "a", MemoryType::Semantic, 0.5, Some("u1")).await.unwrap();
        svc.remember("s2", "b", MemoryType::Episodic, 0.5, Some("u1")).await.unwrap();
        svc.remember("s2", "c", MemoryType::Semantic, 0.5, Some("u1")).await.unwrap();

        svc.delete_by_session("s2", Some("u1")).await.unwrap();
        assert_eq!(svc.count(None, None, Some("u1")).await.unwrap(), 1);

        svc.delete_by_type(MemoryType::Semantic, Some("u1")).await.unwrap();
        assert_eq!(svc.count(None, None, Some("u1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_degrades_instead_of_failing() {
        let svc = service_over(Arc::new(MemoryVectorStore::unavailable()));
        let stored = svc
            .remember("s1", "fact", MemoryType::Semantic, 0.5, Some("u1"))
            .await
            .unwrap();
        assert!(!stored, "write degraded to no-op");
        assert!(svc.recall("fact", 5, Some("u1")).await.unwrap().is_empty());
        assert!(svc.search("fact", 5, Some("u1")).await.unwrap().is_empty());
        assert!(svc.list(None, None, None, 0, 10, Some("u1")).await.unwrap().is_empty());
        assert_eq!(svc.count(None, None, Some("u1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn user_embedding_config_routes_to_own_collection() {
        let keys = Arc::new(MemoryApiKeyStore::new());
        let mut k = ApiKeyRecord::new("u1", "openai", KeyPurpose::Embedding, "sk");
        k.model = Some("user-embed".into());
        k.dimensions = Some(8);
        keys.put(k).await.unwrap();

        let store = Arc::new(MemoryVectorStore::new());
        let svc = MemoryService::new(
            store,
            Arc::new(KeyResolver::new(keys)),
            system_embedding(),
            Arc::new(MockEmbedderProvider::default()),
            0.0,
        );

        // u1 writes via the user model; an anonymous caller uses the system
        // model.  The two must not see each other's memories.
        svc.remember("s1", "user fact", MemoryType::Semantic, 0.5, Some("u1")).await.unwrap();
        svc.remember("s1", "system fact", MemoryType::Semantic, 0.5, None).await.unwrap();
        assert_eq!(svc.count(None, None, Some("u1")).await.unwrap(), 1);
        assert_eq!(svc.count(None, None, None).await.unwrap(), 1);
    }

    #[test]
    fn prompt_block_is_bulleted() {
        let items = vec![
            MemoryItem {
                id: 1,
                session_id: "s".into(),
                content: "first".into(),
                memory_type: "SEMANTIC".into(),
                importance: 0.5,
                create_time_ms: 0,
                score: Some(0.9),
            },
            MemoryItem {
                id: 2,
                session_id: "s".into(),
                content: "second".into(),
                memory_type: "EPISODIC".into(),
                importance: 0.5,
                create_time_ms: 0,
                score: Some(0.4),
            },
        ];
        let block = MemoryService::format_for_prompt(&items);
        assert!(block.starts_with("Relevant memories from past experience:"));
        assert!(block.contains("- first\n"));
        assert!(block.contains("- second\n"));
    }
}
