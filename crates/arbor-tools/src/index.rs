// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Vector index over tool descriptors: top-K retrieval by user intent.
//!
//! The index is populated lazily, once per embedding dimension per process
//! lifetime; a restart rebuilds it idempotently (delete-then-insert by
//! `tool_id`).  Every failure path degrades to an empty result — the agent
//! loop treats that as "offer all tools".

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use arbor_config::EmbeddingSettings;
use arbor_model::{Embedder, EmbedderProvider};
use arbor_store::KeyResolver;
use arbor_vector::{tool_index_collection_name, ToolRow, VectorStore};

use crate::registry::ToolRegistry;

/// Index text is clipped to this many chars before embedding.
const INDEX_TEXT_LIMIT: usize = 3500;

pub struct ToolIndex {
    store: Arc<dyn VectorStore>,
    registry: Arc<ToolRegistry>,
    resolver: Arc<KeyResolver>,
    /// System-default embedding; a blank model means "no usable default"
    /// and keyless users get no index rather than borrowing the system key.
    system_embedding: EmbeddingSettings,
    embedders: Arc<dyn EmbedderProvider>,
    populated_dimensions: Mutex<HashSet<usize>>,
}

impl ToolIndex {
    pub fn new(
        store: Arc<dyn VectorStore>,
        registry: Arc<ToolRegistry>,
        resolver: Arc<KeyResolver>,
        system_embedding: EmbeddingSettings,
        embedders: Arc<dyn EmbedderProvider>,
    ) -> Self {
        Self {
            store,
            registry,
            resolver,
            system_embedding,
            embedders,
            populated_dimensions: Mutex::new(HashSet::new()),
        }
    }

    async fn resolve_embedder(&self, user_id: Option<&str>) -> Option<Arc<dyn Embedder>> {
        match self.resolver.resolve_embedding(user_id).await {
            Ok(Some(settings)) => Some(self.embedders.embedder_for(&settings)),
            Ok(None) => {
                if self.system_embedding.model.is_empty() {
                    None
                } else {
                    Some(self.embedders.embedder_for(&self.system_embedding))
                }
            }
            Err(e) => {
                warn!(error = %e, "embedding key resolution failed; tool index disabled");
                None
            }
        }
    }

    /// Top-K tool ids for a natural-language intent, best first.  Empty on
    /// any failure or when no embedder applies; the caller falls back to
    /// the full catalog.
    pub async fn search_relevant_tools(
        &self,
        query: &str,
        k: usize,
        user_id: Option<&str>,
    ) -> Vec<String> {
        let Some(embedder) = self.resolve_embedder(user_id).await else {
            return Vec::new();
        };
        let dim = embedder.dimension();
        let collection = tool_index_collection_name(dim);

        if let Err(e) = self.store.ensure_tool_index_collection(&collection, dim).await {
            warn!(error = %e, "tool index collection unavailable");
            return Vec::new();
        }
        if let Err(e) = self.populate_if_needed(&collection, dim, embedder.as_ref()).await {
            warn!(error = %e, "tool index population failed");
            return Vec::new();
        }

        let vector = match embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "tool query embedding failed");
                return Vec::new();
            }
        };
        match self.store.search_tools(&collection, &vector, k).await {
            Ok(hits) => hits.into_iter().map(|h| h.tool_id).collect(),
            Err(e) => {
                warn!(error = %e, "tool index search failed");
                Vec::new()
            }
        }
    }

    async fn populate_if_needed(
        &self,
        collection: &str,
        dim: usize,
        embedder: &dyn Embedder,
    ) -> anyhow::Result<()> {
        if self.populated_dimensions.lock().unwrap().contains(&dim) {
            return Ok(());
        }
        let descriptors = self.registry.active();
        debug!(dim, count = descriptors.len(), "populating tool index");
        for d in &descriptors {
            let mut text = d.index_text();
            if text.len() > INDEX_TEXT_LIMIT {
                let cut = (0..=INDEX_TEXT_LIMIT).rev().find(|i| text.is_char_boundary(*i));
                text.truncate(cut.unwrap_or(0));
            }
            let embedding = embedder.embed(&text).await?;
            // Upsert: the varchar primary key is the tool name.
            self.store.delete_tool(collection, &d.name).await?;
            self.store
                .insert_tool(
                    collection,
                    ToolRow {
                        tool_id: d.name.clone(),
                        tool_name: d.name.clone(),
                        description: d.description.clone(),
                        schema_text: d.parameters.to_string(),
                        embedding,
                    },
                )
                .await?;
        }
        self.populated_dimensions.lock().unwrap().insert(dim);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::descriptor::ToolDescriptor;
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

    fn index_with(
        registry: Arc<ToolRegistry>,
        system: EmbeddingSettings,
        keys: Arc<MemoryApiKeyStore>,
    ) -> ToolIndex {
        ToolIndex::new(
            Arc::new(MemoryVectorStore::new()),
            registry,
            Arc::new(KeyResolver::new(keys)),
            system,
            Arc::new(MockEmbedderProvider::default()),
        )
    }

    fn registry_with_tool(name: &str, description: &str) -> Arc<ToolRegistry> {
        let reg = Arc::new(ToolRegistry::new());
        reg.register(ToolDescriptor::native(
            name,
            description,
            json!({"type": "object"}),
            format!("{name}_handler"),
        ));
        reg
    }

    #[tokio::test]
    async fn exact_name_query_ranks_tool_first() {
        let reg = registry_with_tool("weather_lookup", "look up the weather forecast");
        let idx = index_with(reg.clone(), system_embedding(), Arc::new(MemoryApiKeyStore::new()));

        let text = reg.get("weather_lookup").unwrap().index_text();
        let ids = idx.search_relevant_tools(&text, 1, None).await;
        assert_eq!(ids, vec!["weather_lookup"]);
    }

    #[tokio::test]
    async fn k_bounds_result_count() {
        let reg = registry_with_tool("t1", "a tool");
        let idx = index_with(reg, system_embedding(), Arc::new(MemoryApiKeyStore::new()));
        let ids = idx.search_relevant_tools("anything", 2, None).await;
        assert_eq!(ids.len(), 2, "builtins + stored tool, clipped to k");
    }

    #[tokio::test]
    async fn no_system_default_and_no_user_key_yields_empty() {
        let reg = registry_with_tool("t1", "a tool");
        let no_default =
            EmbeddingSettings { model: String::new(), ..EmbeddingSettings::default() };
        let idx = index_with(reg, no_default, Arc::new(MemoryApiKeyStore::new()));
        assert!(idx.search_relevant_tools("anything", 5, None).await.is_empty());
    }

    #[tokio::test]
    async fn user_key_enables_index_without_system_default() {
        let keys = Arc::new(MemoryApiKeyStore::new());
        let mut k = ApiKeyRecord::new("u1", "openai", KeyPurpose::Embedding, "sk");
        k.dimensions = Some(8);
        k.model = Some("user-embed".into());
        keys.put(k).await.unwrap();

        let reg = registry_with_tool("t1", "a tool");
        let no_default =
            EmbeddingSettings { model: String::new(), ..EmbeddingSettings::default() };
        let idx = index_with(reg, no_default, keys);
        let ids = idx.search_relevant_tools("a tool", 5, Some("u1")).await;
        assert!(!ids.is_empty());
    }

    #[tokio::test]
    async fn repopulation_is_skipped_within_process() {
        let reg = registry_with_tool("t1", "a tool");
        let idx = index_with(reg.clone(), system_embedding(), Arc::new(MemoryApiKeyStore::new()));
        idx.search_relevant_tools("warm up", 3, None).await;
        assert_eq!(idx.populated_dimensions.lock().unwrap().len(), 1);

        // Tools registered after population are invisible until restart —
        // the populated-dimensions set is a process-local soft hint.
        reg.register(ToolDescriptor::native(
            "late_tool",
            "registered late",
            json!({"type": "object"}),
            "late_handler",
        ));
        let ids = idx.search_relevant_tools("registered late", 10, None).await;
        assert!(!ids.contains(&"late_tool".to_string()));
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_empty() {
        let reg = registry_with_tool("t1", "a tool");
        let idx = ToolIndex::new(
            Arc::new(MemoryVectorStore::unavailable()),
            reg,
            Arc::new(KeyResolver::new(Arc::new(MemoryApiKeyStore::new()))),
            system_embedding(),
            Arc::new(MockEmbedderProvider::default()),
        );
        assert!(idx.search_relevant_tools("anything", 5, None).await.is_empty());
    }
}
