// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-user provider keys and their resolution into client settings.
//!
//! A user may hold several keys per provider and purpose; at most one
//! active key per (owner, provider, purpose) slot carries the default
//! flag, and setting a new default clears the previous one in the same
//! write.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use arbor_config::{EmbeddingSettings, ProviderSettings};

use crate::session::now_ms;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPurpose {
    Llm,
    Embedding,
}

impl KeyPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Embedding => "embedding",
        }
    }
}

impl std::fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored provider key plus its optional per-key overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub owner: String,
    pub provider: String,
    pub purpose: KeyPurpose,
    pub api_key: String,
    /// Overrides the per-provider default endpoint when set.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Overrides the per-provider default model when set.
    #[serde(default)]
    pub model: Option<String>,
    /// Embedding keys only: output dimension of the model.
    #[serde(default)]
    pub dimensions: Option<usize>,
    #[serde(default)]
    pub is_default: bool,
    pub active: bool,
    pub create_time_ms: i64,
}

impl ApiKeyRecord {
    pub fn new(
        owner: impl Into<String>,
        provider: impl Into<String>,
        purpose: KeyPurpose,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.into(),
            provider: provider.into(),
            purpose,
            api_key: api_key.into(),
            base_url: None,
            model: None,
            dimensions: None,
            is_default: false,
            active: true,
            create_time_ms: now_ms(),
        }
    }
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Insert or replace by record id.  A record arriving with the default
    /// flag clears any prior default in its (owner, provider, purpose) slot.
    async fn put(&self, record: ApiKeyRecord) -> Result<(), StoreError>;

    async fn list(&self, owner: &str) -> Result<Vec<ApiKeyRecord>, StoreError>;

    /// Flag `key_id` as the slot default.  Idempotent.
    async fn set_default(&self, owner: &str, key_id: &str) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

fn apply_put(records: &mut Vec<ApiKeyRecord>, record: ApiKeyRecord) {
    if record.is_default {
        for r in records.iter_mut() {
            if r.owner == record.owner
                && r.provider == record.provider
                && r.purpose == record.purpose
            {
                r.is_default = false;
            }
        }
    }
    records.retain(|r| r.id != record.id);
    records.push(record);
}

fn apply_set_default(
    records: &mut [ApiKeyRecord],
    owner: &str,
    key_id: &str,
) -> Result<(), StoreError> {
    let target = records
        .iter()
        .find(|r| r.id == key_id && r.owner == owner)
        .cloned()
        .ok_or_else(|| StoreError::NotFound(format!("key {key_id}")))?;
    for r in records.iter_mut() {
        if r.owner == target.owner && r.provider == target.provider && r.purpose == target.purpose
        {
            r.is_default = r.id == key_id;
        }
    }
    Ok(())
}

// ─── In-memory store ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryApiKeyStore {
    records: Mutex<Vec<ApiKeyRecord>>,
}

impl MemoryApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyStore for MemoryApiKeyStore {
    async fn put(&self, record: ApiKeyRecord) -> Result<(), StoreError> {
        apply_put(&mut self.records.lock().unwrap(), record);
        Ok(())
    }

    async fn list(&self, owner: &str) -> Result<Vec<ApiKeyRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect())
    }

    async fn set_default(&self, owner: &str, key_id: &str) -> Result<(), StoreError> {
        apply_set_default(&mut self.records.lock().unwrap(), owner, key_id)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records.lock().unwrap().retain(|r| r.id != id);
        Ok(())
    }
}

// ─── File-backed store ────────────────────────────────────────────────────────

/// All key records in one JSON document, rewritten atomically on change.
pub struct FileApiKeyStore {
    path: PathBuf,
    records: Mutex<Vec<ApiKeyRecord>>,
}

impl FileApiKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("keys.json");
        let records = if path.is_file() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text).map_err(|e| StoreError::Serde(e.to_string()))?
        } else {
            Vec::new()
        };
        Ok(Self { path, records: Mutex::new(records) })
    }

    fn flush(&self, records: &[ApiKeyRecord]) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(records)
            .map_err(|e| StoreError::Serde(e.to_string()))?;
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for FileApiKeyStore {
    async fn put(&self, record: ApiKeyRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        apply_put(&mut records, record);
        self.flush(&records)
    }

    async fn list(&self, owner: &str) -> Result<Vec<ApiKeyRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect())
    }

    async fn set_default(&self, owner: &str, key_id: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        apply_set_default(&mut records, owner, key_id)?;
        self.flush(&records)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        records.retain(|r| r.id != id);
        self.flush(&records)
    }
}

// ─── Resolution ───────────────────────────────────────────────────────────────

/// Materializes a user's stored keys into client settings.
pub struct KeyResolver {
    keys: std::sync::Arc<dyn ApiKeyStore>,
}

impl KeyResolver {
    pub fn new(keys: std::sync::Arc<dyn ApiKeyStore>) -> Self {
        Self { keys }
    }

    async fn pick(
        &self,
        owner: Option<&str>,
        purpose: KeyPurpose,
    ) -> Result<Option<ApiKeyRecord>, StoreError> {
        let Some(owner) = owner else { return Ok(None) };
        let mut candidates: Vec<ApiKeyRecord> = self
            .keys
            .list(owner)
            .await?
            .into_iter()
            .filter(|r| r.active && r.purpose == purpose)
            .collect();
        candidates.sort_by_key(|r| r.create_time_ms);
        Ok(candidates
            .iter()
            .find(|r| r.is_default)
            .cloned()
            .or_else(|| candidates.into_iter().next()))
    }

    /// The user's LLM endpoint, or `None` → route through the system pair.
    pub async fn resolve_llm(
        &self,
        owner: Option<&str>,
    ) -> Result<Option<ProviderSettings>, StoreError> {
        let Some(record) = self.pick(owner, KeyPurpose::Llm).await? else {
            return Ok(None);
        };
        let base_url = resolve_field(
            &record,
            KeyPurpose::Llm,
            "base_url",
            record.base_url.clone(),
            default_base_url(&record.provider),
        )?;
        let model = resolve_field(
            &record,
            KeyPurpose::Llm,
            "model",
            record.model.clone(),
            default_chat_model(&record.provider),
        )?;
        Ok(Some(ProviderSettings {
            name: record.provider.clone(),
            base_url,
            api_key: Some(record.api_key.clone()),
            model,
            timeout_seconds: 60,
        }))
    }

    /// The user's embedding endpoint, or `None` → use the system default.
    pub async fn resolve_embedding(
        &self,
        owner: Option<&str>,
    ) -> Result<Option<EmbeddingSettings>, StoreError> {
        let Some(record) = self.pick(owner, KeyPurpose::Embedding).await? else {
            return Ok(None);
        };
        let base_url = resolve_field(
            &record,
            KeyPurpose::Embedding,
            "base_url",
            record.base_url.clone(),
            default_base_url(&record.provider),
        )?;
        let model = resolve_field(
            &record,
            KeyPurpose::Embedding,
            "model",
            record.model.clone(),
            default_embedding_model(&record.provider),
        )?;
        Ok(Some(EmbeddingSettings {
            base_url,
            api_key: Some(record.api_key.clone()),
            model,
            dimensions: record.dimensions.unwrap_or(1536),
            max_input_tokens: 8192,
            timeout_seconds: 60,
        }))
    }
}

/// A stored key must materialize into complete client settings: the key's
/// own value wins, a built-in per-provider default fills the gap, and a
/// provider with neither needs the field set explicitly on the key.
fn resolve_field(
    record: &ApiKeyRecord,
    purpose: KeyPurpose,
    field: &str,
    explicit: Option<String>,
    fallback: Option<&'static str>,
) -> Result<String, StoreError> {
    explicit
        .filter(|v| !v.is_empty())
        .or_else(|| fallback.map(str::to_string))
        .ok_or_else(|| {
            StoreError::Validation(format!(
                "{purpose} key for provider \"{}\" (owner {}) has no {field} and no \
                 built-in default; set {field} on the key",
                record.provider, record.owner
            ))
        })
}

fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "gemini" => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        "ollama" => Some("http://localhost:11434/v1"),
        _ => None,
    }
}

fn default_chat_model(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("gpt-4o-mini"),
        "deepseek" => Some("deepseek-chat"),
        "gemini" => Some("gemini-2.0-flash"),
        _ => None,
    }
}

fn default_embedding_model(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("text-embedding-3-small"),
        "ollama" => Some("nomic-embed-text"),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
