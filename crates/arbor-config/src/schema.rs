// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub milvus: MilvusConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Root directory for the file-backed session and key stores.
    /// Defaults to `~/.local/share/arbor` (platform equivalent) when unset.
    #[serde(default)]
    pub data_dir: Option<std::path::PathBuf>,
}

/// Connection settings for the vector database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilvusConfig {
    #[serde(default = "default_milvus_host")]
    pub host: String,
    #[serde(default = "default_milvus_port")]
    pub port: u16,
    /// Collection used when no per-user embedding model applies.
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    /// Dimension of the system-default embedding model.
    #[serde(default = "default_vector_dimensions")]
    pub vector_dimensions: usize,
}

impl MilvusConfig {
    /// Base URL of the Milvus HTTP API derived from host + port.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for MilvusConfig {
    fn default() -> Self {
        Self {
            host: default_milvus_host(),
            port: default_milvus_port(),
            collection_name: default_collection_name(),
            vector_dimensions: default_vector_dimensions(),
        }
    }
}

/// System LLM endpoints.  The runtime routes through `primary` and fails
/// over to `fallback`; per-user keys bypass both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub primary: ProviderSettings,
    #[serde(default)]
    pub fallback: ProviderSettings,
}

/// One OpenAI-style chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider label, e.g. "openai" | "deepseek" | "gemini" | "ollama".
    /// Drives provider quirks (strict tool-history filtering).
    #[serde(default)]
    pub name: String,
    /// API base that ends before `/chat/completions`,
    /// e.g. `https://api.openai.com/v1`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Prefer referencing keys via environment in deployment; a literal key
    /// here is accepted for local development.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Default model substituted into requests that carry none.
    #[serde(default)]
    pub model: String,
    /// Per-call timeout for non-streaming requests.  Streaming calls use 2×.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: default_base_url(),
            api_key: None,
            model: String::new(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// The system-default embedding endpoint and model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: String,
    /// Output vector dimension declared by the model.
    #[serde(default = "default_vector_dimensions")]
    pub dimensions: usize,
    /// Maximum input tokens the model accepts; inputs are truncated to fit.
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: String::new(),
            dimensions: default_vector_dimensions(),
            max_input_tokens: default_max_input_tokens(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Knobs of the per-session agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Context window trim threshold (message count).
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
    /// Hard cap on reason-act iterations per session.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// How many tools the vector index feeds to the model per iteration.
    #[serde(default = "default_top_k_tools")]
    pub top_k_tools: usize,
    /// Prefix length for the near-duplicate check in `store_memory`.
    #[serde(default = "default_store_memory_prefix_len")]
    pub store_memory_prefix_len: usize,
    /// Poll interval while a session sits in PAUSED.
    #[serde(default = "default_resume_poll_ms")]
    pub resume_poll_ms: u64,
    /// Minimum similarity score for loop-path memory recall.  The browse
    /// path applies no threshold.
    #[serde(default)]
    pub min_recall_score: f32,
    /// Sampling temperature for loop completions.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Max completion tokens per loop iteration.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_context_messages: default_max_context_messages(),
            max_iterations: default_max_iterations(),
            top_k_tools: default_top_k_tools(),
            store_memory_prefix_len: default_store_memory_prefix_len(),
            resume_poll_ms: default_resume_poll_ms(),
            min_recall_score: 0.0,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_milvus_host() -> String {
    "localhost".into()
}
fn default_milvus_port() -> u16 {
    19530
}
fn default_collection_name() -> String {
    "agent_memories".into()
}
fn default_vector_dimensions() -> usize {
    1536
}
fn default_base_url() -> String {
    "http://localhost:11434/v1".into()
}
fn default_timeout_seconds() -> u64 {
    60
}
fn default_max_input_tokens() -> usize {
    8192
}
fn default_max_context_messages() -> usize {
    50
}
fn default_max_iterations() -> u32 {
    30
}
fn default_top_k_tools() -> usize {
    12
}
fn default_store_memory_prefix_len() -> usize {
    15
}
fn default_resume_poll_ms() -> u64 {
    2000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.agent.max_iterations, 30);
        assert_eq!(cfg.agent.max_context_messages, 50);
        assert_eq!(cfg.agent.top_k_tools, 12);
        assert_eq!(cfg.milvus.port, 19530);
    }

    #[test]
    fn partial_agent_section_keeps_other_defaults() {
        let cfg: Config = serde_yaml::from_str("agent:\n  max_iterations: 5\n").unwrap();
        assert_eq!(cfg.agent.max_iterations, 5);
        assert_eq!(cfg.agent.top_k_tools, 12);
        assert_eq!(cfg.agent.resume_poll_ms, 2000);
    }

    #[test]
    fn milvus_base_url_joins_host_and_port() {
        let m = MilvusConfig { host: "db.internal".into(), port: 9091, ..Default::default() };
        assert_eq!(m.base_url(), "http://db.internal:9091");
    }

    #[test]
    fn provider_settings_parse() {
        let yaml = r#"
llm:
  primary:
    name: deepseek
    base_url: https://api.deepseek.com/v1
    model: deepseek-chat
    timeout_seconds: 90
  fallback:
    name: openai
    model: gpt-4o-mini
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.llm.primary.name, "deepseek");
        assert_eq!(cfg.llm.primary.timeout_seconds, 90);
        assert_eq!(cfg.llm.fallback.model, "gpt-4o-mini");
        // fallback timeout untouched → default
        assert_eq!(cfg.llm.fallback.timeout_seconds, 60);
    }

    #[test]
    fn min_recall_score_defaults_to_zero() {
        let cfg = Config::default();
        assert_eq!(cfg.agent.min_recall_score, 0.0);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let cfg = Config::default();
        let text = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.embedding.dimensions, cfg.embedding.dimensions);
        assert_eq!(back.agent.max_tokens, cfg.agent.max_tokens);
    }
}
