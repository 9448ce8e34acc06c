// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use arbor_config::EmbeddingSettings;

use crate::{backend::Embedder, ModelError};

/// Rough chars-per-token factor used to bound the input length.
const CHARS_PER_TOKEN: usize = 4;

/// Client for an OpenAI-style `/embeddings` endpoint.
pub struct EmbeddingClient {
    settings: EmbeddingSettings,
    url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(settings: EmbeddingSettings) -> Self {
        let base = settings.base_url.trim_end_matches('/');
        let url = format!("{base}/embeddings");
        Self { settings, url, client: reqwest::Client::new() }
    }

    /// Truncate the input to the model's declared token budget.
    fn clamp_input<'a>(&self, text: &'a str) -> &'a str {
        let max_chars = self.settings.max_input_tokens.saturating_mul(CHARS_PER_TOKEN);
        match text.char_indices().nth(max_chars) {
            Some((byte_idx, _)) => &text[..byte_idx],
            None => text,
        }
    }
}

/// [`crate::EmbedderProvider`] that builds real HTTP clients.
#[derive(Default)]
pub struct HttpEmbedderProvider;

impl crate::backend::EmbedderProvider for HttpEmbedderProvider {
    fn embedder_for(&self, settings: &EmbeddingSettings) -> std::sync::Arc<dyn Embedder> {
        std::sync::Arc::new(EmbeddingClient::new(settings.clone()))
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        if text.trim().is_empty() {
            return Err(ModelError::Validation("cannot embed blank input".into()));
        }
        let input = self.clamp_input(text);

        let body = json!({
            "model": self.settings.model,
            "input": input,
        });
        debug!(model = %self.settings.model, chars = input.len(), "embedding request");

        let mut http_req = self
            .client
            .post(&self.url)
            .json(&body)
            .timeout(Duration::from_secs(self.settings.timeout_seconds.max(1)));
        if let Some(key) = &self.settings.api_key {
            http_req = http_req.bearer_auth(key);
        }
        let resp = http_req.send().await.map_err(ModelError::transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status.as_u16(), &text));
        }

        let text = resp.text().await.map_err(ModelError::transport)?;
        let parsed: EmbeddingResponse =
            serde_json::from_str(&text).map_err(|e| ModelError::Protocol(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| ModelError::Protocol("embedding response carried no data".into()))
    }

    fn dimension(&self) -> usize {
        self.settings.dimensions
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
