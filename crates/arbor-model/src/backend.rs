// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{ChatRequest, ChatResponse, ModelError};

/// Sink invoked synchronously for every non-empty content delta of a stream.
pub type TokenSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Anything the agent loop can stream completions from: a single configured
/// endpoint, the primary/fallback router, or a scripted mock in tests.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One-shot full completion.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ModelError>;

    /// Streaming completion.  `on_token` fires per content delta in arrival
    /// order; the returned response is assembled to match the non-streaming
    /// shape exactly.
    async fn stream_chat(
        &self,
        req: ChatRequest,
        on_token: TokenSink<'_>,
    ) -> Result<ChatResponse, ModelError>;
}

/// Text → fixed-dimension vector.  Implemented by the HTTP embedding client
/// and by the deterministic mock used in tests.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError>;

    /// Declared output dimension; every returned vector has this length.
    fn dimension(&self) -> usize;

    /// Model identifier, used for collection routing.
    fn model_name(&self) -> &str;
}

/// Materializes an [`Embedder`] from resolved settings.  The memory service
/// resolves per-user embedding configs at call time, so it needs a factory
/// rather than one fixed client.
pub trait EmbedderProvider: Send + Sync {
    fn embedder_for(&self, settings: &arbor_config::EmbeddingSettings) -> std::sync::Arc<dyn Embedder>;
}

/// Materializes a [`ChatBackend`] from resolved provider settings.  A
/// session whose owner holds an LLM key talks to that endpoint directly
/// (no router); the factory is the seam that builds the client.
pub trait ChatFactory: Send + Sync {
    fn backend_for(&self, settings: &arbor_config::ProviderSettings) -> std::sync::Arc<dyn ChatBackend>;
}
