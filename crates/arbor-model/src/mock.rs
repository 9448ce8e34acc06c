// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic scripted backends for tests: exact event sequences —
//! including tool calls and mid-stream failures — without network access.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    backend::{ChatBackend, Embedder, TokenSink},
    ChatRequest, ChatResponse, Choice, Message, ModelError, ToolCallPayload,
};

/// One pre-scripted model turn.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// A complete text answer, streamed as a single chunk.
    Text(String),
    /// A text answer streamed chunk by chunk.
    Chunks(Vec<String>),
    /// The model requests these tool calls.
    ToolCalls(Vec<ToolCallPayload>),
    /// Transport failure before any output.
    Fail(String),
    /// HTTP failure with an explicit status.
    FailStatus(u16, String),
    /// Stream that emits `tokens`, then dies with a transport error.
    MidStreamFail { tokens: Vec<String> },
}

/// Pre-scripted chat backend.  Each call pops the next reply from the front
/// of the queue; an exhausted queue falls back to a marker text reply.
pub struct ScriptedChatClient {
    scripts: Mutex<VecDeque<ScriptedReply>>,
    fail_all: Option<String>,
    last_request: Arc<Mutex<Option<ChatRequest>>>,
    requests_seen: Arc<Mutex<usize>>,
}

impl ScriptedChatClient {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            scripts: Mutex::new(replies.into()),
            fail_all: None,
            last_request: Arc::new(Mutex::new(None)),
            requests_seen: Arc::new(Mutex::new(0)),
        }
    }

    /// Backend that fails every call with a transport error, forever.
    pub fn always_failing(message: impl Into<String>) -> Self {
        Self { fail_all: Some(message.into()), ..Self::new(vec![]) }
    }

    /// Shared handle to the last request seen; written on every call so
    /// tests can inspect what was sent.
    pub fn last_request_handle(&self) -> Arc<Mutex<Option<ChatRequest>>> {
        Arc::clone(&self.last_request)
    }

    /// Shared call counter.
    pub fn requests_seen(&self) -> Arc<Mutex<usize>> {
        Arc::clone(&self.requests_seen)
    }

    fn record(&self, req: &ChatRequest) {
        *self.last_request.lock().unwrap() = Some(req.clone());
        *self.requests_seen.lock().unwrap() += 1;
    }

    fn next_reply(&self) -> ScriptedReply {
        if let Some(msg) = &self.fail_all {
            return ScriptedReply::Fail(msg.clone());
        }
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::Text("[no more scripts]".into()))
    }

    fn response(model: Option<&str>, message: Message, finish: &str) -> ChatResponse {
        ChatResponse {
            id: "scripted".into(),
            model: model.unwrap_or("scripted-model").into(),
            choices: vec![Choice { finish_reason: Some(finish.into()), message }],
        }
    }
}

#[async_trait]
impl ChatBackend for ScriptedChatClient {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ModelError> {
        self.record(&req);
        match self.next_reply() {
            ScriptedReply::Text(text) => {
                Ok(Self::response(req.model.as_deref(), Message::assistant(text), "stop"))
            }
            ScriptedReply::Chunks(chunks) => Ok(Self::response(
                req.model.as_deref(),
                Message::assistant(chunks.concat()),
                "stop",
            )),
            ScriptedReply::ToolCalls(calls) => Ok(Self::response(
                req.model.as_deref(),
                Message::assistant_tool_calls(calls),
                "tool_calls",
            )),
            ScriptedReply::Fail(msg) => Err(ModelError::Network(msg)),
            ScriptedReply::FailStatus(status, body) => Err(ModelError::from_status(status, &body)),
            // Without a stream there is nothing to emit first.
            ScriptedReply::MidStreamFail { .. } => {
                Err(ModelError::Network("stream aborted".into()))
            }
        }
    }

    async fn stream_chat(
        &self,
        req: ChatRequest,
        on_token: TokenSink<'_>,
    ) -> Result<ChatResponse, ModelError> {
        self.record(&req);
        match self.next_reply() {
            ScriptedReply::Text(text) => {
                if !text.is_empty() {
                    on_token(&text);
                }
                Ok(Self::response(req.model.as_deref(), Message::assistant(text), "stop"))
            }
            ScriptedReply::Chunks(chunks) => {
                for c in &chunks {
                    if !c.is_empty() {
                        on_token(c);
                    }
                }
                Ok(Self::response(
                    req.model.as_deref(),
                    Message::assistant(chunks.concat()),
                    "stop",
                ))
            }
            ScriptedReply::ToolCalls(calls) => Ok(Self::response(
                req.model.as_deref(),
                Message::assistant_tool_calls(calls),
                "tool_calls",
            )),
            ScriptedReply::Fail(msg) => Err(ModelError::Network(msg)),
            ScriptedReply::FailStatus(status, body) => Err(ModelError::from_status(status, &body)),
            ScriptedReply::MidStreamFail { tokens } => {
                for t in &tokens {
                    on_token(t);
                }
                Err(ModelError::Network("stream aborted mid-transmission".into()))
            }
        }
    }
}

/// [`crate::EmbedderProvider`] that hands out deterministic mock embedders
/// sized from the resolved settings.
#[derive(Default)]
pub struct MockEmbedderProvider {
    /// When set, every embedder produced fails with a transport error.
    pub fail: bool,
}

impl crate::backend::EmbedderProvider for MockEmbedderProvider {
    fn embedder_for(
        &self,
        settings: &arbor_config::EmbeddingSettings,
    ) -> Arc<dyn crate::backend::Embedder> {
        if self.fail {
            Arc::new(ScriptedEmbeddingClient::failing(settings.dimensions, settings.model.clone()))
        } else {
            Arc::new(ScriptedEmbeddingClient::new(settings.dimensions, settings.model.clone()))
        }
    }
}

/// Deterministic embedder: equal inputs produce equal vectors, so
/// exact-match queries always score highest under inner product.
pub struct ScriptedEmbeddingClient {
    dimension: usize,
    model: String,
    fail: bool,
}

impl ScriptedEmbeddingClient {
    pub fn new(dimension: usize, model: impl Into<String>) -> Self {
        Self { dimension, model: model.into(), fail: false }
    }

    /// Embedder whose every call fails with a transport error; used to
    /// exercise degraded-mode paths.
    pub fn failing(dimension: usize, model: impl Into<String>) -> Self {
        Self { dimension, model: model.into(), fail: true }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for (i, b) in text.bytes().enumerate() {
            v[(i + b as usize) % self.dimension] += f32::from(b) / 255.0;
        }
        // L2-normalize so inner product behaves like cosine similarity.
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for ScriptedEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        if self.fail {
            return Err(ModelError::Network("embedding endpoint unreachable".into()));
        }
        if text.trim().is_empty() {
            return Err(ModelError::Validation("cannot embed blank input".into()));
        }
        Ok(self.vector_for(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> ChatRequest {
        ChatRequest::new(vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn scripted_text_reply_streams_and_assembles() {
        let c = ScriptedChatClient::new(vec![ScriptedReply::Chunks(vec![
            "Hel".into(),
            "lo".into(),
        ])]);
        let mut seen = String::new();
        let mut sink = |t: &str| seen.push_str(t);
        let resp = c.stream_chat(req(), &mut sink).await.unwrap();
        assert_eq!(seen, "Hello");
        assert_eq!(resp.message().unwrap().text(), Some("Hello"));
        assert_eq!(resp.finish_reason(), Some("stop"));
    }

    #[tokio::test]
    async fn scripted_tool_calls_set_finish_reason() {
        let c = ScriptedChatClient::new(vec![ScriptedReply::ToolCalls(vec![
            ToolCallPayload::function("c1", "recall_memory", r#"{"query":"x"}"#),
        ])]);
        let mut sink = |_: &str| {};
        let resp = c.stream_chat(req(), &mut sink).await.unwrap();
        assert_eq!(resp.finish_reason(), Some("tool_calls"));
        assert_eq!(resp.message().unwrap().role, crate::Role::Assistant);
        assert!(resp.message().unwrap().has_tool_calls());
    }

    #[tokio::test]
    async fn exhausted_scripts_fall_back_to_marker() {
        let c = ScriptedChatClient::new(vec![]);
        let resp = c.chat(req()).await.unwrap();
        assert!(resp.message().unwrap().text().unwrap().contains("no more scripts"));
    }

    #[tokio::test]
    async fn mid_stream_fail_emits_tokens_then_errors() {
        let c = ScriptedChatClient::new(vec![ScriptedReply::MidStreamFail {
            tokens: vec!["a".into(), "b".into()],
        }]);
        let mut seen = String::new();
        let mut sink = |t: &str| seen.push_str(t);
        let err = c.stream_chat(req(), &mut sink).await.unwrap_err();
        assert_eq!(seen, "ab");
        assert!(matches!(err, ModelError::Network(_)));
    }

    #[tokio::test]
    async fn embedder_is_deterministic_and_normalized() {
        let e = ScriptedEmbeddingClient::new(16, "mock-embed");
        let a = e.embed("the same text").await.unwrap();
        let b = e.embed("the same text").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn different_texts_differ() {
        let e = ScriptedEmbeddingClient::new(16, "mock-embed");
        let a = e.embed("alpha").await.unwrap();
        let b = e.embed("beta").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn failing_embedder_errors() {
        let e = ScriptedEmbeddingClient::failing(8, "mock-embed");
        assert!(e.embed("x").await.is_err());
    }
}
