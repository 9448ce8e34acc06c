// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Primary/fallback routing over two chat endpoints.
//!
//! Every call is rewritten to the target's configured model, executed under
//! that target's circuit breaker with bounded retries, and failed over to
//! the fallback on any error — including an open breaker.  A stream that
//! dies mid-transmission counts as a failed call; tokens already delivered
//! stay delivered, and the fallback restarts the stream from the top.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

use crate::{
    backend::{ChatBackend, TokenSink},
    breaker::{BreakerSettings, CircuitBreaker},
    retry::RetrySettings,
    ChatClient, ChatRequest, ChatResponse, ModelError,
};

/// One routed endpoint: a backend plus its breaker state.
pub struct RouterTarget {
    backend: Arc<dyn ChatBackend>,
    provider: String,
    model: String,
    breaker: CircuitBreaker,
}

impl RouterTarget {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self::with_breaker(backend, provider, model, BreakerSettings::default())
    }

    pub fn with_breaker(
        backend: Arc<dyn ChatBackend>,
        provider: impl Into<String>,
        model: impl Into<String>,
        settings: BreakerSettings,
    ) -> Self {
        Self {
            backend,
            provider: provider.into(),
            model: model.into(),
            breaker: CircuitBreaker::new(settings),
        }
    }
}

pub struct Router {
    primary: RouterTarget,
    fallback: RouterTarget,
    retry: RetrySettings,
}

impl Router {
    /// Route between two configured endpoints.
    pub fn from_clients(primary: ChatClient, fallback: ChatClient) -> Self {
        let primary_provider = primary.provider().to_string();
        let primary_model = primary.default_model().to_string();
        let fallback_provider = fallback.provider().to_string();
        let fallback_model = fallback.default_model().to_string();
        Self::from_targets(
            RouterTarget::new(Arc::new(primary), primary_provider, primary_model),
            RouterTarget::new(Arc::new(fallback), fallback_provider, fallback_model),
        )
    }

    /// Route between two pre-built targets (tests use scripted backends).
    pub fn from_targets(primary: RouterTarget, fallback: RouterTarget) -> Self {
        Self { primary, fallback, retry: RetrySettings::default() }
    }

    pub fn with_retry_settings(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    async fn chat_target(
        &self,
        target: &RouterTarget,
        req: &ChatRequest,
    ) -> Result<ChatResponse, ModelError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !target.breaker.try_acquire() {
                return Err(ModelError::CircuitOpen { provider: target.provider.clone() });
            }
            let start = Instant::now();
            let result = target.backend.chat(req.clone().with_model(&target.model)).await;
            let elapsed = start.elapsed();
            match result {
                Ok(resp) => {
                    target.breaker.record_success(elapsed);
                    return Ok(resp);
                }
                Err(err) => {
                    if err.counts_as_failure() {
                        target.breaker.record_failure(elapsed);
                    }
                    if attempt < self.retry.attempts && err.is_retryable() {
                        warn!(provider = %target.provider, attempt, error = %err,
                              "chat call failed; retrying");
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn stream_target(
        &self,
        target: &RouterTarget,
        req: &ChatRequest,
        on_token: &mut (dyn FnMut(&str) + Send),
    ) -> Result<ChatResponse, ModelError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !target.breaker.try_acquire() {
                return Err(ModelError::CircuitOpen { provider: target.provider.clone() });
            }
            let start = Instant::now();
            let result = target
                .backend
                .stream_chat(req.clone().with_model(&target.model), &mut *on_token)
                .await;
            let elapsed = start.elapsed();
            match result {
                Ok(resp) => {
                    target.breaker.record_success(elapsed);
                    return Ok(resp);
                }
                Err(err) => {
                    // A stream that opened but died mid-transmission is still
                    // a failed call; partial tokens have already reached the
                    // sink and the retry restarts from the top.
                    if err.counts_as_failure() {
                        target.breaker.record_failure(elapsed);
                    }
                    if attempt < self.retry.attempts && err.is_retryable() {
                        warn!(provider = %target.provider, attempt, error = %err,
                              "stream failed; retrying");
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl ChatBackend for Router {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ModelError> {
        match self.chat_target(&self.primary, &req).await {
            Ok(resp) => Ok(resp),
            Err(primary_err) => {
                warn!(error = %primary_err, "primary exhausted; failing over");
                match self.chat_target(&self.fallback, &req).await {
                    Ok(resp) => Ok(resp),
                    Err(fallback_err) => Err(ModelError::AllProvidersFailed {
                        primary: Box::new(primary_err),
                        fallback: Box::new(fallback_err),
                    }),
                }
            }
        }
    }

    async fn stream_chat(
        &self,
        req: ChatRequest,
        on_token: TokenSink<'_>,
    ) -> Result<ChatResponse, ModelError> {
        match self.stream_target(&self.primary, &req, on_token).await {
            Ok(resp) => Ok(resp),
            Err(primary_err) => {
                warn!(error = %primary_err, "primary stream exhausted; failing over");
                match self.stream_target(&self.fallback, &req, on_token).await {
                    Ok(resp) => Ok(resp),
                    Err(fallback_err) => Err(ModelError::AllProvidersFailed {
                        primary: Box::new(primary_err),
                        fallback: Box::new(fallback_err),
                    }),
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
