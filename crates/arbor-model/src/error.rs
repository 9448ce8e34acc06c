// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Longest body excerpt carried inside a provider error.
const SNIPPET_LEN: usize = 300;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("transport error: {0}")]
    Network(String),

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("provider error {status}: {snippet}")]
    Provider { status: u16, snippet: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("circuit open for {provider}")]
    CircuitOpen { provider: String },

    #[error("all providers failed; primary: {primary}; fallback: {fallback}")]
    AllProvidersFailed {
        primary: Box<ModelError>,
        fallback: Box<ModelError>,
    },
}

impl ModelError {
    /// Classify an HTTP failure status with its body.
    pub fn from_status(status: u16, body: &str) -> Self {
        if status == 429 {
            return Self::RateLimited;
        }
        let snippet: String = body.chars().take(SNIPPET_LEN).collect();
        Self::Provider { status, snippet }
    }

    /// Map a reqwest transport failure.  Timeouts and connect failures are
    /// transport errors; everything else the HTTP layer reports before a
    /// status line also counts as transport.
    pub fn transport(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }

    /// Whether the retry layer may re-issue the call.  Only transport-style
    /// failures and throttling retry; a 4xx is the caller's bug and a
    /// malformed body will not improve on a second read.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited => true,
            Self::Provider { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the circuit breaker records this outcome.  Validation errors
    /// never reach the wire and must not poison the window.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_rate_limited() {
        assert!(matches!(ModelError::from_status(429, "slow down"), ModelError::RateLimited));
    }

    #[test]
    fn status_500_is_provider_error_with_snippet() {
        let err = ModelError::from_status(500, "boom");
        match err {
            ModelError::Provider { status, snippet } => {
                assert_eq!(status, 500);
                assert_eq!(snippet, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn snippet_is_truncated() {
        let body = "x".repeat(1000);
        match ModelError::from_status(502, &body) {
            ModelError::Provider { snippet, .. } => assert_eq!(snippet.len(), 300),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(ModelError::Network("t".into()).is_retryable());
        assert!(ModelError::RateLimited.is_retryable());
        assert!(ModelError::from_status(503, "").is_retryable());
        assert!(!ModelError::from_status(400, "").is_retryable());
        assert!(!ModelError::Protocol("bad json".into()).is_retryable());
        assert!(!ModelError::Validation("blank".into()).is_retryable());
    }

    #[test]
    fn validation_does_not_count_as_breaker_failure() {
        assert!(!ModelError::Validation("blank".into()).counts_as_failure());
        assert!(ModelError::Network("t".into()).counts_as_failure());
        assert!(ModelError::from_status(400, "").counts_as_failure());
    }
}
