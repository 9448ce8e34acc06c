// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The context window: the ordered message list sent to the model on every
//! iteration, persisted as a JSON blob on the session row.
//!
//! The loop is the sole writer of the blob, but the row itself is shared,
//! so every store call re-fetches by id before mutating rather than saving
//! a possibly-stale session reference.

use std::sync::Arc;

use arbor_model::{Message, Role};

use crate::store::{save_with_retry, SessionStore, StoreError};

pub struct ContextStore {
    store: Arc<dyn SessionStore>,
    max_messages: usize,
}

impl ContextStore {
    pub fn new(store: Arc<dyn SessionStore>, max_messages: usize) -> Self {
        Self { store, max_messages }
    }

    /// Deserialize the context blob; empty when absent.
    pub async fn load(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let session = self.store.get(session_id).await?;
        if session.context_json.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&session.context_json).map_err(|e| StoreError::Serde(e.to_string()))
    }

    /// Replace the context with `messages` (trimmed) and persist.
    pub async fn initialize(
        &self,
        session_id: &str,
        messages: Vec<Message>,
    ) -> Result<(), StoreError> {
        let trimmed = trim_messages(messages, self.max_messages);
        self.persist(session_id, &trimmed).await
    }

    /// Load, append all `messages` in order, trim, persist.
    pub async fn append(
        &self,
        session_id: &str,
        messages: Vec<Message>,
    ) -> Result<(), StoreError> {
        let mut all = self.load(session_id).await?;
        all.extend(messages);
        let trimmed = trim_messages(all, self.max_messages);
        self.persist(session_id, &trimmed).await
    }

    async fn persist(&self, session_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        let blob =
            serde_json::to_string(messages).map_err(|e| StoreError::Serde(e.to_string()))?;
        save_with_retry(self.store.as_ref(), session_id, move |s| {
            s.context_json = blob.clone();
        })
        .await?;
        Ok(())
    }
}

/// Trim to at most `max` messages: the leading message survives iff it is
/// the system prompt; the rest is kept from the tail.
pub fn trim_messages(mut msgs: Vec<Message>, max: usize) -> Vec<Message> {
    if max == 0 || msgs.len() <= max {
        return msgs;
    }
    let system_head = msgs.first().map(|m| m.role == Role::System).unwrap_or(false);
    if system_head {
        let head = msgs.remove(0);
        let keep = max - 1;
        let tail = msgs.split_off(msgs.len() - keep);
        let mut out = Vec::with_capacity(max);
        out.push(head);
        out.extend(tail);
        out
    } else {
        let len = msgs.len();
        msgs.split_off(len - max)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
