// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Two-phase memory compression: ask an LLM for a merged set, return it for
//! human confirmation, then apply the confirmed deletes and inserts.
//!
//! The apply step is deliberately not atomic across the two operations;
//! a partial application leaves the store in a recoverable state and the
//! outcome counts tell the caller exactly how far it got.

use serde::{Deserialize, Serialize};
use tracing::warn;

use arbor_model::{ChatBackend, ChatRequest, Message};

use crate::service::{MemoryError, MemoryService};
use crate::types::{MemoryItem, MemoryType};

/// Upper bound on memories considered in one compression round.
const COMPRESSION_FETCH_CAP: usize = 200;

/// A compression proposal awaiting confirmation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressionPlan {
    /// What the user currently has stored.
    pub current: Vec<MemoryItem>,
    /// The LLM's merged replacement set.
    pub proposed: Vec<ProposedMemory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedMemory {
    pub content: String,
    #[serde(default)]
    pub memory_type: Option<String>,
    #[serde(default)]
    pub importance: Option<f32>,
}

/// Counts of what the apply step actually managed to do.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompressionOutcome {
    pub deleted: usize,
    pub inserted: usize,
}

impl MemoryService {
    /// Phase 1: collect the user's memories and ask `llm` for a merged set.
    /// An empty store yields an empty plan without touching the model.
    pub async fn prepare_compression(
        &self,
        user_id: Option<&str>,
        llm: &dyn ChatBackend,
    ) -> Result<CompressionPlan, MemoryError> {
        let current = self.fetch_for_compression(user_id, COMPRESSION_FETCH_CAP).await?;
        if current.is_empty() {
            return Ok(CompressionPlan::default());
        }

        let prompt = compression_prompt(&current);
        let mut req = ChatRequest::new(vec![Message::user(prompt)]);
        req.temperature = Some(0.2);
        let resp = llm.chat(req).await?;
        let content = resp
            .message()
            .and_then(|m| m.text())
            .ok_or_else(|| MemoryError::Compression("model returned no content".into()))?;

        let body = strip_code_fence(content);
        let proposed: Vec<ProposedMemory> = serde_json::from_str(body)
            .map_err(|e| MemoryError::Compression(format!("{e}: {body}")))?;
        Ok(CompressionPlan { current, proposed })
    }

    /// Phase 2: apply a confirmed plan.  Failed deletes are skipped with a
    /// warning; inserts land under the synthetic session `"compressed"`.
    pub async fn execute_compression(
        &self,
        user_id: Option<&str>,
        delete_ids: &[i64],
        new_memories: &[ProposedMemory],
    ) -> Result<CompressionOutcome, MemoryError> {
        let mut outcome = CompressionOutcome::default();
        for &id in delete_ids {
            match self.delete_by_id(id, user_id).await {
                Ok(()) => outcome.deleted += 1,
                Err(e) => warn!(id, error = %e, "compression delete failed; continuing"),
            }
        }
        for mem in new_memories {
            let memory_type = mem
                .memory_type
                .as_deref()
                .map(MemoryType::parse_or_default)
                .unwrap_or(MemoryType::Semantic);
            let importance = mem.importance.unwrap_or(0.8);
            match self
                .remember("compressed", &mem.content, memory_type, importance, user_id)
                .await
            {
                Ok(true) => outcome.inserted += 1,
                Ok(false) => warn!("compression insert skipped; store unavailable"),
                Err(e) => warn!(error = %e, "compression insert failed; continuing"),
            }
        }
        Ok(outcome)
    }
}

fn compression_prompt(current: &[MemoryItem]) -> String {
    let mut listing = String::new();
    for (i, item) in current.iter().enumerate() {
        listing.push_str(&format!(
            "{}. [{}] (importance {:.2}) {}\n",
            i + 1,
            item.memory_type,
            item.importance,
            item.content
        ));
    }
    format!(
        "You are compacting an agent's long-term memory store. Merge memories \
         that state the same fact, drop transient trivia, and keep every stable \
         fact about the user or their work. Respond with a JSON array ONLY, no \
         prose and no code fences. Each element must be an object of the form \
         {{\"content\": string, \"memory_type\": \"EPISODIC\"|\"SEMANTIC\"|\"PROCEDURAL\", \
         \"importance\": number between 0 and 1}}.\n\nCurrent memories:\n{listing}"
    )
}

/// Drop a surrounding Markdown code fence, if present.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else { return trimmed };
    // Skip the info string (e.g. "json") up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").map(str::trim).unwrap_or_else(|| body.trim())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
