// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use arbor_vector::StoredMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryType {
    Episodic,
    Semantic,
    Procedural,
}

impl MemoryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Episodic => "EPISODIC",
            Self::Semantic => "SEMANTIC",
            Self::Procedural => "PROCEDURAL",
        }
    }

    /// Parse a model- or user-supplied label; anything unrecognized maps to
    /// `Semantic`, the default for stable facts.
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "EPISODIC" => Self::Episodic,
            "PROCEDURAL" => Self::Procedural,
            _ => Self::Semantic,
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Browse-oriented memory shape returned by list/search/recall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: i64,
    pub session_id: String,
    pub content: String,
    pub memory_type: String,
    pub importance: f32,
    pub create_time_ms: i64,
    /// Similarity score; present only on vector-search results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl MemoryItem {
    pub fn from_stored(record: StoredMemory, score: Option<f32>) -> Self {
        Self {
            id: record.id,
            session_id: record.session_id,
            content: record.content,
            memory_type: record.memory_type,
            importance: record.importance,
            create_time_ms: record.create_time_ms,
            score,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
