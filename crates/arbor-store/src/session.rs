// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Epoch milliseconds, the timestamp unit of every persisted record.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One autonomous execution of the agent against a user task.
///
/// The row is shared with external writers (pause/resume/abort handlers);
/// every mutation goes through an optimistic `version` check, and writers
/// re-fetch by id before mutating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner: Option<String>,
    pub task_description: String,
    pub status: SessionStatus,
    pub iteration_count: u32,
    /// Serialized context window (JSON message array); empty until the
    /// loop initializes it.
    #[serde(default)]
    pub context_json: String,
    #[serde(default)]
    pub plan_json: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub version: u64,
    pub create_time_ms: i64,
    pub update_time_ms: i64,
}

impl Session {
    pub fn new(id: impl Into<String>, task: impl Into<String>, owner: Option<String>) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            owner,
            task_description: task.into(),
            status: SessionStatus::Pending,
            iteration_count: 0,
            context_json: String::new(),
            plan_json: None,
            result: None,
            error_message: None,
            version: 0,
            create_time_ms: now,
            update_time_ms: now,
        }
    }
}

/// Session ids are external and opaque: at most 64 chars from a filename-
/// safe alphabet (they name the persisted row on disk).
pub fn validate_session_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::Validation("session id must not be empty".into()));
    }
    if id.len() > 64 {
        return Err(StoreError::Validation("session id exceeds 64 characters".into()));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return Err(StoreError::Validation(format!("session id contains invalid characters: {id}")));
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
