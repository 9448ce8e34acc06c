// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session row persistence with optimistic versioning.
//!
//! Two implementations share one contract: `save` compares the stored
//! version against the caller's copy and rejects stale writes with
//! [`StoreError::Conflict`]; a successful save bumps the version.  The
//! file store writes one JSON document per session and renames it into
//! place so a crash never leaves a half-written row.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::session::{now_ms, validate_session_id, Session};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("version conflict on session {id}: expected {expected}, found {found}")]
    Conflict { id: String, expected: u64, found: u64 },

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new row; the id must be unused.
    async fn create(&self, session: Session) -> Result<(), StoreError>;

    /// Fetch a fresh copy of the row.
    async fn get(&self, id: &str) -> Result<Session, StoreError>;

    /// Optimistic save: fails with [`StoreError::Conflict`] when the stored
    /// version differs from `session.version`.  On success the caller's
    /// copy carries the bumped version and refreshed update time.
    async fn save(&self, session: &mut Session) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Refetch-mutate-save with up to 3 attempts on version conflicts, per the
/// shared-row contract: the loop and the external command handlers both
/// write the same session concurrently.
pub async fn save_with_retry<F>(
    store: &dyn SessionStore,
    id: &str,
    mutate: F,
) -> Result<Session, StoreError>
where
    F: Fn(&mut Session),
{
    for attempt in 0..3 {
        let mut session = store.get(id).await?;
        mutate(&mut session);
        match store.save(&mut session).await {
            Ok(()) => return Ok(session),
            Err(StoreError::Conflict { .. }) if attempt < 2 => {
                debug!(session_id = id, attempt, "version conflict; refetching");
            }
            Err(e) => return Err(e),
        }
    }
    // Not reachable: the third attempt always returns above.
    Err(StoreError::Unavailable("save retries exhausted".into()))
}

// ─── In-memory store ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySessionStore {
    rows: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: Session) -> Result<(), StoreError> {
        validate_session_id(&session.id)?;
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(session.id));
        }
        rows.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Session, StoreError> {
        self.rows
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    async fn save(&self, session: &mut Session) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let stored = rows
            .get(&session.id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session.id)))?;
        if stored.version != session.version {
            return Err(StoreError::Conflict {
                id: session.id.clone(),
                expected: session.version,
                found: stored.version,
            });
        }
        session.version += 1;
        session.update_time_ms = now_ms();
        rows.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.rows.lock().unwrap().remove(id);
        Ok(())
    }
}

// ─── File-backed store ────────────────────────────────────────────────────────

/// One JSON document per session under `dir`.  Writes go to a sibling
/// `.tmp` file first and are renamed into place, so a crash mid-write
/// leaves the previous row intact.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read(&self, id: &str) -> Result<Session, StoreError> {
        let path = self.path(id);
        let text = std::fs::read_to_string(&path)
            .map_err(|_| StoreError::NotFound(format!("session {id}")))?;
        serde_json::from_str(&text).map_err(|e| StoreError::Serde(e.to_string()))
    }

    fn write(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.path(&session.id);
        let tmp = path.with_extension("json.tmp");
        let text =
            serde_json::to_string_pretty(session).map_err(|e| StoreError::Serde(e.to_string()))?;
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, session: Session) -> Result<(), StoreError> {
        validate_session_id(&session.id)?;
        if self.path(&session.id).exists() {
            return Err(StoreError::AlreadyExists(session.id));
        }
        self.write(&session)
    }

    async fn get(&self, id: &str) -> Result<Session, StoreError> {
        validate_session_id(id)?;
        self.read(id)
    }

    async fn save(&self, session: &mut Session) -> Result<(), StoreError> {
        let stored = self.read(&session.id)?;
        if stored.version != session.version {
            return Err(StoreError::Conflict {
                id: session.id.clone(),
                expected: session.version,
                found: stored.version,
            });
        }
        session.version += 1;
        session.update_time_ms = now_ms();
        self.write(session)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        validate_session_id(id)?;
        let _ = std::fs::remove_file(self.path(id));
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
