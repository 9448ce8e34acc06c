// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The worker surface: session submission and the external command set
//! (pause / resume / abort / continue) the HTTP façade calls into.
//!
//! One spawned task per live session.  Commands only write the session
//! row; the loop observes status changes cooperatively at iteration edges.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use arbor_config::{AgentConfig, Config};
use arbor_memory::MemoryService;
use arbor_model::{
    ChatBackend, ChatClient, ChatFactory, HttpChatFactory, HttpEmbedderProvider, Message, Router,
};
use arbor_store::{
    save_with_retry, validate_session_id, ApiKeyStore, ContextStore, FileApiKeyStore,
    FileSessionStore, KeyResolver, Session, SessionStatus, SessionStore, StoreError,
};
use arbor_tools::{ToolIndex, ToolRegistry};
use arbor_vector::{MilvusStore, VectorStore};

use crate::{agent::AgentLoop, events::AgentEvent, publisher::EventPublisher};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("session {id} is {status}; operation requires {required}")]
    InvalidState { id: String, status: SessionStatus, required: &'static str },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything one session loop needs, shared by all loops of the process.
pub struct RuntimeDeps {
    pub sessions: Arc<dyn SessionStore>,
    pub context: Arc<ContextStore>,
    pub keys: Arc<KeyResolver>,
    pub memory: Arc<MemoryService>,
    pub registry: Arc<ToolRegistry>,
    pub tool_index: Arc<ToolIndex>,
    pub events: Arc<EventPublisher>,
    pub system_chat: Arc<dyn ChatBackend>,
    pub chat_factory: Arc<dyn ChatFactory>,
    pub agent: AgentConfig,
}

pub struct Runtime {
    deps: Arc<RuntimeDeps>,
}

impl Runtime {
    pub fn new(deps: RuntimeDeps) -> Self {
        Self { deps: Arc::new(deps) }
    }

    /// Production wiring: file stores under `data_dir`, Milvus, and the
    /// primary/fallback router over the configured system endpoints.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let data_dir = cfg
            .data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("arbor")))
            .unwrap_or_else(|| std::path::PathBuf::from(".arbor-data"));

        let sessions: Arc<dyn SessionStore> =
            Arc::new(FileSessionStore::new(data_dir.join("sessions"))?);
        let key_store: Arc<dyn ApiKeyStore> = Arc::new(FileApiKeyStore::new(&data_dir)?);
        let keys = Arc::new(KeyResolver::new(key_store));
        let vector: Arc<dyn VectorStore> = Arc::new(MilvusStore::new(&cfg.milvus));

        let embedders = Arc::new(HttpEmbedderProvider);
        let memory = Arc::new(MemoryService::new(
            Arc::clone(&vector),
            Arc::clone(&keys),
            cfg.embedding.clone(),
            embedders.clone(),
            cfg.agent.min_recall_score,
        ));
        let registry = Arc::new(ToolRegistry::new());
        let tool_index = Arc::new(ToolIndex::new(
            Arc::clone(&vector),
            Arc::clone(&registry),
            Arc::clone(&keys),
            cfg.embedding.clone(),
            embedders,
        ));

        let router = Router::from_clients(
            ChatClient::new(cfg.llm.primary.clone()),
            ChatClient::new(cfg.llm.fallback.clone()),
        );

        Ok(Self::new(RuntimeDeps {
            context: Arc::new(ContextStore::new(
                Arc::clone(&sessions),
                cfg.agent.max_context_messages,
            )),
            sessions,
            keys,
            memory,
            registry,
            tool_index,
            events: Arc::new(EventPublisher::new()),
            system_chat: Arc::new(router),
            chat_factory: Arc::new(HttpChatFactory),
            agent: cfg.agent.clone(),
        }))
    }

    pub fn deps(&self) -> &Arc<RuntimeDeps> {
        &self.deps
    }

    /// Create a PENDING session row and enqueue its loop.  A caller-chosen
    /// id that already exists surfaces as `AlreadyExists`.
    pub async fn submit(
        &self,
        task: &str,
        session_id: Option<String>,
        owner: Option<String>,
    ) -> Result<Session, CommandError> {
        let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        validate_session_id(&id)?;
        let session = Session::new(&id, task, owner);
        self.deps.sessions.create(session.clone()).await?;
        info!(session_id = %id, "session submitted");
        self.spawn_loop(id);
        Ok(session)
    }

    fn spawn_loop(&self, id: String) {
        let deps = Arc::clone(&self.deps);
        tokio::spawn(async move {
            AgentLoop::run(deps, id).await;
        });
    }

    pub async fn get(&self, id: &str) -> Result<Session, CommandError> {
        Ok(self.deps.sessions.get(id).await?)
    }

    pub fn subscribe(&self, id: &str) -> broadcast::Receiver<AgentEvent> {
        self.deps.events.subscribe(id)
    }

    /// RUNNING → PAUSED; anything else is a state conflict.
    pub async fn pause(&self, id: &str) -> Result<Session, CommandError> {
        let session = self.deps.sessions.get(id).await?;
        if session.status != SessionStatus::Running {
            return Err(CommandError::InvalidState {
                id: id.to_string(),
                status: session.status,
                required: "RUNNING",
            });
        }
        let updated = save_with_retry(self.deps.sessions.as_ref(), id, |s| {
            if s.status == SessionStatus::Running {
                s.status = SessionStatus::Paused;
            }
        })
        .await?;
        self.deps.events.publish(AgentEvent::status_change(id, SessionStatus::Paused));
        Ok(updated)
    }

    /// PAUSED → RUNNING; anything else is a state conflict.
    pub async fn resume(&self, id: &str) -> Result<Session, CommandError> {
        let session = self.deps.sessions.get(id).await?;
        if session.status != SessionStatus::Paused {
            return Err(CommandError::InvalidState {
                id: id.to_string(),
                status: session.status,
                required: "PAUSED",
            });
        }
        let updated = save_with_retry(self.deps.sessions.as_ref(), id, |s| {
            if s.status == SessionStatus::Paused {
                s.status = SessionStatus::Running;
            }
        })
        .await?;
        self.deps.events.publish(AgentEvent::status_change(id, SessionStatus::Running));
        Ok(updated)
    }

    /// Cooperative abort: mark FAILED and let the loop notice at its next
    /// iteration edge.  A no-op on sessions already terminal.
    pub async fn abort(&self, id: &str) -> Result<Session, CommandError> {
        let session = self.deps.sessions.get(id).await?;
        if session.status.is_terminal() {
            return Ok(session);
        }
        let updated = save_with_retry(self.deps.sessions.as_ref(), id, |s| {
            if !s.status.is_terminal() {
                s.status = SessionStatus::Failed;
                s.error_message = Some("Aborted by user".into());
            }
        })
        .await?;
        self.deps.events.publish(AgentEvent::status_change(id, SessionStatus::Failed));
        Ok(updated)
    }

    /// Append a user message to a finished session's context and re-enter
    /// the plan from the top over the existing conversation.
    pub async fn continue_session(
        &self,
        id: &str,
        message: &str,
    ) -> Result<Session, CommandError> {
        let session = self.deps.sessions.get(id).await?;
        if !session.status.is_terminal() {
            return Err(CommandError::InvalidState {
                id: id.to_string(),
                status: session.status,
                required: "COMPLETED or FAILED",
            });
        }
        self.deps.context.append(id, vec![Message::user(message)]).await?;
        let updated = save_with_retry(self.deps.sessions.as_ref(), id, |s| {
            s.status = SessionStatus::Pending;
            s.result = None;
            s.error_message = None;
        })
        .await?;
        info!(session_id = %id, "session continued");
        self.spawn_loop(id.to_string());
        Ok(updated)
    }
}
