// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-session agent loop: recall → stream → decide → act → persist.
//!
//! One loop instance owns one session task.  All durable state flows
//! through the session and context stores by primary id — the loop never
//! trusts an in-memory session copy across an await point, because pause /
//! resume / abort handlers write the same row concurrently.  Pause and
//! abort are cooperative: both are observed at the top of the next
//! iteration, never mid-stream.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use arbor_memory::{MemoryService, MemoryType};
use arbor_model::{
    ChatBackend, ChatFactory, ChatRequest, Message, Role, ToolCallPayload, ToolChoice, ToolSpec,
};
use arbor_store::{save_with_retry, SessionStatus, SessionStore};
use arbor_tools::{RECALL_MEMORY, STORE_MEMORY};

use crate::{
    events::{AgentEvent, AgentEventKind},
    prompts::base_system_prompt,
    runtime::RuntimeDeps,
};

/// Task excerpt length in the completion memory.
const COMPLETION_TASK_CLIP: usize = 200;
/// Answer excerpt length in the completion memory.
const COMPLETION_ANSWER_CLIP: usize = 500;
/// Tool results shorter than this are not worth an episodic memory.
const AUTO_STORE_MIN_LEN: usize = 50;

pub struct AgentLoop {
    deps: Arc<RuntimeDeps>,
    session_id: String,
    owner: Option<String>,
    task: String,
    iteration: u32,
    /// Normalized contents already stored in this session, plus their
    /// prefixes.  Process-local soft state: losing it on restart costs at
    /// worst a redundant memory write.
    stored_contents: HashSet<String>,
    stored_prefixes: HashSet<String>,
}

impl AgentLoop {
    fn new(deps: Arc<RuntimeDeps>, session_id: String) -> Self {
        Self {
            deps,
            session_id,
            owner: None,
            task: String::new(),
            iteration: 0,
            stored_contents: HashSet::new(),
            stored_prefixes: HashSet::new(),
        }
    }

    /// Drive one session to a terminal state.  Never panics the worker:
    /// any error marks the session FAILED with an ERROR event.
    pub async fn run(deps: Arc<RuntimeDeps>, session_id: String) {
        let mut agent = Self::new(deps.clone(), session_id.clone());
        if let Err(err) = agent.execute().await {
            let reason = format!("{err:#}");
            error!(session_id = %session_id, error = %reason, "session loop failed");
            agent.publish(
                AgentEvent::new(&session_id, AgentEventKind::Error)
                    .with_content(&reason)
                    .at_iteration(agent.iteration),
            );
            let marked = save_with_retry(deps.sessions.as_ref(), &session_id, |s| {
                if !s.status.is_terminal() {
                    s.status = SessionStatus::Failed;
                    s.error_message = Some(reason.clone());
                }
            })
            .await;
            match marked {
                Ok(_) => agent
                    .publish(AgentEvent::status_change(&session_id, SessionStatus::Failed)),
                Err(e) => error!(session_id = %session_id, error = %e,
                                 "could not mark session failed"),
            }
        }
    }

    fn publish(&self, event: AgentEvent) {
        self.deps.events.publish(event);
    }

    fn event(&self, kind: AgentEventKind) -> AgentEvent {
        AgentEvent::new(&self.session_id, kind).at_iteration(self.iteration)
    }

    async fn execute(&mut self) -> anyhow::Result<()> {
        let session =
            self.deps.sessions.get(&self.session_id).await.context("loading session")?;
        self.owner = session.owner.clone();
        self.task = session.task_description.clone();

        self.publish(AgentEvent::plan_ready(&self.session_id));
        self.publish(AgentEvent::step_start(&self.session_id, 1));

        let plan = serde_json::to_string(&crate::events::PLAN_STEPS).unwrap_or_default();
        let started = save_with_retry(self.deps.sessions.as_ref(), &self.session_id, move |s| {
            if s.status == SessionStatus::Pending {
                s.status = SessionStatus::Running;
            }
            s.plan_json = Some(plan.clone());
        })
        .await
        .context("starting session")?;
        if started.status == SessionStatus::Running {
            self.publish(AgentEvent::status_change(&self.session_id, SessionStatus::Running));
        }

        // A session whose owner holds an LLM key talks to that endpoint
        // directly; everyone else goes through the system router pair.
        let backend: Arc<dyn ChatBackend> =
            match self.deps.keys.resolve_llm(self.owner.as_deref()).await? {
                Some(settings) => {
                    info!(session_id = %self.session_id, provider = %settings.name,
                          "using owner's LLM endpoint");
                    self.deps.chat_factory.backend_for(&settings)
                }
                None => Arc::clone(&self.deps.system_chat),
            };

        // A non-empty context means this is a continuation; resume as-is.
        let existing = self.deps.context.load(&self.session_id).await?;
        if existing.is_empty() {
            self.deps
                .context
                .initialize(
                    &self.session_id,
                    vec![Message::system(base_system_prompt()), Message::user(&self.task)],
                )
                .await?;
        }
        self.publish(AgentEvent::step_complete(&self.session_id, 1, None));

        self.publish(AgentEvent::step_start(&self.session_id, 2));
        let answer = self.inner_loop(backend.as_ref()).await?;

        match answer {
            Some(answer) => self.finalize_success(&answer).await,
            None => self.finalize_no_answer().await,
        }
    }

    async fn inner_loop(&mut self, backend: &dyn ChatBackend) -> anyhow::Result<Option<String>> {
        let poll = Duration::from_millis(self.deps.agent.resume_poll_ms.max(1));
        loop {
            // Reload the row; the status is the coordination point with the
            // external pause/resume/abort handlers.
            let mut session = self.deps.sessions.get(&self.session_id).await?;
            while session.status == SessionStatus::Paused {
                debug!(session_id = %self.session_id, "paused; polling for resume");
                tokio::time::sleep(poll).await;
                session = self.deps.sessions.get(&self.session_id).await?;
            }
            if session.status != SessionStatus::Running {
                return Ok(None);
            }

            let iteration = session.iteration_count + 1;
            self.iteration = iteration;
            self.publish(self.event(AgentEventKind::IterationStart));

            let context = self.deps.context.load(&self.session_id).await?;
            let intent = context
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .and_then(|m| m.text())
                .unwrap_or(self.task.as_str())
                .to_string();
            let tools = self.select_tools(&intent).await;

            let mut req = ChatRequest::new(context);
            req.tools = tools;
            req.tool_choice = Some(ToolChoice::Auto);
            req.temperature = Some(self.deps.agent.temperature);
            req.max_tokens = Some(self.deps.agent.max_tokens);

            let events = Arc::clone(&self.deps.events);
            let sid = self.session_id.clone();
            let mut sink = move |token: &str| {
                events.publish(
                    AgentEvent::new(&sid, AgentEventKind::Thinking)
                        .with_content(token)
                        .at_iteration(iteration),
                );
            };
            let resp = backend
                .stream_chat(req, &mut sink)
                .await
                .context("completion stream failed")?;
            let message =
                resp.message().cloned().unwrap_or_else(|| Message::assistant(String::new()));

            if message.has_tool_calls() {
                let calls = message.tool_calls.clone().unwrap_or_default();
                let mut batch = Vec::with_capacity(calls.len() + 1);
                batch.push(message);
                for call in &calls {
                    self.publish(
                        self.event(AgentEventKind::ToolCall)
                            .with_payload(serde_json::to_value(call).unwrap_or(Value::Null)),
                    );
                    let output = self.execute_tool(call).await;
                    self.publish(self.event(AgentEventKind::ToolResult).with_payload(json!({
                        "toolName": call.function.name,
                        "output": output,
                    })));
                    self.auto_store_result(&call.function.name, &output).await;
                    batch.push(Message::tool_result(&call.id, output));
                }
                // One append carries the assistant message plus every tool
                // result.  Split writes would let the next iteration load a
                // context whose tool results answer calls it cannot see,
                // and the model would loop.
                self.deps.context.append(&self.session_id, batch).await?;
            } else {
                let answer = message.content.clone().unwrap_or_default();
                self.deps.context.append(&self.session_id, vec![message]).await?;
                save_with_retry(self.deps.sessions.as_ref(), &self.session_id, move |s| {
                    s.iteration_count = iteration;
                })
                .await?;
                return Ok(Some(answer));
            }

            save_with_retry(self.deps.sessions.as_ref(), &self.session_id, move |s| {
                s.iteration_count = iteration;
            })
            .await?;

            if iteration >= self.deps.agent.max_iterations {
                return Ok(None);
            }
        }
    }

    async fn finalize_success(&mut self, answer: &str) -> anyhow::Result<()> {
        self.publish(AgentEvent::step_complete(&self.session_id, 2, Some("完成推理")));
        self.publish(AgentEvent::step_start(&self.session_id, 3));

        let result = answer.to_string();
        save_with_retry(self.deps.sessions.as_ref(), &self.session_id, move |s| {
            s.result = Some(result.clone());
            s.status = SessionStatus::Completed;
        })
        .await
        .context("completing session")?;

        self.publish(AgentEvent::step_complete(&self.session_id, 3, Some(answer)));
        self.publish(self.event(AgentEventKind::FinalAnswer).with_content(answer));
        self.publish(AgentEvent::status_change(&self.session_id, SessionStatus::Completed));

        let note = format!(
            "Task: {}\nAnswer: {}",
            clip_chars(&self.task, COMPLETION_TASK_CLIP),
            clip_chars(answer, COMPLETION_ANSWER_CLIP)
        );
        if let Err(e) = self
            .deps
            .memory
            .remember(&self.session_id, &note, MemoryType::Semantic, 0.85, self.owner.as_deref())
            .await
        {
            warn!(session_id = %self.session_id, error = %e, "completion memory not stored");
        }
        Ok(())
    }

    async fn finalize_no_answer(&mut self) -> anyhow::Result<()> {
        let session = self.deps.sessions.get(&self.session_id).await?;
        if session.status.is_terminal() {
            // Externally aborted; the command handler already wrote the row
            // and published the status change.
            self.publish(AgentEvent::step_complete(&self.session_id, 2, Some("未得到最终回答")));
            return Ok(());
        }

        let reason = format!(
            "Max iterations ({}) reached without final answer.",
            self.deps.agent.max_iterations
        );
        let fail_reason = reason.clone();
        save_with_retry(self.deps.sessions.as_ref(), &self.session_id, move |s| {
            if !s.status.is_terminal() {
                s.status = SessionStatus::Failed;
                s.error_message = Some(fail_reason.clone());
            }
        })
        .await
        .context("failing session")?;

        self.publish(AgentEvent::step_complete(&self.session_id, 2, Some("未得到最终回答")));
        self.publish(self.event(AgentEventKind::Error).with_content(&reason));
        self.publish(AgentEvent::status_change(&self.session_id, SessionStatus::Failed));
        Ok(())
    }

    /// Top-K relevant tools by intent; the full catalog when the index has
    /// nothing usable.
    async fn select_tools(&self, intent: &str) -> Vec<ToolSpec> {
        let ids = self
            .deps
            .tool_index
            .search_relevant_tools(intent, self.deps.agent.top_k_tools, self.owner.as_deref())
            .await;
        if !ids.is_empty() {
            let specs: Vec<ToolSpec> = ids
                .iter()
                .filter_map(|id| self.deps.registry.get(id))
                .map(|d| d.to_spec())
                .collect();
            if !specs.is_empty() {
                return specs;
            }
        }
        self.deps.registry.active().iter().map(|d| d.to_spec()).collect()
    }

    /// §tool dispatch: built-ins first, then the registry.  Always a
    /// string; `[ToolError] …` on any failure.
    async fn execute_tool(&mut self, call: &ToolCallPayload) -> String {
        let name = call.function.name.as_str();
        debug!(session_id = %self.session_id, tool = name, "executing tool call");
        match name {
            RECALL_MEMORY => self.builtin_recall(&call.function.arguments).await,
            STORE_MEMORY => self.builtin_store(&call.function.arguments).await,
            _ => self.deps.registry.invoke(name, &call.function.arguments).await,
        }
    }

    async fn builtin_recall(&self, arguments: &str) -> String {
        let args: Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(e) => return format!("[ToolError] invalid arguments: {e}"),
        };
        let Some(query) = args.get("query").and_then(Value::as_str) else {
            return "[ToolError] recall_memory requires a query".to_string();
        };
        let top_k = args.get("top_k").and_then(Value::as_i64).unwrap_or(10).clamp(1, 20) as usize;

        let owner = self.owner.as_deref();
        let recalled = match self.deps.memory.recall(query, top_k, owner).await {
            Ok(items) => items,
            Err(e) => return format!("[ToolError] {e}"),
        };
        // Thresholded recall can come back dry for a fuzzy query; fall back
        // to the broader browse search before giving up.
        let items = if recalled.is_empty() {
            match self.deps.memory.search(query, top_k, owner).await {
                Ok(items) => items,
                Err(e) => return format!("[ToolError] {e}"),
            }
        } else {
            recalled
        };
        if items.is_empty() {
            "No relevant memories found.".to_string()
        } else {
            MemoryService::format_for_prompt(&items)
        }
    }

    async fn builtin_store(&mut self, arguments: &str) -> String {
        let args: Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(e) => return format!("[ToolError] invalid arguments: {e}"),
        };
        let Some(content) = args.get("content").and_then(Value::as_str) else {
            return "[ToolError] store_memory requires content".to_string();
        };
        let memory_type = args
            .get("memory_type")
            .and_then(Value::as_str)
            .map(MemoryType::parse_or_default)
            .unwrap_or(MemoryType::Semantic);
        let importance = args.get("importance").and_then(Value::as_f64).unwrap_or(0.8) as f32;

        let normalized = normalize_memory(content);
        if self.stored_contents.contains(&normalized) {
            return "Memory already stored previously; skipping duplicate.".to_string();
        }
        let prefix: String =
            normalized.chars().take(self.deps.agent.store_memory_prefix_len).collect();
        if !prefix.is_empty() && self.stored_prefixes.contains(&prefix) {
            return "Already stored similar content.".to_string();
        }

        match self
            .deps
            .memory
            .remember(
                &self.session_id,
                content.trim(),
                memory_type,
                importance,
                self.owner.as_deref(),
            )
            .await
        {
            Ok(_) => {
                self.stored_contents.insert(normalized);
                self.stored_prefixes.insert(prefix);
                "Memory stored successfully.".to_string()
            }
            Err(e) => format!("[ToolError] {e}"),
        }
    }

    /// Substantial non-builtin tool output becomes an episodic memory so a
    /// later session can recall what the tools found.
    async fn auto_store_result(&self, tool_name: &str, output: &str) {
        if tool_name == RECALL_MEMORY || tool_name == STORE_MEMORY {
            return;
        }
        if output.len() < AUTO_STORE_MIN_LEN
            || output.starts_with("[ToolError]")
            || output.starts_with("[Stub]")
        {
            return;
        }
        let note = format!("{tool_name}: {output}");
        if let Err(e) = self
            .deps
            .memory
            .remember(&self.session_id, &note, MemoryType::Episodic, 0.6, self.owner.as_deref())
            .await
        {
            warn!(session_id = %self.session_id, error = %e,
                  "episodic tool-result memory not stored");
        }
    }
}

/// Dedup normalization: trim, collapse whitespace runs, lowercase.
fn normalize_memory(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn clip_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_memory("  User  Likes\tRust \n"), "user likes rust");
        assert_eq!(normalize_memory("用户是 Java 开发者"), "用户是 java 开发者");
    }

    #[test]
    fn normalize_equates_surrounding_whitespace() {
        assert_eq!(normalize_memory("用户是 Java 开发者"), normalize_memory("  用户是 Java 开发者  "));
    }

    #[test]
    fn clip_chars_respects_char_boundaries() {
        assert_eq!(clip_chars("abcdef", 3), "abc");
        assert_eq!(clip_chars("日本語テキスト", 3), "日本語");
        assert_eq!(clip_chars("short", 100), "short");
    }
}
