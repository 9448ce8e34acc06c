// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use arbor_store::now_ms;

/// The fixed user-visible plan framing every session.
pub const PLAN_STEPS: [&str; 3] = ["recall", "think-and-act", "answer"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentEventKind {
    PlanReady,
    StepStart,
    StepComplete,
    IterationStart,
    Thinking,
    ToolCall,
    ToolResult,
    FinalAnswer,
    StatusChange,
    Error,
}

/// One frame on a session's event topic.  Serializes as a flat JSON object
/// so subscribers can render it without schema negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: AgentEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub iteration: u32,
    pub timestamp_ms: i64,
}

impl AgentEvent {
    pub fn new(session_id: impl Into<String>, kind: AgentEventKind) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            content: None,
            payload: None,
            iteration: 0,
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn at_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn plan_ready(session_id: &str) -> Self {
        Self::new(session_id, AgentEventKind::PlanReady)
            .with_payload(serde_json::json!(PLAN_STEPS))
    }

    pub fn step_start(session_id: &str, index: usize) -> Self {
        Self::new(session_id, AgentEventKind::StepStart).with_payload(serde_json::json!({
            "index": index,
            "title": PLAN_STEPS[index - 1],
        }))
    }

    pub fn step_complete(session_id: &str, index: usize, summary: Option<&str>) -> Self {
        let mut payload = serde_json::json!({
            "index": index,
            "title": PLAN_STEPS[index - 1],
        });
        if let Some(s) = summary {
            payload["summary"] = serde_json::json!(s);
        }
        Self::new(session_id, AgentEventKind::StepComplete).with_payload(payload)
    }

    pub fn status_change(session_id: &str, status: arbor_store::SessionStatus) -> Self {
        Self::new(session_id, AgentEventKind::StatusChange).with_content(status.as_str())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_ready_lists_the_three_steps() {
        let e = AgentEvent::plan_ready("s1");
        assert_eq!(e.kind, AgentEventKind::PlanReady);
        assert_eq!(e.payload.unwrap(), serde_json::json!(["recall", "think-and-act", "answer"]));
    }

    #[test]
    fn step_events_carry_index_and_title() {
        let start = AgentEvent::step_start("s1", 2);
        assert_eq!(start.payload.as_ref().unwrap()["index"], 2);
        assert_eq!(start.payload.as_ref().unwrap()["title"], "think-and-act");

        let done = AgentEvent::step_complete("s1", 2, Some("完成推理"));
        assert_eq!(done.payload.as_ref().unwrap()["summary"], "完成推理");

        let no_summary = AgentEvent::step_complete("s1", 1, None);
        assert!(no_summary.payload.as_ref().unwrap().get("summary").is_none());
    }

    #[test]
    fn serializes_with_type_tag_and_skips_absent_fields() {
        let e = AgentEvent::new("s1", AgentEventKind::Thinking)
            .with_content("chunk")
            .at_iteration(3);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "THINKING");
        assert_eq!(json["content"], "chunk");
        assert_eq!(json["iteration"], 3);
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn status_change_carries_status_string() {
        let e = AgentEvent::status_change("s1", arbor_store::SessionStatus::Completed);
        assert_eq!(e.content.as_deref(), Some("COMPLETED"));
    }
}
