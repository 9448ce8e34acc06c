// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-style chat completion client: one-shot and SSE streaming calls
//! against a single configured endpoint.
//!
//! The streaming path reassembles the response from line-delimited SSE
//! frames so that callers receive the exact shape a non-streaming call
//! would have produced, including tool calls whose JSON arguments arrive
//! fragmented across many deltas.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use arbor_config::ProviderSettings;

use crate::{
    backend::{ChatBackend, TokenSink},
    ChatRequest, ChatResponse, Message, ModelError, Role,
};

/// Chat client for one OpenAI-compatible endpoint.
pub struct ChatClient {
    settings: ProviderSettings,
    chat_url: String,
    client: reqwest::Client,
}

impl ChatClient {
    pub fn new(settings: ProviderSettings) -> Self {
        let base = settings.base_url.trim_end_matches('/');
        let chat_url = format!("{base}/chat/completions");
        Self { settings, chat_url, client: reqwest::Client::new() }
    }

    /// Provider label this client was configured with.
    pub fn provider(&self) -> &str {
        &self.settings.name
    }

    /// Model substituted into requests that carry none.
    pub fn default_model(&self) -> &str {
        &self.settings.model
    }

    fn timeout(&self, streaming: bool) -> Duration {
        let secs = self.settings.timeout_seconds.max(1);
        // A stream stays open for the whole completion; give it twice the
        // single-shot budget.
        if streaming { Duration::from_secs(secs * 2) } else { Duration::from_secs(secs) }
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let model = req.model.clone().unwrap_or_else(|| self.settings.model.clone());

        // Strict tool-history validators reject role=tool messages that they
        // did not hand out themselves; filter them before transmission.
        let messages: Vec<&Message> = if strict_tool_history(&self.settings.name) {
            req.messages.iter().filter(|m| m.role != Role::Tool).collect()
        } else {
            req.messages.iter().collect()
        };

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(choice) = req.tool_choice {
            body["tool_choice"] = json!(choice);
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = req.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }

    async fn post(&self, body: &Value, streaming: bool) -> Result<reqwest::Response, ModelError> {
        let mut http_req =
            self.client.post(&self.chat_url).json(body).timeout(self.timeout(streaming));
        if let Some(key) = &self.settings.api_key {
            http_req = http_req.bearer_auth(key);
        }
        let resp = http_req.send().await.map_err(ModelError::transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status.as_u16(), &text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatBackend for ChatClient {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ModelError> {
        let body = self.build_body(&req, false);
        debug!(
            provider = %self.settings.name,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "sending completion request"
        );
        let resp = self.post(&body, false).await?;
        let text = resp.text().await.map_err(ModelError::transport)?;
        serde_json::from_str(&text).map_err(|e| ModelError::Protocol(e.to_string()))
    }

    async fn stream_chat(
        &self,
        req: ChatRequest,
        on_token: TokenSink<'_>,
    ) -> Result<ChatResponse, ModelError> {
        let body = self.build_body(&req, true);
        debug!(
            provider = %self.settings.name,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "opening completion stream"
        );
        let resp = self.post(&body, true).await?;

        let mut assembler = ResponseAssembler::default();
        let mut byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets.  Maintain a line buffer
        // across chunks; emit frames only for complete lines.
        let mut buf = String::new();
        'outer: while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk.map_err(ModelError::transport)?;
            buf.push_str(&String::from_utf8_lossy(&bytes));
            for frame in drain_complete_sse_lines(&mut buf) {
                match frame {
                    SseFrame::Done => break 'outer,
                    SseFrame::Chunk(chunk) => {
                        if let Some(delta) = assembler.apply(chunk) {
                            on_token(&delta);
                        }
                    }
                }
            }
        }
        Ok(assembler.finish())
    }
}

/// Whether this provider rejects conversations containing role=tool messages
/// it did not itself produce.
fn strict_tool_history(provider: &str) -> bool {
    provider.to_ascii_lowercase().contains("gemini")
}

/// [`crate::ChatFactory`] that builds real HTTP clients.
#[derive(Default)]
pub struct HttpChatFactory;

impl crate::backend::ChatFactory for HttpChatFactory {
    fn backend_for(
        &self,
        settings: &ProviderSettings,
    ) -> std::sync::Arc<dyn crate::backend::ChatBackend> {
        std::sync::Arc::new(ChatClient::new(settings.clone()))
    }
}

// ─── SSE framing ──────────────────────────────────────────────────────────────

pub(crate) enum SseFrame {
    Chunk(StreamChunk),
    Done,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    #[allow(dead_code)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    call_type: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Parse a single complete SSE `data:` line.
///
/// Returns `None` for empty lines, comment lines, and unparseable data —
/// the stream carries keep-alives and vendor extensions that must not kill
/// an otherwise healthy completion.
fn parse_sse_data_line(line: &str) -> Option<SseFrame> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseFrame::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(data).ok()?;
    Some(SseFrame::Chunk(chunk))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        // Strip the optional Windows-style \r before \n.
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(frame) = parse_sse_data_line(&line) {
            frames.push(frame);
        }
    }
    frames
}

// ─── Response assembly ────────────────────────────────────────────────────────

/// Accumulates streamed deltas into a complete [`ChatResponse`].
///
/// Tool-call deltas are grouped by their `index` field: the first delta for
/// an index establishes id and type, later deltas append argument
/// fragments.  The function name is set on first occurrence.
#[derive(Default)]
pub(crate) struct ResponseAssembler {
    id: String,
    model: String,
    content: String,
    finish_reason: Option<String>,
    calls: BTreeMap<u32, ToolCallAccumulator>,
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    call_type: String,
    name: String,
    arguments: String,
}

impl ResponseAssembler {
    /// Fold one chunk in; returns the content delta to forward, if any.
    pub(crate) fn apply(&mut self, chunk: StreamChunk) -> Option<String> {
        if let Some(id) = chunk.id {
            if self.id.is_empty() {
                self.id = id;
            }
        }
        if let Some(model) = chunk.model {
            if self.model.is_empty() {
                self.model = model;
            }
        }

        let choice = chunk.choices.into_iter().next()?;
        if let Some(reason) = choice.finish_reason {
            // The last frame's finish_reason wins.
            self.finish_reason = Some(reason);
        }

        if let Some(deltas) = choice.delta.tool_calls {
            for tc in deltas {
                let acc = self.calls.entry(tc.index).or_default();
                if acc.id.is_empty() {
                    if let Some(id) = tc.id {
                        acc.id = id;
                    }
                }
                if acc.call_type.is_empty() {
                    if let Some(t) = tc.call_type {
                        acc.call_type = t;
                    }
                }
                if let Some(f) = tc.function {
                    if acc.name.is_empty() {
                        if let Some(name) = f.name {
                            acc.name = name;
                        }
                    }
                    if let Some(args) = f.arguments {
                        acc.arguments.push_str(&args);
                    }
                }
            }
        }

        match choice.delta.content {
            Some(text) if !text.is_empty() => {
                self.content.push_str(&text);
                Some(text)
            }
            _ => None,
        }
    }

    pub(crate) fn finish(self) -> ChatResponse {
        let message = if self.calls.is_empty() {
            Message {
                role: Role::Assistant,
                content: if self.content.is_empty() { None } else { Some(self.content) },
                tool_calls: None,
                tool_call_id: None,
            }
        } else {
            // BTreeMap iteration yields ascending index order.
            let calls = self
                .calls
                .into_values()
                .map(|acc| crate::ToolCallPayload {
                    id: acc.id,
                    call_type: if acc.call_type.is_empty() {
                        "function".into()
                    } else {
                        acc.call_type
                    },
                    function: crate::FunctionCallPayload {
                        name: acc.name,
                        arguments: acc.arguments,
                    },
                })
                .collect();
            Message {
                role: Role::Assistant,
                content: if self.content.is_empty() { None } else { Some(self.content) },
                tool_calls: Some(calls),
                tool_call_id: None,
            }
        };
        ChatResponse {
            id: self.id,
            model: self.model,
            choices: vec![crate::Choice { finish_reason: self.finish_reason, message }],
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ToolChoice, ToolSpec};

    fn make_client() -> ChatClient {
        ChatClient::new(ProviderSettings {
            name: "test-compat".into(),
            base_url: "http://localhost:9999/v1".into(),
            api_key: None,
            model: "test-model".into(),
            timeout_seconds: 60,
        })
    }

    fn chunk(data: &str) -> StreamChunk {
        serde_json::from_str(data).unwrap()
    }

    // ── Construction / request building ──────────────────────────────────────

    #[test]
    fn chat_url_appends_path() {
        let c = make_client();
        assert_eq!(c.chat_url, "http://localhost:9999/v1/chat/completions");
    }

    #[test]
    fn base_url_trailing_slash_stripped() {
        let c = ChatClient::new(ProviderSettings {
            base_url: "http://localhost:1234/v1/".into(),
            ..ProviderSettings::default()
        });
        assert_eq!(c.chat_url, "http://localhost:1234/v1/chat/completions");
    }

    #[test]
    fn missing_model_uses_configured_default() {
        let c = make_client();
        let body = c.build_body(&ChatRequest::new(vec![Message::user("hi")]), false);
        assert_eq!(body["model"], "test-model");
    }

    #[test]
    fn explicit_model_wins_over_default() {
        let c = make_client();
        let req = ChatRequest::new(vec![Message::user("hi")]).with_model("other");
        assert_eq!(c.build_body(&req, false)["model"], "other");
    }

    #[test]
    fn tools_and_tool_choice_serialized() {
        let c = make_client();
        let mut req = ChatRequest::new(vec![Message::user("hi")]);
        req.tools = vec![ToolSpec {
            name: "recall_memory".into(),
            description: "look up".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        req.tool_choice = Some(ToolChoice::Auto);
        let body = c.build_body(&req, true);
        assert_eq!(body["tools"][0]["function"]["name"], "recall_memory");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn empty_tools_omitted_from_body() {
        let c = make_client();
        let body = c.build_body(&ChatRequest::new(vec![Message::user("hi")]), false);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn strict_provider_filters_tool_messages() {
        let c = ChatClient::new(ProviderSettings {
            name: "gemini".into(),
            model: "m".into(),
            ..ProviderSettings::default()
        });
        let req = ChatRequest::new(vec![
            Message::system("sys"),
            Message::user("q"),
            Message::tool_result("c1", "out"),
        ]);
        let body = c.build_body(&req, false);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| m["role"] != "tool"));
    }

    #[test]
    fn lenient_provider_keeps_tool_messages() {
        let c = make_client();
        let req = ChatRequest::new(vec![Message::user("q"), Message::tool_result("c1", "out")]);
        let body = c.build_body(&req, false);
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn stream_timeout_doubles_configured_seconds() {
        let c = make_client();
        assert_eq!(c.timeout(false), Duration::from_secs(60));
        assert_eq!(c.timeout(true), Duration::from_secs(120));
    }

    // ── SSE line buffer ──────────────────────────────────────────────────────

    #[test]
    fn drain_handles_single_complete_line() {
        let mut buf =
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n".to_string();
        let frames = drain_complete_sse_lines(&mut buf);
        assert_eq!(frames.len(), 1);
        assert!(buf.is_empty(), "buffer should be drained");
    }

    #[test]
    fn drain_retains_incomplete_last_line() {
        let partial = "data: {\"choices\":[{\"delta\":{\"content\":\"hel";
        let mut buf = partial.to_string();
        let frames = drain_complete_sse_lines(&mut buf);
        assert!(frames.is_empty(), "no complete line yet");
        assert_eq!(buf, partial, "partial line must stay in buffer");
    }

    #[test]
    fn event_split_across_two_chunks_is_parsed() {
        let full_line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"recall_memory","arguments":""}}]}}]}"#;
        let split = full_line.len() / 2;

        let mut buf = String::new();
        buf.push_str(&full_line[..split]);
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
        assert!(!buf.is_empty(), "buffer must hold the partial line");

        buf.push_str(&full_line[split..]);
        buf.push('\n');
        let frames = drain_complete_sse_lines(&mut buf);
        assert_eq!(frames.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let mut buf = ": keep-alive\n\nevent: ping\n".to_string();
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
    }

    #[test]
    fn done_sentinel_is_recognized() {
        let mut buf = "data: [DONE]\n".to_string();
        let frames = drain_complete_sse_lines(&mut buf);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], SseFrame::Done));
    }

    #[test]
    fn windows_crlf_line_endings_are_handled() {
        let mut buf =
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\r\n".to_string();
        let frames = drain_complete_sse_lines(&mut buf);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], SseFrame::Chunk(_)));
    }

    // ── Assembly ─────────────────────────────────────────────────────────────

    #[test]
    fn content_deltas_append_and_forward() {
        let mut asm = ResponseAssembler::default();
        let d1 = asm.apply(chunk(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#));
        let d2 = asm.apply(chunk(r#"{"choices":[{"delta":{"content":"lo"}}]}"#));
        assert_eq!(d1.as_deref(), Some("Hel"));
        assert_eq!(d2.as_deref(), Some("lo"));
        let resp = asm.finish();
        assert_eq!(resp.message().unwrap().text(), Some("Hello"));
    }

    #[test]
    fn empty_content_delta_is_not_forwarded() {
        let mut asm = ResponseAssembler::default();
        assert!(asm.apply(chunk(r#"{"choices":[{"delta":{"content":""}}]}"#)).is_none());
        assert!(asm.apply(chunk(r#"{"choices":[{"delta":{}}]}"#)).is_none());
    }

    #[test]
    fn empty_stream_yields_null_content() {
        let asm = ResponseAssembler::default();
        let resp = asm.finish();
        let msg = resp.message().unwrap();
        assert!(msg.content.is_none());
        assert!(msg.tool_calls.is_none());
    }

    /// The fragmented tool-call sequence a provider actually emits: id and
    /// name arrive in the first delta, the JSON arguments split across the
    /// following deltas, then finish_reason=tool_calls.
    #[test]
    fn fragmented_tool_call_reassembles() {
        let mut asm = ResponseAssembler::default();
        asm.apply(chunk(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","type":"function","function":{"name":"store_memory"}}]}}]}"#,
        ));
        asm.apply(chunk(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"cont"}}]}}]}"#,
        ));
        asm.apply(chunk(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ent\":\"x\"}"}}]}}]}"#,
        ));
        asm.apply(chunk(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#));

        let resp = asm.finish();
        assert_eq!(resp.finish_reason(), Some("tool_calls"));
        let calls = resp.message().unwrap().tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].call_type, "function");
        assert_eq!(calls[0].function.name, "store_memory");
        assert_eq!(calls[0].function.arguments, r#"{"content":"x"}"#);
    }

    #[test]
    fn parallel_tool_calls_ordered_by_index() {
        let mut asm = ResponseAssembler::default();
        // Index 1 arrives before index 0; the assembled list must still be
        // in ascending index order.
        asm.apply(chunk(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"c1","function":{"name":"second","arguments":"{}"}}]}}]}"#,
        ));
        asm.apply(chunk(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c0","function":{"name":"first","arguments":"{}"}}]}}]}"#,
        ));
        let resp = asm.finish();
        let calls = resp.message().unwrap().tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "first");
        assert_eq!(calls[1].function.name, "second");
    }

    #[test]
    fn missing_call_type_defaults_to_function() {
        let mut asm = ResponseAssembler::default();
        asm.apply(chunk(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c0","function":{"name":"f","arguments":"{}"}}]}}]}"#,
        ));
        let resp = asm.finish();
        assert_eq!(resp.message().unwrap().tool_calls.as_ref().unwrap()[0].call_type, "function");
    }

    #[test]
    fn last_finish_reason_wins() {
        let mut asm = ResponseAssembler::default();
        asm.apply(chunk(r#"{"choices":[{"delta":{"content":"x"},"finish_reason":null}]}"#));
        asm.apply(chunk(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#));
        assert_eq!(asm.finish().finish_reason(), Some("stop"));
    }

    #[test]
    fn response_id_and_model_taken_from_first_frame() {
        let mut asm = ResponseAssembler::default();
        asm.apply(chunk(
            r#"{"id":"chatcmpl-9","model":"m1","choices":[{"delta":{"content":"a"}}]}"#,
        ));
        asm.apply(chunk(
            r#"{"id":"other","model":"m2","choices":[{"delta":{"content":"b"}}]}"#,
        ));
        let resp = asm.finish();
        assert_eq!(resp.id, "chatcmpl-9");
        assert_eq!(resp.model, "m1");
    }

    #[test]
    fn content_alongside_tool_calls_is_kept() {
        let mut asm = ResponseAssembler::default();
        asm.apply(chunk(r#"{"choices":[{"delta":{"content":"Let me check."}}]}"#));
        asm.apply(chunk(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c0","function":{"name":"f","arguments":"{}"}}]}}]}"#,
        ));
        let resp = asm.finish();
        let msg = resp.message().unwrap();
        assert_eq!(msg.text(), Some("Let me check."));
        assert!(msg.has_tool_calls());
    }
}
