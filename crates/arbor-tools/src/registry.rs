// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The tool catalog and its invocation seam.
//!
//! Tool execution never throws across the agent-loop boundary: every
//! failure — unknown tool, missing handler, handler panic-equivalent —
//! comes back as a `[ToolError] …` string that the model consumes as an
//! ordinary tool result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::descriptor::{builtin_descriptors, ToolDescriptor, ToolKind};

/// A registered in-process handler, resolved by a descriptor's entry point.
#[async_trait]
pub trait NativeTool: Send + Sync {
    async fn invoke(&self, arguments: &str) -> anyhow::Result<String>;
}

/// Executes python/node/shell tool payloads in whatever sandbox the host
/// provides.  The registry guarantees the arguments JSON string reaches the
/// runner verbatim.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, descriptor: &ToolDescriptor, arguments: &str) -> anyhow::Result<String>;
}

pub struct ToolRegistry {
    stored: Mutex<HashMap<String, ToolDescriptor>>,
    natives: Mutex<HashMap<String, Arc<dyn NativeTool>>>,
    script_runner: Mutex<Option<Arc<dyn ScriptRunner>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            stored: Mutex::new(HashMap::new()),
            natives: Mutex::new(HashMap::new()),
            script_runner: Mutex::new(None),
        }
    }

    /// Add or replace a stored descriptor.  Built-in names cannot be
    /// shadowed; they are injected on every read.
    pub fn register(&self, descriptor: ToolDescriptor) {
        self.stored.lock().unwrap().insert(descriptor.name.clone(), descriptor);
    }

    pub fn deactivate(&self, name: &str) {
        if let Some(d) = self.stored.lock().unwrap().get_mut(name) {
            d.active = false;
        }
    }

    /// Register an in-process handler under an entry-point key.
    pub fn register_native(&self, entry_point: impl Into<String>, handler: Arc<dyn NativeTool>) {
        self.natives.lock().unwrap().insert(entry_point.into(), handler);
    }

    pub fn set_script_runner(&self, runner: Arc<dyn ScriptRunner>) {
        *self.script_runner.lock().unwrap() = Some(runner);
    }

    /// Look up by name; built-ins win over stored descriptors.
    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        builtin_descriptors()
            .into_iter()
            .find(|d| d.name == name)
            .or_else(|| self.stored.lock().unwrap().get(name).cloned())
    }

    /// Built-ins plus every active stored descriptor, name-sorted.
    pub fn active(&self) -> Vec<ToolDescriptor> {
        let mut out = builtin_descriptors();
        out.extend(self.stored.lock().unwrap().values().filter(|d| d.active).cloned());
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// §tool dispatch for everything except the two memory built-ins (those
    /// need session state and live in the agent loop).  Always returns a
    /// string; failures are `[ToolError] …` strings.
    pub async fn invoke(&self, name: &str, arguments: &str) -> String {
        let Some(descriptor) = self.get(name) else {
            return format!("[ToolError] Unknown tool: {name}");
        };
        debug!(tool = name, kind = ?descriptor.kind, "dispatching tool call");
        match descriptor.kind {
            ToolKind::Native => {
                let Some(entry) = descriptor.entry_point.clone() else {
                    return format!("[ToolError] Tool {name} has no entry point");
                };
                let handler = self.natives.lock().unwrap().get(&entry).cloned();
                match handler {
                    Some(handler) => match handler.invoke(arguments).await {
                        Ok(output) => output,
                        Err(e) => format!("[ToolError] {e}"),
                    },
                    None => format!("[ToolError] No handler registered for {entry}"),
                }
            }
            ToolKind::Python | ToolKind::Node | ToolKind::Shell => {
                let runner = self.script_runner.lock().unwrap().clone();
                match runner {
                    Some(runner) => match runner.run(&descriptor, arguments).await {
                        Ok(output) => output,
                        Err(e) => format!("[ToolError] {e}"),
                    },
                    None => format!("[ToolError] No script runner configured for {name}"),
                }
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
