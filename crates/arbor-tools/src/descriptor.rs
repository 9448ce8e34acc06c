// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::json;

use arbor_model::ToolSpec;

pub const RECALL_MEMORY: &str = "recall_memory";
pub const STORE_MEMORY: &str = "store_memory";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Native,
    Python,
    Node,
    Shell,
}

/// A catalog entry describing one callable tool.
///
/// The parameter schema is a JSON Schema object stored verbatim and sent to
/// the model unmodified.  Script kinds carry their payload; native kinds
/// resolve a registered handler through `entry_point`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub kind: ToolKind,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    pub active: bool,
}

impl ToolDescriptor {
    pub fn native(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        entry_point: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            kind: ToolKind::Native,
            script: None,
            entry_point: Some(entry_point.into()),
            active: true,
        }
    }

    /// Schema shape offered to the model.
    pub fn to_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    /// The text embedded into the tool index for retrieval by intent.
    pub fn index_text(&self) -> String {
        format!("{}\n{}\n{}", self.name, self.description, self.parameters)
    }
}

/// The two built-in memory tools, always present and never stored.
pub fn builtin_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: RECALL_MEMORY.into(),
            description: "Semantically search the agent's long-term memory for facts \
                          relevant to a natural-language query."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "top_k": { "type": "integer", "minimum": 1, "maximum": 20 }
                },
                "required": ["query"]
            }),
            kind: ToolKind::Native,
            script: None,
            entry_point: None,
            active: true,
        },
        ToolDescriptor {
            name: STORE_MEMORY.into(),
            description: "Persist a stable long-term fact into the agent's memory."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": { "type": "string" },
                    "memory_type": {
                        "type": "string",
                        "enum": ["EPISODIC", "SEMANTIC", "PROCEDURAL"]
                    },
                    "importance": { "type": "number", "minimum": 0, "maximum": 1 }
                },
                "required": ["content"]
            }),
            kind: ToolKind::Native,
            script: None,
            entry_point: None,
            active: true,
        },
    ]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
