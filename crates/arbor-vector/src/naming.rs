// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Collection naming: one collection per (embedding model, dimension).

/// Lower-case the model name and collapse every non-alphanumeric run into a
/// single `_`, trimming leading/trailing underscores.
pub fn sanitize_model_name(model: &str) -> String {
    let mut out = String::with_capacity(model.len());
    let mut last_was_sep = false;
    for ch in model.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

pub fn memory_collection_name(model: &str, dim: usize) -> String {
    format!("memories_{}_{}", sanitize_model_name(model), dim)
}

pub fn tool_index_collection_name(dim: usize) -> String {
    format!("agent_tools_index_{dim}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
