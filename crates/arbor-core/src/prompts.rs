// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The canonical base system prompt seeding every fresh session context.

/// Instructions the agent starts from.  Memory discipline matters here:
/// facts must be stored once, in explicit third-person form, so that later
/// recalls are unambiguous about who "I" was.
pub fn base_system_prompt() -> String {
    "You are an autonomous agent that completes tasks on the user's behalf. \
     You have access to tools, including two memory tools: recall_memory and \
     store_memory.\n\
     \n\
     Memory usage rules:\n\
     - When the question could be answered from previously stored facts, call \
     recall_memory before answering.\n\
     - Use store_memory only for stable, long-term facts worth keeping across \
     sessions. Store each distinct fact at most once.\n\
     - Always rewrite stored facts in explicit third-person form (\"the \
     user...\" / \"the assistant...\") so they stay unambiguous when recalled \
     later. Never store first-person phrasing.\n\
     \n\
     When you can answer the question, answer it directly without further \
     tool calls."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_names_both_memory_tools() {
        let p = base_system_prompt();
        assert!(p.contains("recall_memory"));
        assert!(p.contains("store_memory"));
    }

    #[test]
    fn prompt_demands_third_person_storage() {
        let p = base_system_prompt();
        assert!(p.contains("third-person"));
        assert!(p.contains("the user"));
    }
}
