// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod events;
mod prompts;
mod publisher;
mod runtime;

pub use agent::AgentLoop;
pub use events::{AgentEvent, AgentEventKind, PLAN_STEPS};
pub use prompts::base_system_prompt;
pub use publisher::EventPublisher;
pub use runtime::{CommandError, Runtime, RuntimeDeps};
