// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod context;
mod keys;
mod session;
mod store;

pub use context::{trim_messages, ContextStore};
pub use keys::{
    ApiKeyRecord, ApiKeyStore, FileApiKeyStore, KeyPurpose, KeyResolver, MemoryApiKeyStore,
};
pub use session::{now_ms, validate_session_id, Session, SessionStatus};
pub use store::{
    save_with_retry, FileSessionStore, MemorySessionStore, SessionStore, StoreError,
};
