// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod filter;
mod memory_store;
mod milvus;
mod naming;
mod store;

pub use filter::Filter;
pub use memory_store::MemoryVectorStore;
pub use milvus::MilvusStore;
pub use naming::{memory_collection_name, sanitize_model_name, tool_index_collection_name};
pub use store::{MemoryRow, SearchHit, StoredMemory, ToolHit, ToolRow, VectorError, VectorStore};
