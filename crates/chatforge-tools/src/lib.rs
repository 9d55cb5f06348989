// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod registry;
pub mod tool;

pub use builtin::get_time::GetTimeTool;
pub use builtin::journal::{JournalEntry, JournalStore, JournalTool};
pub use builtin::web_fetch::{FetchCache, WebFetchTool};
pub use builtin::web_search::{TavilySearchTool, WebSearchTool};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{ApiKeyStatus, Tool, ToolCall, ToolContext, ToolOutput};
