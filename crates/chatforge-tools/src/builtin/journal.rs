// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-user persistent journal.
//!
//! Storage is injected through [`JournalStore`] so this crate stays
//! independent from the persistence crate; the database implements the trait
//! and the server wires it in at startup.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

/// One stored journal entry.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub id: i64,
    pub created_at: String,
    pub text: String,
}

/// Persistence interface for the journal tool.
#[async_trait]
pub trait JournalStore: Send + Sync {
    async fn append(&self, user_id: &str, text: &str) -> anyhow::Result<i64>;
    async fn list(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<JournalEntry>>;
    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<JournalEntry>>;
}

pub struct JournalTool {
    pub store: std::sync::Arc<dyn JournalStore>,
}

#[async_trait]
impl Tool for JournalTool {
    fn name(&self) -> &str {
        "journal"
    }

    fn description(&self) -> &str {
        "Persistent per-user journal. action=append stores a note, \
         action=list returns recent entries, action=search finds entries \
         containing the query text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["append", "list", "search"],
                    "description": "Operation to perform"
                },
                "text": {
                    "type": "string",
                    "description": "Note text (append) or search query (search)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum entries to return (default 20)"
                }
            },
            "required": ["action"],
            "additionalProperties": false
        })
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        crate::tool::validate_required(&self.parameters_schema(), args)?;
        let action = args["action"].as_str().unwrap_or("");
        match action {
            "append" | "search" => {
                if args.get("text").and_then(|v| v.as_str()).is_none() {
                    return Err(format!("action '{action}' requires 'text'"));
                }
                Ok(())
            }
            "list" => Ok(()),
            other => Err(format!("unknown action '{other}'")),
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let action = call.args["action"].as_str().unwrap_or("");
        let limit = call
            .args
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(20)
            .clamp(1, 100) as usize;

        let result = match action {
            "append" => {
                let text = call.args["text"].as_str().unwrap_or("");
                self.store
                    .append(&ctx.user_id, text)
                    .await
                    .map(|id| json!({ "appended": id }).to_string())
            }
            "list" => self
                .store
                .list(&ctx.user_id, limit)
                .await
                .map(|entries| render_entries(&entries)),
            "search" => {
                let query = call.args["text"].as_str().unwrap_or("");
                self.store
                    .search(&ctx.user_id, query, limit)
                    .await
                    .map(|entries| render_entries(&entries))
            }
            other => Err(anyhow::anyhow!("unknown action '{other}'")),
        };

        match result {
            Ok(content) => ToolOutput::ok(&call.id, content),
            Err(e) => ToolOutput::err(&call.id, format!("journal error: {e}")),
        }
    }
}

fn render_entries(entries: &[JournalEntry]) -> String {
    if entries.is_empty() {
        return "(no entries)".to_string();
    }
    entries
        .iter()
        .map(|e| format!("[{}] {}: {}", e.id, e.created_at, e.text))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct MemStore {
        entries: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl JournalStore for MemStore {
        async fn append(&self, user_id: &str, text: &str) -> anyhow::Result<i64> {
            let mut entries = self.entries.lock().unwrap();
            entries.push((user_id.to_string(), text.to_string()));
            Ok(entries.len() as i64)
        }

        async fn list(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<JournalEntry>> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .enumerate()
                .filter(|(_, (u, _))| u == user_id)
                .take(limit)
                .map(|(i, (_, t))| JournalEntry {
                    id: i as i64 + 1,
                    created_at: "2026-01-01T00:00:00Z".into(),
                    text: t.clone(),
                })
                .collect())
        }

        async fn search(
            &self,
            user_id: &str,
            query: &str,
            limit: usize,
        ) -> anyhow::Result<Vec<JournalEntry>> {
            Ok(self
                .list(user_id, usize::MAX)
                .await?
                .into_iter()
                .filter(|e| e.text.contains(query))
                .take(limit)
                .collect())
        }
    }

    fn tool() -> JournalTool {
        JournalTool { store: Arc::new(MemStore::default()) }
    }

    fn call(args: Value) -> ToolCall {
        ToolCall { id: "j1".into(), name: "journal".into(), args }
    }

    #[test]
    fn validate_append_requires_text() {
        let t = tool();
        assert!(t.validate(&json!({ "action": "append" })).is_err());
        assert!(t.validate(&json!({ "action": "append", "text": "x" })).is_ok());
        assert!(t.validate(&json!({ "action": "list" })).is_ok());
        assert!(t.validate(&json!({ "action": "frobnicate" })).is_err());
    }

    #[tokio::test]
    async fn append_then_list_round_trip() {
        let t = tool();
        let ctx = ToolContext::detached("u1");
        let out = t
            .execute(&call(json!({ "action": "append", "text": "note one" })), &ctx)
            .await;
        assert!(!out.is_error, "{}", out.content);

        let out = t.execute(&call(json!({ "action": "list" })), &ctx).await;
        assert!(out.content.contains("note one"));
    }

    #[tokio::test]
    async fn entries_are_scoped_per_user() {
        let t = tool();
        let ctx_a = ToolContext::detached("alice");
        let ctx_b = ToolContext::detached("bob");
        t.execute(&call(json!({ "action": "append", "text": "secret" })), &ctx_a)
            .await;
        let out = t.execute(&call(json!({ "action": "list" })), &ctx_b).await;
        assert_eq!(out.content, "(no entries)");
    }

    #[tokio::test]
    async fn search_filters_entries() {
        let t = tool();
        let ctx = ToolContext::detached("u1");
        t.execute(&call(json!({ "action": "append", "text": "alpha note" })), &ctx)
            .await;
        t.execute(&call(json!({ "action": "append", "text": "beta note" })), &ctx)
            .await;
        let out = t
            .execute(&call(json!({ "action": "search", "text": "alpha" })), &ctx)
            .await;
        assert!(out.content.contains("alpha note"));
        assert!(!out.content.contains("beta note"));
    }
}
