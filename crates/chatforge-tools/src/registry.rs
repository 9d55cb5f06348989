// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::{ApiKeyStatus, Tool, ToolCall, ToolContext, ToolOutput};

/// A tool schema in OpenAI function-spec shape.  Mirrors the model crate's
/// `ToolSpec` but keeps this crate independent from it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
///
/// Immutable after construction; shared across requests behind an `Arc`.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Register a tool.  Names must be unique and the declared parameter
    /// schema must describe a JSON object, otherwise registration fails.
    pub fn register(&mut self, tool: impl Tool + 'static) -> anyhow::Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            anyhow::bail!("duplicate tool name: {name}");
        }
        let schema = tool.parameters_schema();
        if schema["type"].as_str() != Some("object") {
            anyhow::bail!("tool '{name}' declares a non-object parameter schema");
        }
        self.tools.insert(name, Arc::new(tool));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// A tool is resolvable when it exists and its credential is configured.
    pub fn resolvable(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .map(|t| t.api_key_status().usable())
            .unwrap_or(false)
    }

    /// Produce schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Schemas restricted to the given names (unknown names skipped).
    pub fn schemas_for(&self, names: &[String]) -> Vec<ToolSchema> {
        self.schemas()
            .into_iter()
            .filter(|s| names.iter().any(|n| n == &s.name))
            .collect()
    }

    /// Credential status for every tool, keyed by name.
    pub fn api_key_status(&self) -> HashMap<String, ApiKeyStatus> {
        self.tools
            .iter()
            .map(|(name, t)| (name.clone(), t.api_key_status()))
            .collect()
    }

    /// Validate a call's arguments against the tool's declared validator.
    pub fn validate(&self, call: &ToolCall) -> Result<(), String> {
        match self.tools.get(&call.name) {
            Some(tool) => tool.validate(&call.args),
            None => Err(format!("unknown tool: {}", call.name)),
        }
    }

    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call, ctx).await,
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "required": ["text"] })
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    struct KeyedTool;

    #[async_trait]
    impl Tool for KeyedTool {
        fn name(&self) -> &str {
            "keyed"
        }
        fn description(&self) -> &str {
            "needs a key"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn api_key_status(&self) -> ApiKeyStatus {
            ApiKeyStatus::with_key(false, "KEYED_API_KEY")
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            ToolOutput::ok(&call.id, "")
        }
    }

    struct BadSchemaTool;

    #[async_trait]
    impl Tool for BadSchemaTool {
        fn name(&self) -> &str {
            "bad"
        }
        fn description(&self) -> &str {
            "declares a non-object schema"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "string" })
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            ToolOutput::ok(&call.id, "")
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" }).unwrap();
        assert!(reg.get("echo").is_some());
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" }).unwrap();
        let err = reg.register(EchoTool { name: "echo" }).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn non_object_schema_rejected() {
        let mut reg = ToolRegistry::new();
        let err = reg.register(BadSchemaTool).unwrap_err();
        assert!(err.to_string().contains("non-object"));
    }

    #[test]
    fn resolvable_requires_existing_tool_with_credential() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" }).unwrap();
        reg.register(KeyedTool).unwrap();
        assert!(reg.resolvable("echo"));
        assert!(!reg.resolvable("keyed"), "missing credential");
        assert!(!reg.resolvable("ghost"), "unknown tool");
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "zeta" }).unwrap();
        reg.register(EchoTool { name: "alpha" }).unwrap();
        let schemas = reg.schemas();
        let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn schemas_for_skips_unknown_names() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" }).unwrap();
        let schemas = reg.schemas_for(&["echo".into(), "ghost".into()]);
        assert_eq!(schemas.len(), 1);
    }

    #[test]
    fn api_key_status_map_includes_all_tools() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" }).unwrap();
        reg.register(KeyedTool).unwrap();
        let statuses = reg.api_key_status();
        assert!(statuses["echo"].usable());
        assert_eq!(
            statuses["keyed"].missing_key_label.as_deref(),
            Some("KEYED_API_KEY")
        );
    }

    #[test]
    fn validate_routes_to_tool_validator() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" }).unwrap();
        let bad = ToolCall { id: "1".into(), name: "echo".into(), args: json!({}) };
        assert!(reg.validate(&bad).is_err());
        let good = ToolCall { id: "1".into(), name: "echo".into(), args: json!({"text": "x"}) };
        assert!(reg.validate(&good).is_ok());
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_error_output() {
        let reg = ToolRegistry::new();
        let call = ToolCall { id: "x".into(), name: "missing".into(), args: json!({}) };
        let out = reg.execute(&call, &ToolContext::detached("u1")).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn execute_known_tool_succeeds() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" }).unwrap();
        let call = ToolCall { id: "1".into(), name: "echo".into(), args: json!({"text":"hi"}) };
        let out = reg.execute(&call, &ToolContext::detached("u1")).await;
        assert!(!out.is_error);
        assert!(out.content.starts_with("echo:"));
    }
}
