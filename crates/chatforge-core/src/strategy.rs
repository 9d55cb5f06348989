// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tracing::warn;

use chatforge_tools::ToolRegistry;

/// The four request-handling strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// No tools, no stream: one upstream call, one JSON response.
    Direct,
    /// No tools, stream: upstream SSE forwarded through the framer.
    Streaming,
    /// Tools, no stream: the full tool loop runs server-side, the client
    /// gets a single JSON response.
    ToolsUnified,
    /// Tools and stream: the iterative orchestrator with live framing.
    ToolsIterative,
}

/// Classify a request.
///
/// `tools` counts as non-empty only when at least one requested name
/// resolves in the registry with its credential present; names that do not
/// are dropped with a warning, never a failure.  Returns the strategy and
/// the usable tool names.
pub fn select(
    stream: bool,
    requested_tools: &[String],
    registry: &ToolRegistry,
) -> (Strategy, Vec<String>) {
    let mut usable = Vec::new();
    for name in requested_tools {
        if registry.resolvable(name) {
            usable.push(name.clone());
        } else {
            warn!(tool = %name, "requested tool unavailable; dropped from request");
        }
    }

    let strategy = match (!usable.is_empty(), stream) {
        (false, false) => Strategy::Direct,
        (false, true) => Strategy::Streaming,
        (true, false) => Strategy::ToolsUnified,
        (true, true) => Strategy::ToolsIterative,
    };
    (strategy, usable)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatforge_tools::{ApiKeyStatus, Tool, ToolCall, ToolContext, ToolOutput};
    use serde_json::{json, Value};

    struct NoopTool {
        name: &'static str,
        keyed: bool,
    }

    #[async_trait]
    impl Tool for NoopTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "noop"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn api_key_status(&self) -> ApiKeyStatus {
            if self.keyed {
                ApiKeyStatus::with_key(false, "SOME_KEY")
            } else {
                ApiKeyStatus::not_required()
            }
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            ToolOutput::ok(&call.id, "")
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(NoopTool { name: "get_time", keyed: false }).unwrap();
        reg.register(NoopTool { name: "keyed_search", keyed: true }).unwrap();
        reg
    }

    #[test]
    fn no_tools_no_stream_is_direct() {
        let (s, usable) = select(false, &[], &registry());
        assert_eq!(s, Strategy::Direct);
        assert!(usable.is_empty());
    }

    #[test]
    fn no_tools_stream_is_streaming() {
        let (s, _) = select(true, &[], &registry());
        assert_eq!(s, Strategy::Streaming);
    }

    #[test]
    fn tools_no_stream_is_unified() {
        let (s, usable) = select(false, &["get_time".into()], &registry());
        assert_eq!(s, Strategy::ToolsUnified);
        assert_eq!(usable, vec!["get_time"]);
    }

    #[test]
    fn tools_stream_is_iterative() {
        let (s, _) = select(true, &["get_time".into()], &registry());
        assert_eq!(s, Strategy::ToolsIterative);
    }

    #[test]
    fn unresolvable_tools_downgrade_to_passthrough() {
        // A tool whose credential is missing does not count as a tool.
        let (s, usable) = select(true, &["keyed_search".into()], &registry());
        assert_eq!(s, Strategy::Streaming);
        assert!(usable.is_empty());

        let (s, _) = select(false, &["ghost_tool".into()], &registry());
        assert_eq!(s, Strategy::Direct);
    }

    #[test]
    fn mixed_tools_keep_only_usable() {
        let (s, usable) = select(
            true,
            &["keyed_search".into(), "get_time".into(), "ghost".into()],
            &registry(),
        );
        assert_eq!(s, Strategy::ToolsIterative);
        assert_eq!(usable, vec!["get_time"]);
    }
}
