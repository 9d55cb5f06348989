// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so enabled-unless-disabled fields need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

fn default_bind() -> String {
    "0.0.0.0:8585".into()
}
fn default_db_path() -> String {
    "chatforge.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the HTTP listener binds to.
    /// Overridden by the `CHATFORGE_BIND` environment variable.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Path to the SQLite database file.
    /// Overridden by the `CHATFORGE_DB` environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Hex-encoded 32-byte master key used to encrypt provider API keys at
    /// rest.  Prefer setting this via the `CHATFORGE_MASTER_KEY` environment
    /// variable instead of a config file.  When absent, provider records
    /// cannot be created and the providers API returns an error.
    pub master_key: Option<String>,
    /// Allow cross-origin requests from any origin.  Intended for local
    /// development against a web UI dev server; keep off in production.
    #[serde(default)]
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            db_path: default_db_path(),
            master_key: None,
            permissive_cors: false,
        }
    }
}

fn default_max_tool_iterations() -> u32 {
    10
}
fn default_stream_idle_secs() -> u64 {
    60
}
fn default_tool_timeout_secs() -> u64 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Default per-user cap on model↔tool iterations.  The per-user settings
    /// row overrides this; both are clamped to 1–50 at use sites.
    /// Overridden by `CHATFORGE_MAX_TOOL_ITERATIONS`.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    /// Abort an upstream stream after this many seconds without receiving a
    /// single byte.  Resets on any activity.
    #[serde(default = "default_stream_idle_secs")]
    pub stream_idle_timeout_secs: u64,
    /// Wall-clock cap for a single tool execution.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Connect timeout for upstream provider requests.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            stream_idle_timeout_secs: default_stream_idle_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_max_conversations() -> u32 {
    500
}
fn default_max_messages() -> u32 {
    2000
}
fn default_retention_days() -> u32 {
    180
}
fn default_sweep_interval_secs() -> u64 {
    3600
}

/// Per-user persistence limits, enforced by the retention sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Overridden by `CHATFORGE_MAX_CONVERSATIONS`.
    #[serde(default = "default_max_conversations")]
    pub max_conversations_per_user: u32,
    /// Overridden by `CHATFORGE_MAX_MESSAGES`.
    #[serde(default = "default_max_messages")]
    pub max_messages_per_conversation: u32,
    /// Conversations untouched for longer than this are soft-deleted.
    /// Overridden by `CHATFORGE_RETENTION_DAYS`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_conversations_per_user: default_max_conversations(),
            max_messages_per_conversation: default_max_messages(),
            retention_days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_fetch_max_chars() -> usize {
    20_000
}
fn default_fetch_cache_ttl_secs() -> u64 {
    900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Brave Search key for the default web-search backend.
    /// Falls back to the `BRAVE_API_KEY` environment variable.
    pub brave_api_key: Option<String>,
    /// Tavily key for the alternative search backend.  When absent the
    /// `tavily_search` tool is reported as missing its credential and is
    /// filtered out of requests that list it.
    pub tavily_api_key: Option<String>,
    /// Page-window size for the web-fetch tool before pagination kicks in.
    #[serde(default = "default_fetch_max_chars")]
    pub fetch_max_chars: usize,
    /// TTL for web-fetch continuation cursors.
    #[serde(default = "default_fetch_cache_ttl_secs")]
    pub fetch_cache_ttl_secs: u64,
    /// Expose the per-user journal tool.
    #[serde(default = "default_true")]
    pub journal_enabled: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            brave_api_key: None,
            tavily_api_key: None,
            fetch_max_chars: default_fetch_max_chars(),
            fetch_cache_ttl_secs: default_fetch_cache_ttl_secs(),
            journal_enabled: true,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.orchestrator.max_tool_iterations, 10);
        assert_eq!(cfg.orchestrator.stream_idle_timeout_secs, 60);
        assert_eq!(cfg.orchestrator.tool_timeout_secs, 60);
        assert_eq!(cfg.orchestrator.connect_timeout_secs, 30);
        assert!(cfg.tools.journal_enabled);
    }

    #[test]
    fn empty_yaml_deserializes_to_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:8585");
        assert_eq!(cfg.limits.max_conversations_per_user, 500);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let cfg: Config =
            serde_yaml::from_str("orchestrator:\n  max_tool_iterations: 3\n").unwrap();
        assert_eq!(cfg.orchestrator.max_tool_iterations, 3);
        assert_eq!(cfg.orchestrator.tool_timeout_secs, 60);
    }

    #[test]
    fn master_key_absent_by_default() {
        assert!(Config::default().server.master_key.is_none());
    }
}
