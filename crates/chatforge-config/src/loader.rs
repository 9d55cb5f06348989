// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones; environment variables
/// override everything.
fn config_search_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/etc/chatforge/config.yaml"),
        PathBuf::from("/etc/chatforge/config.yml"),
        PathBuf::from("chatforge.yaml"),
        PathBuf::from("chatforge.yml"),
    ]
}

/// Load configuration by merging all discovered YAML files, then applying
/// environment-variable overrides.  `extra` may provide an explicit path
/// (e.g. a `--config` CLI flag); a missing explicit path is an error.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Environment variables win over every file layer.
fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CHATFORGE_BIND") {
        cfg.server.bind = v;
    }
    if let Ok(v) = std::env::var("CHATFORGE_DB") {
        cfg.server.db_path = v;
    }
    if let Ok(v) = std::env::var("CHATFORGE_MASTER_KEY") {
        cfg.server.master_key = Some(v);
    }
    if let Ok(v) = std::env::var("CHATFORGE_MAX_TOOL_ITERATIONS") {
        if let Ok(n) = v.parse() {
            cfg.orchestrator.max_tool_iterations = n;
        }
    }
    if let Ok(v) = std::env::var("CHATFORGE_MAX_CONVERSATIONS") {
        if let Ok(n) = v.parse() {
            cfg.limits.max_conversations_per_user = n;
        }
    }
    if let Ok(v) = std::env::var("CHATFORGE_MAX_MESSAGES") {
        if let Ok(n) = v.parse() {
            cfg.limits.max_messages_per_conversation = n;
        }
    }
    if let Ok(v) = std::env::var("CHATFORGE_RETENTION_DAYS") {
        if let Ok(n) = v.parse() {
            cfg.limits.retention_days = n;
        }
    }
    if cfg.tools.brave_api_key.is_none() {
        cfg.tools.brave_api_key = std::env::var("BRAVE_API_KEY").ok();
    }
    if cfg.tools.tavily_api_key.is_none() {
        cfg.tools.tavily_api_key = std::env::var("TAVILY_API_KEY").ok();
    }
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
