// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

use chatforge_config::Config;
use chatforge_core::AbortRegistry;
use chatforge_db::Db;
use chatforge_tools::{
    FetchCache, GetTimeTool, JournalEntry, JournalStore, JournalTool, TavilySearchTool,
    ToolRegistry, WebFetchTool, WebSearchTool,
};

/// Shared application state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
    pub tools: Arc<ToolRegistry>,
    pub abort: Arc<AbortRegistry>,
    pub models_cache: Arc<ModelsCache>,
    /// Continuation-token cache for `web_fetch`; held here so its TTL
    /// sweeper can be spawned alongside the listener.
    pub fetch_cache: Arc<FetchCache>,
}

impl AppState {
    pub fn new(db: Db, config: Config) -> anyhow::Result<Self> {
        let fetch_cache = FetchCache::new(Duration::from_secs(config.tools.fetch_cache_ttl_secs));
        let tools = build_registry(&config, db.clone(), Arc::clone(&fetch_cache))?;
        Ok(Self {
            db,
            config: Arc::new(config),
            tools: Arc::new(tools),
            abort: AbortRegistry::new(),
            models_cache: Arc::new(ModelsCache::new(Duration::from_secs(300))),
            fetch_cache,
        })
    }
}

/// Journal persistence adapter so the tools crate stays database-free.
struct DbJournal {
    db: Db,
}

#[async_trait]
impl JournalStore for DbJournal {
    async fn append(&self, user_id: &str, text: &str) -> anyhow::Result<i64> {
        Ok(self.db.journal_append(user_id, text).await?)
    }

    async fn list(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<JournalEntry>> {
        Ok(self
            .db
            .journal_list(user_id, limit)
            .await?
            .into_iter()
            .map(|row| JournalEntry { id: row.id, created_at: row.created_at, text: row.text })
            .collect())
    }

    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<JournalEntry>> {
        Ok(self
            .db
            .journal_search(user_id, query, limit)
            .await?
            .into_iter()
            .map(|row| JournalEntry { id: row.id, created_at: row.created_at, text: row.text })
            .collect())
    }
}

/// Assemble the tool registry from config.  The fetch cache's TTL sweeper is
/// spawned by [`crate::serve`]; registry construction stays synchronous.
pub fn build_registry(
    config: &Config,
    db: Db,
    fetch_cache: Arc<FetchCache>,
) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(GetTimeTool)?;
    registry.register(WebSearchTool { api_key: config.tools.brave_api_key.clone() })?;
    registry.register(TavilySearchTool { api_key: config.tools.tavily_api_key.clone() })?;
    registry.register(WebFetchTool {
        cache: fetch_cache,
        max_chars: config.tools.fetch_max_chars,
    })?;
    if config.tools.journal_enabled {
        registry.register(JournalTool { store: Arc::new(DbJournal { db }) })?;
    }
    Ok(registry)
}

/// Process-wide model-listing cache with a TTL, swept by a dedicated task.
pub struct ModelsCache {
    entries: Mutex<HashMap<String, (Instant, Vec<String>)>>,
    ttl: Duration,
}

impl ModelsCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl }
    }

    pub fn get(&self, provider_id: &str) -> Option<Vec<String>> {
        let entries = self.entries.lock().expect("models cache poisoned");
        entries.get(provider_id).and_then(|(at, names)| {
            (at.elapsed() <= self.ttl).then(|| names.clone())
        })
    }

    pub fn put(&self, provider_id: &str, names: Vec<String>) {
        self.entries
            .lock()
            .expect("models cache poisoned")
            .insert(provider_id.to_string(), (Instant::now(), names));
    }

    pub fn sweep(&self) {
        self.entries
            .lock()
            .expect("models cache poisoned")
            .retain(|_, (at, _)| at.elapsed() <= self.ttl);
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.ttl.max(Duration::from_secs(60));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                cache.sweep();
            }
        })
    }
}

/// Periodic retention sweeper enforcing per-user persistence limits.
pub fn spawn_retention_sweeper(db: Db, config: Arc<Config>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(config.limits.sweep_interval_secs.max(60));
        let mut tick = tokio::time::interval(period);
        loop {
            tick.tick().await;
            match db
                .sweep_retention(
                    config.limits.max_conversations_per_user,
                    config.limits.retention_days,
                )
                .await
            {
                Ok(0) => {}
                Ok(n) => tracing::info!(swept = n, "retention sweep"),
                Err(e) => warn!(error = %e, "retention sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> Arc<FetchCache> {
        FetchCache::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn registry_exposes_expected_tools() {
        let db = Db::open_in_memory(None).await.unwrap();
        let registry = build_registry(&Config::default(), db, cache()).unwrap();
        let names = registry.names();
        for expected in ["get_time", "web_search", "tavily_search", "web_fetch", "journal"] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn journal_disabled_by_config() {
        let db = Db::open_in_memory(None).await.unwrap();
        let mut config = Config::default();
        config.tools.journal_enabled = false;
        let registry = build_registry(&config, db, cache()).unwrap();
        assert!(!registry.names().contains(&"journal".to_string()));
    }

    #[test]
    fn models_cache_expires() {
        let cache = ModelsCache::new(Duration::from_millis(0));
        cache.put("p1", vec!["m1".into()]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("p1").is_none());
        cache.sweep();
    }

    #[test]
    fn models_cache_round_trip() {
        let cache = ModelsCache::new(Duration::from_secs(60));
        cache.put("p1", vec!["m1".into(), "m2".into()]);
        assert_eq!(cache.get("p1").unwrap().len(), 2);
        assert!(cache.get("p2").is_none());
    }
}
