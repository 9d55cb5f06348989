// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Fetch a URL, convert HTML to readable markdown-ish text, and paginate
//! large documents through continuation cursors.
//!
//! Pagination is heading-based: when a page exceeds the window, the split
//! point is moved back to the nearest markdown heading so a continuation
//! starts at a section boundary.  The remainder is parked in a process-wide
//! LRU cache keyed by an opaque cursor token; entries expire after a TTL
//! enforced by a dedicated sweeper task.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

const CACHE_CAPACITY: usize = 256;

struct CachedPage {
    remainder: String,
    source_url: String,
    created: Instant,
}

/// Continuation-token cache shared by all `web_fetch` executions.
pub struct FetchCache {
    pages: Mutex<LruCache<String, CachedPage>>,
    ttl: Duration,
}

impl FetchCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity"),
            )),
            ttl,
        })
    }

    fn insert(&self, remainder: String, source_url: String) -> String {
        let cursor = format!("wf_{}", uuid::Uuid::new_v4().simple());
        self.pages.lock().unwrap().put(
            cursor.clone(),
            CachedPage { remainder, source_url, created: Instant::now() },
        );
        cursor
    }

    fn take(&self, cursor: &str) -> Option<(String, String)> {
        let mut pages = self.pages.lock().unwrap();
        let page = pages.pop(cursor)?;
        if page.created.elapsed() > self.ttl {
            return None;
        }
        Some((page.remainder, page.source_url))
    }

    fn sweep(&self) {
        let mut pages = self.pages.lock().unwrap();
        // LruCache has no retain; collect expired keys first.
        let expired: Vec<String> = pages
            .iter()
            .filter(|(_, p)| p.created.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            pages.pop(&k);
        }
    }

    /// Spawn the TTL sweeper.  Runs for the process lifetime.
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

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pages.lock().unwrap().len()
    }
}

pub struct WebFetchTool {
    pub cache: Arc<FetchCache>,
    /// Page-window size in characters before pagination kicks in.
    pub max_chars: usize,
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch content from a URL and convert it to readable text. \
         Large documents are paginated: when the result ends with a cursor \
         token, call web_fetch again with that cursor to continue reading. \
         HTTP and HTTPS only; read-only; no authentication."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http or https)"
                },
                "cursor": {
                    "type": "string",
                    "description": "Continuation cursor from a previous web_fetch result"
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Page window size in characters"
                }
            },
            "additionalProperties": false
        })
    }

    /// `url` and `cursor` are mutually optional but one must be present.
    fn validate(&self, args: &Value) -> Result<(), String> {
        if !args.is_object() {
            return Err("arguments must be a JSON object".into());
        }
        let has_url = args.get("url").and_then(|v| v.as_str()).is_some();
        let has_cursor = args.get("cursor").and_then(|v| v.as_str()).is_some();
        if !has_url && !has_cursor {
            return Err("either 'url' or 'cursor' is required".into());
        }
        Ok(())
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let max_chars = call
            .args
            .get("max_chars")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(self.max_chars)
            .clamp(1_000, 200_000);

        // Continuation takes priority over a fresh fetch.
        if let Some(cursor) = call.args.get("cursor").and_then(|v| v.as_str()) {
            return match self.cache.take(cursor) {
                Some((remainder, source_url)) => {
                    let (page, next) = paginate(&remainder, max_chars);
                    ToolOutput::ok(
                        &call.id,
                        self.render_page(&source_url, page, next.map(|r| self.cache.insert(r, source_url.clone()))),
                    )
                }
                None => ToolOutput::err(&call.id, "cursor expired or unknown; fetch the URL again"),
            };
        }

        let url = match call.args.get("url").and_then(|v| v.as_str()) {
            Some(u) if u.starts_with("http://") || u.starts_with("https://") => u.to_string(),
            Some(u) => return ToolOutput::err(&call.id, format!("unsupported URL scheme: {u}")),
            None => return ToolOutput::err(&call.id, "missing 'url'"),
        };

        debug!(url = %url, "web_fetch tool");

        let fetched = tokio::select! {
            r = fetch_url(&url) => r,
            _ = ctx.cancel.cancelled() => {
                return ToolOutput::err(&call.id, "fetch cancelled");
            }
        };
        match fetched {
            Ok(content) => {
                let (page, next) = paginate(&content, max_chars);
                ToolOutput::ok(
                    &call.id,
                    self.render_page(&url, page, next.map(|r| self.cache.insert(r, url.clone()))),
                )
            }
            Err(e) => ToolOutput::err(&call.id, format!("fetch error: {e}")),
        }
    }
}

impl WebFetchTool {
    fn render_page(&self, url: &str, page: &str, cursor: Option<String>) -> String {
        match cursor {
            Some(c) => format!(
                "{page}\n\n[content continues — call web_fetch with cursor=\"{c}\"] ({url})"
            ),
            None => page.to_string(),
        }
    }
}

async fn fetch_url(url: &str) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::limited(3))
        .user_agent("chatforge/0.9")
        .build()?;

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    let body = response.text().await?;

    let content = if content_type.contains("html") {
        html_to_text(&body)
    } else if content_type.contains("json") {
        match serde_json::from_str::<Value>(&body) {
            Ok(v) => serde_json::to_string_pretty(&v).unwrap_or(body),
            Err(_) => body,
        }
    } else {
        body
    };
    Ok(content)
}

/// Convert HTML to markdown-ish text using html2text.
fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 100)
}

/// Split `content` into a page of at most `max_chars` and an optional
/// remainder.  The split prefers the last markdown heading inside the
/// window, falling back to the last line break, then to a hard cut at a
/// char boundary.
fn paginate(content: &str, max_chars: usize) -> (&str, Option<String>) {
    if content.len() <= max_chars {
        return (content, None);
    }
    let mut window_end = max_chars;
    while !content.is_char_boundary(window_end) {
        window_end -= 1;
    }
    let window = &content[..window_end];

    let split = find_heading_split(window)
        .or_else(|| window.rfind('\n').map(|i| i + 1))
        .unwrap_or(window_end);
    // A degenerate split at 0 would loop forever; fall back to the hard cut.
    let split = if split == 0 { window_end } else { split };

    (&content[..split], Some(content[split..].to_string()))
}

/// Offset of the last markdown heading line within `window`, ignoring a
/// heading at offset 0 (splitting there would make no progress).
fn find_heading_split(window: &str) -> Option<usize> {
    let mut last = None;
    let mut offset = 0;
    for line in window.split_inclusive('\n') {
        if offset > 0 && line.trim_start().starts_with('#') {
            last = Some(offset);
        }
        offset += line.len();
    }
    last
}
