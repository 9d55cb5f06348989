// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{ApiKeyStatus, Tool, ToolCall, ToolContext, ToolOutput};

/// Default web search backend using the Brave aggregator API.
pub struct WebSearchTool {
    pub api_key: Option<String>,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Real-time web search. count: 1-10 (default 5). \
         Include the current year in queries for recent info. \
         ALWAYS cite sources after answering:\n\
         Sources:\n\
         - [Title](URL)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                },
                "count": {
                    "type": "integer",
                    "description": "Number of results to return (default 5, max 10)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn api_key_status(&self) -> ApiKeyStatus {
        ApiKeyStatus::with_key(self.api_key.is_some(), "BRAVE_API_KEY")
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let query = match call.args.get("query").and_then(|v| v.as_str()) {
            Some(q) => q.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'query'"),
        };
        let count = call
            .args
            .get("count")
            .and_then(|v| v.as_u64())
            .unwrap_or(5)
            .clamp(1, 10) as usize;

        debug!(query = %query, count, "web_search tool");

        let Some(api_key) = &self.api_key else {
            return ToolOutput::err(
                &call.id,
                "No Brave Search API key configured. Set the BRAVE_API_KEY environment \
                 variable or tools.brave_api_key in the server config.",
            );
        };

        let result = tokio::select! {
            r = brave_search(&query, count, api_key) => r,
            _ = ctx.cancel.cancelled() => {
                return ToolOutput::err(&call.id, "search cancelled");
            }
        };
        match result {
            Ok(results) => ToolOutput::ok(&call.id, results),
            Err(e) => ToolOutput::err(&call.id, format!("search error: {e}")),
        }
    }
}

async fn brave_search(query: &str, count: usize, api_key: &str) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .user_agent("chatforge/0.9")
        .build()?;

    let url = format!(
        "https://api.search.brave.com/res/v1/web/search?q={}&count={}",
        urlencoding(query),
        count
    );

    let resp = client
        .get(&url)
        .header("Accept", "application/json")
        .header("Accept-Encoding", "gzip")
        .header("X-Subscription-Token", api_key)
        .send()
        .await?;

    if !resp.status().is_success() {
        anyhow::bail!("Brave API returned status {}", resp.status());
    }

    let json: Value = resp.json().await?;
    let results = json
        .get("web")
        .and_then(|w| w.get("results"))
        .and_then(|r| r.as_array())
        .map(|arr| arr.as_slice())
        .unwrap_or(&[]);

    Ok(format_results(results, count))
}

/// Tavily variant for users who configured that backend's credential.
pub struct TavilySearchTool {
    pub api_key: Option<String>,
}

#[async_trait]
impl Tool for TavilySearchTool {
    fn name(&self) -> &str {
        "tavily_search"
    }

    fn description(&self) -> &str {
        "Web search via the Tavily API. Requires a user-configured Tavily key. \
         count: 1-10 (default 5)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "count": {
                    "type": "integer",
                    "description": "Number of results to return (default 5, max 10)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn api_key_status(&self) -> ApiKeyStatus {
        ApiKeyStatus::with_key(self.api_key.is_some(), "TAVILY_API_KEY")
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let query = match call.args.get("query").and_then(|v| v.as_str()) {
            Some(q) => q.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'query'"),
        };
        let count = call
            .args
            .get("count")
            .and_then(|v| v.as_u64())
            .unwrap_or(5)
            .clamp(1, 10) as usize;

        let Some(api_key) = &self.api_key else {
            return ToolOutput::err(
                &call.id,
                "No Tavily API key configured. Set TAVILY_API_KEY or \
                 tools.tavily_api_key in the server config.",
            );
        };

        let result = tokio::select! {
            r = tavily_search(&query, count, api_key) => r,
            _ = ctx.cancel.cancelled() => {
                return ToolOutput::err(&call.id, "search cancelled");
            }
        };
        match result {
            Ok(results) => ToolOutput::ok(&call.id, results),
            Err(e) => ToolOutput::err(&call.id, format!("search error: {e}")),
        }
    }
}

async fn tavily_search(query: &str, count: usize, api_key: &str) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .user_agent("chatforge/0.9")
        .build()?;

    let resp = client
        .post("https://api.tavily.com/search")
        .bearer_auth(api_key)
        .json(&json!({ "query": query, "max_results": count }))
        .send()
        .await?;

    if !resp.status().is_success() {
        anyhow::bail!("Tavily API returned status {}", resp.status());
    }

    let json: Value = resp.json().await?;
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .map(|arr| arr.as_slice())
        .unwrap_or(&[]);

    if results.is_empty() {
        return Ok("(no results)".to_string());
    }
    let mut output = Vec::new();
    for (i, r) in results.iter().enumerate().take(count) {
        let title = r.get("title").and_then(|v| v.as_str()).unwrap_or("(no title)");
        let url = r.get("url").and_then(|v| v.as_str()).unwrap_or("");
        let content = r.get("content").and_then(|v| v.as_str()).unwrap_or("");
        output.push(format!("{}. **{}**\n   {}\n   {}", i + 1, title, url, content));
    }
    Ok(output.join("\n\n"))
}

fn format_results(results: &[Value], count: usize) -> String {
    if results.is_empty() {
        return "(no results)".to_string();
    }
    let mut output = Vec::new();
    for (i, r) in results.iter().enumerate().take(count) {
        let title = r.get("title").and_then(|v| v.as_str()).unwrap_or("(no title)");
        let url = r.get("url").and_then(|v| v.as_str()).unwrap_or("");
        let desc = r.get("description").and_then(|v| v.as_str()).unwrap_or("");
        output.push(format!("{}. **{}**\n   {}\n   {}", i + 1, title, url, desc));
    }
    output.join("\n\n")
}

fn urlencoding(s: &str) -> String {
    let mut encoded = String::new();
    for c in s.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => encoded.push(c),
            ' ' => encoded.push('+'),
            c => {
                for byte in c.to_string().as_bytes() {
                    encoded.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    encoded
}
