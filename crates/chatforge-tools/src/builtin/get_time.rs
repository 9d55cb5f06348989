// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

/// Current wall-clock time, optionally shifted to a fixed UTC offset.
pub struct GetTimeTool;

#[async_trait]
impl Tool for GetTimeTool {
    fn name(&self) -> &str {
        "get_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time as an ISO-8601 timestamp. \
         Pass utc_offset_minutes to shift into a local timezone."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "utc_offset_minutes": {
                    "type": "integer",
                    "description": "Minutes east of UTC (e.g. 120 for UTC+2). Default 0."
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
        let offset_minutes = call
            .args
            .get("utc_offset_minutes")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        // Offsets beyond ±26 h are nonsense; clamp rather than fail.
        let offset_minutes = offset_minutes.clamp(-26 * 60, 26 * 60) as i32;

        let now = chrono::Utc::now();
        let shifted = match chrono::FixedOffset::east_opt(offset_minutes * 60) {
            Some(tz) => now.with_timezone(&tz).to_rfc3339(),
            None => now.to_rfc3339(),
        };
        ToolOutput::ok(&call.id, json!({ "now": shifted }).to_string())
    }
}
