// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted provider for tests.
//!
//! Each call to [`ModelProvider::stream`] (or `request`) consumes the next
//! scripted turn.  Orchestrator and pipeline tests use this to exercise the
//! model↔tool loop without a network.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;

use crate::{
    provider::{EventStream, ModelProvider, ProviderError},
    AssembledToolCall, CompletionRequest, CompletionResponse, FinishReason, ProviderEvent,
};

pub struct MockProvider {
    /// One inner vec of events per model turn, consumed in order.
    turns: Mutex<Vec<Vec<ProviderEvent>>>,
    /// Requests observed, for assertions on tool_choice / history shape.
    pub seen: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn new(turns: Vec<Vec<ProviderEvent>>) -> Self {
        let mut turns = turns;
        turns.reverse(); // pop() consumes from the front
        Self { turns: Mutex::new(turns), seen: Mutex::new(Vec::new()) }
    }

    /// Convenience: a single turn that streams `text` and stops.
    pub fn text_reply(text: &str) -> Self {
        Self::new(vec![vec![
            ProviderEvent::ContentDelta(text.to_string()),
            ProviderEvent::Finished(FinishReason::Stop),
            ProviderEvent::Done,
        ]])
    }

    fn next_turn(&self) -> Vec<ProviderEvent> {
        self.turns.lock().unwrap().pop().unwrap_or_else(|| {
            vec![
                ProviderEvent::ContentDelta("(script exhausted)".into()),
                ProviderEvent::Finished(FinishReason::Stop),
                ProviderEvent::Done,
            ]
        })
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn id(&self) -> &str {
        "mock"
    }

    async fn request(&self, req: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        self.seen.lock().unwrap().push(req);
        let mut resp = CompletionResponse::default();
        for ev in self.next_turn() {
            match ev {
                ProviderEvent::ContentDelta(t) => resp.content.push_str(&t),
                ProviderEvent::ReasoningDelta(t) => {
                    resp.reasoning.get_or_insert_with(String::new).push_str(&t)
                }
                ProviderEvent::ToolCallDelta { index, id, name, arguments } => {
                    // Scripted calls arrive whole; merge fragments by index.
                    if let Some(tc) = resp.tool_calls.iter_mut().find(|t| t.index == index) {
                        tc.arguments.push_str(&arguments);
                    } else {
                        resp.tool_calls.push(AssembledToolCall { index, id, name, arguments });
                    }
                }
                ProviderEvent::Finished(f) => resp.finish_reason = Some(f),
                ProviderEvent::Usage(u) => resp.usage = u,
                ProviderEvent::ResponseId(id) => resp.response_id = Some(id),
                _ => {}
            }
        }
        Ok(resp)
    }

    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ProviderError> {
        self.seen.lock().unwrap().push(req);
        let events = self.next_turn();
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["mock-model".into()])
    }
}
