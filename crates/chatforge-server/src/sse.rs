// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Server-Sent-Events framing.
//!
//! Single-writer: the orchestrator task owns the sending half of the channel
//! for the lifetime of the request; this module turns the receiving half
//! into the response body.  Events are delivered in send order with no
//! coalescing, each as a `data: <json>` frame, terminated by `data: [DONE]`.
//! Keep-alive comment frames defeat idle-timeout proxies.  Dropping the
//! response body (client disconnect) cancels the request token, which the
//! orchestrator folds into its abort path.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chatforge_core::ChatEvent;

/// Heartbeat period; comfortably inside the ≤ 20 s contract.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);

/// Build the streaming response.  Headers flush immediately when axum sends
/// the response head; `X-Accel-Buffering: no` keeps nginx-style proxies from
/// buffering the body.
pub fn sse_response(rx: mpsc::Receiver<ChatEvent>, cancel: CancellationToken) -> Response {
    let mut response = sse_body(rx, cancel).into_response();
    response
        .headers_mut()
        .insert("x-accel-buffering", axum::http::HeaderValue::from_static("no"));
    response
}

fn sse_body(
    rx: mpsc::Receiver<ChatEvent>,
    cancel: CancellationToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Created outside the generator so it is captured (and therefore dropped)
    // with the stream even if the body is never polled.
    let disconnect_guard = cancel.drop_guard();
    let stream = async_stream::stream! {
        let _disconnect_guard = disconnect_guard;
        let mut rx = rx;
        while let Some(event) = rx.recv().await {
            yield Ok(frame(&event));
        }
        yield Ok(Event::default().data("[DONE]"));
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEPALIVE_PERIOD))
}

fn frame(event: &ChatEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        // Serialization of our own enum cannot realistically fail; degrade
        // to an error frame rather than killing the stream.
        Err(e) => Event::default().data(
            serde_json::json!({
                "type": "error",
                "kind": "internal_error",
                "message": format!("event serialization failed: {e}"),
            })
            .to_string(),
        ),
    }
}
