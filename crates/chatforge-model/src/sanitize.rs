// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Request sanitization: drop fields the target provider does not support.
//!
//! Call [`strip_unsupported`] before handing a [`CompletionRequest`] to the
//! transport.  Dropping is deterministic — the same request against the same
//! capability set always produces the same sanitized request.

use crate::{
    provider::ProviderCaps,
    types::{ChatMessage, ContentPart, MessageContent},
    CompletionRequest,
};

const IMAGE_OMITTED: &str = "[image omitted: model does not support image input]";

/// Remove request fields and content the provider does not advertise support
/// for: reasoning/verbosity directives, and image parts (replaced with a text
/// placeholder so the turn structure survives).
pub fn strip_unsupported(mut req: CompletionRequest, caps: &ProviderCaps) -> CompletionRequest {
    if !caps.reasoning_effort {
        req.reasoning_effort = None;
    }
    if !caps.verbosity {
        req.verbosity = None;
    }
    if !caps.images {
        req.messages = req.messages.into_iter().map(strip_message).collect();
    }
    req
}

fn strip_message(mut m: ChatMessage) -> ChatMessage {
    if let MessageContent::Parts(parts) = m.content {
        let stripped: Vec<ContentPart> = parts
            .into_iter()
            .map(|p| match p {
                ContentPart::ImageRef { .. } => ContentPart::Text { text: IMAGE_OMITTED.into() },
                other => other,
            })
            .collect();
        // Collapse single text part back to Text for cleaner serialization.
        if stripped.len() == 1 {
            if let ContentPart::Text { text } = &stripped[0] {
                m.content = MessageContent::Text(text.clone());
                return m;
            }
        }
        m.content = MessageContent::Parts(stripped);
    }
    m
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn full_caps() -> ProviderCaps {
        ProviderCaps { reasoning_effort: true, verbosity: true, images: true }
    }

    fn bare_caps() -> ProviderCaps {
        ProviderCaps { reasoning_effort: false, verbosity: false, images: false }
    }

    fn req_with_directives() -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            reasoning_effort: Some("high".into()),
            verbosity: Some("low".into()),
            ..Default::default()
        }
    }

    #[test]
    fn no_op_when_everything_supported() {
        let req = strip_unsupported(req_with_directives(), &full_caps());
        assert_eq!(req.reasoning_effort.as_deref(), Some("high"));
        assert_eq!(req.verbosity.as_deref(), Some("low"));
    }

    #[test]
    fn directives_dropped_when_unsupported() {
        let req = strip_unsupported(req_with_directives(), &bare_caps());
        assert!(req.reasoning_effort.is_none());
        assert!(req.verbosity.is_none());
    }

    #[test]
    fn image_parts_replaced_with_placeholder() {
        let mut req = req_with_directives();
        req.messages = vec![ChatMessage::user_with_parts(vec![
            ContentPart::text("describe this"),
            ContentPart::image("data:image/png;base64,ABC"),
        ])];
        let req = strip_unsupported(req, &bare_caps());
        match &req.messages[0].content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(&parts[1], ContentPart::Text { text } if text == IMAGE_OMITTED));
            }
            other => panic!("expected Parts, got {other:?}"),
        }
    }

    #[test]
    fn single_image_part_collapses_to_text() {
        let mut req = req_with_directives();
        req.messages = vec![ChatMessage::user_with_parts(vec![ContentPart::image(
            "data:image/png;base64,ABC",
        )])];
        let req = strip_unsupported(req, &bare_caps());
        assert!(matches!(req.messages[0].content, MessageContent::Text(_)));
        assert_eq!(req.messages[0].as_text(), Some(IMAGE_OMITTED));
    }

    #[test]
    fn stripping_is_deterministic() {
        let mk = || {
            let mut req = req_with_directives();
            req.messages = vec![ChatMessage::user_with_parts(vec![
                ContentPart::text("x"),
                ContentPart::image("data:image/png;base64,A"),
            ])];
            strip_unsupported(req, &bare_caps())
        };
        let a = serde_json::to_string(&mk().messages).unwrap();
        let b = serde_json::to_string(&mk().messages).unwrap();
        assert_eq!(a, b);
    }
}
