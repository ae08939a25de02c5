//! Chunk-to-envelope translation.
//!
//! Pure reshaping, reused identically by the SSE and WebSocket transports;
//! only the outer framing differs and that is applied by the callers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::chunk::Chunk;

/// Fixed client-facing error code; no finer taxonomy is propagated.
pub const PROCESSING_ERROR_CODE: &str = "PROCESSING_ERROR";

/// Normalized `{session_id, type, data}` structure emitted to clients
/// regardless of transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct Envelope {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[schema(value_type = Object)]
    pub data: Value,
}

impl Envelope {
    pub fn is_terminal(&self) -> bool {
        self.kind == "end" || self.kind == "error"
    }
}

pub fn translate(chunk: &Chunk, session_id: &str) -> Envelope {
    let (kind, data) = match chunk {
        Chunk::Text { fragment } => (
            "text",
            json!({ "content": fragment, "is_incremental": true }),
        ),
        Chunk::Error { message } => (
            "error",
            json!({ "message": message, "code": PROCESSING_ERROR_CODE }),
        ),
        Chunk::Reference { items } => ("reference", json!({ "references": items })),
        Chunk::Time {
            total_seconds,
            note,
        } => (
            "time",
            json!({ "total_time": total_seconds, "speed_improvement": note }),
        ),
        Chunk::End {
            total_tokens,
            final_text,
        } => (
            "end",
            json!({ "total_tokens": total_tokens, "final_text": final_text }),
        ),
        Chunk::Status { phase } => ("status", json!(phase)),
        Chunk::Other { tag, data } => {
            return Envelope {
                session_id: session_id.to_string(),
                kind: tag.clone(),
                data: data.clone(),
            }
        }
    };
    Envelope {
        session_id: session_id.to_string(),
        kind: kind.to_string(),
        data,
    }
}

/// Wraps coalesced buffer output back into a text envelope.
pub fn text_envelope(session_id: &str, content: &str) -> Envelope {
    Envelope {
        session_id: session_id.to_string(),
        kind: "text".to_string(),
        data: json!({ "content": content, "is_incremental": true }),
    }
}

/// Synthesizes an error envelope for failures that arise inside the gateway
/// itself rather than upstream.
pub fn error_envelope(session_id: &str, message: &str) -> Envelope {
    Envelope {
        session_id: session_id.to_string(),
        kind: "error".to_string(),
        data: json!({ "message": message, "code": PROCESSING_ERROR_CODE }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_carries_incremental_flag() {
        let envelope = translate(
            &Chunk::Text {
                fragment: "hi".to_string(),
            },
            "s1",
        );
        assert_eq!(envelope.kind, "text");
        assert_eq!(envelope.session_id, "s1");
        assert_eq!(envelope.data, json!({"content": "hi", "is_incremental": true}));
    }

    #[test]
    fn error_uses_fixed_code() {
        let envelope = translate(
            &Chunk::Error {
                message: "boom".to_string(),
            },
            "s1",
        );
        assert_eq!(
            envelope.data,
            json!({"message": "boom", "code": "PROCESSING_ERROR"})
        );
        assert!(envelope.is_terminal());
    }

    #[test]
    fn end_defaults_survive_translation() {
        let envelope = translate(
            &Chunk::End {
                total_tokens: 0,
                final_text: String::new(),
            },
            "s1",
        );
        assert_eq!(envelope.data, json!({"total_tokens": 0, "final_text": ""}));
        assert!(envelope.is_terminal());
    }

    #[test]
    fn unknown_payload_passes_through() {
        let envelope = translate(
            &Chunk::Other {
                tag: "debug".to_string(),
                data: json!({"x": 1}),
            },
            "s1",
        );
        assert_eq!(envelope.kind, "debug");
        assert_eq!(envelope.data, json!({"x": 1}));
        assert!(!envelope.is_terminal());
    }

    #[test]
    fn envelope_serializes_with_type_key() {
        let envelope = text_envelope("s1", "hello");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["session_id"], "s1");
    }
}
