//! Upstream chunk taxonomy.
//!
//! The memory engine streams SSE-framed JSON lines of the form
//! `data: {"type": "...", "data": ...}`. Parsing is lossy on purpose: a
//! malformed line yields `None` and the stream carries on, it never aborts.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// Coarse progress marker (0 = started, 1 = retrieval done, 2 = generating).
    Status { phase: i64 },
    /// Incremental generated text, order-sensitive.
    Text { fragment: String },
    /// Grounding citations, delivered once after text completes.
    Reference { items: Vec<Value> },
    /// Timing telemetry, delivered once near the end.
    Time { total_seconds: f64, note: String },
    /// Terminal success marker.
    End { total_tokens: i64, final_text: String },
    /// Terminal failure marker.
    Error { message: String },
    /// Unknown tag, payload passed through for forward compatibility.
    Other { tag: String, data: Value },
}

impl Chunk {
    /// Parses one raw upstream line. Accepts both bare JSON and
    /// `data: `-prefixed SSE frames. Returns `None` for anything that is not
    /// a tagged JSON object.
    pub fn parse(raw: &str) -> Option<Chunk> {
        let payload = raw.trim();
        let payload = payload.strip_prefix("data:").unwrap_or(payload).trim();
        if payload.is_empty() {
            return None;
        }

        let value: Value = serde_json::from_str(payload).ok()?;
        let object = value.as_object()?;
        let tag = object.get("type")?.as_str()?;
        let data = object.get("data").cloned().unwrap_or(Value::Null);

        let chunk = match tag {
            "status" => Chunk::Status {
                phase: as_i64(&data).unwrap_or(0),
            },
            "text" => Chunk::Text {
                fragment: data.as_str()?.to_string(),
            },
            "reference" => Chunk::Reference {
                items: reference_items(&data),
            },
            "time" => Chunk::Time {
                total_seconds: data
                    .get("total_time")
                    .or_else(|| data.get("total_seconds"))
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                note: data
                    .get("speed_improvement")
                    .or_else(|| data.get("note"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "end" => Chunk::End {
                total_tokens: data
                    .get("total_tokens")
                    .and_then(|v| as_i64(v))
                    .unwrap_or(0),
                final_text: data
                    .get("final_text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "error" => Chunk::Error {
                message: error_message(&data),
            },
            other => Chunk::Other {
                tag: other.to_string(),
                data,
            },
        };
        Some(chunk)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Chunk::End { .. } | Chunk::Error { .. })
    }
}

// Upstreams are sloppy about numeric encoding; "2" and 2 both occur.
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn reference_items(data: &Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .get("references")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn error_message(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("upstream error")
            .to_string(),
        _ => "upstream error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_sse_framed_text() {
        let chunk = Chunk::parse("data: {\"type\":\"text\",\"data\":\"こんにちは\"}\n\n");
        assert_eq!(
            chunk,
            Some(Chunk::Text {
                fragment: "こんにちは".to_string()
            })
        );
    }

    #[test]
    fn parses_status_with_string_phase() {
        assert_eq!(
            Chunk::parse(r#"{"type":"status","data":"2"}"#),
            Some(Chunk::Status { phase: 2 })
        );
        assert_eq!(
            Chunk::parse(r#"{"type":"status","data":1}"#),
            Some(Chunk::Status { phase: 1 })
        );
    }

    #[test]
    fn parses_end_with_defaults() {
        assert_eq!(
            Chunk::parse(r#"{"type":"end","data":{}}"#),
            Some(Chunk::End {
                total_tokens: 0,
                final_text: String::new()
            })
        );
        assert_eq!(
            Chunk::parse(r#"{"type":"end","data":{"total_tokens":42,"final_text":"done"}}"#),
            Some(Chunk::End {
                total_tokens: 42,
                final_text: "done".to_string()
            })
        );
    }

    #[test]
    fn parses_reference_shapes() {
        let bare = Chunk::parse(r#"{"type":"reference","data":[{"id":1}]}"#).unwrap();
        let wrapped = Chunk::parse(r#"{"type":"reference","data":{"references":[{"id":1}]}}"#)
            .unwrap();
        assert_eq!(bare, wrapped);
        assert_eq!(
            bare,
            Chunk::Reference {
                items: vec![json!({"id": 1})]
            }
        );
    }

    #[test]
    fn parses_time_and_error() {
        assert_eq!(
            Chunk::parse(r#"{"type":"time","data":{"total_time":1.5,"speed_improvement":"2x"}}"#),
            Some(Chunk::Time {
                total_seconds: 1.5,
                note: "2x".to_string()
            })
        );
        assert_eq!(
            Chunk::parse(r#"{"type":"error","data":"boom"}"#),
            Some(Chunk::Error {
                message: "boom".to_string()
            })
        );
        assert_eq!(
            Chunk::parse(r#"{"type":"error","data":{"message":"boom"}}"#),
            Some(Chunk::Error {
                message: "boom".to_string()
            })
        );
    }

    #[test]
    fn unknown_tag_passes_through() {
        assert_eq!(
            Chunk::parse(r#"{"type":"debug","data":{"x":1}}"#),
            Some(Chunk::Other {
                tag: "debug".to_string(),
                data: json!({"x": 1})
            })
        );
    }

    #[test]
    fn malformed_input_is_skipped() {
        assert_eq!(Chunk::parse("not json at all"), None);
        assert_eq!(Chunk::parse("data: [1,2,3]"), None);
        assert_eq!(Chunk::parse(r#"{"no_type": true}"#), None);
        assert_eq!(Chunk::parse(""), None);
    }

    #[test]
    fn terminal_detection() {
        assert!(Chunk::parse(r#"{"type":"end"}"#).unwrap().is_terminal());
        assert!(Chunk::parse(r#"{"type":"error","data":"x"}"#)
            .unwrap()
            .is_terminal());
        assert!(!Chunk::parse(r#"{"type":"text","data":"x"}"#)
            .unwrap()
            .is_terminal());
    }
}
