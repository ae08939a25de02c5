//! Seam to the external memory engine.
//!
//! The engine is a separate process doing the heavy retrieval and LLM work;
//! the gateway only needs a blocking iterator of raw chunk lines per turn.
//! `chat_stream` is always called from a session worker thread, never from
//! the async runtime, which is why the remote implementation can use the
//! blocking HTTP client.

use std::io::{BufRead, BufReader};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One prior turn of conversation, oldest first.
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

/// Everything the engine needs for one conversational turn.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub query: String,
    /// Opaque per-character memory store identifier, passed through untouched.
    pub cube_id: Option<String>,
    pub history: Vec<HistoryTurn>,
    pub internet_search: bool,
}

pub trait MemoryEngine: Send + Sync {
    fn character_name(&self) -> String;
    fn model_name(&self) -> String;

    /// Runs one turn and yields raw chunk lines (bare JSON or SSE-framed).
    /// Must not panic on transport failure; failures are reported in-stream
    /// as `error` chunks so every consumer sees a uniform protocol.
    fn chat_stream(&self, request: EngineRequest) -> Box<dyn Iterator<Item = String> + Send>;
}

fn error_chunk(message: &str) -> String {
    json!({ "type": "error", "data": message }).to_string()
}

/// Talks to the memory-engine process over its streaming HTTP endpoint.
pub struct RemoteMemoryEngine {
    base_url: String,
    character_name: String,
    model_name: String,
}

impl RemoteMemoryEngine {
    pub fn new(base_url: String, character_name: String, model_name: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            character_name,
            model_name,
        }
    }
}

impl MemoryEngine for RemoteMemoryEngine {
    fn character_name(&self) -> String {
        self.character_name.clone()
    }

    fn model_name(&self) -> String {
        self.model_name.clone()
    }

    fn chat_stream(&self, request: EngineRequest) -> Box<dyn Iterator<Item = String> + Send> {
        // Built per call, on the worker thread. No overall timeout: a turn
        // streams for as long as the engine keeps producing.
        let client = match reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                return Box::new(std::iter::once(error_chunk(&format!(
                    "failed to build engine client: {err}"
                ))));
            }
        };

        let history: Vec<_> = request
            .history
            .iter()
            .map(|turn| json!({ "role": turn.role, "content": turn.content }))
            .collect();
        let body = json!({
            "query": request.query,
            "cube_id": request.cube_id,
            "history": history,
            "internet_search": request.internet_search,
        });

        let url = format!("{}/chat/stream", self.base_url);
        let response = match client.post(&url).json(&body).send() {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %url, error = %err, "memory engine request failed");
                return Box::new(std::iter::once(error_chunk(&format!(
                    "memory engine unreachable: {err}"
                ))));
            }
        };
        if !response.status().is_success() {
            let status = response.status();
            warn!(url = %url, status = %status, "memory engine rejected request");
            return Box::new(std::iter::once(error_chunk(&format!(
                "memory engine returned status {status}"
            ))));
        }

        Box::new(SseLines {
            lines: BufReader::new(response).lines(),
            failed: false,
        })
    }
}

struct SseLines<R> {
    lines: std::io::Lines<R>,
    failed: bool,
}

impl<R: BufRead> Iterator for SseLines<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.failed {
            return None;
        }
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(line),
                Err(err) => {
                    // Surface the break in-stream once, then stop.
                    debug!(error = %err, "engine stream interrupted");
                    self.failed = true;
                    return Some(error_chunk(&format!("engine stream interrupted: {err}")));
                }
            }
        }
    }
}

/// Deterministic in-process engine for tests and local runs without the
/// memory-engine process.
pub struct MockEngine {
    character_name: String,
}

impl MockEngine {
    pub fn new(character_name: impl Into<String>) -> Self {
        Self {
            character_name: character_name.into(),
        }
    }
}

impl MemoryEngine for MockEngine {
    fn character_name(&self) -> String {
        self.character_name.clone()
    }

    fn model_name(&self) -> String {
        "mock".to_string()
    }

    fn chat_stream(&self, request: EngineRequest) -> Box<dyn Iterator<Item = String> + Send> {
        let reply = format!("「{}」について考えました。これは模擬応答です。", request.query);
        let mut chunks = vec![
            json!({ "type": "status", "data": 0 }).to_string(),
            json!({ "type": "status", "data": 1 }).to_string(),
            json!({ "type": "status", "data": 2 }).to_string(),
        ];
        // Emitted in small pieces so buffering paths get exercised.
        let fragments: Vec<String> = reply.chars().map(|c| c.to_string()).collect();
        for fragment in &fragments {
            chunks.push(json!({ "type": "text", "data": fragment }).to_string());
        }
        chunks.push(
            json!({
                "type": "reference",
                "data": { "references": [{ "source": "mock", "memory": "模擬記憶" }] }
            })
            .to_string(),
        );
        chunks.push(
            json!({ "type": "time", "data": { "total_time": 0.01, "speed_improvement": "" } })
                .to_string(),
        );
        chunks.push(
            json!({
                "type": "end",
                "data": { "total_tokens": fragments.len(), "final_text": reply }
            })
            .to_string(),
        );
        Box::new(chunks.into_iter())
    }
}
