use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use companion_gateway::config::Settings;
use companion_gateway::engine::{EngineRequest, MemoryEngine, MockEngine};
use companion_gateway::router::{build_router_with_state, AppState};
use companion_gateway_sidecar::{SidecarManager, SidecarManagerConfig};

struct TestApp {
    app: Router,
    config_dir: TempDir,
}

impl TestApp {
    fn new() -> Self {
        Self::with_engine(Arc::new(MockEngine::new("テスト")))
    }

    fn with_engine(engine: Arc<dyn MemoryEngine>) -> Self {
        let config_dir = tempfile::tempdir().expect("create temp config dir");
        let settings_path = config_dir.path().join("Setting.json");
        std::fs::write(&settings_path, settings_json("テスト"))
            .expect("write settings");

        let settings = Settings::load(&settings_path).expect("load settings");
        let sidecar = SidecarManager::new(SidecarManagerConfig::new(
            settings_path.clone(),
            config_dir.path().join("neo4j"),
        ));
        let state = Arc::new(AppState::new(settings, settings_path, engine, sidecar));
        let (app, _state) = build_router_with_state(state);
        Self { app, config_dir }
    }

    fn settings_path(&self) -> std::path::PathBuf {
        self.config_dir.path().join("Setting.json")
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri(path);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let request = builder.body(body).expect("build request");
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("send request");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn get_json(&self, path: &str) -> (StatusCode, Value) {
        let (status, body) = self.request(Method::GET, path, None).await;
        (status, serde_json::from_str(&body).expect("json body"))
    }

    async fn post_json(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let (status, body) = self.request(Method::POST, path, Some(body)).await;
        (status, serde_json::from_str(&body).expect("json body"))
    }
}

fn settings_json(character: &str) -> String {
    json!({
        "gatewayPort": 55601,
        "memoryDbPort": 55603,
        "memoryWebPort": 55606,
        "currentCharacterIndex": 0,
        "characterList": [
            {"name": character, "isEnableMemory": false, "modelName": "test-model"}
        ]
    })
    .to_string()
}

fn parse_sse(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|payload| serde_json::from_str(payload).expect("sse payload is json"))
        .collect()
}

struct ScriptedEngine {
    chunks: Vec<String>,
}

impl MemoryEngine for ScriptedEngine {
    fn character_name(&self) -> String {
        "scripted".to_string()
    }

    fn model_name(&self) -> String {
        "scripted".to_string()
    }

    fn chat_stream(&self, _request: EngineRequest) -> Box<dyn Iterator<Item = String> + Send> {
        Box::new(self.chunks.clone().into_iter())
    }
}

#[tokio::test]
async fn health_reports_character_and_engine() {
    let app = TestApp::new();
    let (status, body) = app.get_json("/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["character"], "テスト");
    assert_eq!(body["memory_enabled"], false);
    assert_eq!(body["llm_model"], "mock");
    assert_eq!(body["neo4j_status"], "stopped");
}

#[tokio::test]
async fn sidecar_health_endpoint_reports_composite() {
    let app = TestApp::new();
    let (status, body) = app.get_json("/api/health/neo4j").await;
    assert_eq!(status, StatusCode::OK);
    // Memory disabled: no process, no connection, but nothing is unhealthy.
    assert_eq!(body["success"], true);
    assert_eq!(body["health"]["enabled"], false);
    assert_eq!(body["health"]["process_alive"], false);
    assert_eq!(body["stats"]["state"], "stopped");
}

#[tokio::test]
async fn chat_stream_relays_mock_engine_end_to_end() {
    let app = TestApp::new();
    let (status, body) = app
        .request(
            Method::POST,
            "/api/chat/stream",
            Some(json!({"query": "やあ", "request_id": "req_1"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let envelopes = parse_sse(&body);
    assert!(!envelopes.is_empty());

    for envelope in &envelopes {
        assert_eq!(envelope["session_id"], "req_1");
    }

    // Text arrives in order and concatenates to the engine's final text.
    let text: String = envelopes
        .iter()
        .filter(|e| e["type"] == "text")
        .map(|e| e["data"]["content"].as_str().expect("content"))
        .collect();
    let end = envelopes.last().expect("non-empty stream");
    assert_eq!(end["type"], "end");
    assert_eq!(end["data"]["final_text"], Value::String(text));

    let terminals = envelopes
        .iter()
        .filter(|e| e["type"] == "end" || e["type"] == "error")
        .count();
    assert_eq!(terminals, 1);
}

#[tokio::test]
async fn chat_stream_rejects_empty_query() {
    let app = TestApp::new();
    let (status, body) = app
        .post_json("/api/chat/stream", json!({"query": "   "}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "urn:companion-gateway:error:invalid_request");
}

#[tokio::test]
async fn malformed_chunk_does_not_abort_the_stream() {
    let mut chunks = vec![
        json!({"type": "status", "data": 0}).to_string(),
        json!({"type": "status", "data": 1}).to_string(),
        json!({"type": "status", "data": 2}).to_string(),
    ];
    for i in 0..5 {
        chunks.push(json!({"type": "text", "data": format!("t{i}")}).to_string());
    }
    chunks.insert(4, "this is not json".to_string());
    chunks.push(json!({"type": "end", "data": {}}).to_string());
    assert_eq!(chunks.len(), 10);

    let app = TestApp::with_engine(Arc::new(ScriptedEngine { chunks }));
    let (status, body) = app
        .request(
            Method::POST,
            "/api/chat/stream",
            Some(json!({"query": "hi"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let envelopes = parse_sse(&body);
    assert_eq!(envelopes.len(), 9);
    assert_eq!(envelopes.last().expect("non-empty")["type"], "end");
}

#[tokio::test]
async fn engine_error_surfaces_as_error_envelope() {
    let chunks = vec![
        json!({"type": "text", "data": "partial"}).to_string(),
        json!({"type": "error", "data": "cube is locked"}).to_string(),
    ];
    let app = TestApp::with_engine(Arc::new(ScriptedEngine { chunks }));
    let (status, body) = app
        .request(
            Method::POST,
            "/api/chat/stream",
            Some(json!({"query": "hi"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "stream errors are in-band");

    let envelopes = parse_sse(&body);
    let last = envelopes.last().expect("non-empty");
    assert_eq!(last["type"], "error");
    assert_eq!(last["data"]["code"], "PROCESSING_ERROR");
    assert_eq!(last["data"]["message"], "cube is locked");
}

#[tokio::test]
async fn control_rejects_unknown_action() {
    let app = TestApp::new();
    let (status, body) = app
        .post_json("/api/control", json!({"action": "reboot"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "urn:companion-gateway:error:unsupported_action");
    assert_eq!(body["action"], "reboot");
}

#[tokio::test]
async fn control_reload_config_picks_up_changes() {
    let app = TestApp::new();
    std::fs::write(app.settings_path(), settings_json("新しいキャラ")).expect("rewrite settings");

    let (status, body) = app
        .post_json("/api/control", json!({"action": "reload_config"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let (_, health) = app.get_json("/api/health").await;
    assert_eq!(health["character"], "新しいキャラ");
}

#[tokio::test]
async fn control_clear_cache_reports_purged_count() {
    let app = TestApp::new();
    let (status, body) = app
        .post_json("/api/control", json!({"action": "clear_cache"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "cleared 0 stale sessions");
}

#[tokio::test]
async fn unknown_routes_return_problem_details() {
    let app = TestApp::new();
    let (status, body) = app.get_json("/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "urn:companion-gateway:error:not_found");
    assert_eq!(body["resource"], "/nope");
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = TestApp::new();
    let (status, body) = app.get_json("/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/api/chat/stream"].is_object());
    assert!(body["components"]["schemas"]["Envelope"].is_object());
}
