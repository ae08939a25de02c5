//! HTTP surface: chat streaming, health, and control endpoints.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{Request, StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Span};
use utoipa::{OpenApi, ToSchema};

use companion_gateway_error::{ErrorType, GatewayError, ProblemDetails};
use companion_gateway_sidecar::{SidecarHealth, SidecarManager, SidecarStats};

use crate::config::Settings;
use crate::engine::{EngineRequest, HistoryTurn, MemoryEngine};
use crate::session::{run_session, SessionRegistry};
use crate::translator::Envelope;
use crate::ws::ws_chat;

const MAX_HISTORY_TURNS: usize = 10;
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub struct AppState {
    pub settings: RwLock<Settings>,
    pub settings_path: PathBuf,
    pub registry: Arc<SessionRegistry>,
    pub engine: Arc<dyn MemoryEngine>,
    pub sidecar: SidecarManager,
    pub shutdown: Notify,
}

impl AppState {
    pub fn new(
        settings: Settings,
        settings_path: PathBuf,
        engine: Arc<dyn MemoryEngine>,
        sidecar: SidecarManager,
    ) -> Self {
        Self {
            settings: RwLock::new(settings),
            settings_path,
            registry: Arc::new(SessionRegistry::new()),
            engine,
            sidecar,
            shutdown: Notify::new(),
        }
    }
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let api_router = Router::new()
        .route("/chat/stream", post(post_chat_stream))
        .route("/health", get(get_health))
        .route("/health/neo4j", get(get_sidecar_health))
        .route("/control", post(post_control))
        .with_state(shared.clone());

    let mut router = Router::new()
        .route("/", get(get_root))
        .route("/openapi.json", get(get_openapi))
        .route("/ws/chat/:client_id", get(ws_chat))
        .nest("/api", api_router)
        .fallback(not_found)
        .with_state(shared.clone());

    let http_logging = match std::env::var("COMPANION_GATEWAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, get_sidecar_health, post_chat_stream, post_control),
    components(schemas(
        ChatRequest,
        ChatType,
        ImageAttachment,
        NotificationContext,
        DesktopContext,
        HistoryMessage,
        HealthResponse,
        SidecarHealthResponse,
        ControlRequest,
        ControlResponse,
        Envelope,
        ProblemDetails,
        ErrorType
    )),
    tags(
        (name = "chat", description = "Streaming chat"),
        (name = "health", description = "Health reporting"),
        (name = "control", description = "Runtime control")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Gateway(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    #[default]
    Text,
    TextImage,
    Notification,
    DesktopWatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ImageAttachment {
    /// base64 data URL.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NotificationContext {
    pub from: String,
    pub original_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DesktopContext {
    pub application: Option<String>,
    pub window_title: Option<String>,
    pub capture_type: Option<String>,
    #[schema(value_type = Option<String>)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub chat_type: ChatType,
    #[serde(default)]
    pub images: Vec<ImageAttachment>,
    pub notification: Option<NotificationContext>,
    pub desktop_context: Option<DesktopContext>,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    #[serde(default)]
    pub internet_search: bool,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub character: Option<String>,
    pub memory_enabled: bool,
    pub llm_model: String,
    pub neo4j_status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SidecarHealthResponse {
    pub success: bool,
    #[schema(value_type = Object)]
    pub health: SidecarHealth,
    #[schema(value_type = Object)]
    pub stats: SidecarStats,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ControlRequest {
    pub action: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ControlResponse {
    pub status: String,
    pub message: String,
}

async fn get_root() -> Json<serde_json::Value> {
    Json(json!({
        "name": "companion-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn not_found(uri: Uri) -> ApiError {
    GatewayError::NotFound {
        resource: uri.path().to_string(),
    }
    .into()
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, body = HealthResponse)),
    tag = "health"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let settings = state.settings.read().await;
    let memory_enabled = settings.memory_enabled();
    let character = settings.current_character().map(|c| c.name.clone());
    drop(settings);

    let sidecar_state = state.sidecar.state().await;
    let status = if memory_enabled && sidecar_state != companion_gateway_sidecar::SidecarState::Running
    {
        "error"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        character,
        memory_enabled,
        llm_model: state.engine.model_name(),
        neo4j_status: sidecar_state.as_str().to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/api/health/neo4j",
    responses((status = 200, body = SidecarHealthResponse)),
    tag = "health"
)]
async fn get_sidecar_health(State(state): State<Arc<AppState>>) -> Json<SidecarHealthResponse> {
    let health = state.sidecar.health_check().await;
    let stats = state.sidecar.stats().await;
    Json(SidecarHealthResponse {
        success: health.is_healthy(),
        health,
        stats,
    })
}

#[utoipa::path(
    post,
    path = "/api/chat/stream",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "SSE stream of chat envelopes"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if request.query.trim().is_empty() && request.notification.is_none() {
        return Err(GatewayError::InvalidRequest {
            message: "query must not be empty".to_string(),
        }
        .into());
    }

    let settings = state.settings.read().await.clone();
    let engine_request = build_engine_request(&settings, &request);
    let session_id = request
        .request_id
        .clone()
        .unwrap_or_else(|| format!("http_{}", random_suffix()));

    // One HTTP request is its own connection; no other session shares it.
    let connection_id = session_id.clone();
    let (tx, rx) = mpsc::channel::<Envelope>(32);
    tokio::spawn(run_session(
        state.registry.clone(),
        state.engine.clone(),
        engine_request,
        session_id,
        connection_id,
        false,
        tx,
    ));

    let stream = ReceiverStream::new(rx).map(|envelope| {
        let data = serde_json::to_string(&envelope).unwrap_or_default();
        Ok::<Event, Infallible>(Event::default().data(data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE)))
}

#[utoipa::path(
    post,
    path = "/api/control",
    request_body = ControlRequest,
    responses(
        (status = 200, body = ControlResponse),
        (status = 400, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    tag = "control"
)]
async fn post_control(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ControlRequest>,
) -> Result<Json<ControlResponse>, ApiError> {
    let message = match request.action.as_str() {
        "shutdown" => {
            info!("shutdown requested via control endpoint");
            let state = state.clone();
            // Let the response go out before the server starts draining.
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                state.shutdown.notify_one();
            });
            "shutdown initiated".to_string()
        }
        "reload_config" => {
            reload_settings(&state).await?;
            "configuration reloaded".to_string()
        }
        "restart" => {
            info!("sidecar restart requested via control endpoint");
            state.sidecar.stop().await;
            reload_settings(&state).await?;
            let memory_enabled = state.settings.read().await.memory_enabled();
            if memory_enabled && !state.sidecar.start().await {
                return Err(GatewayError::SidecarUnavailable {
                    message: "sidecar did not come back after restart".to_string(),
                }
                .into());
            }
            "sidecar restarted".to_string()
        }
        "clear_cache" => {
            let purged = state.registry.purge_inactive().await;
            format!("cleared {purged} stale sessions")
        }
        other => {
            warn!(action = %other, "unsupported control action");
            return Err(GatewayError::UnsupportedAction {
                action: other.to_string(),
            }
            .into());
        }
    };

    Ok(Json(ControlResponse {
        status: "success".to_string(),
        message,
    }))
}

async fn reload_settings(state: &Arc<AppState>) -> Result<(), ApiError> {
    let settings = Settings::load(&state.settings_path).map_err(|err| {
        GatewayError::ConfigInvalid {
            message: err.to_string(),
        }
    })?;
    *state.settings.write().await = settings;
    info!(path = %state.settings_path.display(), "configuration reloaded");
    Ok(())
}

/// Builds the engine-facing request from a transport request: chat-type
/// specific preamble, attachment note, and history clamped to the most
/// recent turns.
pub fn build_engine_request(settings: &Settings, request: &ChatRequest) -> EngineRequest {
    let mut query = match request.chat_type {
        ChatType::Notification => match &request.notification {
            Some(notification) => {
                let mut text = format!(
                    "通知が届きました。\n差出人: {}\n内容: {}",
                    notification.from, notification.original_message
                );
                if !request.query.trim().is_empty() {
                    text.push('\n');
                    text.push_str(&request.query);
                }
                text
            }
            None => request.query.clone(),
        },
        ChatType::DesktopWatch => match &request.desktop_context {
            Some(context) => format!(
                "デスクトップの様子: {} ({})\n{}",
                context.application.as_deref().unwrap_or("不明なアプリ"),
                context.window_title.as_deref().unwrap_or(""),
                request.query
            ),
            None => request.query.clone(),
        },
        ChatType::Text | ChatType::TextImage => request.query.clone(),
    };

    if !request.images.is_empty() {
        let bytes: usize = request.images.iter().map(|image| image_byte_size(&image.data)).sum();
        debug!(count = request.images.len(), bytes, "chat request carries images");
        query.push_str(&format!(
            "\n(画像{}枚が添付されています)",
            request.images.len()
        ));
    }

    let skip = request.history.len().saturating_sub(MAX_HISTORY_TURNS);
    let history = request
        .history
        .iter()
        .skip(skip)
        .map(|message| HistoryTurn {
            role: message.role.clone(),
            content: message.content.clone(),
        })
        .collect();

    EngineRequest {
        query,
        cube_id: settings
            .current_character()
            .and_then(|character| character.cube_id.clone()),
        history,
        internet_search: request.internet_search,
    }
}

fn image_byte_size(data_url: &str) -> usize {
    let payload = data_url.rsplit(',').next().unwrap_or(data_url);
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map(|bytes| bytes.len())
        .unwrap_or(0)
}

static SUFFIX_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Short non-cryptographic id suffix; collisions across reconnects are
/// resolved by supersession, not prevented.
pub(crate) fn random_suffix() -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        .hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    SUFFIX_COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_request(query: &str) -> ChatRequest {
        ChatRequest {
            query: query.to_string(),
            chat_type: ChatType::Text,
            images: Vec::new(),
            notification: None,
            desktop_context: None,
            history: Vec::new(),
            internet_search: false,
            request_id: None,
        }
    }

    #[test]
    fn notification_gets_a_preamble() {
        let mut request = chat_request("");
        request.chat_type = ChatType::Notification;
        request.notification = Some(NotificationContext {
            from: "メールアプリ".to_string(),
            original_message: "会議は15時からです".to_string(),
        });
        let engine_request = build_engine_request(&Settings::default(), &request);
        assert!(engine_request.query.contains("メールアプリ"));
        assert!(engine_request.query.contains("会議は15時からです"));
    }

    #[test]
    fn history_is_clamped_to_recent_turns() {
        let mut request = chat_request("hi");
        for i in 0..25 {
            request.history.push(HistoryMessage {
                role: "user".to_string(),
                content: format!("turn {i}"),
                timestamp: None,
            });
        }
        let engine_request = build_engine_request(&Settings::default(), &request);
        assert_eq!(engine_request.history.len(), MAX_HISTORY_TURNS);
        assert_eq!(engine_request.history[0].content, "turn 15");
        assert_eq!(engine_request.history[9].content, "turn 24");
    }

    #[test]
    fn images_add_attachment_note() {
        let mut request = chat_request("これは何?");
        request.chat_type = ChatType::TextImage;
        request.images.push(ImageAttachment {
            data: "data:image/png;base64,aGVsbG8=".to_string(),
        });
        let engine_request = build_engine_request(&Settings::default(), &request);
        assert!(engine_request.query.contains("画像1枚"));
    }

    #[test]
    fn image_byte_size_handles_data_urls() {
        assert_eq!(image_byte_size("data:image/png;base64,aGVsbG8="), 5);
        assert_eq!(image_byte_size("not base64 at all!"), 0);
    }

    #[test]
    fn suffixes_differ_between_calls() {
        assert_ne!(random_suffix(), random_suffix());
    }
}
