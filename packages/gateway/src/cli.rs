use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use companion_gateway_sidecar::{SidecarManager, SidecarManagerConfig};

use crate::config::{ConfigError, Settings};
use crate::engine::{MemoryEngine, MockEngine, RemoteMemoryEngine};
use crate::router::{build_router_with_state, AppState};

const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Parser, Debug)]
#[command(name = "companion-gateway", bin_name = "companion-gateway")]
#[command(about = "Streaming chat gateway for a companion-AI character", version)]
#[command(arg_required_else_help = true)]
pub struct CompanionGatewayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway HTTP/WebSocket server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    /// Listen port; defaults to the port from the settings file.
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Path to Setting.json.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    /// Use the in-process mock engine instead of the memory-engine process.
    /// Implies no sidecar management.
    #[arg(long)]
    mock_engine: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run() -> Result<(), CliError> {
    let cli = CompanionGatewayCli::parse();
    init_logging();
    match cli.command {
        Command::Server(args) => run_server(&args),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let settings_path = args.config.clone().unwrap_or_else(default_settings_path);
    let settings = Settings::load(&settings_path)?;
    let port = args.port.unwrap_or(settings.gateway_port);
    let addr = format!("{}:{}", args.host, port);

    let character = settings.current_character().cloned().unwrap_or_default();
    let engine: Arc<dyn MemoryEngine> = if args.mock_engine {
        Arc::new(MockEngine::new(character.name.clone()))
    } else {
        Arc::new(RemoteMemoryEngine::new(
            settings.memory_api_url(),
            character.name.clone(),
            character.model_name.clone(),
        ))
    };

    let sidecar = SidecarManager::new(SidecarManagerConfig::new(
        settings_path.clone(),
        settings.memory_runtime_dir(),
    ));
    let manage_sidecar = settings.memory_enabled() && !args.mock_engine;

    let cors = build_cors_layer(args)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        if manage_sidecar {
            // Memory features are essential when the character has them
            // enabled; a dead sidecar means a dead start.
            if !sidecar.start().await {
                return Err(CliError::Server(
                    "graph database sidecar failed to start".to_string(),
                ));
            }
        } else {
            tracing::info!("sidecar management disabled");
        }

        let state = Arc::new(AppState::new(
            settings,
            settings_path,
            engine,
            sidecar,
        ));
        let (router, state) = build_router_with_state(state);
        let router = router.layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, character = %character.name, "gateway listening");

        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupt received, shutting down");
                    }
                    _ = shutdown_state.shutdown.notified() => {
                        tracing::info!("shutdown requested, shutting down");
                    }
                }
                shutdown_state.sidecar.stop().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("companion-gateway").join("Setting.json"))
        .unwrap_or_else(|| PathBuf::from("Setting.json"))
}

fn build_cors_layer(args: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &args.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    cors = cors.allow_methods(Any).allow_headers(Any);
    Ok(cors)
}
