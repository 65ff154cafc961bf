//! HTTP gateway: axum router, shared state and server loop.
//!
//! Routes:
//! - `GET  /`                                - embedded web UI
//! - `GET  /health`                          - liveness
//! - `GET  /api/proxy?url=`                  - remote content proxy
//! - `GET  /api/static/*`                    - alias of the proxy
//! - `POST /api/sandbox`                     - acquire-or-create a sandbox
//! - `POST /api/conversations`               - start a conversation
//! - `GET  /api/conversations/{id}`          - conversation state
//! - `DELETE /api/conversations/{id}`        - forget a conversation
//! - `POST /api/conversations/{id}/messages` - run a turn (SSE)

pub mod conversations;
pub mod error;
pub mod proxy;
pub mod sandbox;
pub mod web;

use crate::config::Config;
use crate::conversation::{Driver, SessionStore};
use crate::llm::{ChatProvider, OpenAiChatClient};
use crate::preview::{PreviewService, PreviewSettings, ReadinessProbe};
use crate::sandbox::e2b::E2bSandboxClient;
use crate::sandbox::SandboxProvider;
use anyhow::Context;
use axum::{
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Outbound client for the content proxy.
    pub http: reqwest::Client,
    pub preview: Arc<PreviewService>,
    pub driver: Driver,
    pub sessions: Arc<SessionStore>,
}

impl AppState {
    /// Wire the production providers (OpenAI, E2B) from config.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let llm = Arc::new(OpenAiChatClient::from_config(&config.llm)?);
        let sandboxes = Arc::new(E2bSandboxClient::from_config(&config.sandbox)?);
        Self::with_providers(config, llm, sandboxes)
    }

    pub fn with_providers(
        config: Config,
        llm: Arc<dyn ChatProvider>,
        sandboxes: Arc<dyn SandboxProvider>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.proxy.timeout_secs))
            .user_agent(concat!("sandpreview/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build proxy HTTP client")?;

        let preview = Arc::new(PreviewService::new(
            sandboxes,
            PreviewSettings::from_config(&config),
        ));
        let probe = ReadinessProbe::new(&config.readiness)?;
        let driver = Driver::new(llm, preview.clone(), probe);
        let sessions = Arc::new(SessionStore::new(config.llm.system_prompt.clone()));

        Ok(Self {
            config: Arc::new(config),
            http,
            preview,
            driver,
            sessions,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let gateway = &state.config.gateway;
    let middleware = ServiceBuilder::new()
        .layer(RequestBodyLimitLayer::new(gateway.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(gateway.request_timeout_secs),
        ));

    Router::new()
        .route("/", get(web::handle_index))
        .route("/ui/{*path}", get(web::handle_asset))
        .route("/health", get(handle_health))
        .route("/api/proxy", get(proxy::handle_proxy))
        .route("/api/proxy/{*path}", get(proxy::handle_proxy))
        .route("/api/static", get(proxy::handle_proxy))
        .route("/api/static/{*path}", get(proxy::handle_proxy))
        .route("/api/sandbox", post(sandbox::handle_sandbox))
        .route("/api/conversations", post(conversations::handle_create))
        .route(
            "/api/conversations/{id}",
            get(conversations::handle_get).delete(conversations::handle_delete),
        )
        .route(
            "/api/conversations/{id}/messages",
            post(conversations::handle_message),
        )
        .layer(middleware)
        .with_state(state)
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn run_gateway(state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.gateway.host, state.config.gateway.port)
        .parse()
        .context("Invalid gateway host/port")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    if state.config.proxy.allowed_hosts.is_empty() {
        tracing::warn!("Content proxy accepts any target host; set proxy.allowed_hosts to restrict it");
    }
    tracing::info!("sandpreview listening on http://{addr}");

    let sweeper = spawn_session_sweeper(
        state.sessions.clone(),
        Duration::from_secs(state.config.gateway.session_idle_secs),
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Gateway server failed")?;

    sweeper.abort();
    tracing::info!("Gateway stopped");
    Ok(())
}

/// Periodically drop conversations idle for longer than `ttl`.
fn spawn_session_sweeper(sessions: Arc<SessionStore>, ttl: Duration) -> JoinHandle<()> {
    let period = ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = sessions.evict_idle(ttl);
            if evicted > 0 {
                tracing::debug!(evicted, live = sessions.len(), "Evicted idle conversations");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
    }
}
