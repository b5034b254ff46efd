//! Gateway Service - Public entry point in front of the analysis engine
//!
//! Responsibilities:
//! - Forward analysis requests to the engine, preserving its status codes
//! - Re-stream the engine's live progress events to browsers (SSE)
//! - Apply the single request timeout of the deployment (analysis calls)
//!
//! Endpoints:
//! - GET  /                     - Welcome / liveness
//! - POST /api/analysis/analyze - Proxy to engine POST /analyze
//! - GET  /api/analysis/stream  - Proxy to engine GET /stream (no timeout)

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
struct Config {
    bind: String,
    engine_url: String,
    proxy_timeout: Duration,
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind: std::env::var("GATEWAY_BIND").unwrap_or_else(|_| "127.0.0.1:8000".to_string()),
            engine_url: std::env::var("ENGINE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8001".to_string()),
            proxy_timeout: parse_proxy_timeout(std::env::var("PROXY_TIMEOUT_SECS").ok().as_deref()),
        }
    }
}

/// Unset, blank, or unparseable values fall back to the 60-second default.
fn parse_proxy_timeout(value: Option<&str>) -> Duration {
    let secs = value.and_then(|v| v.trim().parse().ok()).unwrap_or(60);
    Duration::from_secs(secs)
}

// ============================================================================
// State
// ============================================================================

struct AppState {
    /// Client for request/response proxying, bounded by the proxy timeout.
    http: reqwest::Client,
    /// Client for the event stream: long-lived, so no overall timeout.
    stream_http: reqwest::Client,
    engine_url: String,
}

impl AppState {
    fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.proxy_timeout)
            .build()
            .context("Failed to build proxy HTTP client")?;
        let stream_http = reqwest::Client::builder()
            .build()
            .context("Failed to build stream HTTP client")?;
        Ok(Self {
            http,
            stream_http,
            engine_url: config.engine_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.engine_url, path)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn root_handler() -> Json<Value> {
    Json(serde_json::json!({
        "service": "campaign-report-gateway",
        "status": "running",
    }))
}

fn bad_gateway(message: String) -> Response {
    eprintln!("gateway error: {message}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: message }),
    )
        .into_response()
}

/// Forward the analysis request and relay the engine's JSON body and status
/// unchanged, so validation errors keep their 422 on the public surface.
async fn analyze_proxy(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    let resp = match state
        .http
        .post(state.endpoint("/analyze"))
        .json(&body)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(err) => return bad_gateway(format!("engine request failed: {err}")),
    };

    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    match resp.json::<Value>().await {
        Ok(payload) => (status, Json(payload)).into_response(),
        Err(err) => bad_gateway(format!("engine response unreadable: {err}")),
    }
}

/// Re-stream the engine's SSE byte stream to the client. The proxy timeout
/// does not apply here; the stream stays open as long as both sides do.
async fn stream_proxy(State(state): State<Arc<AppState>>) -> Response {
    let resp = match state
        .stream_http
        .get(state.endpoint("/stream"))
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(err) => return bad_gateway(format!("engine stream failed: {err}")),
    };
    if !resp.status().is_success() {
        return bad_gateway(format!("engine stream returned {}", resp.status()));
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(resp.bytes_stream()))
        .unwrap_or_else(|err| bad_gateway(format!("stream response build failed: {err}")))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    println!("=== Campaign Report Gateway ===");
    println!("Engine upstream: {}", config.engine_url);

    let state = Arc::new(AppState::new(&config)?);

    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/api/analysis/analyze", post(analyze_proxy))
        .route("/api/analysis/stream", get(stream_proxy))
        .layer(cors)
        .with_state(state);

    println!("Gateway listening on http://{}", config.bind);
    println!("\nEndpoints:");
    println!("  GET  /");
    println!("  POST /api/analysis/analyze");
    println!("  GET  /api/analysis/stream");

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
