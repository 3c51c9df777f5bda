//! HTTP gateway server built on axum.

use crate::config::{RelayConfig, ServerConfig};
use crate::pipeline::RagPipeline;
use axum::{
    Router,
    extract::{Query, State},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared gateway reference for axum handlers.
pub type SharedGateway = Arc<GatewayState>;

/// Everything the handlers need. Immutable after startup.
pub struct GatewayState {
    pipeline: Arc<RagPipeline>,
    relay: RelayConfig,
    started_at: chrono::DateTime<Utc>,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("provider", &self.pipeline.provider().name())
            .field("model", &self.pipeline.provider().model_name())
            .field("relay", &self.relay)
            .finish()
    }
}

impl GatewayState {
    pub fn new(pipeline: Arc<RagPipeline>, relay: RelayConfig) -> Self {
        Self {
            pipeline,
            relay,
            started_at: Utc::now(),
        }
    }

    pub fn shared(self) -> SharedGateway {
        Arc::new(self)
    }

    pub fn pipeline(&self) -> &Arc<RagPipeline> {
        &self.pipeline
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

/// Query string of the streaming endpoint.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub prompt: String,
}

/// Build the router with generation, streaming, and health routes.
///
/// `/api/llama2/generate` and `/api/stream` are kept as aliases for older
/// clients.
pub fn router(shared: SharedGateway) -> Router {
    Router::new()
        .route("/generate", post(generate_handler))
        .route("/api/llama2/generate", post(generate_handler))
        .route("/stream", get(stream_handler))
        .route("/api/stream", get(stream_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(shared)
}

/// Non-streaming generation. Always 200; failures are reported in the body.
async fn generate_handler(State(gw): State<SharedGateway>, prompt: String) -> String {
    gw.pipeline.generate_text(&prompt).await
}

/// Streaming generation over Server-Sent Events.
///
/// Keep-alive comments are sent only when `relay.keep_alive_secs` is non-zero.
async fn stream_handler(
    State(gw): State<SharedGateway>,
    Query(params): Query<StreamParams>,
) -> Response {
    let rx = gw.pipeline.spawn_stream(params.prompt, &gw.relay);
    let events =
        ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.into_sse_event()));

    let sse = Sse::new(events);
    match gw.relay.keep_alive_secs {
        0 => sse.into_response(),
        secs => sse
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(secs)))
            .into_response(),
    }
}

/// Health check endpoint.
async fn health_handler(State(gw): State<SharedGateway>) -> impl IntoResponse {
    let provider = gw.pipeline.provider();
    let body = serde_json::json!({
        "status": "ok",
        "provider": provider.name(),
        "model": provider.model_name(),
        "uptime_secs": gw.uptime_secs(),
    });
    axum::Json(body)
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Start the gateway on the configured address.
///
/// Runs until a shutdown signal arrives.
pub async fn run(gw: SharedGateway, config: &ServerConfig) -> Result<(), std::io::Error> {
    let app = router(gw);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
