use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::FutureExt;
use reader_lib::{BlockStreamServer, MetricsAndReadinessManager, OperatorPhase, ReaderMetricsSnapshot};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::error;

/// HTTP surface of the running reader: health, head and metrics.
#[derive(Clone)]
pub struct ManagerApi {
    readiness: Arc<MetricsAndReadinessManager>,
    server: BlockStreamServer,
    phase: watch::Receiver<OperatorPhase>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ready: bool,
    pub phase: OperatorPhase,
    pub head_block_number: Option<u64>,
    pub max_latency_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub reader: ReaderMetricsSnapshot,
    pub subscribers: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ManagerApi {
    pub fn new(
        readiness: Arc<MetricsAndReadinessManager>,
        server: BlockStreamServer,
        phase: watch::Receiver<OperatorPhase>,
    ) -> Self {
        Self {
            readiness,
            server,
            phase,
        }
    }

    pub async fn serve(
        self,
        bind_address: &str,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let addr: SocketAddr = bind_address.parse()?;
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Starting manager API server on {}", addr);
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown.map(|v| {
                _ = v.inspect_err(|_err| error!("shutdown receive error"));
            }))
            .await?;
        Ok(())
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/v1/head", get(head))
            .route("/v1/metrics", get(metrics))
            .layer(CorsLayer::permissive())
            .with_state(self.clone())
    }
}

async fn healthz(State(api): State<ManagerApi>) -> (StatusCode, Json<HealthResponse>) {
    let phase = *api.phase.borrow();
    // a fresh head alone is not enough while draining
    let ready = phase == OperatorPhase::Running && api.readiness.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            ready,
            phase,
            head_block_number: api.readiness.head_block_number(),
            max_latency_secs: api.readiness.max_latency().as_secs(),
        }),
    )
}

async fn head(State(api): State<ManagerApi>) -> Response {
    match api.server.head_info() {
        Some(head) => Json(head).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "no block streamed yet".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn metrics(State(api): State<ManagerApi>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        reader: api.readiness.snapshot(),
        subscribers: api.server.subscriber_count(),
    })
}
