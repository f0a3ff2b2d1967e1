//! HTTP observability endpoints for the sidecar.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use collapse::{CollapseMetrics, Collapser};
use measured::MetricGroup;
use measured::text::BufferedTextEncoder;
use tokio::sync::Mutex;

/// Renders the engine's metric group into Prometheus text format.
pub struct MetricsEncoder {
    encoder: Mutex<BufferedTextEncoder>,
    metrics: Arc<CollapseMetrics>,
}

impl MetricsEncoder {
    #[must_use]
    pub fn new(metrics: Arc<CollapseMetrics>) -> Self {
        Self {
            encoder: Mutex::default(),
            metrics,
        }
    }

    /// # Panics
    ///
    /// Panics if metric collection fails.
    pub async fn encode(&self) -> Vec<u8> {
        let mut encoder = self.encoder.lock().await;
        #[expect(clippy::unwrap_used, reason = "text encoding cannot fail")]
        self.metrics.collect_group_into(&mut *encoder).unwrap();
        encoder.finish().to_vec()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub metrics: Arc<MetricsEncoder>,
    pub engine: Arc<Collapser<String>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Response {
    if state.engine.is_running() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not started").into_response()
    }
}

async fn metrics(State(state): State<ApiState>) -> Response {
    let body = state.metrics.encode().await;
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response()
}
