use axum::{
    extract::{Extension, State},
    http::{header, StatusCode},
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Map, Value};
use tracing::{error, info};
use webhook_gate_core::Algorithm;
use webhook_gate_util::config::PROVIDER_SIGNATURE_HEADERS;

use crate::guard::{verify_webhook, VerifiedWebhook, WebhookGuard};
use crate::problem::ProblemResponse;
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    guard: WebhookGuard,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, guard: WebhookGuard) -> Self {
        Self { metrics, guard }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn guard(&self) -> &WebhookGuard {
        &self.guard
    }
}

pub fn app_router(state: AppState) -> Router {
    let webhooks = Router::new()
        .route("/webhooks", post(receive_webhook))
        .route_layer(from_fn_with_state(state.guard.clone(), verify_webhook));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/_debug/webhook-stats", get(webhook_stats))
        .merge(webhooks)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn webhook_stats(State(state): State<AppState>) -> Result<Json<Value>, ProblemResponse> {
    let guard = state.guard();
    let config = guard.config();
    let backend = guard.idempotency();
    let size = backend.len().await.map_err(|err| {
        error!(stage = "idempotency", error = %err, "failed to count idempotency records");
        ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "failed to read idempotency store",
        )
    })?;

    let providers: Map<String, Value> = PROVIDER_SIGNATURE_HEADERS
        .iter()
        .map(|(name, header)| (name.to_string(), Value::from(*header)))
        .collect();

    Ok(Json(json!({
        "idempotencyStoreSize": size,
        "idempotencyBackend": backend.label(),
        "supportedAlgorithms": Algorithm::SUPPORTED.map(Algorithm::as_str),
        "supportedProviders": providers,
        "signatureHeader": config.signature_header,
        "timestampHeader": config.timestamp_header,
        "idHeader": config.id_header,
        "toleranceSeconds": config.tolerance_secs,
        "idempotencyTtlMs": config.idempotency_ttl.as_millis() as u64,
        "payloadMode": config.payload_mode.as_str(),
        "secretSource": guard.resolver().kind(),
    })))
}

async fn receive_webhook(Extension(verified): Extension<VerifiedWebhook>) -> impl IntoResponse {
    info!(
        stage = "ingress",
        webhook_id = verified.webhook_id.as_deref().unwrap_or("-"),
        algorithm = %verified.algorithm,
        timestamp = verified.timestamp,
        "webhook accepted"
    );
    Json(json!({
        "received": true,
        "webhookId": verified.webhook_id,
    }))
}
