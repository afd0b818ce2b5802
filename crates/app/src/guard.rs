use std::{sync::Arc, time::Duration, time::Instant};

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{debug, error, info, warn};
use webhook_gate_core::{
    canonical_json, parse_signature, parse_timestamp, verify, verify_with_timestamp, Algorithm,
    Clock, IdempotencyRecord, ShouldProcess, VerificationFailure, VerificationResult,
    DEFAULT_TOLERANCE_SECS, DEFAULT_TTL,
};
use webhook_gate_util::{
    config::{
        DEFAULT_ID_HEADER, DEFAULT_MAX_BODY_BYTES, DEFAULT_SECRET_TIMEOUT,
        DEFAULT_SIGNATURE_HEADER, DEFAULT_TIMESTAMP_HEADER,
    },
    PayloadMode, WebhookSettings,
};

use crate::idempotency::IdempotencyBackend;
use crate::problem::ProblemResponse;
use crate::secret::SecretResolver;

const INTERNAL_MESSAGE: &str = "Webhook validation failed";

/// Header names and limits applied to every inbound delivery.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub signature_header: String,
    /// `None` disables the freshness check.
    pub timestamp_header: Option<String>,
    /// `None` disables duplicate suppression.
    pub id_header: Option<String>,
    pub tolerance_secs: u64,
    pub idempotency_ttl: Duration,
    pub secret_timeout: Duration,
    pub max_body_bytes: usize,
    pub payload_mode: PayloadMode,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            timestamp_header: Some(DEFAULT_TIMESTAMP_HEADER.to_string()),
            id_header: Some(DEFAULT_ID_HEADER.to_string()),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
            idempotency_ttl: DEFAULT_TTL,
            secret_timeout: DEFAULT_SECRET_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            payload_mode: PayloadMode::Raw,
        }
    }
}

impl GuardConfig {
    pub fn from_settings(settings: &WebhookSettings) -> Self {
        Self {
            signature_header: settings.signature_header.clone(),
            timestamp_header: settings.timestamp_header.clone(),
            id_header: settings.id_header.clone(),
            tolerance_secs: settings.tolerance_secs,
            idempotency_ttl: settings.idempotency_ttl,
            secret_timeout: settings.secret_timeout,
            max_body_bytes: settings.max_body_bytes,
            payload_mode: settings.payload_mode,
        }
    }
}

/// Shared state of the verification middleware.
#[derive(Clone)]
pub struct WebhookGuard {
    config: Arc<GuardConfig>,
    resolver: SecretResolver,
    idempotency: IdempotencyBackend,
    clock: Clock,
}

impl WebhookGuard {
    pub fn new(
        config: GuardConfig,
        resolver: SecretResolver,
        idempotency: IdempotencyBackend,
    ) -> Self {
        Self {
            config: Arc::new(config),
            resolver,
            idempotency,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn resolver(&self) -> &SecretResolver {
        &self.resolver
    }

    pub fn idempotency(&self) -> &IdempotencyBackend {
        &self.idempotency
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

/// Inserted into the request extensions of every delivery that passed the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedWebhook {
    pub webhook_id: Option<String>,
    pub algorithm: Algorithm,
    pub timestamp: Option<i64>,
}

/// Why a delivery was turned away.
#[derive(Debug)]
pub enum Rejection {
    MissingSignature { header: String },
    MalformedPayload(String),
    InvalidSignature(String),
    StaleTimestamp {
        reason: String,
        timestamp: Option<i64>,
        age: Option<i64>,
    },
    MissingIdentifier { header: String },
    Internal,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedPayload(_) | Self::MissingIdentifier { .. } => StatusCode::BAD_REQUEST,
            Self::MissingSignature { .. }
            | Self::InvalidSignature(_)
            | Self::StaleTimestamp { .. } => StatusCode::UNAUTHORIZED,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingSignature { .. } => "missing_signature",
            Self::MalformedPayload(_) => "malformed_payload",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::StaleTimestamp { .. } => "stale_timestamp",
            Self::MissingIdentifier { .. } => "missing_identifier",
            Self::Internal => "internal_error",
        }
    }

    fn from_verification(result: VerificationResult) -> Self {
        let reason = result
            .reason
            .unwrap_or_else(|| "invalid signature".to_string());
        match result.failure {
            Some(VerificationFailure::MissingTimestamp | VerificationFailure::StaleTimestamp) => {
                Self::StaleTimestamp {
                    reason,
                    timestamp: result.timestamp,
                    age: result.age,
                }
            }
            Some(VerificationFailure::InvalidSignature) | None => Self::InvalidSignature(reason),
        }
    }

    fn into_problem(self) -> ProblemResponse {
        let status = self.status();
        let code = self.kind();
        match self {
            Self::MissingSignature { header } => {
                ProblemResponse::new(status, code, "missing signature").with_context("header", header)
            }
            Self::MalformedPayload(message) | Self::InvalidSignature(message) => {
                ProblemResponse::new(status, code, message)
            }
            Self::StaleTimestamp {
                reason,
                timestamp,
                age,
            } => {
                let mut problem = ProblemResponse::new(status, code, reason);
                if let Some(timestamp) = timestamp {
                    problem = problem.with_context("timestamp", timestamp);
                }
                if let Some(age) = age {
                    problem = problem.with_context("age", age);
                }
                problem
            }
            Self::MissingIdentifier { header } => {
                ProblemResponse::new(status, code, "missing webhook id").with_context("header", header)
            }
            Self::Internal => ProblemResponse::new(status, code, INTERNAL_MESSAGE),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        self.into_problem().into_response()
    }
}

enum Verdict {
    Forward(Request),
    Cached(IdempotencyRecord),
}

/// Authenticates a webhook delivery before it reaches the wrapped handler.
///
/// Duplicates are answered here with `200 {"cached": true}` and never
/// forwarded.
pub async fn verify_webhook(
    State(guard): State<WebhookGuard>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let (outcome, response) = match evaluate(&guard, request).await {
        Ok(Verdict::Forward(request)) => ("forwarded", next.run(request).await),
        Ok(Verdict::Cached(record)) => ("cached", cached_response(&record)),
        Err(rejection) => {
            counter!("webhook_rejections_total", "kind" => rejection.kind()).increment(1);
            ("rejected", rejection.into_response())
        }
    };
    counter!("webhook_requests_total", "outcome" => outcome).increment(1);
    histogram!("webhook_verify_latency_seconds").record(start.elapsed().as_secs_f64());
    response
}

async fn evaluate(guard: &WebhookGuard, request: Request) -> Result<Verdict, Rejection> {
    let config = guard.config();
    let (mut parts, body) = request.into_parts();

    let signature = header_value(&parts.headers, &config.signature_header)
        .ok_or_else(|| {
            debug!(stage = "ingress", header = %config.signature_header, "signature header missing");
            Rejection::MissingSignature {
                header: config.signature_header.clone(),
            }
        })?
        .to_string();

    let body = read_body(body, config.max_body_bytes).await?;
    let signed = signing_bytes(&body, config.payload_mode)?;

    let secret = guard
        .resolver()
        .resolve(&parts.headers, config.secret_timeout)
        .await
        .map_err(|err| {
            error!(stage = "secret", error = %err, "failed to resolve webhook secret");
            Rejection::Internal
        })?;

    let now = guard.now();
    let timestamp_raw = config
        .timestamp_header
        .as_deref()
        .and_then(|name| header_value(&parts.headers, name))
        .filter(|raw| !raw.trim().is_empty());
    let result = match timestamp_raw {
        Some(raw) => verify_with_timestamp(
            &signed,
            &signature,
            parse_timestamp(raw),
            secret.as_bytes(),
            config.tolerance_secs,
            now.timestamp(),
        ),
        None => VerificationResult::signature_only(verify(&signed, &signature, secret.as_bytes())),
    };

    if !result.valid {
        warn!(
            stage = "freshness",
            reason = result.reason.as_deref().unwrap_or_default(),
            age = result.age,
            "webhook verification failed"
        );
        return Err(Rejection::from_verification(result));
    }

    let Some(algorithm) =
        parse_signature(&signature).and_then(|(name, _)| name.parse::<Algorithm>().ok())
    else {
        return Err(Rejection::InvalidSignature("invalid signature".to_string()));
    };

    let webhook_id = match config.id_header.as_deref() {
        Some(name) => {
            let id = header_value(&parts.headers, name)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| Rejection::MissingIdentifier {
                    header: name.to_string(),
                })?
                .to_string();
            let decision = guard
                .idempotency()
                .should_process(&id, config.idempotency_ttl, now)
                .await
                .map_err(|err| {
                    error!(stage = "idempotency", webhook_id = %id, error = %err, "idempotency check failed");
                    Rejection::Internal
                })?;
            if let ShouldProcess::Duplicate(record) = decision {
                info!(
                    stage = "idempotency",
                    webhook_id = %id,
                    processed_at = %record.processed_at.to_rfc3339(),
                    "duplicate webhook absorbed"
                );
                return Ok(Verdict::Cached(record));
            }
            Some(id)
        }
        None => None,
    };

    parts.extensions.insert(VerifiedWebhook {
        webhook_id,
        algorithm,
        timestamp: result.timestamp,
    });
    Ok(Verdict::Forward(Request::from_parts(parts, Body::from(body))))
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes, Rejection> {
    let bytes = to_bytes(body, limit).await.map_err(|err| {
        debug!(stage = "ingress", error = %err, "failed to read webhook body");
        Rejection::MalformedPayload(format!("webhook payload unreadable or larger than {limit} bytes"))
    })?;
    if bytes.is_empty() {
        return Err(Rejection::MalformedPayload(
            "missing webhook payload".to_string(),
        ));
    }
    Ok(bytes)
}

fn signing_bytes(body: &Bytes, mode: PayloadMode) -> Result<Bytes, Rejection> {
    match mode {
        PayloadMode::Raw => Ok(body.clone()),
        PayloadMode::CanonicalJson => canonical_json(body).map(Bytes::from).map_err(|err| {
            debug!(stage = "ingress", error = %err, "payload could not be canonicalised");
            Rejection::MalformedPayload("unserializable payload".to_string())
        }),
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn cached_response(record: &IdempotencyRecord) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "message": "Webhook already processed",
            "webhookId": record.webhook_id,
            "processedAt": record.processed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "cached": true,
        })),
    )
        .into_response()
}
