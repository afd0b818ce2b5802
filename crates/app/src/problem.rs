use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Serialize)]
struct ProblemDetails {
    error: &'static str,
    message: String,
    code: &'static str,
    #[serde(flatten)]
    context: Map<String, Value>,
}

/// JSON error body of the form `{ error, message, code, ...context }`.
#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, code: &'static str, message: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                error: status.canonical_reason().unwrap_or("Error"),
                message: message.into(),
                code,
                context: Map::new(),
            },
        }
    }

    pub fn with_context<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.body.context.insert(key.to_string(), value.into());
        self
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response
    }
}
