use axum::{extract::Request, http::{StatusCode, HeaderValue}, middleware::Next, response::{IntoResponse, Response}, Json};
use once_cell::sync::Lazy;
use prometheus::IntCounterVec;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use uuid::Uuid;

/// Distinct `code` label values tracked before new codes collapse into `overflow`.
pub const MAX_ERROR_CODES: usize = 40;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")] pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")] pub message: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    NotFound { code: &'static str, trace_id: Option<Uuid> },
    /// The upstream gateway rejected or failed the call.
    BadGateway { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    Internal { trace_id: Option<Uuid>, message: Option<String> },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self { Self::Internal { trace_id, message: Some(e.to_string()) } }
    pub fn bad_request(code: &'static str, trace_id: Option<Uuid>) -> Self { Self::BadRequest { code, trace_id, message: None } }
    pub fn bad_gateway<S: Into<String>>(code: &'static str, message: S) -> Self { Self::BadGateway { code, trace_id: None, message: Some(message.into()) } }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body, error_code) = match self {
            ApiError::BadRequest { code, trace_id, message } => (
                StatusCode::BAD_REQUEST,
                ErrorBody { code: code.into(), trace_id, message },
                code
            ),
            ApiError::NotFound { code, trace_id } => (
                StatusCode::NOT_FOUND,
                ErrorBody { code: code.into(), trace_id, message: None },
                code
            ),
            ApiError::BadGateway { code, trace_id, message } => (
                StatusCode::BAD_GATEWAY,
                ErrorBody { code: code.into(), trace_id, message },
                code
            ),
            ApiError::Internal { trace_id, message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody { code: "internal_error".into(), trace_id, message },
                "internal_error"
            ),
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

static HTTP_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        "http_errors_total",
        "Count of HTTP error responses emitted (status >= 400)",
        &["service", "code", "status"]
    )
    .unwrap_or_else(|_| {
        // Already registered by another copy of this crate in the process; count locally.
        IntCounterVec::new(
            prometheus::Opts::new("http_errors_total", "Count of HTTP error responses emitted (status >= 400)"),
            &["service", "code", "status"],
        )
        .expect("static metric definition is valid")
    })
});

static SEEN_CODES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn guarded_code(code: &str) -> String {
    let mut seen = match SEEN_CODES.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if seen.contains(code) {
        return code.to_string();
    }
    if seen.len() >= MAX_ERROR_CODES {
        return "overflow".to_string();
    }
    seen.insert(code.to_string());
    code.to_string()
}

/// Record one error response. Responses below 400 are ignored.
pub fn record_error_response(service: &str, status: StatusCode, code: Option<&str>) {
    if status.as_u16() < 400 {
        return;
    }
    let code = guarded_code(code.unwrap_or("unknown"));
    HTTP_ERRORS_TOTAL
        .with_label_values(&[service, code.as_str(), status.as_str()])
        .inc();
}

type LayerFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// `axum::middleware::from_fn` compatible layer counting error responses by `X-Error-Code`.
pub fn http_error_metrics_layer(
    service: &'static str,
) -> impl Fn(Request, Next) -> LayerFuture + Clone + Send + Sync + 'static {
    move |req: Request, next: Next| -> LayerFuture {
        Box::pin(async move {
            let resp = next.run(req).await;
            let code = resp
                .headers()
                .get("X-Error-Code")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            record_error_response(service, resp.status(), code.as_deref());
            resp
        })
    }
}
