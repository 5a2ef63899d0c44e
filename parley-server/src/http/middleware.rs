//! Transport middleware, outer to inner:
//! panic recovery → request context (id + logging) → preflight status →
//! CORS → user identity.

use std::any::Any;
use std::time::{Duration, Instant};

use axum::extract::{FromRequestParts, Request};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{async_trait, Json};
use parley_core::error::{AppError, ErrorCode};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::Instrument;

use super::envelope::{ApiError, Envelope};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const PANIC_MESSAGE: &str = "内部错误";

const MAX_REQUEST_ID_LEN: usize = 128;
const CORS_MAX_AGE: Duration = Duration::from_secs(600);

// ============================================================================
// Panic recovery
// ============================================================================

/// Response for `CatchPanicLayer::custom`.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "Handler panicked");

    let body = Envelope::failure(ErrorCode::Internal.as_u16(), PANIC_MESSAGE);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

// ============================================================================
// Request context
// ============================================================================

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Reuse or mint an `X-Request-ID`, expose it to handlers and the response,
/// and log the request inside a span carrying the id.
pub async fn request_context(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
        user_id = tracing::field::Empty,
    );

    let started = Instant::now();
    let mut response = next.run(request).instrument(span.clone()).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    span.in_scope(|| {
        tracing::info!(
            status = response.status().as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
    });
    response
}

// ============================================================================
// CORS
// ============================================================================

/// CORS policy from `cors_allowed_origins`. A `*` entry allows any origin;
/// otherwise only listed origins are echoed back.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static(USER_ID_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
        .max_age(CORS_MAX_AGE)
}

/// `CorsLayer` answers preflights with 200; clients of this API expect 204.
pub async fn preflight_no_content(request: Request, next: Next) -> Response {
    let preflight = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

// ============================================================================
// User identity
// ============================================================================

/// Authenticated caller, taken from `X-User-ID`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub String);

fn user_from_headers(headers: &HeaderMap) -> Option<CurrentUser> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| CurrentUser(v.to_string()))
}

fn unauthorized() -> ApiError {
    ApiError(AppError::from_code(ErrorCode::Unauthorized))
}

/// Reject requests without `X-User-ID` with 401.
pub async fn require_user(mut request: Request, next: Next) -> Response {
    match user_from_headers(request.headers()) {
        Some(user) => {
            tracing::Span::current().record("user_id", user.0.as_str());
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => unauthorized().into_response(),
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<CurrentUser>() {
            return Ok(user.clone());
        }
        user_from_headers(&parts.headers).ok_or_else(unauthorized)
    }
}
