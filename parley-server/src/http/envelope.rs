//! Response envelope `{code, message, data}` and the error → status mapping.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{async_trait, Json};
use parley_core::error::{AppError, ErrorCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const SUCCESS_MESSAGE: &str = "success";

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn success(status: StatusCode, data: T) -> Self {
        Self {
            code: status.as_u16(),
            message: SUCCESS_MESSAGE.to_string(),
            data: Some(data),
        }
    }
}

impl Envelope<()> {
    pub fn failure(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

pub type ApiResult<T> = Result<(StatusCode, Json<Envelope<T>>), ApiError>;

pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(Envelope::success(StatusCode::OK, data))))
}

pub fn created<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((
        StatusCode::CREATED,
        Json(Envelope::success(StatusCode::CREATED, data)),
    ))
}

/// HTTP status for an (already externalised) error code.
pub fn http_status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound
        | ErrorCode::ProviderNotFound
        | ErrorCode::ModelNotFound
        | ErrorCode::SessionNotFound
        | ErrorCode::SessionAccessDenied
        | ErrorCode::MessageNotFound
        | ErrorCode::MessageAccessDenied => StatusCode::NOT_FOUND,
        ErrorCode::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::SessionExists => StatusCode::CONFLICT,
        ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::AiService => StatusCode::BAD_GATEWAY,
        // nginx's "client closed request"
        ErrorCode::ContextCancelled => {
            StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
        }
        ErrorCode::Internal | ErrorCode::DataLoad | ErrorCode::MessageSendFailed => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Transport wrapper for [`AppError`]: logs the cause chain, then serialises
/// only the external code and message.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let internal = self.0.code;
        let external = internal.external();
        let status = http_status(external);

        if status.is_server_error() {
            tracing::error!(code = internal.as_u16(), error = %self.0, "Request failed");
        } else {
            tracing::debug!(code = internal.as_u16(), error = %self.0, "Request rejected");
        }

        let body = Envelope::failure(external.as_u16(), self.0.external_message());
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Extractors: parse failures become envelope 400s
// ============================================================================

pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(rejected_json(rejection)),
        }
    }
}

pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(ApiQuery(value)),
            Err(rejection) => Err(rejected_query(rejection)),
        }
    }
}

fn rejected_json(rejection: JsonRejection) -> ApiError {
    ApiError(AppError::bad_request(format!(
        "invalid request body: {}",
        rejection.body_text()
    )))
}

fn rejected_query(rejection: QueryRejection) -> ApiError {
    ApiError(AppError::bad_request(format!(
        "invalid query string: {}",
        rejection.body_text()
    )))
}
