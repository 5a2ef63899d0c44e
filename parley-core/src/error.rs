use std::fmt;

use thiserror::Error;

/// Startup and infrastructure failures (config, pool, migrations).
#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

// ============================================================================
// Application error taxonomy
// ============================================================================

/// Every code the API can return in the `code` field of its envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    ValidationFailed,
    Internal,
    ServiceUnavailable,
    AiService,
    ContextCancelled,
    ProviderNotFound,
    ModelNotFound,
    DataLoad,
    SessionNotFound,
    SessionAccessDenied,
    SessionExists,
    MessageNotFound,
    MessageAccessDenied,
    MessageSendFailed,
}

impl ErrorCode {
    pub const fn as_u16(self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::ValidationFailed => 422,
            ErrorCode::Internal => 500,
            ErrorCode::ServiceUnavailable => 503,
            ErrorCode::AiService => 550,
            ErrorCode::ContextCancelled => 551,
            ErrorCode::ProviderNotFound => 560,
            ErrorCode::ModelNotFound => 561,
            ErrorCode::DataLoad => 562,
            ErrorCode::SessionNotFound => 570,
            ErrorCode::SessionAccessDenied => 571,
            ErrorCode::SessionExists => 572,
            ErrorCode::MessageNotFound => 580,
            ErrorCode::MessageAccessDenied => 581,
            ErrorCode::MessageSendFailed => 582,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "bad request",
            ErrorCode::Unauthorized => "missing user identity",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "resource not found",
            ErrorCode::ValidationFailed => "validation failed",
            ErrorCode::Internal => "internal error",
            ErrorCode::ServiceUnavailable => "service unavailable",
            ErrorCode::AiService => "AI service error",
            ErrorCode::ContextCancelled => "request cancelled",
            ErrorCode::ProviderNotFound => "provider not found",
            ErrorCode::ModelNotFound => "model not found",
            ErrorCode::DataLoad => "failed to load data",
            ErrorCode::SessionNotFound => "session not found",
            ErrorCode::SessionAccessDenied => "session access denied",
            ErrorCode::SessionExists => "session already exists",
            ErrorCode::MessageNotFound => "message not found",
            ErrorCode::MessageAccessDenied => "message access denied",
            ErrorCode::MessageSendFailed => "failed to send message",
        }
    }

    /// The code shown to callers. Not-found and not-yours share one external
    /// code so a caller cannot probe for other users' resources.
    pub fn external(self) -> ErrorCode {
        match self {
            ErrorCode::SessionNotFound => ErrorCode::SessionAccessDenied,
            ErrorCode::MessageNotFound => ErrorCode::MessageAccessDenied,
            other => other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Typed application error: a code, a caller-facing message and the
/// underlying cause chain (kept for logs, never serialised).
#[derive(Debug)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    source: Option<anyhow::Error>,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn internal(source: impl Into<anyhow::Error>) -> Self {
        Self::with_source(
            ErrorCode::Internal,
            ErrorCode::Internal.default_message(),
            source,
        )
    }

    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.source.as_ref()
    }

    /// Message safe to show callers; collapses the not-found/not-yours pair.
    pub fn external_message(&self) -> String {
        match self.code {
            ErrorCode::SessionNotFound | ErrorCode::SessionAccessDenied => {
                "session not found or access denied".to_string()
            }
            ErrorCode::MessageNotFound | ErrorCode::MessageAccessDenied => {
                "message not found or access denied".to_string()
            }
            _ => self.message.clone(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {:#}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}
