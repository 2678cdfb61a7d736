use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("message blocked by safety filters: {0}")]
    ContentBlocked(String),

    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("all models are rate limited: {0}")]
    RateLimited(String),

    #[error("AI service unavailable: {0}")]
    Unavailable(String),

    #[error("AI service failed: {0}")]
    InternalError(String),
}

/// Closed classification of everything a provider call can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    AuthError,
    RateLimited,
    ContentBlocked,
    Unavailable,
    Unknown,
}

impl ProviderErrorKind {
    /// Fatal kinds fail identically on every candidate, so fallback is skipped.
    pub fn is_request_fatal(self) -> bool {
        matches!(self, Self::AuthError | Self::ContentBlocked)
    }

    /// Of two recoverable failures, the one that better explains an exhausted run.
    pub fn most_specific(self, other: Self) -> Self {
        fn rank(kind: ProviderErrorKind) -> u8 {
            match kind {
                ProviderErrorKind::RateLimited => 2,
                ProviderErrorKind::Unavailable => 1,
                _ => 0,
            }
        }

        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::AuthError => "authentication failed",
            Self::RateLimited => "rate limited",
            Self::ContentBlocked => "content blocked",
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Untouched provider payload, kept for logs only.
    pub raw: Option<String>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            raw: None,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::AuthError, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn content_blocked(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ContentBlocked, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unavailable, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unknown, message)
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    BadInput(String),

    #[error(transparent)]
    Provider(ProviderError),

    /// `cause` is the most specific kind seen across attempts; `last` is kept for diagnostics.
    #[error("all model candidates failed; last error: {last}")]
    AllCandidatesExhausted {
        last: ProviderError,
        cause: ProviderErrorKind,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config: {0}")]
    MissingRequired(String),

    #[error("invalid value for {0}")]
    InvalidValue(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_INPUT",
            ApiError::ContentBlocked(_) => "CONTENT_BLOCKED",
            ApiError::Unauthorized(_) => "PROVIDER_AUTH_FAILED",
            ApiError::RateLimited(_) => "RATE_LIMITED",
            ApiError::Unavailable(_) => "PROVIDER_UNAVAILABLE",
            ApiError::InternalError(_) => "ALL_MODELS_FAILED",
        }
    }

    fn from_provider(err: &ProviderError) -> Self {
        let message = err.message.clone();
        match err.kind {
            ProviderErrorKind::AuthError => ApiError::Unauthorized(message),
            ProviderErrorKind::ContentBlocked => ApiError::ContentBlocked(message),
            ProviderErrorKind::RateLimited => ApiError::RateLimited(message),
            ProviderErrorKind::Unavailable => ApiError::Unavailable(message),
            ProviderErrorKind::Unknown => ApiError::InternalError(message),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        ApiError::from_provider(&err)
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::BadInput(message) => ApiError::BadRequest(message),
            ChatError::Provider(err) => ApiError::from_provider(&err),
            ChatError::AllCandidatesExhausted { last, cause } => {
                let message = format!("all models failed, last error: {}", last.message);
                match cause {
                    ProviderErrorKind::RateLimited => ApiError::RateLimited(message),
                    ProviderErrorKind::Unavailable => ApiError::Unavailable(message),
                    _ => ApiError::InternalError(message),
                }
            }
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ContentBlocked(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
            details: None,
        })
    }
}
