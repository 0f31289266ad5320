//! HTTP-facing error type for the Nappio server.
//!
//! Each adapter has its own error enum ([`SupabaseError`], [`StripeError`],
//! [`AuthError`]). Handlers return [`ApiError`], which the adapters convert
//! into, and which renders as a JSON body:
//!
//! ```json
//! { "error": "a user with this email already exists", "code": "conflict" }
//! ```
//!
//! Details of 5xx failures are logged and replaced by a generic message in
//! the response.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::auth::AuthError;
use crate::stripe::StripeError;
use crate::supabase::SupabaseError;

/// Which third party a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Supabase,
    Stripe,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supabase => f.write_str("identity provider"),
            Self::Stripe => f.write_str("payment processor"),
        }
    }
}

/// Errors returned by route handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request body or parameters are invalid.
    #[error("{0}")]
    Validation(String),

    /// The request body exceeds the size limit.
    #[error("request body too large")]
    PayloadTooLarge,

    /// Authentication failed.
    #[error(transparent)]
    Auth(AuthError),

    /// The resource does not exist or is not owned by the caller.
    #[error("{0}")]
    NotFound(String),

    /// The request collides with existing data.
    #[error("{0}")]
    Conflict(String),

    /// A provider refused the request because of its input.
    #[error("{message}")]
    Rejected { provider: Provider, message: String },

    /// A provider timed out or is down.
    #[error("{0} unavailable")]
    Unavailable(Provider),

    /// A provider answered with something we could not use.
    #[error("unexpected response from {provider}")]
    BadGateway { provider: Provider, detail: String },

    /// Anything else. The detail is logged, never returned.
    #[error("internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Rejected { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Auth(AuthError::Provider(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Auth(err) => err.code(),
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Rejected { .. } => "provider_rejected",
            Self::Unavailable(_) => "service_unavailable",
            Self::BadGateway { .. } => "bad_gateway",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            Self::BadGateway { provider, detail } => {
                error!(provider = %provider, detail = %detail, "Unexpected provider response");
            }
            Self::Internal(detail) => error!(detail = %detail, "Internal error"),
            Self::Auth(AuthError::Provider(err)) => {
                warn!(error = %err, "Token verification unavailable");
            }
            Self::Unavailable(provider) => warn!(provider = %provider, "Provider unavailable"),
            _ => {}
        }

        let body = ErrorResponse::new(self.to_string()).with_code(self.code());
        (status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::PayloadTooLarge;
        }
        Self::Validation(rejection.body_text())
    }
}

impl From<SupabaseError> for ApiError {
    fn from(err: SupabaseError) -> Self {
        let provider = Provider::Supabase;
        match err {
            SupabaseError::NotFound => Self::not_found("not found"),
            SupabaseError::Conflict(_) => {
                Self::Conflict("a record with these details already exists".to_string())
            }
            SupabaseError::Rejected { message, .. } => Self::Rejected { provider, message },
            SupabaseError::Timeout(_)
            | SupabaseError::Unavailable(_)
            | SupabaseError::RetriesExhausted { .. } => Self::Unavailable(provider),
            // Service-role calls are never unauthorized unless the key is wrong.
            SupabaseError::Unauthorized => Self::BadGateway {
                provider,
                detail: "service key rejected".to_string(),
            },
            SupabaseError::InvalidResponse(detail) => Self::BadGateway { provider, detail },
            SupabaseError::Configuration(detail) => Self::Internal(detail),
        }
    }
}

impl From<StripeError> for ApiError {
    fn from(err: StripeError) -> Self {
        let provider = Provider::Stripe;
        match err {
            StripeError::Api { message, .. } => Self::Rejected { provider, message },
            StripeError::NotFound(message) => Self::NotFound(message),
            StripeError::Timeout(_) | StripeError::Unavailable(_) => Self::Unavailable(provider),
            StripeError::InvalidResponse(detail) => Self::BadGateway { provider, detail },
            StripeError::Configuration(detail) => Self::Internal(detail),
        }
    }
}

/// A specialized Result type for route handlers.
pub type Result<T> = std::result::Result<T, ApiError>;
