//! Bearer token authentication against Supabase Auth.
//!
//! Protected routes take an [`AuthUser`] argument. The extractor reads the
//! `Authorization: Bearer <jwt>` header and resolves the JWT to a user by
//! asking Supabase (`GET /auth/v1/user`). The JWT is never decoded or
//! verified locally, and never logged.

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use thiserror::Error;
use tracing::debug;

use crate::error::ApiError;
use crate::supabase::{SupabaseClient, SupabaseError, SupabaseUser};

/// Errors that can occur while authenticating a request.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No `Authorization` header was sent.
    #[error("missing authorization header")]
    MissingHeader,

    /// The header is not of the form `Bearer <token>`.
    #[error("authorization header must be 'Bearer <token>'")]
    MalformedHeader,

    /// Supabase did not accept the token (expired, revoked, forged).
    #[error("invalid or expired token")]
    InvalidToken,

    /// Supabase could not be asked about the token.
    #[error("authentication service unavailable")]
    Provider(#[source] SupabaseError),
}

impl AuthError {
    /// Machine readable code for the error response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingHeader => "missing_token",
            Self::MalformedHeader => "invalid_auth_header",
            Self::InvalidToken => "invalid_token",
            Self::Provider(_) => "auth_unavailable",
        }
    }
}

impl From<SupabaseError> for AuthError {
    fn from(err: SupabaseError) -> Self {
        match err {
            SupabaseError::Unauthorized | SupabaseError::NotFound => Self::InvalidToken,
            other => Self::Provider(other),
        }
    }
}

/// Extracts the bearer token from request headers.
///
/// The scheme is matched case-insensitively; an empty token is malformed.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MalformedHeader)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::MalformedHeader);
    }

    Ok(token)
}

/// Resolves the request's bearer token to a Supabase user.
pub async fn authenticate(
    client: &SupabaseClient,
    headers: &HeaderMap,
) -> Result<SupabaseUser, AuthError> {
    let token = bearer_token(headers)?;
    let user = client.get_user(token).await?;
    Ok(user)
}

/// The authenticated caller of a protected route.
#[derive(Debug, Clone)]
pub struct AuthUser(pub SupabaseUser);

impl AuthUser {
    pub fn id(&self) -> &str {
        &self.0.id
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    Arc<SupabaseClient>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let client = Arc::<SupabaseClient>::from_ref(state);

        match authenticate(&client, &parts.headers).await {
            Ok(user) => Ok(Self(user)),
            Err(err) => {
                debug!(code = err.code(), error = %err, "Request authentication failed");
                Err(err.into())
            }
        }
    }
}
