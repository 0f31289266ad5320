//! Supabase client module for authentication and table access.
//!
//! This module provides a client for interacting with Supabase services:
//! - User sign-up and lookup via the GoTrue `/auth/v1` endpoints
//! - Row access via the PostgREST `/rest/v1` endpoints
//!
//! # Architecture
//!
//! The [`SupabaseClient`] is designed to be shared across the application (via `Arc`)
//! and handles all communication with Supabase. It includes:
//! - Configurable timeouts (5 seconds for requests)
//! - Retry logic with exponential backoff for the startup health probe
//! - Structured error handling with [`SupabaseError`]
//!
//! Typed table operations live in [`crate::db`]; this module only knows about
//! tables, equality filters and JSON rows.
//!
//! # Example
//!
//! ```rust,ignore
//! use nappio_server::supabase::SupabaseClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SupabaseClient::new(
//!         "https://your-project.supabase.co",
//!         "your-service-role-key",
//!     )?;
//!
//!     let user = client.get_user("user-jwt-token").await?;
//!     println!("User ID: {}", user.id);
//!
//!     let rows: Vec<serde_json::Value> = client
//!         .select("user_addresses", &[("user_id", &user.id)])
//!         .await?;
//!     println!("{} addresses", rows.len());
//!
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Default timeout for Supabase API requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of retry attempts for startup operations.
const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff (100ms).
const BASE_BACKOFF_MS: u64 = 100;

/// Maximum delay cap for exponential backoff (10 seconds).
const MAX_BACKOFF_MS: u64 = 10_000;

/// Maximum jitter to add to backoff delay (100ms).
const MAX_JITTER_MS: u64 = 100;

/// Postgres error code for unique constraint violations.
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Errors that can occur when interacting with Supabase.
///
/// These errors provide granular information about failures, allowing
/// callers to handle different error conditions appropriately (e.g.,
/// returning 401 for unauthorized vs 503 for timeout).
#[derive(Debug, Error)]
pub enum SupabaseError {
    /// The provided JWT is invalid or expired.
    ///
    /// Maps to HTTP 401 Unauthorized.
    #[error("unauthorized: invalid or expired JWT")]
    Unauthorized,

    /// The requested user or row does not exist.
    #[error("not found")]
    NotFound,

    /// The write collides with an existing record (duplicate email, unique key).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Supabase refused the request for a reason the caller can fix.
    #[error("rejected with status {status}: {message}")]
    Rejected {
        /// HTTP status returned by Supabase.
        status: u16,
        /// Human readable reason from the response body.
        message: String,
    },

    /// The request to Supabase timed out.
    ///
    /// Maps to HTTP 503 Service Unavailable.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Supabase is unreachable.
    ///
    /// Maps to HTTP 503 Service Unavailable.
    #[error("supabase unavailable: {0}")]
    Unavailable(String),

    /// Failed to parse the response from Supabase, or an unexpected status.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Client configuration error.
    #[error("client configuration error: {0}")]
    Configuration(String),

    /// All retry attempts have been exhausted.
    #[error("all {attempts} retry attempts failed: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last error encountered.
        last_error: String,
    },
}

/// A Supabase Auth user, reduced to the fields this service uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupabaseUser {
    /// The unique identifier for the user (UUID format).
    pub id: String,

    /// The user's email address, if available.
    pub email: Option<String>,

    /// First name stored in the user's metadata at sign-up.
    pub first_name: Option<String>,

    /// When the account was created.
    pub created_at: Option<DateTime<Utc>>,
}

/// User object as returned by the GoTrue endpoints.
#[derive(Debug, Deserialize)]
struct SupabaseUserResponse {
    id: String,
    email: Option<String>,
    #[serde(default)]
    user_metadata: UserMetadata,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    first_name: Option<String>,
}

impl From<SupabaseUserResponse> for SupabaseUser {
    fn from(response: SupabaseUserResponse) -> Self {
        Self {
            id: response.id,
            email: response.email,
            first_name: response.user_metadata.first_name,
            created_at: response.created_at,
        }
    }
}

/// Sign-up returns a session wrapping the user when email confirmation is
/// disabled, and the bare user otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    WithSession { user: SupabaseUserResponse },
    User(SupabaseUserResponse),
}

/// Error body shapes returned by GoTrue and PostgREST.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    code: Option<serde_json::Value>,
}

impl ErrorBody {
    fn text(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or(self.msg.as_deref())
            .or(self.error_description.as_deref())
    }

    fn is_unique_violation(&self) -> bool {
        matches!(&self.code, Some(serde_json::Value::String(code)) if code == PG_UNIQUE_VIOLATION)
    }
}

/// Client for interacting with Supabase services.
///
/// The client uses an internal `reqwest::Client` which is already
/// designed to be shared across threads. Wrap in `Arc` for sharing.
#[derive(Clone)]
pub struct SupabaseClient {
    /// The underlying HTTP client.
    http_client: Client,

    /// The base URL of the Supabase project (e.g., `https://xxx.supabase.co`).
    base_url: String,

    /// The service role key, sent as both `apikey` and bearer token for
    /// admin and table calls.
    service_key: String,
}

impl std::fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SupabaseClient {
    /// Creates a new Supabase client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The Supabase project URL (e.g., `https://xxx.supabase.co`)
    /// * `service_key` - The Supabase service role key
    ///
    /// # Errors
    ///
    /// Returns [`SupabaseError::Configuration`] if the HTTP client cannot be created.
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
    ) -> Result<Self, SupabaseError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let service_key = service_key.into();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                SupabaseError::Configuration(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            http_client,
            base_url,
            service_key,
        })
    }

    /// Registers a new user with email and password.
    ///
    /// `metadata` is stored as the user's `user_metadata` and is where the
    /// first name lives.
    ///
    /// # Errors
    ///
    /// - [`SupabaseError::Conflict`] - A user with this email already exists
    /// - [`SupabaseError::Rejected`] - Supabase refused the input (weak password, bad email)
    /// - [`SupabaseError::Timeout`] / [`SupabaseError::Unavailable`] - Supabase unreachable
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> Result<SupabaseUser, SupabaseError> {
        let url = format!("{}/auth/v1/signup", self.base_url);

        debug!(url = %url, "Registering user with Supabase");

        let request = self
            .http_client
            .post(&url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .json(&serde_json::json!({
                "email": email,
                "password": password,
                "data": metadata,
            }));

        let response = send(request).await?;
        let response = check_status(response, "sign up").await?;

        let body: SignUpResponse = response.json().await.map_err(|e| {
            SupabaseError::InvalidResponse(format!("failed to parse sign-up response: {e}"))
        })?;

        let user = match body {
            SignUpResponse::WithSession { user } | SignUpResponse::User(user) => user,
        };

        info!(user_id = %user.id, "User registered");

        Ok(user.into())
    }

    /// Resolves a user JWT to its user by calling `/auth/v1/user`.
    ///
    /// This approach is simpler than local validation and automatically handles
    /// token revocation.
    ///
    /// # Errors
    ///
    /// - [`SupabaseError::Unauthorized`] - The JWT is invalid or expired
    /// - [`SupabaseError::Timeout`] - The request timed out (5 second limit)
    /// - [`SupabaseError::Unavailable`] - Supabase is unreachable
    /// - [`SupabaseError::InvalidResponse`] - Failed to parse the response
    pub async fn get_user(&self, jwt: &str) -> Result<SupabaseUser, SupabaseError> {
        let url = format!("{}/auth/v1/user", self.base_url);

        debug!(url = %url, "Validating JWT with Supabase");

        let request = self
            .http_client
            .get(&url)
            .header("apikey", &self.service_key)
            .bearer_auth(jwt);

        let response = send(request).await?;

        // GoTrue answers 403 for malformed tokens and 401 for expired ones.
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            debug!("JWT validation failed: unauthorized");
            return Err(SupabaseError::Unauthorized);
        }

        let response = check_status(response, "get user").await?;

        let user: SupabaseUserResponse = response.json().await.map_err(|e| {
            SupabaseError::InvalidResponse(format!("failed to parse user response: {e}"))
        })?;

        debug!(user_id = %user.id, "JWT validated successfully");

        Ok(user.into())
    }

    /// Fetches a user by id through the admin API.
    ///
    /// # Errors
    ///
    /// - [`SupabaseError::NotFound`] - No user has this id
    /// - [`SupabaseError::Timeout`] / [`SupabaseError::Unavailable`] - Supabase unreachable
    pub async fn get_user_by_id(&self, user_id: &str) -> Result<SupabaseUser, SupabaseError> {
        let url = format!("{}/auth/v1/admin/users/{user_id}", self.base_url);

        let request = self
            .http_client
            .get(&url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key);

        let response = send(request).await?;
        let response = check_status(response, "get user by id").await?;

        let user: SupabaseUserResponse = response.json().await.map_err(|e| {
            SupabaseError::InvalidResponse(format!("failed to parse user response: {e}"))
        })?;

        Ok(user.into())
    }

    /// Inserts a row and returns the stored representation.
    pub async fn insert<T, R>(&self, table: &str, row: &T) -> Result<Vec<R>, SupabaseError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = self
            .table_request(reqwest::Method::POST, table, &[])
            .header("Prefer", "return=representation")
            .json(row);

        self.rows(request, table, "insert").await
    }

    /// Inserts a row, or merges it into the row that shares `on_conflict`.
    pub async fn upsert<T, R>(
        &self,
        table: &str,
        row: &T,
        on_conflict: &str,
    ) -> Result<Vec<R>, SupabaseError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = self
            .table_request(reqwest::Method::POST, table, &[])
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(row);

        self.rows(request, table, "upsert").await
    }

    /// Selects all rows matching every equality filter.
    pub async fn select<R>(&self, table: &str, filters: &[(&str, &str)]) -> Result<Vec<R>, SupabaseError>
    where
        R: DeserializeOwned,
    {
        let request = self
            .table_request(reqwest::Method::GET, table, filters)
            .query(&[("select", "*")]);

        self.rows(request, table, "select").await
    }

    /// Applies `patch` to every row matching the filters and returns the
    /// updated rows. An empty result means nothing matched.
    pub async fn update<T, R>(
        &self,
        table: &str,
        filters: &[(&str, &str)],
        patch: &T,
    ) -> Result<Vec<R>, SupabaseError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = self
            .table_request(reqwest::Method::PATCH, table, filters)
            .header("Prefer", "return=representation")
            .json(patch);

        self.rows(request, table, "update").await
    }

    /// Deletes every row matching the filters and returns the deleted rows.
    pub async fn delete<R>(&self, table: &str, filters: &[(&str, &str)]) -> Result<Vec<R>, SupabaseError>
    where
        R: DeserializeOwned,
    {
        let request = self
            .table_request(reqwest::Method::DELETE, table, filters)
            .header("Prefer", "return=representation");

        self.rows(request, table, "delete").await
    }

    /// Probes the auth health endpoint once.
    pub async fn check_health(&self) -> Result<(), SupabaseError> {
        let url = format!("{}/auth/v1/health", self.base_url);

        let request = self
            .http_client
            .get(&url)
            .header("apikey", &self.service_key);

        let response = send(request).await?;
        check_status(response, "health check").await?;
        Ok(())
    }

    /// Probes Supabase with retry logic for startup.
    ///
    /// This method implements exponential backoff with jitter. It will retry
    /// up to 5 times before failing, with delays calculated as:
    ///
    /// ```text
    /// delay = min(2^attempt * 100ms + random(0, 100ms), 10s)
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`SupabaseError::RetriesExhausted`] if all retry attempts fail.
    /// The server should exit with an error if this occurs during startup.
    pub async fn check_health_with_retry(&self) -> Result<(), SupabaseError> {
        let mut last_error = String::new();

        for attempt in 0..MAX_RETRY_ATTEMPTS {
            match self.check_health().await {
                Ok(()) => {
                    if attempt > 0 {
                        info!(attempt = attempt + 1, "Supabase reachable after retry");
                    }
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();

                    if attempt < MAX_RETRY_ATTEMPTS - 1 {
                        let delay = calculate_backoff_delay(attempt);
                        warn!(
                            attempt = attempt + 1,
                            max_attempts = MAX_RETRY_ATTEMPTS,
                            delay_ms = delay.as_millis(),
                            error = %e,
                            "Supabase health check failed, retrying"
                        );
                        sleep(delay).await;
                    } else {
                        error!(
                            attempts = MAX_RETRY_ATTEMPTS,
                            error = %e,
                            "Supabase health check failed, no more retries"
                        );
                    }
                }
            }
        }

        Err(SupabaseError::RetriesExhausted {
            attempts: MAX_RETRY_ATTEMPTS,
            last_error,
        })
    }

    /// Returns the base URL of the Supabase project.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_request(
        &self,
        method: reqwest::Method,
        table: &str,
        filters: &[(&str, &str)],
    ) -> RequestBuilder {
        let url = format!("{}/rest/v1/{table}", self.base_url);
        let filters: Vec<(&str, String)> = filters
            .iter()
            .map(|(column, value)| (*column, format!("eq.{value}")))
            .collect();

        self.http_client
            .request(method, url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .query(&filters)
    }

    async fn rows<R>(
        &self,
        request: RequestBuilder,
        table: &str,
        operation: &str,
    ) -> Result<Vec<R>, SupabaseError>
    where
        R: DeserializeOwned,
    {
        let response = send(request).await?;
        let response = check_status(response, operation).await?;

        let rows: Vec<R> = response.json().await.map_err(|e| {
            SupabaseError::InvalidResponse(format!("failed to parse {table} rows: {e}"))
        })?;

        debug!(table = %table, operation = %operation, rows = rows.len(), "Table request completed");

        Ok(rows)
    }
}

/// Sends a request, classifying transport failures.
async fn send(request: RequestBuilder) -> Result<Response, SupabaseError> {
    request.send().await.map_err(|e| {
        if e.is_timeout() {
            SupabaseError::Timeout(REQUEST_TIMEOUT)
        } else if e.is_connect() {
            SupabaseError::Unavailable(format!("connection failed: {e}"))
        } else {
            SupabaseError::Unavailable(format!("request failed: {e}"))
        }
    })
}

/// Passes successful responses through and turns the rest into errors.
async fn check_status(response: Response, operation: &str) -> Result<Response, SupabaseError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let raw = response.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&raw).unwrap_or_default();
    let message = body.text().unwrap_or(raw.as_str()).to_string();

    if status == StatusCode::NOT_FOUND {
        return Err(SupabaseError::NotFound);
    }

    if status == StatusCode::CONFLICT
        || body.is_unique_violation()
        || message.to_lowercase().contains("already registered")
    {
        return Err(SupabaseError::Conflict(message));
    }

    if status.is_client_error() {
        warn!(status = %status, operation = %operation, message = %message, "Supabase rejected request");
        return Err(SupabaseError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    error!(status = %status, operation = %operation, body = %raw, "Unexpected response from Supabase");
    Err(SupabaseError::InvalidResponse(format!(
        "unexpected status {status}: {message}"
    )))
}

/// Calculates the backoff delay for a given retry attempt.
///
/// Uses exponential backoff with jitter:
/// `delay = min(2^attempt * 100ms + random(0, 100ms), 10s)`
fn calculate_backoff_delay(attempt: u32) -> Duration {
    let exponential_ms = BASE_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt));
    let jitter_ms = rand::rng().random_range(0..=MAX_JITTER_MS);
    let total_ms = exponential_ms.saturating_add(jitter_ms).min(MAX_BACKOFF_MS);
    Duration::from_millis(total_ms)
}
