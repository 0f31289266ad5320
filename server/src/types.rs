//! Request and response bodies for the HTTP API.
//!
//! Requests are validated after deserialization with `validate()`, which
//! normalizes what it checks (trimmed names, lowercased emails) and reports
//! the first problem found.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::supabase::SupabaseUser;

/// Minimum password length accepted by Supabase Auth's default policy.
pub const MIN_PASSWORD_LEN: usize = 6;

const MAX_NAME_LEN: usize = 100;

/// Checks the shape of an email address: `local@domain.tld`, no whitespace.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };

    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
}

fn normalize_email(email: &mut String) -> Result<(), ApiError> {
    *email = email.trim().to_lowercase();
    if !is_valid_email(email) {
        return Err(ApiError::validation("email is not a valid address"));
    }
    Ok(())
}

fn required(field: &str, value: &mut String) -> Result<(), ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation(format!("{field} is required")));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(ApiError::validation(format!(
            "{field} must be at most {MAX_NAME_LEN} characters"
        )));
    }
    *value = trimmed.to_string();
    Ok(())
}

/// Trims an optional field, turning blank values into `None`.
fn optional(value: &mut Option<String>) {
    *value = value
        .take()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
}

// ============================================================================
// Requests
// ============================================================================

/// Body of `POST /signup`.
#[derive(Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
}

// Hand-written so the password never ends up in a log line.
impl std::fmt::Debug for SignUpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignUpRequest")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("first_name", &self.first_name)
            .finish()
    }
}

impl SignUpRequest {
    pub fn validate(&mut self) -> Result<(), ApiError> {
        normalize_email(&mut self.email)?;
        required("first_name", &mut self.first_name)?;
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ApiError::validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        Ok(())
    }
}

/// Body of `POST /newsletter/subscribe`.
#[derive(Debug, Deserialize)]
pub struct NewsletterSubscribeRequest {
    pub first_name: String,
    pub email: String,
    #[serde(default)]
    pub postcode: Option<String>,
}

impl NewsletterSubscribeRequest {
    pub fn validate(&mut self) -> Result<(), ApiError> {
        required("first_name", &mut self.first_name)?;
        normalize_email(&mut self.email)?;
        optional(&mut self.postcode);

        // Outward code only, e.g. "SW1" or "N16".
        if let Some(postcode) = &self.postcode {
            let len = postcode.chars().count();
            if !(3..=4).contains(&len) {
                return Err(ApiError::validation("postcode must be 3 to 4 characters"));
            }
        }
        Ok(())
    }
}

/// Body of `POST /newsletter/verify`.
#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub email: String,
}

impl VerifyEmailRequest {
    pub fn validate(&mut self) -> Result<(), ApiError> {
        normalize_email(&mut self.email)
    }
}

/// Body of `POST /subscribe`.
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    #[serde(alias = "priceId")]
    pub price_id: String,
}

impl CheckoutRequest {
    pub fn validate(&mut self) -> Result<(), ApiError> {
        required("price_id", &mut self.price_id)
    }
}

/// Body of `POST /subscriptions/confirm`.
#[derive(Debug, Deserialize)]
pub struct ConfirmSubscriptionRequest {
    pub session_id: String,
}

impl ConfirmSubscriptionRequest {
    pub fn validate(&mut self) -> Result<(), ApiError> {
        required("session_id", &mut self.session_id)
    }
}

/// Body of `POST /unsubscribe`.
#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    /// Stripe subscription id.
    pub subscription_id: String,
    /// Keep the subscription running until the paid period ends.
    #[serde(default)]
    pub at_period_end: bool,
}

impl UnsubscribeRequest {
    pub fn validate(&mut self) -> Result<(), ApiError> {
        required("subscription_id", &mut self.subscription_id)
    }
}

/// Body of `POST /subscriptions/address`.
#[derive(Debug, Deserialize)]
pub struct AssignAddressRequest {
    /// Row id of the subscription in `user_subscriptions`.
    pub subscription_id: Uuid,
    pub address_id: Uuid,
}

/// Body of `POST /addresses`.
#[derive(Debug, Deserialize)]
pub struct AddAddressRequest {
    pub address_line_1: String,
    #[serde(default)]
    pub address_line_2: Option<String>,
    pub city: String,
    pub postcode: String,
    pub country: String,
    #[serde(default)]
    pub address_notes: Option<String>,
}

impl AddAddressRequest {
    pub fn validate(&mut self) -> Result<(), ApiError> {
        required("address_line_1", &mut self.address_line_1)?;
        required("city", &mut self.city)?;
        required("postcode", &mut self.postcode)?;
        required("country", &mut self.country)?;
        optional(&mut self.address_line_2);
        optional(&mut self.address_notes);
        Ok(())
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Response of `GET /`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RootResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Response of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
}

/// The authenticated user as returned by `/signup` and `/user`.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<SupabaseUser> for UserResponse {
    fn from(user: SupabaseUser) -> Self {
        Self {
            id: user.id,
            email: user.email,
            first_name: user.first_name,
            created_at: user.created_at,
        }
    }
}

/// Response of `POST /subscribe`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub checkout_url: String,
    pub session_id: String,
}

/// Response of `POST /subscriptions/confirm`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubscriptionConfirmation {
    pub plan_name: String,
    pub customer_email: Option<String>,
}

/// Response of `POST /unsubscribe`.
#[derive(Debug, Serialize, Deserialize)]
pub struct UnsubscribeResponse {
    pub subscription_id: String,
    pub status: String,
    pub cancelled_at: DateTime<Utc>,
    /// True when the subscription stays active until the paid period ends.
    pub cancel_at_period_end: bool,
}

/// One entry of `GET /subscriptions`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    pub id: Option<Uuid>,
    pub plan_name: String,
    pub status: String,
    pub monthly_cost: f64,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub subscription_id: String,
    pub next_payment_date: Option<DateTime<Utc>>,
    pub address_id: Option<Uuid>,
}

/// Response of `POST /newsletter/verify`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyEmailResponse {
    pub verified: bool,
    pub message: String,
}
