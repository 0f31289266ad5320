//! Stripe client for customers, checkout sessions, subscriptions and prices.
//!
//! Requests are form-encoded and authenticated with the secret key as a
//! bearer token. Failed calls are classified from Stripe's error envelope
//! (`{"error": {"type", "code", "message"}}`) into [`StripeError`].

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Default timeout for Stripe API requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when calling Stripe.
#[derive(Debug, Error)]
pub enum StripeError {
    /// Stripe refused the request (bad price id, declined card, ...).
    #[error("stripe rejected request with status {status}: {message}")]
    Api {
        status: u16,
        /// Stripe's error `type`, e.g. `invalid_request_error`.
        kind: Option<String>,
        /// Stripe's error `code`, e.g. `resource_missing`.
        code: Option<String>,
        message: String,
    },

    /// The referenced Stripe object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Stripe is unreachable, rate limiting, or failing on its side.
    #[error("stripe unavailable: {0}")]
    Unavailable(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("client configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorDetails,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetails {
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
    message: Option<String>,
    param: Option<String>,
}

/// A Stripe Checkout session.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    /// Hosted payment page; only present while the session is open.
    pub url: Option<String>,
    pub customer: Option<String>,
    /// Subscription created by the session once it completes.
    pub subscription: Option<String>,
    /// `open`, `complete` or `expired`.
    pub status: Option<String>,
    pub customer_details: Option<CustomerDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerDetails {
    pub email: Option<String>,
}

impl CheckoutSession {
    pub fn is_complete(&self) -> bool {
        self.status.as_deref() == Some("complete")
    }

    pub fn customer_email(&self) -> Option<&str> {
        self.customer_details.as_ref()?.email.as_deref()
    }
}

/// A Stripe subscription, reduced to what gets recorded locally.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: String,
    pub status: String,
    pub created: i64,
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub items: SubscriptionItems,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    pub price: ItemPrice,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemPrice {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StripeSubscription {
    fn first_item(&self) -> Option<&SubscriptionItem> {
        self.items.data.first()
    }

    pub fn price_id(&self) -> Option<&str> {
        self.first_item().map(|item| item.price.id.as_str())
    }

    /// Plan identifier carried in the price's `plan_id` metadata.
    pub fn plan_id(&self) -> Option<&str> {
        self.first_item()?.price.metadata.get("plan_id").map(String::as_str)
    }

    /// Start of the current billing period. Newer API versions only carry it
    /// on the subscription item.
    pub fn period_start(&self) -> Option<DateTime<Utc>> {
        self.current_period_start
            .or_else(|| self.first_item()?.current_period_start)
            .and_then(timestamp)
    }

    pub fn period_end(&self) -> Option<DateTime<Utc>> {
        self.current_period_end
            .or_else(|| self.first_item()?.current_period_end)
            .and_then(timestamp)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        timestamp(self.created)
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.canceled_at.and_then(timestamp)
    }
}

/// A Stripe price, retrieved with its product expanded.
#[derive(Debug, Clone, Deserialize)]
pub struct StripePrice {
    pub id: String,
    /// Amount in the currency's minor unit.
    pub unit_amount: Option<i64>,
    pub currency: String,
    pub product: ProductRef,
}

/// A price's product: the full object when expanded, otherwise its id.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProductRef {
    Expanded(StripeProduct),
    Id(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeProduct {
    pub id: String,
    pub name: String,
}

impl StripePrice {
    pub fn product_name(&self) -> Option<&str> {
        match &self.product {
            ProductRef::Expanded(product) => Some(&product.name),
            ProductRef::Id(_) => None,
        }
    }

    /// Amount in major currency units.
    pub fn amount(&self) -> Option<f64> {
        self.unit_amount.map(|minor| minor as f64 / 100.0)
    }

    /// Human readable price such as `GBP 12.50`.
    pub fn display_amount(&self) -> Option<String> {
        self.amount()
            .map(|amount| format!("{} {amount:.2}", self.currency.to_uppercase()))
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// Client for the Stripe REST API.
#[derive(Clone)]
pub struct StripeClient {
    http_client: Client,
    base_url: String,
    secret_key: String,
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl StripeClient {
    /// Creates a client for `base_url` (normally `https://api.stripe.com`).
    ///
    /// # Errors
    ///
    /// Returns [`StripeError::Configuration`] if the HTTP client cannot be created.
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Result<Self, StripeError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StripeError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    /// Creates a customer tagged with the Supabase user id and returns its id.
    pub async fn create_customer(&self, email: &str, user_id: &str) -> Result<String, StripeError> {
        #[derive(Deserialize)]
        struct CustomerResp {
            id: String,
        }

        let form = [("email", email), ("metadata[user_id]", user_id)];
        let request = self.request(reqwest::Method::POST, "/v1/customers").form(&form);
        let customer: CustomerResp = self.call(request, "create customer").await?;

        debug!(customer_id = %customer.id, "Created Stripe customer");
        Ok(customer.id)
    }

    /// Creates a subscription-mode checkout session for one unit of `price_id`.
    pub async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        user_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession, StripeError> {
        let form = [
            ("mode", "subscription"),
            ("customer", customer_id),
            ("line_items[0][price]", price_id),
            ("line_items[0][quantity]", "1"),
            ("success_url", success_url),
            ("cancel_url", cancel_url),
            ("metadata[user_id]", user_id),
        ];

        let request = self
            .request(reqwest::Method::POST, "/v1/checkout/sessions")
            .form(&form);
        self.call(request, "create checkout session").await
    }

    pub async fn retrieve_checkout_session(&self, session_id: &str) -> Result<CheckoutSession, StripeError> {
        let request = self.request(
            reqwest::Method::GET,
            &format!("/v1/checkout/sessions/{session_id}"),
        );
        self.call(request, "retrieve checkout session").await
    }

    pub async fn retrieve_subscription(&self, subscription_id: &str) -> Result<StripeSubscription, StripeError> {
        let request = self.request(
            reqwest::Method::GET,
            &format!("/v1/subscriptions/{subscription_id}"),
        );
        self.call(request, "retrieve subscription").await
    }

    /// Retrieves a price with its product expanded, so the plan name comes
    /// back in one call.
    pub async fn retrieve_price(&self, price_id: &str) -> Result<StripePrice, StripeError> {
        let request = self
            .request(reqwest::Method::GET, &format!("/v1/prices/{price_id}"))
            .query(&[("expand[]", "product")]);
        self.call(request, "retrieve price").await
    }

    /// Cancels a subscription.
    ///
    /// With `at_period_end` the subscription stays active until the end of
    /// the paid period; otherwise it is cancelled immediately.
    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<StripeSubscription, StripeError> {
        let path = format!("/v1/subscriptions/{subscription_id}");
        let request = if at_period_end {
            self.request(reqwest::Method::POST, &path)
                .form(&[("cancel_at_period_end", "true")])
        } else {
            self.request(reqwest::Method::DELETE, &path)
        };

        self.call(request, "cancel subscription").await
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.http_client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.secret_key)
    }

    async fn call<R>(&self, request: RequestBuilder, context: &str) -> Result<R, StripeError>
    where
        R: DeserializeOwned,
    {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StripeError::Timeout(REQUEST_TIMEOUT)
            } else {
                StripeError::Unavailable(format!("request failed: {e}"))
            }
        })?;

        let response = ensure_success(response, context).await?;
        response
            .json()
            .await
            .map_err(|e| StripeError::InvalidResponse(format!("{context}: {e}")))
    }
}

/// Passes successful responses through and classifies the rest.
async fn ensure_success(response: Response, context: &str) -> Result<Response, StripeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let request_id = response
        .headers()
        .get("request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();

    let details = serde_json::from_str::<StripeErrorEnvelope>(&body)
        .map(|envelope| envelope.error)
        .ok();
    let message = details
        .as_ref()
        .and_then(|d| d.message.clone())
        .unwrap_or_else(|| format!("{context} failed with status {status}"));

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        error!(
            status = %status,
            stripe_request_id = ?request_id,
            context = %context,
            "Stripe unavailable"
        );
        return Err(StripeError::Unavailable(format!("{context}: status {status}")));
    }

    let Some(details) = details else {
        error!(
            status = %status,
            stripe_request_id = ?request_id,
            response_body = %body,
            context = %context,
            "Unexpected response from Stripe"
        );
        return Err(StripeError::InvalidResponse(format!("{context}: status {status}")));
    };

    warn!(
        status = %status,
        stripe_request_id = ?request_id,
        stripe_error_type = ?details.kind,
        stripe_error_code = ?details.code,
        stripe_error_param = ?details.param,
        context = %context,
        "Stripe request failed"
    );

    // `resource_missing` on a 400 refers to a request parameter, not the addressed object.
    if status == StatusCode::NOT_FOUND {
        return Err(StripeError::NotFound(message));
    }

    if status == StatusCode::UNAUTHORIZED {
        // A bad secret key is our misconfiguration, not the caller's mistake.
        return Err(StripeError::Configuration(message));
    }

    Err(StripeError::Api {
        status: status.as_u16(),
        kind: details.kind,
        code: details.code,
        message,
    })
}
