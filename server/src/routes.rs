//! HTTP route handlers for the Nappio server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /` and `GET /health` - Service information and liveness
//! - `POST /signup`, `GET /user` - Accounts
//! - `POST /subscribe`, `POST /subscriptions/confirm`, `POST /unsubscribe`,
//!   `GET /subscriptions`, `POST /subscriptions/address` - Subscriptions
//! - `POST /newsletter/subscribe`, `POST /newsletter/verify` - Newsletter
//! - `GET /addresses`, `POST /addresses`, `DELETE /addresses/{id}` - Delivery addresses
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - The Supabase, Stripe and SendGrid clients
//! - Server start time for uptime reporting
//!
//! Routes marked as authenticated take an [`AuthUser`], which resolves the
//! bearer JWT through Supabase before the handler runs. Handlers return
//! [`ApiError`] on failure, rendered as `{"error": ..., "code": ...}`.
//!
//! # Example
//!
//! ```rust,no_run
//! use nappio_server::config::Config;
//! use nappio_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config).expect("failed to build clients");
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, FromRef, FromRequest, Path, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use reqwest::Url;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::Instant;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::config::Config;
use crate::db::{self, CheckoutSessionRecord, NewsletterSubscriber, UserAddress, UserSubscription};
use crate::email::{EmailClient, EmailError, EmailMessage, Mailbox, Mailer};
use crate::error::{ApiError, Provider, Result};
use crate::stripe::{StripeClient, StripeError};
use crate::supabase::{SupabaseClient, SupabaseError};
use crate::types::{
    AddAddressRequest, AssignAddressRequest, CheckoutRequest, CheckoutResponse,
    ConfirmSubscriptionRequest, HealthResponse, NewsletterSubscribeRequest, RootResponse,
    SignUpRequest, SubscriptionConfirmation, SubscriptionDetails, UnsubscribeRequest,
    UnsubscribeResponse, UserResponse, VerifyEmailRequest, VerifyEmailResponse,
};

// ============================================================================
// Constants
// ============================================================================

/// Maximum request body size (64 KiB).
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Checkout session status recorded once the subscription is stored.
const SESSION_COMPLETE: &str = "complete";

// ============================================================================
// Application State
// ============================================================================

/// Errors that can occur while building the application state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("supabase client: {0}")]
    Supabase(#[from] SupabaseError),

    #[error("stripe client: {0}")]
    Stripe(#[from] StripeError),

    #[error("email client: {0}")]
    Email(#[from] EmailError),
}

/// Shared application state for all route handlers.
///
/// Cloned for each request; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Identity and database provider.
    pub supabase: Arc<SupabaseClient>,

    /// Payment processor.
    pub stripe: Arc<StripeClient>,

    /// Background email sender.
    pub mailer: Mailer,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Builds the provider clients from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if an HTTP client cannot be created.
    pub fn new(config: Config) -> std::result::Result<Self, StateError> {
        let supabase = SupabaseClient::new(&config.supabase_url, &config.supabase_key)?;
        let stripe = StripeClient::new(&config.stripe_api_url, &config.stripe_secret_key)?;
        let email = EmailClient::new(
            &config.sendgrid_api_url,
            &config.sendgrid_api_key,
            Mailbox::new(&config.email_from, Some(config.service_name.as_str())),
        )?;

        Ok(Self {
            config: Arc::new(config),
            supabase: Arc::new(supabase),
            stripe: Arc::new(stripe),
            mailer: Mailer::new(email),
            start_time: Instant::now(),
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("supabase", &self.supabase)
            .field("stripe", &self.stripe)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

impl FromRef<AppState> for Arc<SupabaseClient> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.supabase)
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// Every route is wrapped in request tracing, CORS for the configured
/// origins, and a 64 KiB body limit.
pub fn create_router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE));

    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/signup", post(post_signup))
        .route("/user", get(get_user))
        .route("/subscribe", post(post_subscribe))
        .route("/subscriptions", get(get_subscriptions))
        .route("/subscriptions/confirm", post(post_confirm_subscription))
        .route("/subscriptions/address", post(post_subscription_address))
        .route("/unsubscribe", post(post_unsubscribe))
        .route("/newsletter/subscribe", post(post_newsletter_subscribe))
        .route("/newsletter/verify", post(post_newsletter_verify))
        .route("/addresses", get(get_addresses).post(post_address))
        .route("/addresses/{id}", delete(delete_address))
        .layer(middleware)
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins()
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring CORS origin that is not a valid header value");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}

// ============================================================================
// Extractors
// ============================================================================

/// JSON body extractor whose rejections render as [`ApiError`].
struct ApiJson<T>(T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

// ============================================================================
// GET / and GET /health
// ============================================================================

async fn get_root(State(state): State<AppState>) -> Json<RootResponse> {
    Json(RootResponse {
        status: "ok".to_string(),
        service: format!("{} API", state.config.service_name),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /health - Liveness check. Does not call any provider.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Accounts
// ============================================================================

/// POST /signup - Create an account.
///
/// # Responses
///
/// - `201 Created` - Account created, welcome email queued
/// - `400 Bad Request` - Invalid input, or Supabase refused it (weak password)
/// - `409 Conflict` - An account with this email already exists
async fn post_signup(
    State(state): State<AppState>,
    ApiJson(mut request): ApiJson<SignUpRequest>,
) -> Result<impl IntoResponse> {
    request.validate()?;

    let metadata = serde_json::json!({ "first_name": request.first_name });
    let user = state
        .supabase
        .sign_up(&request.email, &request.password, metadata)
        .await
        .map_err(|err| match err {
            SupabaseError::Conflict(_) => {
                ApiError::Conflict("an account with this email already exists".to_string())
            }
            other => other.into(),
        })?;

    state.mailer.dispatch(EmailMessage::welcome(
        &state.config.service_name,
        &request.email,
        &request.first_name,
    ));

    info!(user_id = %user.id, "Account created");
    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

/// GET /user - The authenticated user.
async fn get_user(AuthUser(user): AuthUser) -> Json<UserResponse> {
    Json(UserResponse::from(user))
}

// ============================================================================
// Subscriptions
// ============================================================================

/// POST /subscribe - Start a Stripe checkout for a price.
///
/// Reuses the Stripe customer from an earlier checkout when there is one.
/// The session is recorded in `checkout_sessions` so that confirmation can
/// check who started it.
async fn post_subscribe(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(mut request): ApiJson<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>> {
    request.validate()?;
    let user_id = user.id();
    let email = user
        .0
        .email
        .as_deref()
        .ok_or_else(|| ApiError::validation("account has no email address"))?;

    let customer_id = match db::find_customer_for_user(&state.supabase, user_id).await? {
        Some(customer_id) => customer_id,
        None => state.stripe.create_customer(email, user_id).await?,
    };

    let frontend = &state.config.frontend_url;
    let success_url = format!("{frontend}/success?session_id={{CHECKOUT_SESSION_ID}}");
    let cancel_url = format!("{frontend}/cancel");

    let session = state
        .stripe
        .create_checkout_session(&customer_id, &request.price_id, user_id, &success_url, &cancel_url)
        .await?;

    let checkout_url = session.url.clone().ok_or_else(|| ApiError::BadGateway {
        provider: Provider::Stripe,
        detail: format!("checkout session {} has no url", session.id),
    })?;

    db::insert_checkout_session(
        &state.supabase,
        &CheckoutSessionRecord {
            session_id: session.id.clone(),
            user_id: user_id.to_string(),
            customer_id,
            price_id: request.price_id,
            status: session.status.clone(),
        },
    )
    .await?;

    info!(user_id = %user_id, session_id = %session.id, "Checkout session created");
    Ok(Json(CheckoutResponse {
        checkout_url,
        session_id: session.id,
    }))
}

/// POST /subscriptions/confirm - Record the subscription behind a completed checkout.
///
/// Safe to call more than once for the same session: the subscription row
/// is upserted and the confirmation email only goes out the first time.
///
/// # Responses
///
/// - `200 OK` - Subscription recorded; plan name and customer email returned
/// - `404 Not Found` - No such session for this user
/// - `409 Conflict` - The checkout has not been completed
async fn post_confirm_subscription(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(mut request): ApiJson<ConfirmSubscriptionRequest>,
) -> Result<Json<SubscriptionConfirmation>> {
    request.validate()?;
    let user_id = user.id();

    let record = db::find_checkout_session(&state.supabase, &request.session_id, user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("checkout session not found"))?;

    let session = state
        .stripe
        .retrieve_checkout_session(&request.session_id)
        .await?;
    if !session.is_complete() {
        return Err(ApiError::Conflict(
            "checkout session has not been completed".to_string(),
        ));
    }

    let subscription_id = session.subscription.as_deref().ok_or_else(|| ApiError::BadGateway {
        provider: Provider::Stripe,
        detail: format!("completed session {} has no subscription", session.id),
    })?;
    let subscription = state.stripe.retrieve_subscription(subscription_id).await?;

    let price_id = subscription.price_id().unwrap_or(&record.price_id).to_string();
    let price = state.stripe.retrieve_price(&price_id).await?;
    let plan_name = price
        .product_name()
        .ok_or_else(|| ApiError::BadGateway {
            provider: Provider::Stripe,
            detail: format!("price {price_id} returned without its product"),
        })?
        .to_string();

    db::upsert_user_subscription(
        &state.supabase,
        &UserSubscription {
            id: None,
            user_id: user_id.to_string(),
            plan_id: subscription.plan_id().map(str::to_string),
            subscription_id: subscription.id.clone(),
            price_id,
            customer_id: subscription.customer.clone(),
            status: subscription.status.clone(),
            subscribed_at: subscription.created_at(),
            last_payment_date: subscription.period_start(),
            next_payment_date: subscription.period_end(),
            cancelled_at: subscription.cancelled_at(),
            address_id: None,
        },
    )
    .await?;

    let first_confirmation = record.status.as_deref() != Some(SESSION_COMPLETE);
    if first_confirmation {
        db::update_checkout_session(&state.supabase, &session.id, SESSION_COMPLETE).await?;
    }

    let customer_email = session
        .customer_email()
        .map(str::to_string)
        .or_else(|| user.0.email.clone());

    if first_confirmation {
        // The account record carries the name given at signup.
        let account = match state.supabase.get_user_by_id(&record.user_id).await {
            Ok(account) => account,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "Falling back to token user for email");
                user.0.clone()
            }
        };

        if let Some(to) = customer_email.as_deref().or(account.email.as_deref()) {
            state.mailer.dispatch(EmailMessage::new_subscription(
                &state.config.service_name,
                to,
                account.first_name.as_deref().unwrap_or("there"),
                &plan_name,
                price.display_amount().as_deref(),
            ));
        }
    }

    info!(
        user_id = %user_id,
        subscription_id = %subscription.id,
        status = %subscription.status,
        "Subscription recorded"
    );

    Ok(Json(SubscriptionConfirmation {
        plan_name,
        customer_email,
    }))
}

/// POST /unsubscribe - Cancel one of the caller's subscriptions.
///
/// The row is kept, with the provider status and cancellation time.
async fn post_unsubscribe(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(mut request): ApiJson<UnsubscribeRequest>,
) -> Result<Json<UnsubscribeResponse>> {
    request.validate()?;
    let user_id = user.id();

    let existing = db::find_user_subscription(&state.supabase, user_id, &request.subscription_id)
        .await?
        .ok_or_else(|| ApiError::not_found("subscription not found"))?;
    if existing.cancelled_at.is_some() {
        return Err(ApiError::Conflict(
            "subscription is already cancelled".to_string(),
        ));
    }

    let cancelled = state
        .stripe
        .cancel_subscription(&request.subscription_id, request.at_period_end)
        .await?;

    let cancelled_at = Utc::now();
    db::cancel_user_subscription(
        &state.supabase,
        &request.subscription_id,
        &cancelled.status,
        cancelled_at,
    )
    .await?;

    if let Some(to) = user.0.email.as_deref() {
        state.mailer.dispatch(EmailMessage::subscription_cancelled(
            &state.config.service_name,
            to,
            user.0.first_name.as_deref().unwrap_or("there"),
            request.at_period_end,
        ));
    }

    info!(
        user_id = %user_id,
        subscription_id = %request.subscription_id,
        at_period_end = request.at_period_end,
        "Subscription cancelled"
    );

    Ok(Json(UnsubscribeResponse {
        subscription_id: request.subscription_id,
        status: cancelled.status,
        cancelled_at,
        cancel_at_period_end: cancelled.cancel_at_period_end,
    }))
}

/// GET /subscriptions - The caller's subscriptions with plan name and price.
///
/// A subscription whose price cannot be read from Stripe is left out rather
/// than failing the whole listing.
async fn get_subscriptions(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<SubscriptionDetails>>> {
    let rows = db::list_user_subscriptions(&state.supabase, user.id()).await?;
    let mut details = Vec::with_capacity(rows.len());

    for row in rows {
        let price = match state.stripe.retrieve_price(&row.price_id).await {
            Ok(price) => price,
            Err(err) => {
                warn!(
                    subscription_id = %row.subscription_id,
                    error = %err,
                    "Skipping subscription with unreadable price"
                );
                continue;
            }
        };

        let Some(plan_name) = price.product_name() else {
            warn!(subscription_id = %row.subscription_id, "Skipping subscription without product");
            continue;
        };

        // Tiered and metered prices have no flat monthly amount.
        let Some(monthly_cost) = price.amount() else {
            warn!(
                subscription_id = %row.subscription_id,
                price_id = %price.id,
                "Skipping subscription without unit amount"
            );
            continue;
        };

        details.push(SubscriptionDetails {
            id: row.id,
            plan_name: plan_name.to_string(),
            status: row.status,
            monthly_cost,
            start_date: row.subscribed_at,
            end_date: row.cancelled_at,
            subscription_id: row.subscription_id,
            next_payment_date: row.next_payment_date,
            address_id: row.address_id,
        });
    }

    debug!(user_id = %user.id(), count = details.len(), "Listed subscriptions");
    Ok(Json(details))
}

/// POST /subscriptions/address - Deliver a subscription to one of the caller's addresses.
async fn post_subscription_address(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(request): ApiJson<AssignAddressRequest>,
) -> Result<Json<UserSubscription>> {
    let updated = db::assign_subscription_address(
        &state.supabase,
        user.id(),
        request.subscription_id,
        request.address_id,
    )
    .await?
    .ok_or_else(|| ApiError::not_found("subscription or address not found"))?;

    info!(
        user_id = %user.id(),
        subscription_row = %request.subscription_id,
        address_id = %request.address_id,
        "Address assigned to subscription"
    );
    Ok(Json(updated))
}

// ============================================================================
// Newsletter
// ============================================================================

/// Builds `{frontend}/confirm-email?email=...` with the address query-encoded.
fn confirmation_link(frontend_url: &str, email: &str) -> Result<String> {
    let base = Url::parse(&format!("{}/", frontend_url.trim_end_matches('/')))
        .map_err(|e| ApiError::internal(format!("invalid frontend url: {e}")))?;
    let mut link = base
        .join("confirm-email")
        .map_err(|e| ApiError::internal(format!("invalid confirmation link: {e}")))?;
    link.query_pairs_mut().append_pair("email", email);
    Ok(link.into())
}

/// POST /newsletter/subscribe - Add a newsletter subscriber and ask them to confirm.
async fn post_newsletter_subscribe(
    State(state): State<AppState>,
    ApiJson(mut request): ApiJson<NewsletterSubscribeRequest>,
) -> Result<Json<NewsletterSubscriber>> {
    request.validate()?;

    let subscriber = db::insert_newsletter_subscriber(
        &state.supabase,
        &request.first_name,
        &request.email,
        request.postcode.as_deref(),
    )
    .await
    .map_err(|err| match err {
        SupabaseError::Conflict(_) => ApiError::Conflict("email already subscribed".to_string()),
        other => other.into(),
    })?;

    let link = confirmation_link(&state.config.frontend_url, &subscriber.email)?;
    state.mailer.dispatch(EmailMessage::confirmation(
        &state.config.service_name,
        &subscriber.email,
        &subscriber.first_name,
        &link,
    ));

    info!(subscriber_id = ?subscriber.id, "Newsletter subscriber added");
    Ok(Json(subscriber))
}

/// POST /newsletter/verify - Mark a subscriber's email as confirmed.
async fn post_newsletter_verify(
    State(state): State<AppState>,
    ApiJson(mut request): ApiJson<VerifyEmailRequest>,
) -> Result<Json<VerifyEmailResponse>> {
    request.validate()?;

    if !db::verify_newsletter_subscriber(&state.supabase, &request.email).await? {
        return Err(ApiError::not_found("subscriber not found"));
    }

    info!("Newsletter subscriber verified");
    Ok(Json(VerifyEmailResponse {
        verified: true,
        message: "email verified".to_string(),
    }))
}

// ============================================================================
// Addresses
// ============================================================================

async fn get_addresses(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<UserAddress>>> {
    let addresses = db::list_user_addresses(&state.supabase, user.id()).await?;
    Ok(Json(addresses))
}

async fn post_address(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(mut request): ApiJson<AddAddressRequest>,
) -> Result<impl IntoResponse> {
    request.validate()?;

    let address = db::add_user_address(
        &state.supabase,
        &UserAddress {
            id: None,
            user_id: user.id().to_string(),
            address_line_1: request.address_line_1,
            address_line_2: request.address_line_2,
            city: request.city,
            postcode: request.postcode,
            country: request.country,
            address_notes: request.address_notes,
        },
    )
    .await?;

    info!(user_id = %user.id(), address_id = ?address.id, "Address added");
    Ok((StatusCode::CREATED, Json(address)))
}

/// DELETE /addresses/{id} - Remove one of the caller's addresses.
///
/// Answers 404 both for unknown ids and for addresses owned by someone else.
async fn delete_address(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let address_id =
        Uuid::parse_str(&id).map_err(|_| ApiError::validation("address id must be a UUID"))?;

    if !db::delete_user_address(&state.supabase, user.id(), address_id).await? {
        return Err(ApiError::not_found("address not found"));
    }

    info!(user_id = %user.id(), address_id = %address_id, "Address deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Tests
// ============================================================================
