//! Typed access to the Supabase tables owned by this service.
//!
//! Each function maps one use-case onto a PostgREST call through
//! [`SupabaseClient`]. Ownership checks are expressed as extra equality
//! filters on `user_id`, so a row that exists but belongs to someone else
//! looks exactly like a missing row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::supabase::{SupabaseClient, SupabaseError};

pub const NEWSLETTER_SUBSCRIBERS: &str = "newsletter_subscribers";
pub const CHECKOUT_SESSIONS: &str = "checkout_sessions";
pub const USER_SUBSCRIPTIONS: &str = "user_subscriptions";
pub const USER_ADDRESSES: &str = "user_addresses";

/// A row of `newsletter_subscribers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsletterSubscriber {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub first_name: String,
    pub email: String,
    pub postcode: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribed_at: Option<DateTime<Utc>>,
}

/// A row of `checkout_sessions`, linking a Stripe checkout to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub customer_id: String,
    pub price_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// A row of `user_subscriptions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSubscription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub user_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    /// Stripe subscription id (`sub_...`).
    pub subscription_id: String,
    pub price_id: String,
    pub customer_id: String,
    pub status: String,
    #[serde(default)]
    pub subscribed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_payment_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_payment_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    // Omitted on upsert so re-confirming a checkout keeps the assigned address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_id: Option<Uuid>,
}

/// A row of `user_addresses`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub user_id: String,
    pub address_line_1: String,
    #[serde(default)]
    pub address_line_2: Option<String>,
    pub city: String,
    pub postcode: String,
    pub country: String,
    #[serde(default)]
    pub address_notes: Option<String>,
}

/// Takes the single row a write returned.
fn first_row<R>(rows: Vec<R>, table: &str) -> Result<R, SupabaseError> {
    rows.into_iter()
        .next()
        .ok_or_else(|| SupabaseError::InvalidResponse(format!("{table} write returned no rows")))
}

// ============================================================================
// Newsletter
// ============================================================================

/// Stores a new newsletter subscriber.
///
/// A second signup with the same email surfaces as [`SupabaseError::Conflict`]
/// through the table's unique constraint.
pub async fn insert_newsletter_subscriber(
    client: &SupabaseClient,
    first_name: &str,
    email: &str,
    postcode: Option<&str>,
) -> Result<NewsletterSubscriber, SupabaseError> {
    let row = serde_json::json!({
        "first_name": first_name,
        "email": email,
        "postcode": postcode,
    });

    let rows = client.insert(NEWSLETTER_SUBSCRIBERS, &row).await?;
    first_row(rows, NEWSLETTER_SUBSCRIBERS)
}

/// Marks the subscriber with `email` as verified. Returns `false` when no
/// subscriber has that address.
pub async fn verify_newsletter_subscriber(
    client: &SupabaseClient,
    email: &str,
) -> Result<bool, SupabaseError> {
    let rows: Vec<NewsletterSubscriber> = client
        .update(
            NEWSLETTER_SUBSCRIBERS,
            &[("email", email)],
            &serde_json::json!({ "verified": true }),
        )
        .await?;

    Ok(!rows.is_empty())
}

// ============================================================================
// Checkout sessions
// ============================================================================

pub async fn insert_checkout_session(
    client: &SupabaseClient,
    record: &CheckoutSessionRecord,
) -> Result<(), SupabaseError> {
    let _: Vec<CheckoutSessionRecord> = client.insert(CHECKOUT_SESSIONS, record).await?;
    Ok(())
}

pub async fn update_checkout_session(
    client: &SupabaseClient,
    session_id: &str,
    status: &str,
) -> Result<(), SupabaseError> {
    let _: Vec<CheckoutSessionRecord> = client
        .update(
            CHECKOUT_SESSIONS,
            &[("session_id", session_id)],
            &serde_json::json!({ "status": status }),
        )
        .await?;
    Ok(())
}

/// Looks up a checkout session started by `user_id`.
pub async fn find_checkout_session(
    client: &SupabaseClient,
    session_id: &str,
    user_id: &str,
) -> Result<Option<CheckoutSessionRecord>, SupabaseError> {
    let rows: Vec<CheckoutSessionRecord> = client
        .select(
            CHECKOUT_SESSIONS,
            &[("session_id", session_id), ("user_id", user_id)],
        )
        .await?;
    Ok(rows.into_iter().next())
}

/// Returns the Stripe customer already associated with `user_id`, if any of
/// their earlier checkouts created one.
pub async fn find_customer_for_user(
    client: &SupabaseClient,
    user_id: &str,
) -> Result<Option<String>, SupabaseError> {
    let rows: Vec<CheckoutSessionRecord> =
        client.select(CHECKOUT_SESSIONS, &[("user_id", user_id)]).await?;
    Ok(rows.into_iter().next().map(|row| row.customer_id))
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Records a subscription, merging into the existing row for the same Stripe
/// subscription id.
pub async fn upsert_user_subscription(
    client: &SupabaseClient,
    subscription: &UserSubscription,
) -> Result<UserSubscription, SupabaseError> {
    let rows = client
        .upsert(USER_SUBSCRIPTIONS, subscription, "subscription_id")
        .await?;
    first_row(rows, USER_SUBSCRIPTIONS)
}

pub async fn list_user_subscriptions(
    client: &SupabaseClient,
    user_id: &str,
) -> Result<Vec<UserSubscription>, SupabaseError> {
    client.select(USER_SUBSCRIPTIONS, &[("user_id", user_id)]).await
}

/// Finds the subscription with Stripe id `subscription_id` owned by `user_id`.
pub async fn find_user_subscription(
    client: &SupabaseClient,
    user_id: &str,
    subscription_id: &str,
) -> Result<Option<UserSubscription>, SupabaseError> {
    let rows: Vec<UserSubscription> = client
        .select(
            USER_SUBSCRIPTIONS,
            &[("subscription_id", subscription_id), ("user_id", user_id)],
        )
        .await?;
    Ok(rows.into_iter().next())
}

/// Soft-deletes a subscription: the row stays, with the provider status and
/// cancellation time recorded.
pub async fn cancel_user_subscription(
    client: &SupabaseClient,
    subscription_id: &str,
    status: &str,
    cancelled_at: DateTime<Utc>,
) -> Result<Option<UserSubscription>, SupabaseError> {
    let rows: Vec<UserSubscription> = client
        .update(
            USER_SUBSCRIPTIONS,
            &[("subscription_id", subscription_id)],
            &serde_json::json!({
                "status": status,
                "cancelled_at": cancelled_at,
            }),
        )
        .await?;
    Ok(rows.into_iter().next())
}

/// Points a subscription at a delivery address.
///
/// Both the subscription row and the address must belong to `user_id`;
/// otherwise nothing is written and `None` is returned.
pub async fn assign_subscription_address(
    client: &SupabaseClient,
    user_id: &str,
    subscription_row_id: Uuid,
    address_id: Uuid,
) -> Result<Option<UserSubscription>, SupabaseError> {
    let address_id = address_id.to_string();
    let owned: Vec<UserAddress> = client
        .select(USER_ADDRESSES, &[("id", &address_id), ("user_id", user_id)])
        .await?;
    if owned.is_empty() {
        return Ok(None);
    }

    let row_id = subscription_row_id.to_string();
    let rows: Vec<UserSubscription> = client
        .update(
            USER_SUBSCRIPTIONS,
            &[("id", &row_id), ("user_id", user_id)],
            &serde_json::json!({ "address_id": address_id }),
        )
        .await?;
    Ok(rows.into_iter().next())
}

// ============================================================================
// Addresses
// ============================================================================

/// Lists a user's addresses; empty when they have none.
pub async fn list_user_addresses(
    client: &SupabaseClient,
    user_id: &str,
) -> Result<Vec<UserAddress>, SupabaseError> {
    client.select(USER_ADDRESSES, &[("user_id", user_id)]).await
}

pub async fn add_user_address(
    client: &SupabaseClient,
    address: &UserAddress,
) -> Result<UserAddress, SupabaseError> {
    let rows = client.insert(USER_ADDRESSES, address).await?;
    first_row(rows, USER_ADDRESSES)
}

/// Deletes an address owned by `user_id`. Returns `false` when there was
/// nothing to delete.
pub async fn delete_user_address(
    client: &SupabaseClient,
    user_id: &str,
    address_id: Uuid,
) -> Result<bool, SupabaseError> {
    let address_id = address_id.to_string();
    let rows: Vec<UserAddress> = client
        .delete(USER_ADDRESSES, &[("id", &address_id), ("user_id", user_id)])
        .await?;
    Ok(!rows.is_empty())
}
