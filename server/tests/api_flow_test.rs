//! End-to-end API flows against mocked Supabase, Stripe and SendGrid.
//!
//! Each test starts three wiremock servers, points a router at them and
//! drives it with `oneshot` requests the way the web frontend would.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nappio_server::config::Config;
use nappio_server::routes::{create_router, AppState};

const USER_ID: &str = "8d4c7a52-1f0e-4b7b-9d1a-3c5e2f6a7b80";
const SUB_ROW_ID: &str = "7a1d3f4e-2b7c-4c1a-9a8e-0f3c2d1b4a5e";

// ============================================================================
// Fixtures
// ============================================================================

struct Providers {
    supabase: MockServer,
    stripe: MockServer,
    sendgrid: MockServer,
}

impl Providers {
    async fn start() -> Self {
        Self {
            supabase: MockServer::start().await,
            stripe: MockServer::start().await,
            sendgrid: MockServer::start().await,
        }
    }

    fn app(&self) -> Router {
        let config = Config {
            supabase_url: self.supabase.uri(),
            supabase_key: "service-key".to_string(),
            stripe_secret_key: "sk_test_123".to_string(),
            stripe_api_url: self.stripe.uri(),
            sendgrid_api_key: "SG.test".to_string(),
            sendgrid_api_url: self.sendgrid.uri(),
            frontend_url: "https://nappio.co.uk".to_string(),
            service_name: "Nappio".to_string(),
            email_from: "info@nappio.co.uk".to_string(),
            port: 8000,
        };
        create_router(AppState::new(config).expect("state"))
    }

    /// Any bearer token resolves to the test user.
    async fn mount_user(&self) {
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": USER_ID,
                "email": "ada@example.com",
                "user_metadata": {"first_name": "Ada"},
                "created_at": "2024-05-01T10:00:00Z"
            })))
            .mount(&self.supabase)
            .await;
    }

    async fn mount_mail(&self, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/v3/mail/send"))
            .respond_with(ResponseTemplate::new(202))
            .expect(expected)
            .mount(&self.sendgrid)
            .await;
    }
}

fn subscription_row(cancelled: bool) -> Value {
    json!({
        "id": SUB_ROW_ID,
        "user_id": USER_ID,
        "plan_id": "monthly",
        "subscription_id": "sub_123",
        "price_id": "price_123",
        "customer_id": "cus_123",
        "status": if cancelled { "canceled" } else { "active" },
        "subscribed_at": "2024-05-01T10:00:00Z",
        "last_payment_date": "2024-05-01T10:00:00Z",
        "next_payment_date": "2024-06-01T10:00:00Z",
        "cancelled_at": if cancelled { json!("2024-05-10T10:00:00Z") } else { Value::Null },
        "address_id": null
    })
}

fn stripe_subscription(status: &str) -> Value {
    json!({
        "id": "sub_123",
        "customer": "cus_123",
        "status": status,
        "created": 1_714_557_600,
        "canceled_at": null,
        "cancel_at_period_end": false,
        "items": {
            "data": [{
                "price": {"id": "price_123", "metadata": {"plan_id": "monthly"}},
                "current_period_start": 1_714_557_600,
                "current_period_end": 1_717_236_000
            }]
        }
    })
}

fn price_json(id: &str, name: &str, amount: i64) -> Value {
    json!({
        "id": id,
        "unit_amount": amount,
        "currency": "gbp",
        "product": {"id": format!("prod_{id}"), "name": name}
    })
}

fn authed(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", "Bearer user-jwt");

    match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn public(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Gives spawned email tasks a chance to reach the mock before it verifies.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

// ============================================================================
// Signup
// ============================================================================

#[tokio::test]
async fn signup_creates_user_and_sends_welcome_email() {
    let providers = Providers::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/signup"))
        .and(body_partial_json(json!({
            "email": "ada@example.com",
            "data": {"first_name": "Ada"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "session-token",
            "user": {
                "id": USER_ID,
                "email": "ada@example.com",
                "user_metadata": {"first_name": "Ada"}
            }
        })))
        .expect(1)
        .mount(&providers.supabase)
        .await;

    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .and(body_partial_json(json!({"subject": "Welcome to Nappio"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&providers.sendgrid)
        .await;

    let response = providers
        .app()
        .oneshot(public(
            "POST",
            "/signup",
            json!({"email": "Ada@Example.com", "password": "hunter22", "first_name": "Ada"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["id"], USER_ID);
    assert_eq!(body["first_name"], "Ada");

    settle().await;
}

#[tokio::test]
async fn duplicate_signup_is_409() {
    let providers = Providers::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/signup"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "code": 422,
            "msg": "User already registered"
        })))
        .mount(&providers.supabase)
        .await;
    providers.mount_mail(0).await;

    let response = providers
        .app()
        .oneshot(public(
            "POST",
            "/signup",
            json!({"email": "ada@example.com", "password": "hunter22", "first_name": "Ada"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert_eq!(body["code"], "conflict");
}

// ============================================================================
// Checkout and subscriptions
// ============================================================================

#[tokio::test]
async fn subscribe_creates_customer_and_records_session() {
    let providers = Providers::start().await;
    providers.mount_user().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/checkout_sessions"))
        .and(query_param("user_id", format!("eq.{USER_ID}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&providers.supabase)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cus_new"})))
        .expect(1)
        .mount(&providers.stripe)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/checkout/sessions"))
        .and(body_string_contains("customer=cus_new"))
        .and(body_string_contains("success_url=https%3A%2F%2Fnappio.co.uk%2Fsuccess"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cs_test_1",
            "url": "https://checkout.stripe.com/c/pay/cs_test_1",
            "customer": "cus_new",
            "status": "open"
        })))
        .mount(&providers.stripe)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/checkout_sessions"))
        .and(body_partial_json(json!({
            "session_id": "cs_test_1",
            "user_id": USER_ID,
            "customer_id": "cus_new",
            "price_id": "price_123"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([{
            "session_id": "cs_test_1",
            "user_id": USER_ID,
            "customer_id": "cus_new",
            "price_id": "price_123",
            "status": "open"
        }])))
        .expect(1)
        .mount(&providers.supabase)
        .await;

    let response = providers
        .app()
        .oneshot(authed("POST", "/subscribe", Some(json!({"priceId": "price_123"}))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["session_id"], "cs_test_1");
    assert_eq!(body["checkout_url"], "https://checkout.stripe.com/c/pay/cs_test_1");
}

#[tokio::test]
async fn subscribe_with_unknown_price_is_400() {
    let providers = Providers::start().await;
    providers.mount_user().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/checkout_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "session_id": "cs_old",
            "user_id": USER_ID,
            "customer_id": "cus_existing",
            "price_id": "price_old",
            "status": "complete"
        }])))
        .mount(&providers.supabase)
        .await;

    // The existing customer is reused.
    Mock::given(method("POST"))
        .and(path("/v1/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cus_dup"})))
        .expect(0)
        .mount(&providers.stripe)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/checkout/sessions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "type": "invalid_request_error",
                "code": "resource_missing",
                "param": "line_items[0][price]",
                "message": "No such price: 'price_nope'"
            }
        })))
        .mount(&providers.stripe)
        .await;

    let response = providers
        .app()
        .oneshot(authed("POST", "/subscribe", Some(json!({"price_id": "price_nope"}))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "No such price: 'price_nope'");
    assert_eq!(body["code"], "provider_rejected");
}

#[tokio::test]
async fn confirm_records_subscription_and_emails_once() {
    let providers = Providers::start().await;
    providers.mount_user().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/checkout_sessions"))
        .and(query_param("session_id", "eq.cs_test_1"))
        .and(query_param("user_id", format!("eq.{USER_ID}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "session_id": "cs_test_1",
            "user_id": USER_ID,
            "customer_id": "cus_123",
            "price_id": "price_123",
            "status": "open"
        }])))
        .mount(&providers.supabase)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/checkout/sessions/cs_test_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cs_test_1",
            "url": null,
            "customer": "cus_123",
            "subscription": "sub_123",
            "status": "complete",
            "customer_details": {"email": "ada@example.com"}
        })))
        .mount(&providers.stripe)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/subscriptions/sub_123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(stripe_subscription("active")))
        .mount(&providers.stripe)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/prices/price_123"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(price_json("price_123", "Monthly Nappies", 1250)),
        )
        .mount(&providers.stripe)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/user_subscriptions"))
        .and(query_param("on_conflict", "subscription_id"))
        .and(body_partial_json(json!({
            "user_id": USER_ID,
            "subscription_id": "sub_123",
            "plan_id": "monthly",
            "status": "active"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([subscription_row(false)])))
        .expect(1)
        .mount(&providers.supabase)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/checkout_sessions"))
        .and(body_partial_json(json!({"status": "complete"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&providers.supabase)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/auth/v1/admin/users/{USER_ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": USER_ID,
            "email": "ada@example.com",
            "user_metadata": {"first_name": "Augusta"}
        })))
        .expect(1)
        .mount(&providers.supabase)
        .await;

    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .and(body_string_contains("Hi Augusta"))
        .and(body_string_contains("Monthly Nappies for GBP 12.50 per month"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&providers.sendgrid)
        .await;

    let response = providers
        .app()
        .oneshot(authed(
            "POST",
            "/subscriptions/confirm",
            Some(json!({"session_id": "cs_test_1"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["plan_name"], "Monthly Nappies");
    assert_eq!(body["customer_email"], "ada@example.com");

    settle().await;
}

#[tokio::test]
async fn confirm_incomplete_checkout_is_409() {
    let providers = Providers::start().await;
    providers.mount_user().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/checkout_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "session_id": "cs_open",
            "user_id": USER_ID,
            "customer_id": "cus_123",
            "price_id": "price_123",
            "status": "open"
        }])))
        .mount(&providers.supabase)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/checkout/sessions/cs_open"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cs_open",
            "url": "https://checkout.stripe.com/c/pay/cs_open",
            "customer": "cus_123",
            "subscription": null,
            "status": "open"
        })))
        .mount(&providers.stripe)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/user_subscriptions"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .expect(0)
        .mount(&providers.supabase)
        .await;

    let response = providers
        .app()
        .oneshot(authed(
            "POST",
            "/subscriptions/confirm",
            Some(json!({"session_id": "cs_open"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn confirm_someone_elses_session_is_404() {
    let providers = Providers::start().await;
    providers.mount_user().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/checkout_sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&providers.supabase)
        .await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&providers.stripe)
        .await;

    let response = providers
        .app()
        .oneshot(authed(
            "POST",
            "/subscriptions/confirm",
            Some(json!({"session_id": "cs_not_mine"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_subscriptions_skips_unreadable_prices() {
    let providers = Providers::start().await;
    providers.mount_user().await;

    let mut broken = subscription_row(false);
    broken["id"] = json!(Uuid::new_v4());
    broken["subscription_id"] = json!("sub_broken");
    broken["price_id"] = json!("price_deleted");

    Mock::given(method("GET"))
        .and(path("/rest/v1/user_subscriptions"))
        .and(query_param("user_id", format!("eq.{USER_ID}").as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([subscription_row(false), broken])),
        )
        .mount(&providers.supabase)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/prices/price_123"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(price_json("price_123", "Monthly Nappies", 1250)),
        )
        .mount(&providers.stripe)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/prices/price_deleted"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {
                "type": "invalid_request_error",
                "code": "resource_missing",
                "message": "No such price: 'price_deleted'"
            }
        })))
        .mount(&providers.stripe)
        .await;

    let response = providers
        .app()
        .oneshot(authed("GET", "/subscriptions", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let list = body.as_array().expect("array");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["plan_name"], "Monthly Nappies");
    assert_eq!(list[0]["monthly_cost"], 12.5);
    assert_eq!(list[0]["subscription_id"], "sub_123");
}

#[tokio::test]
async fn list_subscriptions_skips_prices_without_unit_amount() {
    let providers = Providers::start().await;
    providers.mount_user().await;

    let mut metered = subscription_row(false);
    metered["id"] = json!(Uuid::new_v4());
    metered["subscription_id"] = json!("sub_metered");
    metered["price_id"] = json!("price_metered");

    Mock::given(method("GET"))
        .and(path("/rest/v1/user_subscriptions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([subscription_row(false), metered])),
        )
        .mount(&providers.supabase)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/prices/price_123"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(price_json("price_123", "Monthly Nappies", 1250)),
        )
        .mount(&providers.stripe)
        .await;

    let mut no_amount = price_json("price_metered", "Pay As You Go", 0);
    no_amount["unit_amount"] = Value::Null;

    Mock::given(method("GET"))
        .and(path("/v1/prices/price_metered"))
        .respond_with(ResponseTemplate::new(200).set_body_json(no_amount))
        .mount(&providers.stripe)
        .await;

    let response = providers
        .app()
        .oneshot(authed("GET", "/subscriptions", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let list = body.as_array().expect("array");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["subscription_id"], "sub_123");
}

#[tokio::test]
async fn unsubscribe_cancels_and_soft_deletes() {
    let providers = Providers::start().await;
    providers.mount_user().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/user_subscriptions"))
        .and(query_param("subscription_id", "eq.sub_123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([subscription_row(false)])))
        .mount(&providers.supabase)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/v1/subscriptions/sub_123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(stripe_subscription("canceled")))
        .expect(1)
        .mount(&providers.stripe)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/user_subscriptions"))
        .and(query_param("subscription_id", "eq.sub_123"))
        .and(body_partial_json(json!({"status": "canceled"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([subscription_row(true)])))
        .expect(1)
        .mount(&providers.supabase)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/user_subscriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&providers.supabase)
        .await;

    providers.mount_mail(1).await;

    let response = providers
        .app()
        .oneshot(authed(
            "POST",
            "/unsubscribe",
            Some(json!({"subscription_id": "sub_123"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "canceled");
    assert!(body["cancelled_at"].is_string());
    assert_eq!(body["cancel_at_period_end"], false);

    settle().await;
}

#[tokio::test]
async fn unsubscribe_at_period_end_keeps_subscription_running() {
    let providers = Providers::start().await;
    providers.mount_user().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/user_subscriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([subscription_row(false)])))
        .mount(&providers.supabase)
        .await;

    let mut pending = stripe_subscription("active");
    pending["cancel_at_period_end"] = json!(true);

    Mock::given(method("POST"))
        .and(path("/v1/subscriptions/sub_123"))
        .and(body_string_contains("cancel_at_period_end=true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pending))
        .expect(1)
        .mount(&providers.stripe)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/user_subscriptions"))
        .and(body_partial_json(json!({"status": "active"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([subscription_row(false)])))
        .expect(1)
        .mount(&providers.supabase)
        .await;

    providers.mount_mail(1).await;

    let response = providers
        .app()
        .oneshot(authed(
            "POST",
            "/unsubscribe",
            Some(json!({"subscription_id": "sub_123", "at_period_end": true})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "active");
    assert_eq!(body["cancel_at_period_end"], true);

    settle().await;
}

#[tokio::test]
async fn unsubscribe_twice_is_409() {
    let providers = Providers::start().await;
    providers.mount_user().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/user_subscriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([subscription_row(true)])))
        .mount(&providers.supabase)
        .await;

    let response = providers
        .app()
        .oneshot(authed(
            "POST",
            "/unsubscribe",
            Some(json!({"subscription_id": "sub_123"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn stripe_outage_is_503() {
    let providers = Providers::start().await;
    providers.mount_user().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/user_subscriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([subscription_row(false)])))
        .mount(&providers.supabase)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/v1/subscriptions/sub_123"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&providers.stripe)
        .await;

    let response = providers
        .app()
        .oneshot(authed(
            "POST",
            "/unsubscribe",
            Some(json!({"subscription_id": "sub_123"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["code"], "service_unavailable");
}

#[tokio::test]
async fn assign_address_to_subscription() {
    let providers = Providers::start().await;
    providers.mount_user().await;
    let address_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/user_addresses"))
        .and(query_param("id", format!("eq.{address_id}").as_str()))
        .and(query_param("user_id", format!("eq.{USER_ID}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": address_id,
            "user_id": USER_ID,
            "address_line_1": "1 High Street",
            "city": "London",
            "postcode": "N1 1AA",
            "country": "UK"
        }])))
        .mount(&providers.supabase)
        .await;

    let mut updated = subscription_row(false);
    updated["address_id"] = json!(address_id);

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/user_subscriptions"))
        .and(query_param("id", format!("eq.{SUB_ROW_ID}").as_str()))
        .and(body_partial_json(json!({"address_id": address_id})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([updated])))
        .expect(1)
        .mount(&providers.supabase)
        .await;

    let response = providers
        .app()
        .oneshot(authed(
            "POST",
            "/subscriptions/address",
            Some(json!({"subscription_id": SUB_ROW_ID, "address_id": address_id})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["address_id"], json!(address_id));
}

// ============================================================================
// Newsletter
// ============================================================================

#[tokio::test]
async fn newsletter_subscribe_sends_confirmation_link() {
    let providers = Providers::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/newsletter_subscribers"))
        .and(body_partial_json(json!({
            "first_name": "Ada",
            "email": "ada@example.com",
            "postcode": "N16"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([{
            "id": Uuid::new_v4(),
            "first_name": "Ada",
            "email": "ada@example.com",
            "postcode": "N16",
            "verified": false,
            "subscribed_at": "2024-05-01T10:00:00Z"
        }])))
        .expect(1)
        .mount(&providers.supabase)
        .await;

    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .and(body_string_contains(
            "https://nappio.co.uk/confirm-email?email=ada%40example.com",
        ))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&providers.sendgrid)
        .await;

    let response = providers
        .app()
        .oneshot(public(
            "POST",
            "/newsletter/subscribe",
            json!({"first_name": "Ada", "email": "ada@example.com", "postcode": "N16"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["verified"], false);

    settle().await;
}

#[tokio::test]
async fn newsletter_duplicate_email_is_409() {
    let providers = Providers::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/newsletter_subscribers"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "code": "23505",
            "message": "duplicate key value violates unique constraint \"newsletter_subscribers_email_key\""
        })))
        .mount(&providers.supabase)
        .await;
    providers.mount_mail(0).await;

    let response = providers
        .app()
        .oneshot(public(
            "POST",
            "/newsletter/subscribe",
            json!({"first_name": "Ada", "email": "ada@example.com"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert_eq!(body["error"], "email already subscribed");
}

#[tokio::test]
async fn newsletter_verify_unknown_email_is_404() {
    let providers = Providers::start().await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/newsletter_subscribers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&providers.supabase)
        .await;

    let response = providers
        .app()
        .oneshot(public(
            "POST",
            "/newsletter/verify",
            json!({"email": "nobody@example.com"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Addresses
// ============================================================================

#[tokio::test]
async fn add_and_list_addresses() {
    let providers = Providers::start().await;
    providers.mount_user().await;
    let address_id = Uuid::new_v4();

    let stored = json!({
        "id": address_id,
        "user_id": USER_ID,
        "address_line_1": "1 High Street",
        "address_line_2": null,
        "city": "London",
        "postcode": "N1 1AA",
        "country": "UK",
        "address_notes": "Leave with neighbour"
    });

    Mock::given(method("POST"))
        .and(path("/rest/v1/user_addresses"))
        .and(body_partial_json(json!({
            "user_id": USER_ID,
            "address_line_1": "1 High Street",
            "city": "London"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([stored.clone()])))
        .expect(1)
        .mount(&providers.supabase)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/user_addresses"))
        .and(query_param("user_id", format!("eq.{USER_ID}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([stored])))
        .mount(&providers.supabase)
        .await;

    let app = providers.app();

    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/addresses",
            Some(json!({
                "address_line_1": " 1 High Street ",
                "city": "London",
                "postcode": "N1 1AA",
                "country": "UK",
                "address_notes": "Leave with neighbour"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    assert_eq!(created["id"], json!(address_id));

    let response = app.oneshot(authed("GET", "/addresses", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let list = json_body(response).await;
    assert_eq!(list.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn delete_own_address_is_204() {
    let providers = Providers::start().await;
    providers.mount_user().await;
    let address_id = Uuid::new_v4();

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/user_addresses"))
        .and(query_param("id", format!("eq.{address_id}").as_str()))
        .and(query_param("user_id", format!("eq.{USER_ID}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": address_id,
            "user_id": USER_ID,
            "address_line_1": "1 High Street",
            "city": "London",
            "postcode": "N1 1AA",
            "country": "UK"
        }])))
        .expect(1)
        .mount(&providers.supabase)
        .await;

    let response = providers
        .app()
        .oneshot(authed("DELETE", &format!("/addresses/{address_id}"), None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
