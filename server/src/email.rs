//! Transactional email through the SendGrid v3 mail send API.
//!
//! Messages are built by the constructors on [`EmailMessage`] and handed to
//! a [`Mailer`], which sends them on a background task. A failed send is
//! logged and otherwise ignored: no request fails because an email did not
//! go out.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Default timeout for SendGrid API requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when sending email.
#[derive(Debug, Error)]
pub enum EmailError {
    /// SendGrid refused the message.
    #[error("email rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("email provider unavailable: {0}")]
    Unavailable(String),

    #[error("client configuration error: {0}")]
    Configuration(String),
}

/// An address with an optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mailbox {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Mailbox {
    pub fn new(email: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            email: email.into(),
            name: name.map(str::to_string),
        }
    }
}

/// A rendered email, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    /// Short name of the message type, used in logs.
    pub kind: &'static str,
    pub to: Mailbox,
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl EmailMessage {
    /// Newsletter double opt-in: asks the subscriber to confirm their address.
    pub fn confirmation(service: &str, to: &str, first_name: &str, link: &str) -> Self {
        let name = escape_html(first_name);
        let href = escape_html(link);

        Self {
            kind: "confirmation",
            to: Mailbox::new(to, Some(first_name)),
            subject: format!("Confirm your email for {service}"),
            text: format!(
                "Hi {first_name},\n\n\
                 Thank you for signing up! Please confirm your email by opening the link below:\n\
                 {link}\n\n\
                 If you didn't sign up, you can ignore this email.\n\n\
                 Best,\nThe {service} Team\n"
            ),
            html: format!(
                "<p>Hi {name},</p>\
                 <p>Thank you for signing up! Please confirm your email by clicking the link below:</p>\
                 <p><a href=\"{href}\">Confirm Email</a></p>\
                 <p>If you didn't sign up, you can ignore this email.</p>\
                 <p>Best,<br>The {service} Team</p>"
            ),
        }
    }

    /// Sent after an account is created.
    pub fn welcome(service: &str, to: &str, first_name: &str) -> Self {
        let name = escape_html(first_name);

        Self {
            kind: "welcome",
            to: Mailbox::new(to, Some(first_name)),
            subject: format!("Welcome to {service}"),
            text: format!(
                "Hi {first_name},\n\n\
                 Your {service} account is ready. You can now choose a plan and manage \
                 your deliveries from your account page.\n\n\
                 Best,\nThe {service} Team\n"
            ),
            html: format!(
                "<p>Hi {name},</p>\
                 <p>Your {service} account is ready. You can now choose a plan and manage \
                 your deliveries from your account page.</p>\
                 <p>Best,<br>The {service} Team</p>"
            ),
        }
    }

    /// Sent once a completed checkout has been recorded. `price` is already
    /// formatted, e.g. `GBP 12.50`.
    pub fn new_subscription(
        service: &str,
        to: &str,
        first_name: &str,
        plan_name: &str,
        price: Option<&str>,
    ) -> Self {
        let name = escape_html(first_name);
        let plan = escape_html(plan_name);
        let price_line = price
            .map(|price| format!(" for {price} per month"))
            .unwrap_or_default();

        Self {
            kind: "new_subscription",
            to: Mailbox::new(to, Some(first_name)),
            subject: format!("Your {service} subscription is confirmed"),
            text: format!(
                "Hi {first_name},\n\n\
                 Thank you for subscribing to {plan_name}{price_line}.\n\
                 We'll be in touch before your first delivery.\n\n\
                 Best,\nThe {service} Team\n"
            ),
            html: format!(
                "<p>Hi {name},</p>\
                 <p>Thank you for subscribing to <strong>{plan}</strong>{price_line}.</p>\
                 <p>We'll be in touch before your first delivery.</p>\
                 <p>Best,<br>The {service} Team</p>"
            ),
        }
    }

    /// Sent after a subscription is cancelled.
    pub fn subscription_cancelled(service: &str, to: &str, first_name: &str, at_period_end: bool) -> Self {
        let name = escape_html(first_name);
        let when = if at_period_end {
            "It will stay active until the end of your current billing period."
        } else {
            "It has ended immediately and you will not be charged again."
        };

        Self {
            kind: "subscription_cancelled",
            to: Mailbox::new(to, Some(first_name)),
            subject: format!("Your {service} subscription has been cancelled"),
            text: format!(
                "Hi {first_name},\n\n\
                 We've cancelled your subscription. {when}\n\n\
                 Best,\nThe {service} Team\n"
            ),
            html: format!(
                "<p>Hi {name},</p>\
                 <p>We've cancelled your subscription. {when}</p>\
                 <p>Best,<br>The {service} Team</p>"
            ),
        }
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Serialize)]
struct SendRequest<'a> {
    personalizations: [Personalization<'a>; 1],
    from: &'a Mailbox,
    reply_to: &'a Mailbox,
    subject: &'a str,
    content: [Content<'a>; 2],
}

#[derive(Serialize)]
struct Personalization<'a> {
    to: [&'a Mailbox; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    mime: &'static str,
    value: &'a str,
}

/// Client for SendGrid's `POST /v3/mail/send`.
#[derive(Clone)]
pub struct EmailClient {
    http_client: Client,
    base_url: String,
    api_key: String,
    from: Mailbox,
}

impl std::fmt::Debug for EmailClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailClient")
            .field("base_url", &self.base_url)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl EmailClient {
    /// Creates a client sending as `from`.
    ///
    /// # Errors
    ///
    /// Returns [`EmailError::Configuration`] if the HTTP client cannot be created.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        from: Mailbox,
    ) -> Result<Self, EmailError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EmailError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            from,
        })
    }

    /// Sends one message. SendGrid answers `202 Accepted` when it has queued
    /// the message for delivery.
    pub async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let body = SendRequest {
            personalizations: [Personalization { to: [&message.to] }],
            from: &self.from,
            reply_to: &self.from,
            subject: &message.subject,
            // SendGrid requires text/plain to come before text/html.
            content: [
                Content { mime: "text/plain", value: &message.text },
                Content { mime: "text/html", value: &message.html },
            ],
        };

        let response = self
            .http_client
            .post(format!("{}/v3/mail/send", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmailError::Timeout(REQUEST_TIMEOUT)
                } else {
                    EmailError::Unavailable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status == StatusCode::ACCEPTED || status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(EmailError::Unavailable(format!("status {status}: {message}")));
        }
        Err(EmailError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

/// Fire-and-forget sender shared through application state.
#[derive(Debug, Clone)]
pub struct Mailer {
    client: EmailClient,
}

impl Mailer {
    pub fn new(client: EmailClient) -> Self {
        Self { client }
    }

    /// Sends `message` on a background task and logs the outcome.
    ///
    /// The returned handle can be awaited but callers normally drop it.
    pub fn dispatch(&self, message: EmailMessage) -> JoinHandle<()> {
        let client = self.client.clone();
        debug!(kind = message.kind, "Queueing email");

        tokio::spawn(async move {
            match client.send(&message).await {
                Ok(()) => info!(kind = message.kind, "Email accepted for delivery"),
                Err(e) => error!(kind = message.kind, error = %e, "Failed to send email"),
            }
        })
    }
}
