//! Server configuration module.
//!
//! Parses configuration from environment variables for the Nappio server.
//! A `.env` file in the working directory is loaded first when present, so
//! local development does not need exported variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SUPABASE_URL` | Yes | - | URL of the Supabase project |
//! | `SUPABASE_KEY` | Yes | - | Supabase service role key |
//! | `STRIPE_SECRET_KEY` | Yes | - | Stripe secret API key |
//! | `SENDGRID_API_KEY` | Yes | - | SendGrid API key |
//! | `FRONTEND_URL` | No | `http://localhost:5173` | Public URL of the web frontend |
//! | `SERVICE_NAME` | No | `Nappio` | Name used in emails and the root endpoint |
//! | `EMAIL_FROM` | No | `info@nappio.co.uk` | Sender and reply-to address |
//! | `STRIPE_API_URL` | No | `https://api.stripe.com` | Stripe API base URL |
//! | `SENDGRID_API_URL` | No | `https://api.sendgrid.com` | SendGrid API base URL |
//! | `PORT` | No | 8000 | HTTP server port |

use std::env;

use reqwest::Url;
use thiserror::Error;
use tracing::debug;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8000;

const DEFAULT_FRONTEND_URL: &str = "http://localhost:5173";
const DEFAULT_SERVICE_NAME: &str = "Nappio";
const DEFAULT_EMAIL_FROM: &str = "info@nappio.co.uk";
const DEFAULT_STRIPE_API_URL: &str = "https://api.stripe.com";
const DEFAULT_SENDGRID_API_URL: &str = "https://api.sendgrid.com";

/// Origins that are always allowed by CORS, for local frontend development.
const DEV_ORIGINS: [&str; 3] = [
    "http://localhost",
    "http://localhost:3000",
    "http://localhost:5173",
];

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// URL of the Supabase project (e.g., `https://xxx.supabase.co`).
    pub supabase_url: String,

    /// Supabase service role key.
    pub supabase_key: String,

    /// Stripe secret API key.
    pub stripe_secret_key: String,

    /// Stripe API base URL.
    pub stripe_api_url: String,

    /// SendGrid API key.
    pub sendgrid_api_key: String,

    /// SendGrid API base URL.
    pub sendgrid_api_url: String,

    /// Public URL of the web frontend, used for links and CORS.
    pub frontend_url: String,

    /// Service name shown in emails and on the root endpoint.
    pub service_name: String,

    /// Sender address for transactional email.
    pub email_from: String,

    /// HTTP server port.
    pub port: u16,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("supabase_url", &self.supabase_url)
            .field("supabase_key", &"<redacted>")
            .field("stripe_secret_key", &"<redacted>")
            .field("stripe_api_url", &self.stripe_api_url)
            .field("sendgrid_api_key", &"<redacted>")
            .field("sendgrid_api_url", &self.sendgrid_api_url)
            .field("frontend_url", &self.frontend_url)
            .field("service_name", &self.service_name)
            .field("email_from", &self.email_from)
            .field("port", &self.port)
            .finish()
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// Loads a `.env` file first if one exists. Variables already present in
    /// the process environment take precedence over the file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - A required environment variable is missing or empty
    /// - A URL variable does not parse as an absolute URL
    /// - Port number is not a valid u16
    ///
    /// # Example
    ///
    /// ```no_run
    /// use nappio_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded environment from file");
        }

        let config = Self {
            supabase_url: parse_url("SUPABASE_URL", required("SUPABASE_URL")?)?,
            supabase_key: required("SUPABASE_KEY")?,
            stripe_secret_key: required("STRIPE_SECRET_KEY")?,
            stripe_api_url: parse_url(
                "STRIPE_API_URL",
                optional("STRIPE_API_URL", DEFAULT_STRIPE_API_URL)?,
            )?,
            sendgrid_api_key: required("SENDGRID_API_KEY")?,
            sendgrid_api_url: parse_url(
                "SENDGRID_API_URL",
                optional("SENDGRID_API_URL", DEFAULT_SENDGRID_API_URL)?,
            )?,
            frontend_url: parse_url(
                "FRONTEND_URL",
                optional("FRONTEND_URL", DEFAULT_FRONTEND_URL)?,
            )?,
            service_name: optional("SERVICE_NAME", DEFAULT_SERVICE_NAME)?,
            email_from: optional("EMAIL_FROM", DEFAULT_EMAIL_FROM)?,
            port: parse_port()?,
        };

        Ok(config)
    }

    /// Origins accepted by CORS: the local development origins plus the
    /// configured frontend URL.
    pub fn allowed_origins(&self) -> Vec<String> {
        let mut origins: Vec<String> = DEV_ORIGINS.iter().map(|o| o.to_string()).collect();
        if !origins.contains(&self.frontend_url) {
            origins.push(self.frontend_url.clone());
        }
        origins
    }
}

/// Reads a required, non-empty environment variable.
fn required(name: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        Ok(_) | Err(env::VarError::NotPresent) => Err(ConfigError::MissingEnvVar(name.to_string())),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Reads an optional environment variable, falling back to `default` when
/// unset or blank.
fn optional(name: &str, default: &str) -> Result<String, ConfigError> {
    match required(name) {
        Ok(value) => Ok(value),
        Err(ConfigError::MissingEnvVar(_)) => Ok(default.to_string()),
        Err(err) => Err(err),
    }
}

/// Validates that `value` is an absolute http(s) URL and strips trailing
/// slashes so paths can be appended with a single `/`.
fn parse_url(name: &str, value: String) -> Result<String, ConfigError> {
    let url = Url::parse(&value).map_err(|e| ConfigError::InvalidFormat {
        var: name.to_string(),
        message: format!("not a valid URL: {e}"),
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    Ok(value.trim_end_matches('/').to_string())
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}
