//! Nappio Server - Main entry point.
//!
//! This binary starts the Nappio API server with:
//! - Structured JSON logging for production
//! - A Supabase connectivity check before accepting traffic
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`nappio_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! SUPABASE_URL="https://xxx.supabase.co" \
//! SUPABASE_KEY="service-role-key" \
//! STRIPE_SECRET_KEY="sk_test_..." \
//! SENDGRID_API_KEY="SG...." \
//! cargo run --release --bin nappio-server
//! ```

use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use nappio_server::config::Config;
use nappio_server::routes::{create_router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  SUPABASE_URL       - Supabase project URL");
            eprintln!("  SUPABASE_KEY       - Supabase service role key");
            eprintln!("  STRIPE_SECRET_KEY  - Stripe secret API key");
            eprintln!("  SENDGRID_API_KEY   - SendGrid API key");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  FRONTEND_URL       - Web frontend URL (default: http://localhost:5173)");
            eprintln!("  SERVICE_NAME       - Name used in emails (default: Nappio)");
            eprintln!("  EMAIL_FROM         - Sender address (default: info@nappio.co.uk)");
            eprintln!("  PORT               - HTTP server port (default: 8000)");
            eprintln!("  RUST_LOG           - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        supabase_url = %config.supabase_url,
        frontend_url = %config.frontend_url,
        "Nappio server starting"
    );

    let state = match AppState::new(config.clone()) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "Failed to create provider clients");
            return ExitCode::from(1);
        }
    };

    if let Err(err) = state.supabase.check_health_with_retry().await {
        error!(error = %err, "Supabase is unreachable, refusing to start");
        return ExitCode::from(1);
    }
    info!("Supabase reachable");

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of
/// `info,tower_http=debug`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGINT or SIGTERM is received. In-flight requests are
/// allowed to finish; axum stops accepting new connections.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
