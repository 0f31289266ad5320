//! Nappio Server - Subscription service backend.
//!
//! This crate provides the HTTP API behind the Nappio web frontend:
//! - Account signup and lookup through Supabase Auth
//! - Subscription checkout and cancellation through Stripe
//! - Newsletter signup with email confirmation
//! - Delivery addresses stored in Supabase
//!
//! # Architecture
//!
//! The server holds no state of its own. Each request is validated and then
//! forwarded to Supabase (identity and tables) or Stripe (billing), and
//! transactional email is sent through SendGrid on background tasks.

pub mod auth;
pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod routes;
pub mod stripe;
pub mod supabase;
pub mod types;
