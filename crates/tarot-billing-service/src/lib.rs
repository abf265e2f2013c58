//! Tarot Billing HTTP API Service.
//!
//! This crate provides the HTTP API for the tarot-billing service, including:
//!
//! - Account registration and profile
//! - Credit balance, history and admin grants
//! - The reading chat, which charges each session once and streams the reply
//! - Stripe webhooks that keep plans and balances in sync with billing
//!
//! # Authentication
//!
//! The service supports three authentication methods:
//!
//! 1. **Session tokens** - HS256 JWTs issued by the auth front-end, for end users
//! 2. **Service API key** - For the auth front-end registering users
//! 3. **Admin API key** - For credit grants

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers need async for axum

pub mod auth;
pub mod billing;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod oracle;
pub mod routes;
pub mod state;
pub mod stripe;

pub use billing::{BillingEventProcessor, Disposition};
pub use config::ServiceConfig;
pub use error::ApiError;
pub use oracle::{ChatTurn, OpenAiOracle, OracleError, ReadingOracle, ReadingPrompt, ReplyStream};
pub use routes::create_router;
pub use state::AppState;
