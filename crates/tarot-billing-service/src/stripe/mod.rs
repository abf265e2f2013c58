//! Stripe webhook integration.
//!
//! Stripe is only an event source here: the service never calls the Stripe
//! API, it verifies and decodes the webhooks Stripe sends.

pub mod signature;
pub mod types;

pub use signature::{SignatureError, SIGNATURE_TOLERANCE_SECS};
pub use types::{WebhookEvent, WebhookResponse};
