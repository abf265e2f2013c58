//! Stripe webhook handler.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;

use crate::billing::BillingEventProcessor;
use crate::error::ApiError;
use crate::state::AppState;
use crate::stripe::{signature, WebhookEvent, WebhookResponse};

/// Handle Stripe webhooks.
///
/// The signature is verified against the raw body before anything is
/// parsed. Events that match no local user are acknowledged so Stripe stops
/// retrying; store failures return 500 so it retries.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    let secret = state
        .config
        .stripe_webhook_secret
        .as_deref()
        .ok_or_else(|| ApiError::Internal("Stripe webhook secret not configured".into()))?;

    let sig = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe signature".into()))?;

    signature::verify(&body, sig, secret, Utc::now()).map_err(|e| {
        tracing::warn!(error = %e, "Invalid Stripe webhook signature");
        ApiError::BadRequest("Invalid webhook signature".into())
    })?;

    let webhook: WebhookEvent =
        serde_json::from_str(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    tracing::info!(
        event_type = %webhook.event_type,
        event_id = %webhook.id,
        "Received Stripe webhook"
    );

    let event = webhook
        .into_billing_event()
        .map_err(|e| ApiError::BadRequest(format!("Malformed event object: {e}")))?;

    let processor = BillingEventProcessor::new(state.store.as_ref(), &state.config.plans);
    let disposition = processor.process(&event).await.map_err(|e| {
        tracing::error!(event_id = %event.id, error = %e, "Failed to process billing event");
        ApiError::Internal(e.to_string())
    })?;

    tracing::debug!(event_id = %event.id, disposition = ?disposition, "Billing event handled");

    Ok(Json(WebhookResponse { received: true }))
}
