//! Application state.

use std::sync::Arc;

use tarot_billing_store::Store;

use crate::config::ServiceConfig;
use crate::oracle::{OpenAiOracle, ReadingOracle};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Reading oracle (optional).
    pub oracle: Option<Arc<dyn ReadingOracle>>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// The OpenAI oracle is enabled when an API key is configured.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        let oracle = config.openai_api_key.as_ref().and_then(|key| {
            match OpenAiOracle::new(&config.openai_base_url, key, &config.openai_model) {
                Ok(client) => {
                    tracing::info!(
                        base_url = %config.openai_base_url,
                        model = %config.openai_model,
                        "Reading oracle enabled"
                    );
                    Some(Arc::new(client) as Arc<dyn ReadingOracle>)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create reading oracle");
                    None
                }
            }
        });

        if oracle.is_none() {
            tracing::warn!("OpenAI not configured - chat will be unavailable");
        }

        if config.stripe_webhook_secret.is_none() {
            tracing::warn!("Stripe webhook secret not configured - webhooks will be rejected");
        }

        Self {
            store,
            config,
            oracle,
        }
    }

    /// Replace the reading oracle.
    #[must_use]
    pub fn with_oracle(mut self, oracle: Arc<dyn ReadingOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Check if a reading oracle is configured.
    #[must_use]
    pub fn has_oracle(&self) -> bool {
        self.oracle.is_some()
    }
}
