//! Common test utilities for tarot-billing integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum_test::{TestResponse, TestServer};
use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::Notify;

use tarot_billing_core::{NewUser, Plan, PlanCatalog, User, UserId};
use tarot_billing_service::auth::{issue_token, SessionClaims};
use tarot_billing_service::stripe::signature;
use tarot_billing_service::{
    create_router, AppState, OracleError, ReadingOracle, ReadingPrompt, ReplyStream,
    ServiceConfig,
};
use tarot_billing_store::{MemoryStore, Store};

pub const SESSION_SECRET: &str = "test-session-secret";
pub const SERVICE_API_KEY: &str = "test-service-key";
pub const ADMIN_API_KEY: &str = "test-admin-key";
pub const WEBHOOK_SECRET: &str = "whsec_test";
pub const PRO_PRICE: &str = "price_pro";
pub const PREMIUM_PRICE: &str = "price_premium";

/// Oracle that replies with a fixed script and records prompts.
pub struct ScriptedOracle {
    deltas: Vec<String>,
    prompts: Mutex<Vec<ReadingPrompt>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedOracle {
    pub fn new(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| (*d).to_string()).collect(),
            prompts: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// An oracle that holds each reply until the returned gate is notified.
    pub fn gated(deltas: &[&str]) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let oracle = Self {
            gate: Some(gate.clone()),
            ..Self::new(deltas)
        };
        (oracle, gate)
    }

    pub fn prompts(&self) -> Vec<ReadingPrompt> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReadingOracle for ScriptedOracle {
    async fn stream_reply(&self, prompt: ReadingPrompt) -> Result<ReplyStream, OracleError> {
        self.prompts.lock().unwrap().push(prompt);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let deltas: Vec<Result<String, OracleError>> =
            self.deltas.iter().cloned().map(Ok).collect();
        Ok(stream::iter(deltas).boxed())
    }
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The store behind the server, for seeding and assertions.
    pub store: Arc<MemoryStore>,
    /// The scripted oracle, when configured.
    pub oracle: Option<Arc<ScriptedOracle>>,
}

pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        listen_addr: "127.0.0.1:0".into(),
        session_secret: Some(SESSION_SECRET.into()),
        service_api_key: Some(SERVICE_API_KEY.into()),
        admin_api_key: Some(ADMIN_API_KEY.into()),
        stripe_webhook_secret: Some(WEBHOOK_SECRET.into()),
        plans: PlanCatalog::default()
            .with_price(PRO_PRICE, Plan::Pro)
            .with_price(PREMIUM_PRICE, Plan::Premium),
        request_timeout_seconds: 30,
        ..ServiceConfig::default()
    }
}

impl TestHarness {
    /// Create a harness whose oracle replies "The moon rises.".
    pub fn new() -> Self {
        Self::build(
            test_config(),
            Some(ScriptedOracle::new(&["The moon ", "rises."])),
        )
    }

    /// Create a harness with no reading oracle.
    pub fn without_oracle() -> Self {
        Self::build(test_config(), None)
    }

    /// Create a harness with a custom configuration.
    pub fn with_config(config: ServiceConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a harness with a custom configuration and oracle.
    pub fn with_config_and_oracle(config: ServiceConfig, oracle: ScriptedOracle) -> Self {
        Self::build(config, Some(oracle))
    }

    fn build(config: ServiceConfig, oracle: Option<ScriptedOracle>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let oracle = oracle.map(Arc::new);

        let mut state = AppState::new(store.clone(), config);
        if let Some(oracle) = &oracle {
            state = state.with_oracle(oracle.clone());
        }

        let server = TestServer::new(create_router(state)).expect("Failed to create test server");

        Self {
            server,
            store,
            oracle,
        }
    }

    /// Register a user directly in the store.
    pub async fn register(&self, email: &str) -> User {
        self.store
            .register_user(NewUser {
                email: email.into(),
                invite_code: None,
            })
            .await
            .expect("registration failed")
            .user
    }

    /// Register a user, then overwrite their balance and expiry.
    pub async fn register_with_balance(
        &self,
        email: &str,
        balance: i64,
        expires_in: Duration,
    ) -> User {
        let mut user = self.register(email).await;
        user.credit_balance = balance;
        user.credits_expires_at = Some(Utc::now() + expires_in);
        self.store.insert_user(user.clone()).await;
        user
    }

    /// Reload a user from the store.
    pub async fn user(&self, user_id: UserId) -> User {
        self.store
            .get_user(user_id)
            .await
            .unwrap()
            .expect("user missing")
    }

    /// Send a Stripe webhook signed with the configured secret.
    pub async fn post_webhook(&self, payload: &serde_json::Value) -> TestResponse {
        let body = payload.to_string();
        let sig = signature::sign(&body, WEBHOOK_SECRET, Utc::now().timestamp());
        self.server
            .post("/webhooks/stripe")
            .add_header("stripe-signature", sig)
            .text(body)
            .await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// `Authorization` header value for a user.
pub fn bearer(user_id: UserId) -> String {
    let claims = SessionClaims::new(user_id, Duration::hours(1));
    let token = issue_token(&claims, SESSION_SECRET).expect("token encoding failed");
    format!("Bearer {token}")
}

/// Stripe event envelope.
pub fn stripe_event(id: &str, event_type: &str, object: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": event_type,
        "created": Utc::now().timestamp(),
        "data": { "object": object }
    })
}
