//! Service configuration.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::path::Path;
use tarot_billing_core::PlanCatalog;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// PostgreSQL connection URL. The in-memory store is used when unset.
    pub database_url: Option<String>,

    /// Maximum PostgreSQL pool connections (default: 10).
    pub database_max_connections: u32,

    /// HS256 secret shared with the auth front-end that issues user tokens.
    pub session_secret: Option<String>,

    /// Service API key for the trusted auth front-end.
    pub service_api_key: Option<String>,

    /// Admin API key for credit grants.
    pub admin_api_key: Option<String>,

    /// Stripe webhook signing secret.
    pub stripe_webhook_secret: Option<String>,

    /// Stripe price id per plan.
    pub plans: PlanCatalog,

    /// OpenAI-compatible API base URL (default: `<https://api.openai.com/v1>`).
    pub openai_base_url: String,

    /// OpenAI API key. The reading oracle is disabled when unset.
    pub openai_api_key: Option<String>,

    /// Chat model (default: "gpt-4o").
    pub openai_model: String,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Maximum concurrent in-flight requests.
    pub max_concurrent_requests: usize,

    /// Days a processed webhook event id is remembered (default: 30).
    pub processed_event_retention_days: i64,
}

/// Stripe secrets file structure.
#[derive(Debug, Deserialize)]
struct StripeSecrets {
    #[serde(default)]
    webhook_secret: Option<String>,
    #[serde(default)]
    basic_price_id: Option<String>,
    #[serde(default)]
    pro_price_id: Option<String>,
    #[serde(default)]
    premium_price_id: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        // Try to load Stripe secrets from file first, then fall back to env vars
        let (stripe_webhook_secret, plans) = load_stripe_secrets();

        Self {
            listen_addr: env_or("LISTEN_ADDR", "0.0.0.0:8080"),
            database_url: env_opt("DATABASE_URL"),
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            session_secret: env_opt("SESSION_SECRET"),
            service_api_key: env_opt("SERVICE_API_KEY"),
            admin_api_key: env_opt("ADMIN_API_KEY"),
            stripe_webhook_secret,
            plans,
            openai_base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            openai_api_key: env_opt("OPENAI_API_KEY"),
            openai_model: env_or("OPENAI_MODEL", "gpt-4o"),
            cors_origins: env_or("CORS_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES", 1024 * 1024), // 1MB
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS", 60),
            max_concurrent_requests: env_parse("MAX_CONCURRENT_REQUESTS", 1024),
            processed_event_retention_days: env_parse("PROCESSED_EVENT_RETENTION_DAYS", 30),
        }
    }

    /// Event ids processed before this instant may be forgotten.
    #[must_use]
    pub fn processed_event_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.processed_event_retention_days.max(1))
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.into())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Load Stripe secrets from file or environment.
fn load_stripe_secrets() -> (Option<String>, PlanCatalog) {
    let secret_paths = [
        ".secrets/stripe.json",
        "tarot-billing/.secrets/stripe.json",
        "../.secrets/stripe.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<StripeSecrets>(path) {
            tracing::info!(path = %path, "Loaded Stripe secrets from file");
            let plans = PlanCatalog::new(
                secrets.basic_price_id,
                secrets.pro_price_id,
                secrets.premium_price_id,
            );
            return (secrets.webhook_secret, plans);
        }
    }

    // Fall back to environment variables
    tracing::debug!("Stripe secrets file not found, using environment variables");
    (
        env_opt("STRIPE_WEBHOOK_SECRET"),
        PlanCatalog::new(
            env_opt("STRIPE_PRICE_ID_BASIC"),
            env_opt("STRIPE_PRICE_ID_PRO"),
            env_opt("STRIPE_PRICE_ID_PREMIUM"),
        ),
    )
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: None,
            database_max_connections: 10,
            session_secret: None,
            service_api_key: None,
            admin_api_key: None,
            stripe_webhook_secret: None,
            plans: PlanCatalog::default(),
            openai_base_url: "https://api.openai.com/v1".into(),
            openai_api_key: None,
            openai_model: "gpt-4o".into(),
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 60,
            max_concurrent_requests: 1024,
            processed_event_retention_days: 30,
        }
    }
}
