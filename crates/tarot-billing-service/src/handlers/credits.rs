//! Credit balance and transaction handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use tarot_billing_core::{credit_expiry_from, CreditTransaction, GrantReason, UserId};

use crate::auth::{AdminAuth, AuthUser};
use crate::error::ApiError;
use crate::state::AppState;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// Stored balance.
    pub credit_balance: i64,
    /// Balance that can be spent now.
    pub usable_credits: i64,
    /// When the balance expires.
    pub credits_expires_at: Option<String>,
    /// Whether the balance has expired.
    pub expired: bool,
    /// Current plan.
    pub plan: String,
}

/// Get current credit balance.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user = state
        .store
        .get_user(auth.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    let now = Utc::now();
    Ok(Json(BalanceResponse {
        credit_balance: user.credit_balance,
        usable_credits: user.usable_credits(now),
        credits_expires_at: user.credits_expires_at.map(|t| t.to_rfc3339()),
        expired: user.credits_expired(now),
        plan: user.plan.as_str().to_string(),
    }))
}

/// Pagination query parameters for history listings.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    /// Maximum number of items to return (default: 50, at most 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// Transaction response.
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    /// Transaction ID.
    pub id: String,
    /// Amount (positive = credit, negative = debit).
    pub amount: i64,
    /// Transaction type.
    pub transaction_type: String,
    /// Balance after this transaction.
    pub balance_after: i64,
    /// Description.
    pub description: String,
    /// Timestamp.
    pub created_at: String,
}

impl From<&CreditTransaction> for TransactionResponse {
    fn from(tx: &CreditTransaction) -> Self {
        Self {
            id: tx.id.to_string(),
            amount: tx.amount,
            transaction_type: tx.kind.as_str().to_string(),
            balance_after: tx.balance_after,
            description: tx.description.clone(),
            created_at: tx.created_at.to_rfc3339(),
        }
    }
}

/// List transactions response.
#[derive(Debug, Serialize)]
pub struct ListTransactionsResponse {
    /// Transactions (newest first).
    pub transactions: Vec<TransactionResponse>,
    /// Whether there are more transactions.
    pub has_more: bool,
}

/// List transaction history.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    state
        .store
        .get_user(auth.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    // Fetch one more than requested to determine has_more
    let limit = query.limit.clamp(1, 100);
    let transactions = state
        .store
        .list_transactions(auth.user_id, limit + 1, query.offset)
        .await?;

    let has_more = transactions.len() > limit;
    let transactions: Vec<_> = transactions
        .iter()
        .take(limit)
        .map(TransactionResponse::from)
        .collect();

    Ok(Json(ListTransactionsResponse {
        transactions,
        has_more,
    }))
}

/// Admin grant request.
#[derive(Debug, Deserialize)]
pub struct GrantCreditsRequest {
    /// Recipient.
    pub user_id: i64,
    /// Credits to add (positive).
    pub amount: i64,
    /// Audit note (e.g. the redemption code).
    pub note: String,
    /// Whether to restart the 30-day validity window.
    #[serde(default)]
    pub extend_expiry: bool,
}

/// Admin grant response.
#[derive(Debug, Serialize)]
pub struct GrantCreditsResponse {
    /// Recipient.
    pub user_id: i64,
    /// Balance after the grant.
    pub credit_balance: i64,
    /// Expiry after the grant.
    pub credits_expires_at: Option<String>,
}

/// Grant credits to a user (admin only).
pub async fn admin_grant_credits(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<GrantCreditsRequest>,
) -> Result<Json<GrantCreditsResponse>, ApiError> {
    if body.amount <= 0 {
        return Err(ApiError::BadRequest("Amount must be positive".into()));
    }
    if body.note.trim().is_empty() {
        return Err(ApiError::BadRequest("A note is required".into()));
    }
    if body.user_id <= 0 {
        return Err(ApiError::BadRequest("Invalid user id".into()));
    }
    let user_id = UserId::new(body.user_id);

    let new_expiry = body.extend_expiry.then(|| credit_expiry_from(Utc::now()));
    let reason = GrantReason::Redemption {
        note: format!("{} (granted by {})", body.note.trim(), admin.admin_id),
    };

    let user = state
        .store
        .grant_credits(user_id, body.amount, reason, new_expiry)
        .await
        .map_err(|e| match e {
            tarot_billing_store::StoreError::NotFound => {
                ApiError::NotFound("Account not found".into())
            }
            other => other.into(),
        })?;

    tracing::info!(
        admin_id = %admin.admin_id,
        user_id = %user_id,
        amount = body.amount,
        balance = user.credit_balance,
        "Admin granted credits"
    );

    Ok(Json(GrantCreditsResponse {
        user_id: user.id.get(),
        credit_balance: user.credit_balance,
        credits_expires_at: user.credits_expires_at.map(|t| t.to_rfc3339()),
    }))
}
