//! Account management handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use tarot_billing_core::{NewUser, User};

use crate::auth::{AuthUser, ServiceAuth};
use crate::error::ApiError;
use crate::state::AppState;

/// Account response.
#[derive(Debug, Serialize)]
pub struct AccountResponse {
    /// User ID.
    pub id: i64,
    /// Email address.
    pub email: String,
    /// Current plan.
    pub plan: String,
    /// Stored credit balance.
    pub credit_balance: i64,
    /// Balance that can be spent now (0 once expired).
    pub usable_credits: i64,
    /// When the balance expires.
    pub credits_expires_at: Option<String>,
    /// Readings opened in the current period.
    pub ai_readings_usage: i32,
    /// Consultations in the current period.
    pub consultation_usage: i32,
    /// Code to share with invitees.
    pub invitation_code: String,
    /// Inviter, if any.
    pub invited_by: Option<i64>,
    /// Created timestamp.
    pub created_at: String,
}

impl From<&User> for AccountResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.get(),
            email: user.email.clone(),
            plan: user.plan.as_str().to_string(),
            credit_balance: user.credit_balance,
            usable_credits: user.usable_credits(Utc::now()),
            credits_expires_at: user.credits_expires_at.map(|t| t.to_rfc3339()),
            ai_readings_usage: user.ai_readings_usage,
            consultation_usage: user.consultation_usage,
            invitation_code: user.invitation_code.clone(),
            invited_by: user.invited_by.map(|id| id.get()),
            created_at: user.created_at.to_rfc3339(),
        }
    }
}

/// Register account request.
#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    /// Verified email address.
    pub email: String,
    /// Invitation code of the inviting user.
    #[serde(default, alias = "inviteCode")]
    pub invite_code: Option<String>,
}

/// Register a new account.
///
/// Called by the auth front-end after it has verified the email address.
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Json(body): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), ApiError> {
    let email = body.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::BadRequest("A valid email is required".into()));
    }

    let invite_code = body
        .invite_code
        .map(|code| code.trim().to_uppercase())
        .filter(|code| !code.is_empty());

    let registration = state
        .store
        .register_user(NewUser { email, invite_code })
        .await
        .map_err(|e| match e {
            tarot_billing_store::StoreError::Conflict(_) => {
                ApiError::Conflict("User already exists".into())
            }
            other => other.into(),
        })?;

    tracing::info!(
        user_id = %registration.user.id,
        service = %service.service_name,
        rewarded_inviter = ?registration.rewarded_inviter.map(|id| id.get()),
        "Account registered"
    );

    Ok((
        StatusCode::CREATED,
        Json(AccountResponse::from(&registration.user)),
    ))
}

/// Get current user's account.
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<AccountResponse>, ApiError> {
    let user = state
        .store
        .get_user(auth.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    Ok(Json(AccountResponse::from(&user)))
}
