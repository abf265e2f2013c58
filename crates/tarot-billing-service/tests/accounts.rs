//! Account, credit and admin integration tests.

mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use serde_json::json;

use common::{bearer, TestHarness, ADMIN_API_KEY, SERVICE_API_KEY};
use tarot_billing_core::{TransactionKind, UserId};
use tarot_billing_service::auth::{issue_token, SessionClaims};
use tarot_billing_store::Store;

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn register_grants_bonus() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/v1/accounts")
        .add_header("x-api-key", SERVICE_API_KEY)
        .json(&json!({ "email": "Seeker@Example.com" }))
        .await;

    response.assert_status(StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["email"], "seeker@example.com");
    assert_eq!(body["credit_balance"], 10);
    assert_eq!(body["usable_credits"], 10);
    assert_eq!(body["plan"], "basic");
    assert_eq!(body["invitation_code"].as_str().unwrap().len(), 8);
}

#[tokio::test]
async fn register_with_invite_code_rewards_inviter() {
    let harness = TestHarness::new();
    let inviter = harness.register("inviter@example.com").await;

    let response = harness
        .server
        .post("/v1/accounts")
        .add_header("x-api-key", SERVICE_API_KEY)
        .json(&json!({
            "email": "friend@example.com",
            "inviteCode": inviter.invitation_code.to_lowercase()
        }))
        .await;

    response.assert_status(StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["invited_by"], inviter.id.get());
    assert_eq!(body["credit_balance"], 10);

    let after = harness.user(inviter.id).await;
    assert_eq!(after.credit_balance, 20);
    assert_eq!(after.credits_expires_at, inviter.credits_expires_at);
}

#[tokio::test]
async fn register_with_unknown_invite_code_still_succeeds() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/v1/accounts")
        .add_header("x-api-key", SERVICE_API_KEY)
        .json(&json!({ "email": "friend@example.com", "invite_code": "ZZZZZZZZ" }))
        .await;

    response.assert_status(StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    assert!(body["invited_by"].is_null());
}

#[tokio::test]
async fn duplicate_email_conflicts() {
    let harness = TestHarness::new();
    harness.register("a@example.com").await;

    harness
        .server
        .post("/v1/accounts")
        .add_header("x-api-key", SERVICE_API_KEY)
        .json(&json!({ "email": "a@example.com" }))
        .await
        .assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn register_requires_service_key() {
    let harness = TestHarness::new();

    harness
        .server
        .post("/v1/accounts")
        .json(&json!({ "email": "a@example.com" }))
        .await
        .assert_status_unauthorized();

    harness
        .server
        .post("/v1/accounts")
        .add_header("x-api-key", "wrong-key")
        .json(&json!({ "email": "a@example.com" }))
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn register_rejects_invalid_email() {
    let harness = TestHarness::new();

    harness
        .server
        .post("/v1/accounts")
        .add_header("x-api-key", SERVICE_API_KEY)
        .json(&json!({ "email": "not-an-email" }))
        .await
        .assert_status_bad_request();
}

// ============================================================================
// Account and balance
// ============================================================================

#[tokio::test]
async fn get_account_with_bearer_token() {
    let harness = TestHarness::new();
    let user = harness.register("a@example.com").await;

    let response = harness
        .server
        .get("/v1/accounts/me")
        .add_header("authorization", bearer(user.id))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["id"], user.id.get());
    assert_eq!(body["email"], "a@example.com");
}

#[tokio::test]
async fn get_account_with_session_cookie() {
    let harness = TestHarness::new();
    let user = harness.register("a@example.com").await;
    let token = issue_token(
        &SessionClaims::new(user.id, Duration::hours(1)),
        common::SESSION_SECRET,
    )
    .unwrap();

    harness
        .server
        .get("/v1/accounts/me")
        .add_header("cookie", format!("session={token}"))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn forged_token_is_rejected() {
    let harness = TestHarness::new();
    let user = harness.register("a@example.com").await;
    let token = issue_token(
        &SessionClaims::new(user.id, Duration::hours(1)),
        "not-the-secret",
    )
    .unwrap();

    harness
        .server
        .get("/v1/accounts/me")
        .add_header("authorization", format!("Bearer {token}"))
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn get_account_for_missing_user_is_not_found() {
    let harness = TestHarness::new();

    harness
        .server
        .get("/v1/accounts/me")
        .add_header("authorization", bearer(UserId::new(999)))
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn expired_balance_reads_as_unusable() {
    let harness = TestHarness::new();
    let user = harness
        .register_with_balance("a@example.com", 5, Duration::days(-1))
        .await;

    let response = harness
        .server
        .get("/v1/credits/balance")
        .add_header("authorization", bearer(user.id))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["credit_balance"], 5);
    assert_eq!(body["usable_credits"], 0);
    assert_eq!(body["expired"], true);
}

#[tokio::test]
async fn get_balance_without_auth_fails() {
    let harness = TestHarness::new();

    harness
        .server
        .get("/v1/credits/balance")
        .await
        .assert_status_unauthorized();
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn transactions_are_paginated_newest_first() {
    let harness = TestHarness::new();
    let user = harness.register("a@example.com").await;
    for note in ["first", "second"] {
        harness
            .server
            .post("/v1/admin/credits")
            .add_header("x-admin-key", ADMIN_API_KEY)
            .json(&json!({ "user_id": user.id.get(), "amount": 5, "note": note }))
            .await
            .assert_status_ok();
    }

    let response = harness
        .server
        .get("/v1/credits/transactions?limit=2")
        .add_header("authorization", bearer(user.id))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    let transactions = body["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 2);
    assert_eq!(body["has_more"], true);
    assert_eq!(transactions[0]["transaction_type"], "redemption");
    assert_eq!(transactions[0]["balance_after"], 20);

    let rest: serde_json::Value = harness
        .server
        .get("/v1/credits/transactions?limit=2&offset=2")
        .add_header("authorization", bearer(user.id))
        .await
        .json();
    assert_eq!(rest["transactions"][0]["transaction_type"], "registration_bonus");
    assert_eq!(rest["has_more"], false);
}

// ============================================================================
// Admin
// ============================================================================

#[tokio::test]
async fn admin_grant_adds_credits() {
    let harness = TestHarness::new();
    let user = harness.register("a@example.com").await;

    let response = harness
        .server
        .post("/v1/admin/credits")
        .add_header("x-admin-key", ADMIN_API_KEY)
        .add_header("x-admin-id", "support-1")
        .json(&json!({
            "user_id": user.id.get(),
            "amount": 25,
            "note": "REDEEM-2024",
            "extend_expiry": true
        }))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["credit_balance"], 35);

    let history = harness.store.list_transactions(user.id, 1, 0).await.unwrap();
    assert_eq!(history[0].kind, TransactionKind::Redemption);
    assert!(history[0].description.contains("REDEEM-2024"));
    assert!(history[0].description.contains("support-1"));

    let after = harness.user(user.id).await;
    assert!(after.credits_expires_at.unwrap() > Utc::now() + Duration::days(29));
}

#[tokio::test]
async fn admin_grant_validates_input() {
    let harness = TestHarness::new();
    let user = harness.register("a@example.com").await;

    harness
        .server
        .post("/v1/admin/credits")
        .add_header("x-admin-key", ADMIN_API_KEY)
        .json(&json!({ "user_id": user.id.get(), "amount": 0, "note": "x" }))
        .await
        .assert_status_bad_request();

    harness
        .server
        .post("/v1/admin/credits")
        .add_header("x-admin-key", ADMIN_API_KEY)
        .json(&json!({ "user_id": 999, "amount": 5, "note": "x" }))
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn admin_grant_requires_admin_key() {
    let harness = TestHarness::new();
    let user = harness.register("a@example.com").await;

    harness
        .server
        .post("/v1/admin/credits")
        .add_header("x-admin-key", SERVICE_API_KEY)
        .json(&json!({ "user_id": user.id.get(), "amount": 5, "note": "x" }))
        .await
        .assert_status_unauthorized();

    assert_eq!(harness.user(user.id).await.credit_balance, 10);
}
