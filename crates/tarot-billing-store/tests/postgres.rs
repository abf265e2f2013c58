//! PostgreSQL backend tests.
//!
//! These need a disposable database:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/tarot_billing_test cargo test -p tarot-billing-store -- --ignored
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use tarot_billing_core::{
    BillingError, CardDrawn, ChargeOutcome, EntitlementChange, GrantReason, NewReading, NewUser,
    Plan, TransactionKind,
};
use tarot_billing_store::schema::all_tables;
use tarot_billing_store::{EntitlementOutcome, PgStore, Store};

async fn fresh_store() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = PgStore::connect(&url, 16).await.unwrap();
    store.migrate().await.unwrap();

    let tables = all_tables().join(", ");
    sqlx::query(&format!("TRUNCATE {tables} RESTART IDENTITY CASCADE"))
        .execute(store.pool())
        .await
        .unwrap();
    store
}

fn new_user(email: &str) -> NewUser {
    NewUser {
        email: email.into(),
        invite_code: None,
    }
}

fn reading(id: &str) -> NewReading {
    NewReading {
        session_id: id.parse().unwrap(),
        spread_id: "celtic-cross".into(),
        question: "Where am I headed?".into(),
        cards: vec![
            CardDrawn {
                card_id: "the-fool".into(),
                position_id: "present".into(),
                is_reversed: false,
            },
            CardDrawn {
                card_id: "the-tower".into(),
                position_id: "challenge".into(),
                is_reversed: true,
            },
        ],
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn registration_and_invitation() {
    let store = fresh_store().await;
    let inviter = store.register_user(new_user("a@example.com")).await.unwrap().user;
    assert_eq!(inviter.credit_balance, 10);

    let invitee = store
        .register_user(NewUser {
            email: "b@example.com".into(),
            invite_code: Some(inviter.invitation_code.clone()),
        })
        .await
        .unwrap();
    assert_eq!(invitee.rewarded_inviter, Some(inviter.id));

    let inviter_after = store.get_user(inviter.id).await.unwrap().unwrap();
    assert_eq!(inviter_after.credit_balance, 20);

    let history = store.list_transactions(inviter.id, 10, 0).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].kind, TransactionKind::InvitationReward);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_charges_on_one_session_deduct_once() {
    let store = Arc::new(fresh_store().await);
    let user = store.register_user(new_user("a@example.com")).await.unwrap().user;
    let user_id = user.id;

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.charge_session_if_new(user_id, &reading("s1")).await })
        })
        .collect();

    let mut charged = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() != ChargeOutcome::AlreadyCharged {
            charged += 1;
        }
    }
    assert_eq!(charged, 1);

    let after = store.get_user(user_id).await.unwrap().unwrap();
    assert_eq!(after.credit_balance, 9);
    assert!(store.get_session(&"s1".parse().unwrap()).await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn expired_credits_are_zeroed_and_committed() {
    let store = fresh_store().await;
    let user = store.register_user(new_user("a@example.com")).await.unwrap().user;
    store
        .grant_credits(
            user.id,
            5,
            GrantReason::Redemption {
                note: "test".into(),
            },
            Some(Utc::now() - Duration::minutes(1)),
        )
        .await
        .unwrap();

    let err = store
        .charge_session_if_new(user.id, &reading("s1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.billing(),
        Some(BillingError::CreditsExpired { .. })
    ));

    let after = store.get_user(user.id).await.unwrap().unwrap();
    assert_eq!(after.credit_balance, 0);
    assert!(store.get_session(&"s1".parse().unwrap()).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn redelivered_event_is_applied_once() {
    let store = fresh_store().await;
    let user = store.register_user(new_user("a@example.com")).await.unwrap().user;
    let change = EntitlementChange::Purchase {
        plan: Plan::Premium,
        customer_id: Some("cus_pg".into()),
    };

    let first = store
        .apply_entitlement("evt_pg", "checkout.session.completed", user.id, &change)
        .await
        .unwrap();
    assert!(matches!(first, EntitlementOutcome::Applied { .. }));

    let again = store
        .apply_entitlement("evt_pg", "checkout.session.completed", user.id, &change)
        .await
        .unwrap();
    assert_eq!(again, EntitlementOutcome::Duplicate);

    let after = store.find_user_by_customer("cus_pg").await.unwrap().unwrap();
    assert_eq!(after.plan, Plan::Premium);
    assert_eq!(after.credit_balance, 110);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn checkout_with_linked_customer_moves_it() {
    let store = fresh_store().await;
    let first = store.register_user(new_user("a@example.com")).await.unwrap().user;
    let second = store.register_user(new_user("b@example.com")).await.unwrap().user;
    let change = EntitlementChange::Purchase {
        plan: Plan::Pro,
        customer_id: Some("cus_shared".into()),
    };

    store
        .apply_entitlement("evt_a", "checkout.session.completed", first.id, &change)
        .await
        .unwrap();
    let outcome = store
        .apply_entitlement("evt_b", "checkout.session.completed", second.id, &change)
        .await
        .unwrap();
    assert!(matches!(outcome, EntitlementOutcome::Applied { .. }));

    let first = store.get_user(first.id).await.unwrap().unwrap();
    assert_eq!(first.stripe_customer_id, None);
    assert_eq!(first.plan, Plan::Pro);

    let holder = store.find_user_by_customer("cus_shared").await.unwrap().unwrap();
    assert_eq!(holder.id, second.id);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn sessions_are_listed_with_their_cards() {
    let store = fresh_store().await;
    let user = store.register_user(new_user("a@example.com")).await.unwrap().user;
    for id in ["s1", "s2"] {
        store.charge_session_if_new(user.id, &reading(id)).await.unwrap();
    }

    let sessions = store.list_sessions(user.id, 10, 0).await.unwrap();
    let ids: Vec<_> = sessions.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["s2", "s1"]);
    assert_eq!(store.list_sessions(user.id, 10, 1).await.unwrap().len(), 1);

    let cards = store.list_cards(&"s1".parse().unwrap()).await.unwrap();
    assert_eq!(cards, reading("s1").cards);
    assert!(store.list_cards(&"nope".parse().unwrap()).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn old_event_markers_are_pruned() {
    let store = fresh_store().await;
    let user = store.register_user(new_user("a@example.com")).await.unwrap().user;
    let renew = EntitlementChange::Renew { plan: Plan::Pro };
    store
        .apply_entitlement("evt_old", "invoice.paid", user.id, &renew)
        .await
        .unwrap();

    assert_eq!(
        store.prune_processed_events(Utc::now() - Duration::days(1)).await.unwrap(),
        0
    );
    assert_eq!(
        store.prune_processed_events(Utc::now() + Duration::seconds(1)).await.unwrap(),
        1
    );
}
