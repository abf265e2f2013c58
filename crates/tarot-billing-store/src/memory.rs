//! In-memory storage implementation.
//!
//! All state sits behind one async mutex, so every trait method is a single
//! critical section: the same atomicity the PostgreSQL backend gets from a
//! transaction holding the user row lock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use tarot_billing_core::{
    apply_entitlement, credit_expiry_from, generate_invitation_code, grant_credits, spend_credit,
    CardDrawn, ChargeOutcome, CreditTransaction, EntitlementChange, GrantReason, Message,
    MessageRole, NewReading, NewUser, Plan, ReadingSession, SessionId, Subscription, User,
    UserId, INVITATION_REWARD_CREDITS, REGISTRATION_BONUS_CREDITS,
};

use crate::error::{Result, StoreError};
use crate::{EntitlementOutcome, Registration, Store};

#[derive(Default)]
struct Inner {
    next_user_id: i64,
    next_message_id: i64,
    users: HashMap<UserId, User>,
    subscriptions: HashMap<String, Subscription>,
    sessions: HashMap<SessionId, ReadingSession>,
    session_order: Vec<SessionId>,
    cards: HashMap<SessionId, Vec<CardDrawn>>,
    messages: Vec<Message>,
    transactions: Vec<CreditTransaction>,
    processed_events: HashMap<String, DateTime<Utc>>,
}

impl Inner {
    fn user_mut(&mut self, user_id: UserId) -> Result<&mut User> {
        self.users.get_mut(&user_id).ok_or(StoreError::NotFound)
    }

    fn detach_customer_from_others(
        &mut self,
        customer_id: &str,
        keep: UserId,
        now: DateTime<Utc>,
    ) {
        let holders = self
            .users
            .values_mut()
            .filter(|u| u.id != keep && u.stripe_customer_id.as_deref() == Some(customer_id));
        for other in holders {
            tracing::warn!(
                customer_id = %customer_id,
                previous_user_id = %other.id,
                user_id = %keep,
                "Customer moved to another user"
            );
            other.stripe_customer_id = None;
            other.updated_at = now;
        }
    }

    fn unique_invitation_code(&self) -> String {
        loop {
            let code = generate_invitation_code();
            if !self.users.values().any(|u| u.invitation_code == code) {
                return code;
            }
        }
    }
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user row as-is.
    ///
    /// Used to seed fixtures (e.g. an already-expired balance) that the
    /// public operations cannot produce directly.
    pub async fn insert_user(&self, user: User) {
        let mut inner = self.inner.lock().await;
        inner.next_user_id = inner.next_user_id.max(user.id.get());
        inner.users.insert(user.id, user);
    }

    /// Number of reading sessions stored.
    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn register_user(&self, new_user: NewUser) -> Result<Registration> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        if inner.users.values().any(|u| u.email == new_user.email) {
            return Err(StoreError::Conflict(format!(
                "email already registered: {}",
                new_user.email
            )));
        }

        let inviter = new_user.invite_code.as_deref().and_then(|code| {
            inner
                .users
                .values()
                .find(|u| u.invitation_code == code)
                .map(|u| u.id)
        });

        inner.next_user_id += 1;
        let mut user = User {
            id: UserId::new(inner.next_user_id),
            email: new_user.email,
            credit_balance: 0,
            credits_expires_at: None,
            plan: Plan::Basic,
            stripe_customer_id: None,
            ai_readings_usage: 0,
            consultation_usage: 0,
            invitation_code: inner.unique_invitation_code(),
            invited_by: inviter,
            created_at: now,
            updated_at: now,
        };

        let bonus = grant_credits(
            &mut user,
            &GrantReason::Registration,
            REGISTRATION_BONUS_CREDITS,
            Some(credit_expiry_from(now)),
            now,
        )?;
        inner.transactions.push(bonus);

        if let Some(inviter_id) = inviter {
            let inviter = inner.user_mut(inviter_id)?;
            let reward = grant_credits(
                inviter,
                &GrantReason::Invitation { invitee: user.id },
                INVITATION_REWARD_CREDITS,
                None,
                now,
            )?;
            inner.transactions.push(reward);
        }

        inner.users.insert(user.id, user.clone());

        Ok(Registration {
            user,
            rewarded_inviter: inviter,
        })
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        Ok(self.inner.lock().await.users.get(&user_id).cloned())
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<User>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn grant_credits(
        &self,
        user_id: UserId,
        amount: i64,
        reason: GrantReason,
        new_expiry: Option<DateTime<Utc>>,
    ) -> Result<User> {
        let mut inner = self.inner.lock().await;
        let user = inner.user_mut(user_id)?;

        let tx = grant_credits(user, &reason, amount, new_expiry, Utc::now())?;
        let updated = user.clone();
        inner.transactions.push(tx);

        Ok(updated)
    }

    async fn list_transactions(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.user_id == user_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.subscriptions.insert(
            subscription.stripe_subscription_id.clone(),
            subscription.clone(),
        );
        Ok(())
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>> {
        Ok(self
            .inner
            .lock()
            .await
            .subscriptions
            .get(subscription_id)
            .cloned())
    }

    async fn apply_entitlement(
        &self,
        event_id: &str,
        _event_type: &str,
        user_id: UserId,
        change: &EntitlementChange,
    ) -> Result<EntitlementOutcome> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        if inner.processed_events.contains_key(event_id) {
            return Ok(EntitlementOutcome::Duplicate);
        }
        if !inner.users.contains_key(&user_id) {
            return Err(StoreError::NotFound);
        }

        if let Some(customer_id) = change.linked_customer() {
            inner.detach_customer_from_others(customer_id, user_id, now);
        }

        let user = inner.user_mut(user_id)?;
        let effect = apply_entitlement(user, change, now);
        let updated = user.clone();

        inner.processed_events.insert(event_id.to_string(), now);
        if let Some(tx) = &effect.transaction {
            inner.transactions.push(tx.clone());
        }

        if effect.changed {
            Ok(EntitlementOutcome::Applied {
                user: updated,
                transaction: effect.transaction,
            })
        } else {
            Ok(EntitlementOutcome::Unchanged)
        }
    }

    async fn prune_processed_events(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let count = inner.processed_events.len();
        inner.processed_events.retain(|_, processed_at| *processed_at >= before);
        Ok(u64::try_from(count - inner.processed_events.len()).unwrap_or(u64::MAX))
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Option<ReadingSession>> {
        Ok(self.inner.lock().await.sessions.get(session_id).cloned())
    }

    async fn charge_session_if_new(
        &self,
        user_id: UserId,
        reading: &NewReading,
    ) -> Result<ChargeOutcome> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        if let Some(existing) = inner.sessions.get(&reading.session_id) {
            if existing.user_id != user_id {
                return Err(StoreError::Conflict(format!(
                    "session {} belongs to another user",
                    reading.session_id
                )));
            }
            return Ok(ChargeOutcome::AlreadyCharged);
        }

        let user = inner.user_mut(user_id)?;
        let (tx, balance) = match spend_credit(user, reading.session_id.as_str(), now) {
            Ok(tx) => (tx, user.credit_balance),
            Err(rejection) => {
                if let Some(expired) = rejection.expired {
                    inner.transactions.push(expired);
                }
                return Err(rejection.error.into());
            }
        };

        inner.transactions.push(tx);
        inner.sessions.insert(
            reading.session_id.clone(),
            ReadingSession {
                id: reading.session_id.clone(),
                user_id,
                spread_id: reading.spread_id.clone(),
                question: reading.question.clone(),
                created_at: now,
            },
        );
        inner.session_order.push(reading.session_id.clone());
        inner
            .cards
            .insert(reading.session_id.clone(), reading.cards.clone());

        Ok(ChargeOutcome::Charged { balance })
    }

    async fn list_sessions(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ReadingSession>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .session_order
            .iter()
            .rev()
            .filter_map(|id| inner.sessions.get(id))
            .filter(|session| session.user_id == user_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_cards(&self, session_id: &SessionId) -> Result<Vec<CardDrawn>> {
        let inner = self.inner.lock().await;
        Ok(inner.cards.get(session_id).cloned().unwrap_or_default())
    }

    async fn append_message(
        &self,
        session_id: &SessionId,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let mut inner = self.inner.lock().await;
        if !inner.sessions.contains_key(session_id) {
            return Err(StoreError::NotFound);
        }

        inner.next_message_id += 1;
        let message = Message {
            id: inner.next_message_id,
            session_id: session_id.clone(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        inner.messages.push(message.clone());

        Ok(message)
    }

    async fn list_messages(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .iter()
            .filter(|m| &m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
