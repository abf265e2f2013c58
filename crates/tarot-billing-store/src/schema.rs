//! Database schema definitions.
//!
//! Row types mirror the tables created by `migrations/`; each converts into
//! the corresponding core type, rejecting values the core cannot represent.

use chrono::{DateTime, Utc};
use tarot_billing_core::{
    CardDrawn, CreditTransaction, Message, MessageRole, Plan, ReadingSession, SessionId,
    Subscription, TransactionId, TransactionKind, User, UserId,
};

use crate::error::StoreError;

/// Table names.
pub mod table {
    /// Users and their ledger.
    pub const USERS: &str = "users";
    /// Provider subscription mirror.
    pub const SUBSCRIPTIONS: &str = "subscriptions";
    /// Charged reading sessions.
    pub const READING_SESSIONS: &str = "reading_sessions";
    /// Cards placed in a session.
    pub const CARDS_DRAWN: &str = "cards_drawn";
    /// Conversation messages.
    pub const MESSAGES: &str = "messages";
    /// Balance change audit trail.
    pub const CREDIT_TRANSACTIONS: &str = "credit_transactions";
    /// Applied provider events.
    pub const PROCESSED_EVENTS: &str = "processed_events";
}

/// Returns all table names, in creation order.
#[must_use]
pub fn all_tables() -> Vec<&'static str> {
    vec![
        table::USERS,
        table::SUBSCRIPTIONS,
        table::READING_SESSIONS,
        table::CARDS_DRAWN,
        table::MESSAGES,
        table::CREDIT_TRANSACTIONS,
        table::PROCESSED_EVENTS,
    ]
}

pub(crate) const USER_COLUMNS: &str = "id, email, credit_balance, credits_expires_at, plan, \
     stripe_customer_id, ai_readings_usage, consultation_usage, invitation_code, invited_by, \
     created_at, updated_at";

pub(crate) const SESSION_COLUMNS: &str = "id, user_id, spread_id, question, created_at";

pub(crate) const CARD_COLUMNS: &str = "card_id, position_id, is_reversed";

pub(crate) const MESSAGE_COLUMNS: &str = "id, session_id, role, content, created_at";

pub(crate) const TRANSACTION_COLUMNS: &str =
    "id, user_id, amount, kind, balance_after, description, created_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct UserRow {
    pub id: i64,
    pub email: String,
    pub credit_balance: i64,
    pub credits_expires_at: Option<DateTime<Utc>>,
    pub plan: String,
    pub stripe_customer_id: Option<String>,
    pub ai_readings_usage: i32,
    pub consultation_usage: i32,
    pub invitation_code: String,
    pub invited_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let plan = Plan::from_name(&row.plan)
            .ok_or_else(|| StoreError::Serialization(format!("unknown plan: {}", row.plan)))?;

        Ok(Self {
            id: UserId::new(row.id),
            email: row.email,
            credit_balance: row.credit_balance,
            credits_expires_at: row.credits_expires_at,
            plan,
            stripe_customer_id: row.stripe_customer_id,
            ai_readings_usage: row.ai_readings_usage,
            consultation_usage: row.consultation_usage,
            invitation_code: row.invitation_code,
            invited_by: row.invited_by.map(UserId::new),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SubscriptionRow {
    pub stripe_subscription_id: String,
    pub user_id: i64,
    pub stripe_price_id: Option<String>,
    pub status: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            stripe_subscription_id: row.stripe_subscription_id,
            user_id: UserId::new(row.user_id),
            stripe_price_id: row.stripe_price_id,
            status: row.status.into(),
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SessionRow {
    pub id: String,
    pub user_id: i64,
    pub spread_id: String,
    pub question: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for ReadingSession {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_session_id(row.id)?,
            user_id: UserId::new(row.user_id),
            spread_id: row.spread_id,
            question: row.question,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CardRow {
    pub card_id: String,
    pub position_id: String,
    pub is_reversed: bool,
}

impl From<CardRow> for CardDrawn {
    fn from(row: CardRow) -> Self {
        Self {
            card_id: row.card_id,
            position_id: row.position_id,
            is_reversed: row.is_reversed,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MessageRow {
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let role = MessageRole::from_name(&row.role)
            .ok_or_else(|| StoreError::Serialization(format!("unknown role: {}", row.role)))?;

        Ok(Self {
            id: row.id,
            session_id: parse_session_id(row.session_id)?,
            role,
            content: row.content,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TransactionRow {
    pub id: String,
    pub user_id: i64,
    pub amount: i64,
    pub kind: String,
    pub balance_after: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for CreditTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let id: TransactionId = row
            .id
            .parse()
            .map_err(|_| StoreError::Serialization(format!("bad transaction id: {}", row.id)))?;
        let kind = TransactionKind::from_name(&row.kind)
            .ok_or_else(|| StoreError::Serialization(format!("unknown kind: {}", row.kind)))?;

        Ok(Self {
            id,
            user_id: UserId::new(row.user_id),
            amount: row.amount,
            kind,
            balance_after: row.balance_after,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

fn parse_session_id(raw: String) -> Result<SessionId, StoreError> {
    SessionId::try_from(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_row_with_unknown_plan_is_rejected() {
        let now = Utc::now();
        let row = UserRow {
            id: 1,
            email: "a@example.com".into(),
            credit_balance: 0,
            credits_expires_at: None,
            plan: "enterprise".into(),
            stripe_customer_id: None,
            ai_readings_usage: 0,
            consultation_usage: 0,
            invitation_code: "ABCDEFGH".into(),
            invited_by: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(
            User::try_from(row),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn tables_are_listed_once() {
        let tables = all_tables();
        let mut deduped = tables.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(tables.len(), deduped.len());
    }
}
