//! PostgreSQL storage implementation.
//!
//! Ledger mutations lock the user row with `SELECT ... FOR UPDATE`, run the
//! core ledger function on the locked row, and write the row, the credit
//! transaction and any markers before committing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use tarot_billing_core::{
    apply_entitlement, credit_expiry_from, generate_invitation_code, grant_credits, spend_credit,
    CardDrawn, ChargeOutcome, CreditTransaction, EntitlementChange, GrantReason, Message, MessageRole,
    NewReading, NewUser, Plan, ReadingSession, SessionId, Subscription, User, UserId,
    INVITATION_REWARD_CREDITS, REGISTRATION_BONUS_CREDITS,
};

use crate::error::{Result, StoreError};
use crate::schema::{
    CardRow, MessageRow, SessionRow, SubscriptionRow, TransactionRow, UserRow, CARD_COLUMNS,
    MESSAGE_COLUMNS, SESSION_COLUMNS, TRANSACTION_COLUMNS, USER_COLUMNS,
};
use crate::{EntitlementOutcome, Registration, Store};

/// Attempts at drawing an unused invitation code before giving up.
const INVITATION_CODE_ATTEMPTS: usize = 5;

type Tx = Transaction<'static, Postgres>;

/// PostgreSQL-backed storage implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with at most `max_connections` connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_user(tx: &mut Tx, user_id: UserId) -> Result<User> {
        sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE"
        ))
        .bind(user_id.get())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::NotFound)?
        .try_into()
    }

    async fn save_user(tx: &mut Tx, user: &User) -> Result<()> {
        sqlx::query(
            r"
            UPDATE users
            SET credit_balance = $2, credits_expires_at = $3, plan = $4,
                stripe_customer_id = $5, ai_readings_usage = $6,
                consultation_usage = $7, updated_at = $8
            WHERE id = $1
            ",
        )
        .bind(user.id.get())
        .bind(user.credit_balance)
        .bind(user.credits_expires_at)
        .bind(user.plan.as_str())
        .bind(user.stripe_customer_id.as_deref())
        .bind(user.ai_readings_usage)
        .bind(user.consultation_usage)
        .bind(user.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn detach_customer_from_others(
        tx: &mut Tx,
        customer_id: &str,
        keep: UserId,
    ) -> Result<()> {
        let previous: Vec<i64> = sqlx::query_scalar(
            r"
            UPDATE users
            SET stripe_customer_id = NULL, updated_at = now()
            WHERE stripe_customer_id = $1 AND id <> $2
            RETURNING id
            ",
        )
        .bind(customer_id)
        .bind(keep.get())
        .fetch_all(&mut **tx)
        .await?;

        for previous_user_id in previous {
            tracing::warn!(
                customer_id = %customer_id,
                previous_user_id,
                user_id = %keep,
                "Customer moved to another user"
            );
        }
        Ok(())
    }

    async fn insert_transaction(tx: &mut Tx, record: &CreditTransaction) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO credit_transactions
                (id, user_id, amount, kind, balance_after, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(record.id.to_string())
        .bind(record.user_id.get())
        .bind(record.amount)
        .bind(record.kind.as_str())
        .bind(record.balance_after)
        .bind(&record.description)
        .bind(record.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn find_session(tx: &mut Tx, session_id: &SessionId) -> Result<Option<ReadingSession>> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM reading_sessions WHERE id = $1"
        ))
        .bind(session_id.as_str())
        .fetch_optional(&mut **tx)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn insert_user(tx: &mut Tx, user: &User) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO users
                (email, credit_balance, credits_expires_at, plan, invitation_code,
                 invited_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING id
            ",
        )
        .bind(&user.email)
        .bind(user.credit_balance)
        .bind(user.credits_expires_at)
        .bind(user.plan.as_str())
        .bind(&user.invitation_code)
        .bind(user.invited_by.map(UserId::get))
        .bind(user.created_at)
        .fetch_one(&mut **tx)
        .await?;
        Ok(id)
    }

    async fn unused_invitation_code(tx: &mut Tx) -> Result<String> {
        for _ in 0..INVITATION_CODE_ATTEMPTS {
            let code = generate_invitation_code();
            let taken: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM users WHERE invitation_code = $1)")
                    .bind(&code)
                    .fetch_one(&mut **tx)
                    .await?;
            if !taken {
                return Ok(code);
            }
        }
        Err(StoreError::Conflict(
            "could not allocate an invitation code".into(),
        ))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn register_user(&self, new_user: NewUser) -> Result<Registration> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM users WHERE email = $1)")
                .bind(&new_user.email)
                .fetch_one(&mut *tx)
                .await?;
        if exists {
            return Err(StoreError::Conflict(format!(
                "email already registered: {}",
                new_user.email
            )));
        }

        let inviter = match new_user.invite_code.as_deref() {
            Some(code) => sqlx::query_scalar::<_, i64>(
                "SELECT id FROM users WHERE invitation_code = $1 FOR UPDATE",
            )
            .bind(code)
            .fetch_optional(&mut *tx)
            .await?
            .map(UserId::new),
            None => None,
        };

        let mut user = User {
            id: UserId::new(0),
            email: new_user.email,
            credit_balance: 0,
            credits_expires_at: None,
            plan: Plan::Basic,
            stripe_customer_id: None,
            ai_readings_usage: 0,
            consultation_usage: 0,
            invitation_code: Self::unused_invitation_code(&mut tx).await?,
            invited_by: inviter,
            created_at: now,
            updated_at: now,
        };
        user.id = UserId::new(Self::insert_user(&mut tx, &user).await?);

        let bonus = grant_credits(
            &mut user,
            &GrantReason::Registration,
            REGISTRATION_BONUS_CREDITS,
            Some(credit_expiry_from(now)),
            now,
        )?;
        Self::save_user(&mut tx, &user).await?;
        Self::insert_transaction(&mut tx, &bonus).await?;

        if let Some(inviter_id) = inviter {
            let mut inviter = Self::lock_user(&mut tx, inviter_id).await?;
            let reward = grant_credits(
                &mut inviter,
                &GrantReason::Invitation { invitee: user.id },
                INVITATION_REWARD_CREDITS,
                None,
                now,
            )?;
            Self::save_user(&mut tx, &inviter).await?;
            Self::insert_transaction(&mut tx, &reward).await?;
        }

        tx.commit().await?;
        tracing::debug!(user_id = %user.id, invited_by = ?inviter, "User registered");

        Ok(Registration {
            user,
            rewarded_inviter: inviter,
        })
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id.get())
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE stripe_customer_id = $1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn grant_credits(
        &self,
        user_id: UserId,
        amount: i64,
        reason: GrantReason,
        new_expiry: Option<DateTime<Utc>>,
    ) -> Result<User> {
        let mut tx = self.pool.begin().await?;
        let mut user = Self::lock_user(&mut tx, user_id).await?;

        let record = grant_credits(&mut user, &reason, amount, new_expiry, Utc::now())?;
        Self::save_user(&mut tx, &user).await?;
        Self::insert_transaction(&mut tx, &record).await?;
        tx.commit().await?;

        Ok(user)
    }

    async fn list_transactions(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);

        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id.get())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO subscriptions
                (stripe_subscription_id, user_id, stripe_price_id, status,
                 current_period_start, current_period_end, cancel_at_period_end, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                stripe_price_id = EXCLUDED.stripe_price_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(&subscription.stripe_subscription_id)
        .bind(subscription.user_id.get())
        .bind(subscription.stripe_price_id.as_deref())
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r"
            SELECT stripe_subscription_id, user_id, stripe_price_id, status,
                   current_period_start, current_period_end, cancel_at_period_end, updated_at
            FROM subscriptions
            WHERE stripe_subscription_id = $1
            ",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn apply_entitlement(
        &self,
        event_id: &str,
        event_type: &str,
        user_id: UserId,
        change: &EntitlementChange,
    ) -> Result<EntitlementOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r"
            INSERT INTO processed_events (event_id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            ",
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(EntitlementOutcome::Duplicate);
        }

        let mut user = Self::lock_user(&mut tx, user_id).await?;
        let effect = apply_entitlement(&mut user, change, Utc::now());

        if let Some(customer_id) = change.linked_customer() {
            Self::detach_customer_from_others(&mut tx, customer_id, user_id).await?;
        }
        if effect.changed {
            Self::save_user(&mut tx, &user).await?;
        }
        if let Some(record) = &effect.transaction {
            Self::insert_transaction(&mut tx, record).await?;
        }
        tx.commit().await?;

        if effect.changed {
            Ok(EntitlementOutcome::Applied {
                user,
                transaction: effect.transaction,
            })
        } else {
            Ok(EntitlementOutcome::Unchanged)
        }
    }

    async fn prune_processed_events(&self, before: DateTime<Utc>) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Option<ReadingSession>> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM reading_sessions WHERE id = $1"
        ))
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn charge_session_if_new(
        &self,
        user_id: UserId,
        reading: &NewReading,
    ) -> Result<ChargeOutcome> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let mut user = Self::lock_user(&mut tx, user_id).await?;

        if let Some(existing) = Self::find_session(&mut tx, &reading.session_id).await? {
            tx.rollback().await?;
            if existing.user_id != user_id {
                return Err(StoreError::Conflict(format!(
                    "session {} belongs to another user",
                    reading.session_id
                )));
            }
            return Ok(ChargeOutcome::AlreadyCharged);
        }

        let record = match spend_credit(&mut user, reading.session_id.as_str(), now) {
            Ok(record) => record,
            Err(rejection) => {
                if let Some(expired) = &rejection.expired {
                    Self::save_user(&mut tx, &user).await?;
                    Self::insert_transaction(&mut tx, expired).await?;
                    tx.commit().await?;
                } else {
                    tx.rollback().await?;
                }
                return Err(rejection.error.into());
            }
        };

        let inserted = sqlx::query(
            r"
            INSERT INTO reading_sessions (id, user_id, spread_id, question, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(reading.session_id.as_str())
        .bind(user_id.get())
        .bind(&reading.spread_id)
        .bind(&reading.question)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Another user's request claimed this id after our lookup.
            tx.rollback().await?;
            tracing::debug!(session_id = %reading.session_id, "Session created concurrently");
            return Err(StoreError::Conflict(format!(
                "session {} belongs to another user",
                reading.session_id
            )));
        }

        for card in &reading.cards {
            sqlx::query(
                r"
                INSERT INTO cards_drawn (session_id, card_id, position_id, is_reversed)
                VALUES ($1, $2, $3, $4)
                ",
            )
            .bind(reading.session_id.as_str())
            .bind(&card.card_id)
            .bind(&card.position_id)
            .bind(card.is_reversed)
            .execute(&mut *tx)
            .await?;
        }

        Self::save_user(&mut tx, &user).await?;
        Self::insert_transaction(&mut tx, &record).await?;
        tx.commit().await?;

        Ok(ChargeOutcome::Charged {
            balance: user.credit_balance,
        })
    }

    async fn list_sessions(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ReadingSession>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);

        sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM reading_sessions \
             WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id.get())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    async fn list_cards(&self, session_id: &SessionId) -> Result<Vec<CardDrawn>> {
        let rows = sqlx::query_as::<_, CardRow>(&format!(
            "SELECT {CARD_COLUMNS} FROM cards_drawn WHERE session_id = $1 ORDER BY id"
        ))
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn append_message(
        &self,
        session_id: &SessionId,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "INSERT INTO messages (session_id, role, content) \
             SELECT id, $2, $3 FROM reading_sessions WHERE id = $1 \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(session_id.as_str())
        .bind(role.as_str())
        .bind(content)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        row.try_into()
    }

    async fn list_messages(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = $1 ORDER BY id"
        ))
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
