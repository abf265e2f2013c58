//! Storage layer for tarot-billing.
//!
//! This crate persists users, their credit ledger, subscriptions, reading
//! sessions and messages. Two backends implement the [`Store`] trait:
//!
//! - [`PgStore`]: PostgreSQL via `sqlx`, with embedded migrations
//! - [`MemoryStore`]: a single-process store for tests and local development
//!
//! # Atomicity
//!
//! Every ledger mutation is a compound operation: the user row is locked,
//! the pure ledger function from `tarot-billing-core` decides the outcome,
//! and the new row is written together with its credit transaction (and,
//! for billing events, the processed-event marker) in one unit of work.
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> tarot_billing_store::Result<()> {
//! use tarot_billing_core::NewUser;
//! use tarot_billing_store::{MemoryStore, Store};
//!
//! let store = MemoryStore::new();
//! let registration = store
//!     .register_user(NewUser {
//!         email: "seeker@example.com".into(),
//!         invite_code: None,
//!     })
//!     .await?;
//! assert_eq!(registration.user.credit_balance, 10);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod pg;
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use pg::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tarot_billing_core::{
    CardDrawn, ChargeOutcome, CreditTransaction, EntitlementChange, GrantReason, Message,
    MessageRole, NewReading, NewUser, ReadingSession, SessionId, Subscription, User, UserId,
};

/// Result of registering a user.
#[derive(Debug, Clone)]
pub struct Registration {
    /// The new user, with the registration bonus applied.
    pub user: User,
    /// The inviter who was rewarded, if the invite code matched.
    pub rewarded_inviter: Option<UserId>,
}

/// Result of applying a billing event's entitlement change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitlementOutcome {
    /// The user row changed.
    Applied {
        /// The user after the change.
        user: User,
        /// Credits granted, if any.
        transaction: Option<CreditTransaction>,
    },
    /// The change was a no-op for this user (e.g. plan already current).
    Unchanged,
    /// The event id was already processed; nothing was done.
    Duplicate,
}

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different
/// implementations (PostgreSQL, in-memory for testing).
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // User Operations
    // =========================================================================

    /// Create a user with the registration bonus and a fresh invitation code.
    ///
    /// If `invite_code` matches an existing user, the new user records them
    /// as inviter and the inviter is rewarded in the same unit of work. An
    /// unknown invite code is ignored.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the email is already registered.
    async fn register_user(&self, new_user: NewUser) -> Result<Registration>;

    /// Get a user by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_user(&self, user_id: UserId) -> Result<Option<User>>;

    /// Find the user linked to a billing-provider customer.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<User>>;

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    /// Add credits and record the transaction atomically.
    ///
    /// Returns the user after the grant.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the user doesn't exist.
    /// - `StoreError::Billing(InvalidAmount)` if `amount` is not positive.
    async fn grant_credits(
        &self,
        user_id: UserId,
        amount: i64,
        reason: GrantReason,
        new_expiry: Option<DateTime<Utc>>,
    ) -> Result<User>;

    /// List credit transactions for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_transactions(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>>;

    // =========================================================================
    // Billing Operations
    // =========================================================================

    /// Insert or update the mirror row keyed by the provider subscription id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Get a subscription by provider id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>>;

    /// Apply an entitlement change for a billing event, at most once per
    /// event id.
    ///
    /// The change is evaluated against the locked user row and written with
    /// the processed-event marker in one unit of work. When the change links
    /// a customer that another user holds, that user is unlinked first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the user doesn't exist.
    async fn apply_entitlement(
        &self,
        event_id: &str,
        event_type: &str,
        user_id: UserId,
        change: &EntitlementChange,
    ) -> Result<EntitlementOutcome>;

    /// Forget processed-event markers recorded before `before`.
    ///
    /// Returns how many were removed. Events older than the provider's
    /// redelivery window can no longer arrive, so their markers are dead.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn prune_processed_events(&self, before: DateTime<Utc>) -> Result<u64>;

    // =========================================================================
    // Reading Session Operations
    // =========================================================================

    /// Get a reading session by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_session(&self, session_id: &SessionId) -> Result<Option<ReadingSession>>;

    /// Charge one credit and create the session, unless it already exists.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the user doesn't exist.
    /// - `StoreError::Conflict` if the session exists but belongs to
    ///   another user.
    /// - `StoreError::Billing(InsufficientCredits)` if the balance is empty.
    /// - `StoreError::Billing(CreditsExpired)` if the balance expired; the
    ///   zeroed balance is committed before returning.
    async fn charge_session_if_new(
        &self,
        user_id: UserId,
        reading: &NewReading,
    ) -> Result<ChargeOutcome>;

    /// List a user's reading sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_sessions(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ReadingSession>>;

    /// Cards recorded for a session, in the order they were placed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_cards(&self, session_id: &SessionId) -> Result<Vec<CardDrawn>>;

    /// Append a message to a session's conversation.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the session doesn't exist.
    async fn append_message(
        &self,
        session_id: &SessionId,
        role: MessageRole,
        content: &str,
    ) -> Result<Message>;

    /// List a session's messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_messages(&self, session_id: &SessionId) -> Result<Vec<Message>>;

    // =========================================================================
    // Health
    // =========================================================================

    /// Check that the backend is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot serve requests.
    async fn ping(&self) -> Result<()>;
}
