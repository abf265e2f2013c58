//! Reading session types for tarot-billing.
//!
//! A [`ReadingSession`] is opened by spending one credit. The session row is
//! the marker that the charge happened: it is created at most once per id, in
//! the same unit of work as the deduction and the cards drawn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SessionId, UserId};

/// A charged reading session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingSession {
    /// Client-generated session id.
    pub id: SessionId,

    /// The user who was charged.
    pub user_id: UserId,

    /// Spread layout used for the reading.
    pub spread_id: String,

    /// The seeker's question.
    pub question: String,

    /// When the session was charged.
    pub created_at: DateTime<Utc>,
}

/// A card placed in a spread position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardDrawn {
    /// Card identifier.
    pub card_id: String,

    /// Spread position the card was placed in.
    pub position_id: String,

    /// Whether the card was drawn reversed.
    pub is_reversed: bool,
}

/// Everything needed to open a new reading session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReading {
    /// Client-generated session id.
    pub session_id: SessionId,

    /// Spread layout used for the reading.
    pub spread_id: String,

    /// The seeker's question.
    pub question: String,

    /// Cards placed in the spread.
    pub cards: Vec<CardDrawn>,
}

/// Outcome of the charging gate for one session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// One credit was spent and the session created.
    Charged {
        /// Balance after the charge.
        balance: i64,
    },

    /// The session already existed; nothing was spent.
    AlreadyCharged,
}

impl ChargeOutcome {
    /// Whether this call performed the deduction.
    #[must_use]
    pub const fn charged(self) -> bool {
        matches!(self, Self::Charged { .. })
    }
}

/// A message in a reading conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned id.
    pub id: i64,

    /// Owning session.
    pub session_id: SessionId,

    /// Who wrote the message.
    pub role: MessageRole,

    /// Message text.
    pub content: String,

    /// When the message was stored.
    pub created_at: DateTime<Utc>,
}

/// Author of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The seeker.
    User,
    /// The reading oracle.
    Assistant,
}

impl MessageRole {
    /// Stored name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse a stored name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serde_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
        assert_eq!(MessageRole::from_name("user"), Some(MessageRole::User));
        assert_eq!(MessageRole::from_name("system"), None);
    }

    #[test]
    fn charge_outcome_reports_deduction() {
        assert!(ChargeOutcome::Charged { balance: 0 }.charged());
        assert!(!ChargeOutcome::AlreadyCharged.charged());
    }
}
