//! Reading chat: the session charging gate and the streamed reply.
//!
//! The first message of a session spends one credit and creates the session
//! row in one unit of work; later messages (and retries of the first one)
//! find the row and are not charged again. The reply is relayed from the
//! oracle as server-sent events and persisted once the stream completes,
//! even if the client has gone away.

use std::convert::Infallible;
use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use tarot_billing_core::{
    CardDrawn, ChargeOutcome, MessageRole, NewReading, ReadingSession, SessionId,
};
use tarot_billing_store::{Store, StoreError};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::oracle::{ChatTurn, ReadingPrompt, ReplyStream};
use crate::state::AppState;

/// Buffered events between the relay task and the response.
const EVENT_BUFFER: usize = 64;

/// Chat request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Client-generated session token, reused on retries.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Spread, cards and question. Required for a new session.
    #[serde(default)]
    pub context: Option<ReadingContext>,
    /// Conversation so far, oldest first.
    #[serde(default)]
    pub messages: Vec<ChatTurn>,
}

/// The reading laid out by the client.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadingContext {
    /// Spread layout.
    pub spread: Option<Spread>,
    /// Cards placed in the spread.
    #[serde(default)]
    pub cards: Vec<PlacedCard>,
    /// The seeker's question.
    #[serde(default)]
    pub question: String,
}

/// Spread layout.
#[derive(Debug, Clone, Deserialize)]
pub struct Spread {
    /// Spread id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Positions in the layout.
    #[serde(default)]
    pub positions: Vec<SpreadPosition>,
}

/// A position in a spread.
#[derive(Debug, Clone, Deserialize)]
pub struct SpreadPosition {
    /// Position id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// What the position stands for.
    #[serde(default)]
    pub description: String,
}

/// A card placed in a position.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedCard {
    /// The card.
    pub card: TarotCard,
    /// Position id.
    pub position_id: String,
    /// Whether the card is reversed.
    #[serde(default)]
    pub is_reversed: bool,
}

/// A tarot card.
#[derive(Debug, Clone, Deserialize)]
pub struct TarotCard {
    /// Card id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Upright meaning.
    #[serde(default)]
    pub meaning_upright: String,
    /// Reversed meaning.
    #[serde(default)]
    pub meaning_reversed: String,
}

impl ReadingContext {
    fn to_new_reading(&self, session_id: SessionId) -> Result<NewReading, ApiError> {
        let spread = self
            .spread
            .as_ref()
            .ok_or_else(|| ApiError::BadRequest("Spread required for a new session".into()))?;

        Ok(NewReading {
            session_id,
            spread_id: spread.id.clone(),
            question: self.question.clone(),
            cards: self
                .cards
                .iter()
                .map(|placed| CardDrawn {
                    card_id: placed.card.id.clone(),
                    position_id: placed.position_id.clone(),
                    is_reversed: placed.is_reversed,
                })
                .collect(),
        })
    }
}

#[derive(Debug, Serialize)]
struct DeltaData<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DoneData<'a> {
    session_id: &'a str,
    charged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    balance: Option<i64>,
}

/// Open or continue a reading and stream the reply.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session_id: SessionId = body
        .session_id
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("Session ID required".into()))?
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid session ID".into()))?;

    let oracle = state
        .oracle
        .clone()
        .ok_or_else(|| ApiError::ExternalService("Reading oracle not configured".into()))?;

    let existing = state.store.get_session(&session_id).await?;
    if existing
        .as_ref()
        .is_some_and(|session| session.user_id != auth.user_id)
    {
        tracing::warn!(user_id = %auth.user_id, session_id = %session_id, "Session belongs to another user");
        return Err(ApiError::Forbidden);
    }

    let outcome = if existing.is_some() {
        ChargeOutcome::AlreadyCharged
    } else {
        let context = body.context.as_ref().ok_or_else(|| {
            ApiError::BadRequest("Reading context required for a new session".into())
        })?;
        let reading = context.to_new_reading(session_id.clone())?;
        state
            .store
            .charge_session_if_new(auth.user_id, &reading)
            .await
            .map_err(charge_error)?
    };

    tracing::info!(
        user_id = %auth.user_id,
        session_id = %session_id,
        charged = outcome.charged(),
        "Reading session opened"
    );

    if let Some(last) = body.messages.last() {
        if last.role == MessageRole::User {
            state
                .store
                .append_message(&session_id, MessageRole::User, &last.content)
                .await?;
        }
    }

    let prompt = build_prompt(body.context.as_ref(), existing.as_ref(), body.messages);
    let replies = oracle.stream_reply(prompt).await.map_err(|e| {
        tracing::error!(session_id = %session_id, error = %e, "Reading oracle failed");
        ApiError::ExternalService("Reading oracle unavailable".into())
    })?;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(relay_reply(
        Arc::clone(&state.store),
        session_id,
        outcome,
        replies,
        tx,
    ));

    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn charge_error(err: StoreError) -> ApiError {
    match err {
        StoreError::Conflict(_) => ApiError::Forbidden,
        StoreError::NotFound => ApiError::InsufficientCredits {
            balance: 0,
            required: 1,
        },
        other => other.into(),
    }
}

/// Drain the oracle stream into the client channel, then persist the reply.
async fn relay_reply(
    store: Arc<dyn Store>,
    session_id: SessionId,
    outcome: ChargeOutcome,
    mut replies: ReplyStream,
    tx: mpsc::Sender<Event>,
) {
    let mut reply = String::new();

    while let Some(delta) = replies.next().await {
        match delta {
            Ok(delta) => {
                reply.push_str(&delta);
                let data = serde_json::to_string(&DeltaData { text: &delta }).unwrap_or_default();
                // The client may have disconnected; keep draining so the reply is saved.
                let _ = tx.send(Event::default().event("delta").data(data)).await;
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Reading stream interrupted");
                let _ = tx
                    .send(Event::default().event("error").data("Reading interrupted"))
                    .await;
                return;
            }
        }
    }

    if reply.is_empty() {
        tracing::warn!(session_id = %session_id, "Reading oracle returned an empty reply");
    } else if let Err(e) = store
        .append_message(&session_id, MessageRole::Assistant, &reply)
        .await
    {
        tracing::error!(session_id = %session_id, error = %e, "Failed to save reading reply");
    }

    let balance = match outcome {
        ChargeOutcome::Charged { balance } => Some(balance),
        ChargeOutcome::AlreadyCharged => None,
    };
    let done = serde_json::to_string(&DoneData {
        session_id: session_id.as_str(),
        charged: outcome.charged(),
        balance,
    })
    .unwrap_or_default();
    let _ = tx.send(Event::default().event("done").data(done)).await;
}

/// Build the system prompt for a reading.
///
/// Describes the spread and each card in its position, then asks for either
/// a full reading or an answer to a follow-up question.
fn build_prompt(
    context: Option<&ReadingContext>,
    session: Option<&ReadingSession>,
    turns: Vec<ChatTurn>,
) -> ReadingPrompt {
    let question = context
        .map(|c| c.question.as_str())
        .filter(|q| !q.is_empty())
        .or(session.map(|s| s.question.as_str()))
        .unwrap_or_default();

    let mut system = String::from(
        "You are a calm, thoughtful tarot reader. Reply in the language of the \
         seeker's question and do not use emojis.\n",
    );

    if let Some(spread) = context.and_then(|c| c.spread.as_ref()) {
        let _ = writeln!(system, "\nSpread: {} - {}", spread.name, spread.description);
    } else if let Some(session) = session {
        let _ = writeln!(system, "\nSpread: {}", session.spread_id);
    }

    let cards = context.map(|c| c.cards.as_slice()).unwrap_or_default();
    if !cards.is_empty() {
        system.push_str("Cards drawn:\n");
        for placed in cards {
            let position = context
                .and_then(|c| c.spread.as_ref())
                .and_then(|s| s.positions.iter().find(|p| p.id == placed.position_id));
            let (orientation, meaning) = if placed.is_reversed {
                ("reversed", &placed.card.meaning_reversed)
            } else {
                ("upright", &placed.card.meaning_upright)
            };
            let _ = writeln!(
                system,
                "- {} ({}): {} {orientation}. Meaning: {meaning}",
                position.map_or(placed.position_id.as_str(), |p| p.name.as_str()),
                position.map_or("", |p| p.description.as_str()),
                placed.card.name,
            );
        }
    }

    let _ = writeln!(system, "\nQuestion: \"{question}\"");

    if turns.iter().any(|t| t.role == MessageRole::Assistant) {
        system.push_str(
            "\nThe reading has already been given. Answer the follow-up question directly, \
             relating it to the cards above.",
        );
    } else {
        system.push_str(
            "\nGive the full reading: an opening line, how the cards speak to each other \
             in their positions, a direct answer to the question, and a closing reflection.",
        );
    }

    ReadingPrompt { system, turns }
}
