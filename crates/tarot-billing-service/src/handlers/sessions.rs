//! Reading session history.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Serialize;

use tarot_billing_core::{CardDrawn, Message, ReadingSession, SessionId};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::handlers::credits::PageQuery;
use crate::state::AppState;

/// One of the caller's readings.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    /// Session ID.
    pub session_id: String,
    /// Spread layout.
    pub spread_id: String,
    /// The seeker's question.
    pub question: String,
    /// When the session was opened.
    pub created_at: String,
    /// Cards drawn, in spread order.
    pub cards: Vec<CardDrawn>,
}

impl SessionSummary {
    fn new(session: ReadingSession, cards: Vec<CardDrawn>) -> Self {
        Self {
            session_id: session.id.to_string(),
            spread_id: session.spread_id,
            question: session.question,
            created_at: session.created_at.to_rfc3339(),
            cards,
        }
    }
}

/// Session list response.
#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    /// Sessions, newest first.
    pub sessions: Vec<SessionSummary>,
    /// Whether more sessions exist past this page.
    pub has_more: bool,
}

/// List the caller's readings with the cards drawn for each.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let limit = query.limit.clamp(1, 100);
    let mut sessions = state
        .store
        .list_sessions(auth.user_id, limit + 1, query.offset)
        .await?;

    let has_more = sessions.len() > limit;
    sessions.truncate(limit);

    let mut summaries = Vec::with_capacity(sessions.len());
    for session in sessions {
        let cards = state.store.list_cards(&session.id).await?;
        summaries.push(SessionSummary::new(session, cards));
    }

    Ok(Json(SessionListResponse {
        sessions: summaries,
        has_more,
    }))
}

/// Message in a session transcript.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    /// Message ID.
    pub id: i64,
    /// "user" or "assistant".
    pub role: String,
    /// Text.
    pub content: String,
    /// Timestamp.
    pub created_at: String,
}

impl From<&Message> for MessageResponse {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
            created_at: message.created_at.to_rfc3339(),
        }
    }
}

/// Session transcript response.
#[derive(Debug, Serialize)]
pub struct SessionMessagesResponse {
    /// Session ID.
    pub session_id: String,
    /// Spread layout.
    pub spread_id: String,
    /// The seeker's question.
    pub question: String,
    /// When the session was opened.
    pub created_at: String,
    /// Cards drawn, in spread order.
    pub cards: Vec<CardDrawn>,
    /// Messages, oldest first.
    pub messages: Vec<MessageResponse>,
}

/// List the messages of one of the caller's sessions.
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<SessionMessagesResponse>, ApiError> {
    let session_id: SessionId = session_id
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid session id".into()))?;

    let session = state
        .store
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Session not found".into()))?;

    if session.user_id != auth.user_id {
        return Err(ApiError::Forbidden);
    }

    let cards = state.store.list_cards(&session_id).await?;
    let messages = state.store.list_messages(&session_id).await?;

    Ok(Json(SessionMessagesResponse {
        session_id: session.id.to_string(),
        spread_id: session.spread_id,
        question: session.question,
        created_at: session.created_at.to_rfc3339(),
        cards,
        messages: messages.iter().map(MessageResponse::from).collect(),
    }))
}
