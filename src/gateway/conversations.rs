//! Conversation endpoints.
//!
//! `POST /api/conversations/{id}/messages` answers with a server-sent event
//! stream of [`DriverEvent`]s that stays open until the turn's deploy (if
//! any) has settled.

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::conversation::{Conversation, DriverEvent, TransitionError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub content: String,
}

/// POST /api/conversations
pub async fn handle_create(State(state): State<AppState>) -> (StatusCode, Json<Conversation>) {
    let session = state.sessions.create();
    (StatusCode::CREATED, Json(session.snapshot()))
}

/// GET /api/conversations/{id}
pub async fn handle_get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Conversation>> {
    let session = state
        .sessions
        .get(id)
        .ok_or_else(|| ApiError::NotFound(format!("Conversation {id} not found")))?;
    Ok(Json(session.snapshot()))
}

/// DELETE /api/conversations/{id}
pub async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.sessions.remove(id) {
        tracing::debug!(conversation = %id, "Conversation removed");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Conversation {id} not found")))
    }
}

/// POST /api/conversations/{id}/messages
pub async fn handle_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<MessageRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let session = state
        .sessions
        .get(id)
        .ok_or_else(|| ApiError::NotFound(format!("Conversation {id} not found")))?;

    let message = state
        .driver
        .begin_turn(&session, &request.content)
        .map_err(|e| match e {
            TransitionError::ReplyInProgress => ApiError::Conflict(e.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        })?;

    let (events, rx) = tokio::sync::mpsc::unbounded_channel();
    let _ = events.send(DriverEvent::Message { message });

    let driver = state.driver.clone();
    tokio::spawn(async move {
        driver.complete_turn(&session, events).await;
    });

    let stream = UnboundedReceiverStream::new(rx).map(|event| Event::default().json_data(&event));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
