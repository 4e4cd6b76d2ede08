//! Chat endpoints.
//!
//! - GET /api/conversations - Inbox with last message and unread count
//! - POST /api/conversations - Get or create a conversation with a counterpart
//! - GET /api/conversations/:id/messages - Messages, newest first (`before` cursor)
//! - POST /api/conversations/:id/messages - Send a message
//! - POST /api/conversations/:id/read - Mark the counterpart's messages read

use crate::auth::SessionUser;
use crate::server::state::AppState;
use crate::services::chat::{MessageQuery, NewMessage, StartConversation};
use crate::types::{Conversation, ConversationId, ConversationSummary, Message};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use blajarplus_web::{ApiJson, ApiQuery, WebResult};
use serde::Serialize;

/// Result of marking a conversation read.
#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    /// Messages that changed
    pub marked: u64,
}

/// The caller's conversations.
pub async fn list_conversations(
    State(state): State<AppState>,
    session: SessionUser,
) -> WebResult<Json<Vec<ConversationSummary>>> {
    Ok(Json(state.chat.list(&session.user).await?))
}

/// Open the conversation with a tutor (as a student) or a student (as a tutor).
pub async fn start_conversation(
    State(state): State<AppState>,
    session: SessionUser,
    ApiJson(request): ApiJson<StartConversation>,
) -> WebResult<(StatusCode, Json<Conversation>)> {
    let conversation = state.chat.start(&session.user, request).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// Page through messages.
pub async fn list_messages(
    State(state): State<AppState>,
    session: SessionUser,
    Path(id): Path<ConversationId>,
    ApiQuery(query): ApiQuery<MessageQuery>,
) -> WebResult<Json<Vec<Message>>> {
    Ok(Json(state.chat.messages(&session.user, id, query).await?))
}

/// Send a message.
pub async fn send_message(
    State(state): State<AppState>,
    session: SessionUser,
    Path(id): Path<ConversationId>,
    ApiJson(message): ApiJson<NewMessage>,
) -> WebResult<(StatusCode, Json<Message>)> {
    let message = state.chat.send(&session.user, id, message).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Mark a conversation read.
pub async fn mark_read(
    State(state): State<AppState>,
    session: SessionUser,
    Path(id): Path<ConversationId>,
) -> WebResult<Json<MarkReadResponse>> {
    let marked = state.chat.mark_read(&session.user, id).await?;
    Ok(Json(MarkReadResponse { marked }))
}
