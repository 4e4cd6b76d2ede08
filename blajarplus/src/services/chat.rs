//! Student/tutor chat.

use super::{text_field, ServiceError, ServiceResult};
use crate::stores::{ChatRepository, MessageCursor, Stores, UserRepository};
use crate::types::{
    Conversation, ConversationId, ConversationSummary, Message, MessageId, Role, User, UserId,
};
use blajarplus_core::environment::Clock;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const MAX_MESSAGE_CHARS: usize = 4000;
const DEFAULT_MESSAGE_PAGE: i64 = 50;
const MAX_MESSAGE_PAGE: i64 = 100;

/// Body of `POST /api/conversations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StartConversation {
    /// The tutor (when a student starts it) or the student (when a tutor does)
    pub participant_id: UserId,
}

/// Query string of `GET /api/conversations/:id/messages`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct MessageQuery {
    /// Only messages older than this
    pub before: Option<DateTime<Utc>>,
    /// Id of the message at `before`, so same-instant messages are not skipped
    pub before_id: Option<MessageId>,
    /// Page size (at most 100)
    pub limit: Option<i64>,
}

/// Body of `POST /api/conversations/:id/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewMessage {
    /// Text
    pub body: String,
}

/// Chat operations.
#[derive(Clone)]
pub struct ChatService {
    chat: Arc<dyn ChatRepository>,
    users: Arc<dyn UserRepository>,
    clock: Arc<dyn Clock>,
}

impl ChatService {
    /// Create the service.
    #[must_use]
    pub fn new(stores: &Stores, clock: Arc<dyn Clock>) -> Self {
        Self {
            chat: Arc::clone(&stores.chat),
            users: Arc::clone(&stores.users),
            clock,
        }
    }

    /// Conversation between the caller and a counterpart of the other role,
    /// created on first use.
    ///
    /// # Errors
    ///
    /// `Forbidden` for admins, `NotFound` when the counterpart is not a user
    /// of the opposite role.
    pub async fn start(&self, user: &User, input: StartConversation) -> ServiceResult<Conversation> {
        let (student, tutor, wanted) = match user.role {
            Role::Student => (user.id, input.participant_id, Role::Tutor),
            Role::Tutor => (input.participant_id, user.id, Role::Student),
            Role::Admin => {
                return Err(ServiceError::forbidden(
                    "conversations are between students and tutors",
                ));
            }
        };
        let counterpart = self.users.get_user(input.participant_id).await?;
        if !counterpart.is_some_and(|u| u.role == wanted) {
            return Err(ServiceError::not_found(wanted.as_str(), input.participant_id));
        }
        Ok(self
            .chat
            .get_or_create_conversation(student, tutor, self.clock.now())
            .await?)
    }

    /// The caller's inbox.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn list(&self, user: &User) -> ServiceResult<Vec<ConversationSummary>> {
        Ok(self.chat.conversations_for(user.id).await?)
    }

    /// Messages newest first.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Forbidden` for non-participants.
    pub async fn messages(
        &self,
        user: &User,
        id: ConversationId,
        query: MessageQuery,
    ) -> ServiceResult<Vec<Message>> {
        self.participant(user, id).await?;
        let limit = query
            .limit
            .unwrap_or(DEFAULT_MESSAGE_PAGE)
            .clamp(1, MAX_MESSAGE_PAGE);
        let cursor = query.before.map(|created_at| MessageCursor {
            created_at,
            id: query.before_id,
        });
        Ok(self.chat.messages(id, cursor, limit).await?)
    }

    /// Post a message.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Forbidden` for non-participants, `Validation` for empty
    /// or oversized text.
    pub async fn send(&self, user: &User, id: ConversationId, input: NewMessage) -> ServiceResult<Message> {
        self.participant(user, id).await?;
        let message = Message {
            id: MessageId::new(),
            conversation_id: id,
            sender_id: user.id,
            body: text_field("message", &input.body, 1, MAX_MESSAGE_CHARS)?,
            created_at: self.clock.now(),
            read_at: None,
        };
        self.chat.insert_message(&message).await?;
        debug!(conversation_id = %id, sender_id = %user.id, "Message sent");
        Ok(message)
    }

    /// Mark the counterpart's messages read. Returns how many changed.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Forbidden` for non-participants.
    pub async fn mark_read(&self, user: &User, id: ConversationId) -> ServiceResult<u64> {
        self.participant(user, id).await?;
        Ok(self.chat.mark_read(id, user.id, self.clock.now()).await?)
    }

    async fn participant(&self, user: &User, id: ConversationId) -> ServiceResult<Conversation> {
        let conversation = self
            .chat
            .get_conversation(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("conversation", id))?;
        if conversation.involves(user.id) {
            Ok(conversation)
        } else {
            Err(ServiceError::forbidden("not a participant of this conversation"))
        }
    }
}
