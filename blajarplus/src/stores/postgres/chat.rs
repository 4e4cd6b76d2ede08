use super::{id, opt_id, PgStore};
use crate::stores::{ChatRepository, MessageCursor, StoreError, StoreResult};
use crate::types::{
    Conversation, ConversationId, ConversationSummary, Message, MessageId, TutorId, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

fn conversation_from_row(row: &PgRow) -> StoreResult<Conversation> {
    Ok(Conversation {
        id: id(row, "id")?,
        student_id: id(row, "student_id")?,
        tutor_id: id(row, "tutor_id")?,
        created_at: row.try_get("created_at")?,
        last_message_at: row.try_get("last_message_at")?,
    })
}

fn message_from_row(row: &PgRow) -> StoreResult<Message> {
    Ok(Message {
        id: id(row, "id")?,
        conversation_id: id(row, "conversation_id")?,
        sender_id: id(row, "sender_id")?,
        body: row.try_get("body")?,
        created_at: row.try_get("created_at")?,
        read_at: row.try_get("read_at")?,
    })
}

fn summary_from_row(row: &PgRow) -> StoreResult<ConversationSummary> {
    let conversation = conversation_from_row(row)?;
    let last_message = match opt_id::<MessageId>(row, "lm_id")? {
        Some(message_id) => Some(Message {
            id: message_id,
            conversation_id: conversation.id,
            sender_id: id(row, "lm_sender_id")?,
            body: row.try_get("lm_body")?,
            created_at: row.try_get("lm_created_at")?,
            read_at: row.try_get("lm_read_at")?,
        }),
        None => None,
    };
    Ok(ConversationSummary {
        conversation,
        last_message,
        unread_count: row.try_get("unread_count")?,
    })
}

#[async_trait]
impl ChatRepository for PgStore {
    async fn get_or_create_conversation(
        &self,
        student: UserId,
        tutor: TutorId,
        now: DateTime<Utc>,
    ) -> StoreResult<Conversation> {
        sqlx::query(
            r"
            INSERT INTO conversations (id, student_id, tutor_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (student_id, tutor_id) DO NOTHING
            ",
        )
        .bind(ConversationId::new().into_uuid())
        .bind(student.into_uuid())
        .bind(tutor.into_uuid())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r"
            SELECT id, student_id, tutor_id, created_at, last_message_at
            FROM conversations
            WHERE student_id = $1 AND tutor_id = $2
            ",
        )
        .bind(student.into_uuid())
        .bind(tutor.into_uuid())
        .fetch_one(&self.pool)
        .await?;
        conversation_from_row(&row)
    }

    async fn get_conversation(&self, conversation: ConversationId) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query(
            r"
            SELECT id, student_id, tutor_id, created_at, last_message_at
            FROM conversations
            WHERE id = $1
            ",
        )
        .bind(conversation.into_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn conversations_for(&self, user: UserId) -> StoreResult<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            r"
            SELECT
                c.id, c.student_id, c.tutor_id, c.created_at, c.last_message_at,
                lm.id AS lm_id, lm.sender_id AS lm_sender_id, lm.body AS lm_body,
                lm.created_at AS lm_created_at, lm.read_at AS lm_read_at,
                (SELECT COUNT(*) FROM messages m
                 WHERE m.conversation_id = c.id AND m.sender_id <> $1 AND m.read_at IS NULL)
                    AS unread_count
            FROM conversations c
            LEFT JOIN LATERAL (
                SELECT id, sender_id, body, created_at, read_at
                FROM messages
                WHERE conversation_id = c.id
                ORDER BY created_at DESC
                LIMIT 1
            ) lm ON TRUE
            WHERE c.student_id = $1 OR c.tutor_id = $1
            ORDER BY COALESCE(c.last_message_at, c.created_at) DESC
            ",
        )
        .bind(user.into_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(summary_from_row).collect()
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let touched = sqlx::query("UPDATE conversations SET last_message_at = $2 WHERE id = $1")
            .bind(message.conversation_id.into_uuid())
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::not_found("conversation", message.conversation_id));
        }

        sqlx::query(
            r"
            INSERT INTO messages (id, conversation_id, sender_id, body, created_at, read_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(message.id.into_uuid())
        .bind(message.conversation_id.into_uuid())
        .bind(message.sender_id.into_uuid())
        .bind(&message.body)
        .bind(message.created_at)
        .bind(message.read_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn messages(
        &self,
        conversation: ConversationId,
        before: Option<MessageCursor>,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        let key = before.map(|cursor| cursor.key());
        let rows = sqlx::query(
            r"
            SELECT id, conversation_id, sender_id, body, created_at, read_at
            FROM messages
            WHERE conversation_id = $1
              AND ($2::TIMESTAMPTZ IS NULL OR (created_at, id) < ($2, $3::UUID))
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            ",
        )
        .bind(conversation.into_uuid())
        .bind(key.map(|(created_at, _)| created_at))
        .bind(key.map(|(_, id)| id))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn mark_read(
        &self,
        conversation: ConversationId,
        reader: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r"
            UPDATE messages
            SET read_at = $3
            WHERE conversation_id = $1 AND sender_id <> $2 AND read_at IS NULL
            ",
        )
        .bind(conversation.into_uuid())
        .bind(reader.into_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
