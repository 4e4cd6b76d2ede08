use super::{id, opt_id, text_enum, PgStore};
use crate::stores::{NotificationRepository, StoreResult};
use crate::types::{Notification, NotificationId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

fn notification_from_row(row: &PgRow) -> StoreResult<Notification> {
    Ok(Notification {
        id: id(row, "id")?,
        user_id: id(row, "user_id")?,
        kind: text_enum(row, "kind")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        booking_id: opt_id(row, "booking_id")?,
        created_at: row.try_get("created_at")?,
        read_at: row.try_get("read_at")?,
    })
}

#[async_trait]
impl NotificationRepository for PgStore {
    async fn insert_notification(&self, notification: &Notification) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO notifications
                (id, user_id, kind, title, body, booking_id, created_at, read_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(notification.id.into_uuid())
        .bind(notification.user_id.into_uuid())
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(notification.booking_id.map(|b| b.into_uuid()))
        .bind(notification.created_at)
        .bind(notification.read_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn notifications_for(
        &self,
        user: UserId,
        unread_only: bool,
        limit: i64,
    ) -> StoreResult<Vec<Notification>> {
        let rows = sqlx::query(
            r"
            SELECT id, user_id, kind, title, body, booking_id, created_at, read_at
            FROM notifications
            WHERE user_id = $1 AND (NOT $2 OR read_at IS NULL)
            ORDER BY created_at DESC
            LIMIT $3
            ",
        )
        .bind(user.into_uuid())
        .bind(unread_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn mark_notification_read(
        &self,
        notification: NotificationId,
        user: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE notifications
            SET read_at = COALESCE(read_at, $3)
            WHERE id = $1 AND user_id = $2
            ",
        )
        .bind(notification.into_uuid())
        .bind(user.into_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
