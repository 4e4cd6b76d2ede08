use super::{id, PgStore};
use crate::stores::{SessionRepository, StoreResult};
use crate::types::{MagicLink, MagicLinkId, Session, SessionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

fn link_from_row(row: &PgRow) -> StoreResult<MagicLink> {
    Ok(MagicLink {
        id: id(row, "id")?,
        email: row.try_get("email")?,
        secret_hash: row.try_get("secret_hash")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        consumed_at: row.try_get("consumed_at")?,
    })
}

fn session_from_row(row: &PgRow) -> StoreResult<Session> {
    Ok(Session {
        id: id(row, "id")?,
        user_id: id(row, "user_id")?,
        secret_hash: row.try_get("secret_hash")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
    })
}

#[async_trait]
impl SessionRepository for PgStore {
    async fn insert_magic_link(&self, link: &MagicLink) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO magic_links (id, email, secret_hash, created_at, expires_at, consumed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(link.id.into_uuid())
        .bind(&link.email)
        .bind(&link.secret_hash)
        .bind(link.created_at)
        .bind(link.expires_at)
        .bind(link.consumed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_magic_link(&self, link: MagicLinkId) -> StoreResult<Option<MagicLink>> {
        let row = sqlx::query(
            r"
            SELECT id, email, secret_hash, created_at, expires_at, consumed_at
            FROM magic_links
            WHERE id = $1
            ",
        )
        .bind(link.into_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn consume_magic_link(&self, link: MagicLinkId, at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE magic_links SET consumed_at = $2 WHERE id = $1 AND consumed_at IS NULL",
        )
        .bind(link.into_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO sessions
                (id, user_id, secret_hash, created_at, expires_at, ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(session.id.into_uuid())
        .bind(session.user_id.into_uuid())
        .bind(&session.secret_hash)
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session: SessionId) -> StoreResult<Option<Session>> {
        let row = sqlx::query(
            r"
            SELECT id, user_id, secret_hash, created_at, expires_at, ip_address, user_agent
            FROM sessions
            WHERE id = $1
            ",
        )
        .bind(session.into_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn delete_session(&self, session: SessionId) -> StoreResult<()> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session.into_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let sessions = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        let links = sqlx::query("DELETE FROM magic_links WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(sessions.rows_affected() + links.rows_affected())
    }
}
