use super::{id, text_enum, PgStore};
use crate::stores::{StoreError, StoreResult, UserRepository};
use crate::types::{User, UserId};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;

const USER_COLUMNS: &str =
    "id, email, name, role, phone, avatar_url, created_at, updated_at";

fn user_from_row(row: &PgRow) -> StoreResult<User> {
    Ok(User {
        id: id(row, "id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        role: text_enum(row, "role")?,
        phone: row.try_get("phone")?,
        avatar_url: row.try_get("avatar_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl UserRepository for PgStore {
    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO users (id, email, name, role, phone, avatar_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(user.id.into_uuid())
        .bind(&user.email)
        .bind(&user.name)
        .bind(user.role.as_str())
        .bind(&user.phone)
        .bind(&user.avatar_url)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => {
                StoreError::Conflict("email is already registered".to_string())
            }
            other => other,
        })?;
        Ok(())
    }

    async fn get_user(&self, user: UserId) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user.into_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn update_user(&self, user: &User) -> StoreResult<()> {
        let result = sqlx::query(
            r"
            UPDATE users
            SET name = $2, role = $3, phone = $4, avatar_url = $5, updated_at = $6
            WHERE id = $1
            ",
        )
        .bind(user.id.into_uuid())
        .bind(&user.name)
        .bind(user.role.as_str())
        .bind(&user.phone)
        .bind(&user.avatar_url)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("user", user.id));
        }
        Ok(())
    }
}
