//! PostgreSQL implementation of the repositories.
//!
//! Queries are runtime-checked (`sqlx::query` + `bind`), so the crate builds
//! without a live database. Rows are mapped by hand with `try_get`.

mod bookings;
mod chat;
mod courses;
mod notifications;
mod reviews;
mod sessions;
mod tutors;
mod users;

use super::{StoreError, StoreResult};
use crate::types::Money;
use blajarplus_web::handlers::health::ReadinessProbe;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            _ => Self::Database(e.to_string()),
        }
    }
}

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Connection string
    pub url: String,
    /// Upper bound on open connections
    pub max_connections: u32,
    /// Connections kept open when idle
    pub min_connections: u32,
    /// How long to wait for a connection
    pub connect_timeout: Duration,
}

/// PostgreSQL-backed store.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database is unreachable.
    pub async fn connect(settings: &PoolSettings) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.connect_timeout)
            .connect(&settings.url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl ReadinessProbe for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn check(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    }
}

/// A uuid column as an id newtype.
fn id<T: From<Uuid>>(row: &PgRow, column: &str) -> StoreResult<T> {
    Ok(T::from(row.try_get::<Uuid, _>(column)?))
}

fn opt_id<T: From<Uuid>>(row: &PgRow, column: &str) -> StoreResult<Option<T>> {
    Ok(row.try_get::<Option<Uuid>, _>(column)?.map(T::from))
}

fn money(row: &PgRow, column: &str) -> StoreResult<Money> {
    Ok(Money::from_rupiah(row.try_get::<i64, _>(column)?))
}

/// A TEXT column holding a snake_case enum.
fn text_enum<T>(row: &PgRow, column: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    parse_text(&row.try_get::<String, _>(column)?)
}

fn parse_text<T>(raw: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse()
        .map_err(|e: T::Err| StoreError::Database(format!("corrupt column value: {e}")))
}

/// Escape `%`, `_` and `\` for use inside an ILIKE pattern.
fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// Advisory lock key for a user: the first eight bytes of the uuid.
fn lock_key(user: Uuid) -> i64 {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&user.as_bytes()[..8]);
    i64::from_be_bytes(prefix)
}
