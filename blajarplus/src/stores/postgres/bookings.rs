use super::{id, lock_key, money, parse_text, text_enum, PgStore};
use crate::stores::{BookingFilter, BookingRepository, StoreError, StoreResult};
use crate::types::{
    Booking, BookingId, CancelledBy, Cancellation, EarningsSummary, Payment, TutorId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

const BOOKING_COLUMNS: &str = "id, student_id, tutor_id, subject, mode, location, notes, \
     start_at, end_at, price, platform_fee, status, payment_deadline, cancelled_by, \
     cancellation_reason, cancelled_at, confirmed_at, completed_at, created_at, updated_at, version";

const PAYMENT_COLUMNS: &str = "id, booking_id, order_id, attempt, amount, status, escrow, \
     checkout_token, redirect_url, provider_transaction_id, payment_type, failure_reason, \
     refund_reference, paid_at, released_at, refunded_at, created_at, updated_at";

fn booking_from_row(row: &PgRow) -> StoreResult<Booking> {
    let cancelled_by: Option<String> = row.try_get("cancelled_by")?;
    let cancellation = match cancelled_by {
        Some(by) => Some(Cancellation {
            by: parse_text::<CancelledBy>(&by)?,
            reason: row
                .try_get::<Option<String>, _>("cancellation_reason")?
                .unwrap_or_default(),
            at: row
                .try_get::<Option<DateTime<Utc>>, _>("cancelled_at")?
                .ok_or_else(|| StoreError::Database("cancelled booking without time".into()))?,
        }),
        None => None,
    };

    Ok(Booking {
        id: id(row, "id")?,
        student_id: id(row, "student_id")?,
        tutor_id: id(row, "tutor_id")?,
        subject: row.try_get("subject")?,
        mode: text_enum(row, "mode")?,
        location: row.try_get("location")?,
        notes: row.try_get("notes")?,
        start_at: row.try_get("start_at")?,
        end_at: row.try_get("end_at")?,
        price: money(row, "price")?,
        platform_fee: money(row, "platform_fee")?,
        status: text_enum(row, "status")?,
        payment_deadline: row.try_get("payment_deadline")?,
        cancellation,
        confirmed_at: row.try_get("confirmed_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        version: row.try_get("version")?,
    })
}

fn payment_from_row(row: &PgRow) -> StoreResult<Payment> {
    Ok(Payment {
        id: id(row, "id")?,
        booking_id: id(row, "booking_id")?,
        order_id: row.try_get("order_id")?,
        attempt: row.try_get("attempt")?,
        amount: money(row, "amount")?,
        status: text_enum(row, "status")?,
        escrow: text_enum(row, "escrow")?,
        checkout_token: row.try_get("checkout_token")?,
        redirect_url: row.try_get("redirect_url")?,
        provider_transaction_id: row.try_get("provider_transaction_id")?,
        payment_type: row.try_get("payment_type")?,
        failure_reason: row.try_get("failure_reason")?,
        refund_reference: row.try_get("refund_reference")?,
        paid_at: row.try_get("paid_at")?,
        released_at: row.try_get("released_at")?,
        refunded_at: row.try_get("refunded_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ids_from_rows(rows: &[PgRow]) -> StoreResult<Vec<BookingId>> {
    rows.iter().map(|row| id(row, "id")).collect()
}

fn uuids(ids: &[BookingId]) -> Vec<Uuid> {
    ids.iter().map(|booking| booking.into_uuid()).collect()
}

#[async_trait]
impl BookingRepository for PgStore {
    async fn insert_booking(&self, booking: &Booking) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        // Lock both parties in a fixed order so concurrent inserts serialize.
        let mut keys = [
            lock_key(booking.tutor_id.into_uuid()),
            lock_key(booking.student_id.into_uuid()),
        ];
        keys.sort_unstable();
        for key in keys {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }

        let clash = sqlx::query(
            r"
            SELECT tutor_id
            FROM bookings
            WHERE status IN ('pending_payment', 'confirmed')
              AND (tutor_id = $1 OR student_id = $2)
              AND start_at < $4
              AND end_at > $3
            LIMIT 1
            ",
        )
        .bind(booking.tutor_id.into_uuid())
        .bind(booking.student_id.into_uuid())
        .bind(booking.start_at)
        .bind(booking.end_at)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = clash {
            let tutor: Uuid = row.try_get("tutor_id")?;
            let party = if tutor == booking.tutor_id.into_uuid() {
                "tutor"
            } else {
                "student"
            };
            debug!(booking_id = %booking.id, party, "booking slot taken");
            return Err(StoreError::SlotTaken { party });
        }

        sqlx::query(
            r"
            INSERT INTO bookings
                (id, student_id, tutor_id, subject, mode, location, notes, start_at, end_at,
                 price, platform_fee, status, payment_deadline, created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ",
        )
        .bind(booking.id.into_uuid())
        .bind(booking.student_id.into_uuid())
        .bind(booking.tutor_id.into_uuid())
        .bind(&booking.subject)
        .bind(booking.mode.as_str())
        .bind(&booking.location)
        .bind(&booking.notes)
        .bind(booking.start_at)
        .bind(booking.end_at)
        .bind(booking.price.rupiah())
        .bind(booking.platform_fee.rupiah())
        .bind(booking.status.as_str())
        .bind(booking.payment_deadline)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .bind(booking.version)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, booking: BookingId) -> StoreResult<Option<(Booking, Option<Payment>)>> {
        let Some(row) =
            sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"))
                .bind(booking.into_uuid())
                .fetch_optional(&self.pool)
                .await?
        else {
            return Ok(None);
        };

        let payment = sqlx::query(&format!(
            r"
            SELECT {PAYMENT_COLUMNS}
            FROM payments
            WHERE booking_id = $1
            ORDER BY attempt DESC
            LIMIT 1
            "
        ))
        .bind(booking.into_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(Some((
            booking_from_row(&row)?,
            payment.as_ref().map(payment_from_row).transpose()?,
        )))
    }

    async fn save_booking(
        &self,
        booking: &Booking,
        expected_version: i64,
        payment: Option<&Payment>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let cancellation = booking.cancellation.as_ref();

        let updated = sqlx::query(
            r"
            UPDATE bookings
            SET status = $3,
                payment_deadline = $4,
                cancelled_by = $5,
                cancellation_reason = $6,
                cancelled_at = $7,
                confirmed_at = $8,
                completed_at = $9,
                updated_at = $10,
                version = $11
            WHERE id = $1 AND version = $2
            ",
        )
        .bind(booking.id.into_uuid())
        .bind(expected_version)
        .bind(booking.status.as_str())
        .bind(booking.payment_deadline)
        .bind(cancellation.map(|c| c.by.as_str()))
        .bind(cancellation.map(|c| c.reason.clone()))
        .bind(cancellation.map(|c| c.at))
        .bind(booking.confirmed_at)
        .bind(booking.completed_at)
        .bind(booking.updated_at)
        .bind(booking.version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM bookings WHERE id = $1)")
                    .bind(booking.id.into_uuid())
                    .fetch_one(&mut *tx)
                    .await?;
            return Err(if exists {
                StoreError::Conflict("booking was modified concurrently".to_string())
            } else {
                StoreError::not_found("booking", booking.id)
            });
        }

        if let Some(payment) = payment {
            sqlx::query(
                r"
                INSERT INTO payments
                    (id, booking_id, order_id, attempt, amount, status, escrow, checkout_token,
                     redirect_url, provider_transaction_id, payment_type, failure_reason,
                     refund_reference, paid_at, released_at, refunded_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                        $17, $18)
                ON CONFLICT (id) DO UPDATE SET
                    status = EXCLUDED.status,
                    escrow = EXCLUDED.escrow,
                    checkout_token = EXCLUDED.checkout_token,
                    redirect_url = EXCLUDED.redirect_url,
                    provider_transaction_id = EXCLUDED.provider_transaction_id,
                    payment_type = EXCLUDED.payment_type,
                    failure_reason = EXCLUDED.failure_reason,
                    refund_reference = EXCLUDED.refund_reference,
                    paid_at = EXCLUDED.paid_at,
                    released_at = EXCLUDED.released_at,
                    refunded_at = EXCLUDED.refunded_at,
                    updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(payment.id.into_uuid())
            .bind(payment.booking_id.into_uuid())
            .bind(&payment.order_id)
            .bind(payment.attempt)
            .bind(payment.amount.rupiah())
            .bind(payment.status.as_str())
            .bind(payment.escrow.as_str())
            .bind(&payment.checkout_token)
            .bind(&payment.redirect_url)
            .bind(&payment.provider_transaction_id)
            .bind(&payment.payment_type)
            .bind(&payment.failure_reason)
            .bind(&payment.refund_reference)
            .bind(payment.paid_at)
            .bind(payment.released_at)
            .bind(payment.refunded_at)
            .bind(payment.created_at)
            .bind(payment.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => {
                    StoreError::Conflict("booking already has a live payment".to_string())
                }
                other => other,
            })?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_bookings(&self, filter: &BookingFilter) -> StoreResult<Vec<Booking>> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE TRUE"));
        if let Some(user) = filter.participant {
            qb.push(" AND (student_id = ")
                .push_bind(user.into_uuid())
                .push(" OR tutor_id = ")
                .push_bind(user.into_uuid())
                .push(")");
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY start_at, id LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(booking_from_row).collect()
    }

    async fn find_by_order_id(&self, order_id: &str) -> StoreResult<Option<BookingId>> {
        let booking: Option<Uuid> =
            sqlx::query_scalar("SELECT booking_id FROM payments WHERE order_id = $1")
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(booking.map(BookingId::from))
    }

    async fn due_for_expiry(
        &self,
        now: DateTime<Utc>,
        skip: &[BookingId],
        limit: i64,
    ) -> StoreResult<Vec<BookingId>> {
        let rows = sqlx::query(
            r"
            SELECT id FROM bookings
            WHERE status = 'pending_payment' AND payment_deadline <= $1
              AND NOT (id = ANY($2))
            ORDER BY payment_deadline
            LIMIT $3
            ",
        )
        .bind(now)
        .bind(uuids(skip))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        ids_from_rows(&rows)
    }

    async fn due_for_completion(
        &self,
        ended_before: DateTime<Utc>,
        skip: &[BookingId],
        limit: i64,
    ) -> StoreResult<Vec<BookingId>> {
        let rows = sqlx::query(
            r"
            SELECT id FROM bookings
            WHERE status = 'confirmed' AND end_at <= $1
              AND NOT (id = ANY($2))
            ORDER BY end_at
            LIMIT $3
            ",
        )
        .bind(ended_before)
        .bind(uuids(skip))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        ids_from_rows(&rows)
    }

    async fn earnings(&self, tutor: TutorId) -> StoreResult<EarningsSummary> {
        let row = sqlx::query(
            r"
            SELECT
                COALESCE(SUM(p.amount) FILTER (WHERE p.escrow = 'held'), 0)::BIGINT AS held,
                COALESCE(SUM(p.amount - b.platform_fee) FILTER (WHERE p.escrow = 'released'), 0)::BIGINT
                    AS released,
                COALESCE(SUM(b.platform_fee) FILTER (WHERE p.escrow = 'released'), 0)::BIGINT
                    AS platform_fees,
                COALESCE(SUM(p.amount) FILTER (WHERE p.escrow = 'refund_pending'), 0)::BIGINT
                    AS refund_pending,
                COALESCE(SUM(p.amount) FILTER (WHERE p.escrow = 'refunded'), 0)::BIGINT AS refunded
            FROM payments p
            JOIN bookings b ON b.id = p.booking_id
            WHERE b.tutor_id = $1
            ",
        )
        .bind(tutor.into_uuid())
        .fetch_one(&self.pool)
        .await?;

        let completed_sessions: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM bookings WHERE tutor_id = $1 AND status = 'completed'",
        )
        .bind(tutor.into_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(EarningsSummary {
            held: money(&row, "held")?,
            released: money(&row, "released")?,
            platform_fees: money(&row, "platform_fees")?,
            refund_pending: money(&row, "refund_pending")?,
            refunded: money(&row, "refunded")?,
            completed_sessions,
        })
    }
}

