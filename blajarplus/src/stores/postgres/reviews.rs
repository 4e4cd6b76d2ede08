use super::{id, PgStore};
use crate::stores::{ReviewRepository, StoreError, StoreResult};
use crate::types::{BookingId, Review, TutorId};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;

fn review_from_row(row: &PgRow) -> StoreResult<Review> {
    let rating: i16 = row.try_get("rating")?;
    Ok(Review {
        id: id(row, "id")?,
        booking_id: id(row, "booking_id")?,
        tutor_id: id(row, "tutor_id")?,
        student_id: id(row, "student_id")?,
        rating: u8::try_from(rating)
            .map_err(|_| StoreError::Database(format!("bad rating {rating}")))?,
        comment: row.try_get("comment")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ReviewRepository for PgStore {
    async fn insert_review(&self, review: &Review) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO reviews (id, booking_id, tutor_id, student_id, rating, comment, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(review.id.into_uuid())
        .bind(review.booking_id.into_uuid())
        .bind(review.tutor_id.into_uuid())
        .bind(review.student_id.into_uuid())
        .bind(i16::from(review.rating))
        .bind(&review.comment)
        .bind(review.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => {
                StoreError::Conflict("booking has already been reviewed".to_string())
            }
            other => other,
        })?;

        // Running average, updated under the row lock of the profile.
        let updated = sqlx::query(
            r"
            UPDATE tutor_profiles
            SET rating_avg = (rating_avg * rating_count + $2) / (rating_count + 1),
                rating_count = rating_count + 1
            WHERE user_id = $1
            ",
        )
        .bind(review.tutor_id.into_uuid())
        .bind(f64::from(review.rating))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("tutor", review.tutor_id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn review_for_booking(&self, booking: BookingId) -> StoreResult<Option<Review>> {
        let row = sqlx::query(
            r"
            SELECT id, booking_id, tutor_id, student_id, rating, comment, created_at
            FROM reviews
            WHERE booking_id = $1
            ",
        )
        .bind(booking.into_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(review_from_row).transpose()
    }

    async fn reviews_for_tutor(
        &self,
        tutor: TutorId,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Review>> {
        let rows = sqlx::query(
            r"
            SELECT id, booking_id, tutor_id, student_id, rating, comment, created_at
            FROM reviews
            WHERE tutor_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(tutor.into_uuid())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(review_from_row).collect()
    }
}
