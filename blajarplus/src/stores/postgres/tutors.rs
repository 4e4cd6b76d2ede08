use super::{id, like_pattern, money, parse_text, PgStore};
use crate::stores::{Page, StoreError, StoreResult, TutorRepository, TutorSearch, TutorSort};
use crate::types::{AvailabilitySlot, LessonMode, TutorId, TutorListing, TutorProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row};

const PROFILE_COLUMNS: &str = "p.user_id, p.headline, p.bio, p.subjects, p.hourly_rate, p.city, \
     p.teaching_modes, p.experience_years, p.education, p.verified, p.rating_avg, \
     p.rating_count, p.created_at, p.updated_at";

fn profile_from_row(row: &PgRow) -> StoreResult<TutorProfile> {
    let modes: Vec<String> = row.try_get("teaching_modes")?;
    Ok(TutorProfile {
        user_id: id(row, "user_id")?,
        headline: row.try_get("headline")?,
        bio: row.try_get("bio")?,
        subjects: row.try_get("subjects")?,
        hourly_rate: money(row, "hourly_rate")?,
        city: row.try_get("city")?,
        teaching_modes: modes
            .iter()
            .map(|m| parse_text::<LessonMode>(m))
            .collect::<StoreResult<_>>()?,
        experience_years: row.try_get("experience_years")?,
        education: row.try_get("education")?,
        verified: row.try_get("verified")?,
        rating_avg: row.try_get("rating_avg")?,
        rating_count: row.try_get("rating_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn listing_from_row(row: &PgRow) -> StoreResult<TutorListing> {
    Ok(TutorListing {
        profile: profile_from_row(row)?,
        name: row.try_get("name")?,
        avatar_url: row.try_get("avatar_url")?,
    })
}

fn mode_names(modes: &[LessonMode]) -> Vec<String> {
    modes.iter().map(|m| m.as_str().to_string()).collect()
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, search: &TutorSearch) {
    qb.push(" WHERE TRUE");
    if let Some(query) = &search.query {
        let pattern = like_pattern(query);
        qb.push(" AND (u.name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR p.headline ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR p.bio ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(subject) = &search.subject {
        qb.push(" AND EXISTS (SELECT 1 FROM unnest(p.subjects) AS s WHERE lower(s) = lower(")
            .push_bind(subject.clone())
            .push("))");
    }
    if let Some(city) = &search.city {
        qb.push(" AND lower(p.city) = lower(")
            .push_bind(city.clone())
            .push(")");
    }
    if let Some(mode) = search.mode {
        qb.push(" AND ")
            .push_bind(mode.as_str())
            .push(" = ANY(p.teaching_modes)");
    }
    if let Some(min) = search.min_rate {
        qb.push(" AND p.hourly_rate >= ").push_bind(min.rupiah());
    }
    if let Some(max) = search.max_rate {
        qb.push(" AND p.hourly_rate <= ").push_bind(max.rupiah());
    }
    if let Some(rating) = search.min_rating {
        qb.push(" AND p.rating_avg >= ").push_bind(rating);
    }
    if search.verified_only {
        qb.push(" AND p.verified");
    }
}

const fn order_by(sort: TutorSort) -> &'static str {
    match sort {
        TutorSort::Rating => " ORDER BY p.rating_avg DESC, p.rating_count DESC, p.user_id",
        TutorSort::PriceAsc => " ORDER BY p.hourly_rate ASC, p.user_id",
        TutorSort::PriceDesc => " ORDER BY p.hourly_rate DESC, p.user_id",
        TutorSort::Newest => " ORDER BY p.created_at DESC, p.user_id",
    }
}

#[async_trait]
impl TutorRepository for PgStore {
    async fn upsert_profile(&self, profile: &TutorProfile) -> StoreResult<TutorProfile> {
        let row = sqlx::query(&format!(
            r"
            INSERT INTO tutor_profiles AS p
                (user_id, headline, bio, subjects, hourly_rate, city, teaching_modes,
                 experience_years, education, verified, rating_avg, rating_count,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, 0, 0, $10, $10)
            ON CONFLICT (user_id) DO UPDATE SET
                headline = EXCLUDED.headline,
                bio = EXCLUDED.bio,
                subjects = EXCLUDED.subjects,
                hourly_rate = EXCLUDED.hourly_rate,
                city = EXCLUDED.city,
                teaching_modes = EXCLUDED.teaching_modes,
                experience_years = EXCLUDED.experience_years,
                education = EXCLUDED.education,
                updated_at = EXCLUDED.updated_at
            RETURNING {PROFILE_COLUMNS}
            "
        ))
        .bind(profile.user_id.into_uuid())
        .bind(&profile.headline)
        .bind(&profile.bio)
        .bind(&profile.subjects)
        .bind(profile.hourly_rate.rupiah())
        .bind(&profile.city)
        .bind(mode_names(&profile.teaching_modes))
        .bind(profile.experience_years)
        .bind(&profile.education)
        .bind(profile.updated_at)
        .fetch_one(&self.pool)
        .await?;
        profile_from_row(&row)
    }

    async fn get_profile(&self, tutor: TutorId) -> StoreResult<Option<TutorProfile>> {
        let row = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS} FROM tutor_profiles p WHERE p.user_id = $1"
        ))
        .bind(tutor.into_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn get_listing(&self, tutor: TutorId) -> StoreResult<Option<TutorListing>> {
        let row = sqlx::query(&format!(
            r"
            SELECT {PROFILE_COLUMNS}, u.name, u.avatar_url
            FROM tutor_profiles p
            JOIN users u ON u.id = p.user_id
            WHERE p.user_id = $1
            "
        ))
        .bind(tutor.into_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn search(&self, search: &TutorSearch) -> StoreResult<Page<TutorListing>> {
        let mut count =
            QueryBuilder::new("SELECT COUNT(*) FROM tutor_profiles p JOIN users u ON u.id = p.user_id");
        push_filters(&mut count, search);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::new(format!(
            "SELECT {PROFILE_COLUMNS}, u.name, u.avatar_url \
             FROM tutor_profiles p JOIN users u ON u.id = p.user_id"
        ));
        push_filters(&mut select, search);
        select
            .push(order_by(search.sort))
            .push(" LIMIT ")
            .push_bind(i64::from(search.per_page))
            .push(" OFFSET ")
            .push_bind(search.offset());
        let rows = select.build().fetch_all(&self.pool).await?;

        Ok(Page {
            items: rows.iter().map(listing_from_row).collect::<StoreResult<_>>()?,
            total,
            page: search.page,
            per_page: search.per_page,
        })
    }

    async fn set_verified(
        &self,
        tutor: TutorId,
        verified: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE tutor_profiles SET verified = $2, updated_at = $3 WHERE user_id = $1")
                .bind(tutor.into_uuid())
                .bind(verified)
                .bind(at)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace_availability(
        &self,
        tutor: TutorId,
        slots: &[AvailabilitySlot],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tutor_availability WHERE tutor_id = $1")
            .bind(tutor.into_uuid())
            .execute(&mut *tx)
            .await?;
        for slot in slots {
            sqlx::query(
                r"
                INSERT INTO tutor_availability (tutor_id, day_of_week, start_time, end_time)
                VALUES ($1, $2, $3, $4)
                ",
            )
            .bind(tutor.into_uuid())
            .bind(i16::from(slot.day_of_week))
            .bind(slot.start_time)
            .bind(slot.end_time)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn availability(&self, tutor: TutorId) -> StoreResult<Vec<AvailabilitySlot>> {
        let rows = sqlx::query(
            r"
            SELECT day_of_week, start_time, end_time
            FROM tutor_availability
            WHERE tutor_id = $1
            ORDER BY day_of_week, start_time
            ",
        )
        .bind(tutor.into_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<AvailabilitySlot> {
                let day: i16 = row.try_get("day_of_week")?;
                Ok(AvailabilitySlot {
                    day_of_week: u8::try_from(day)
                        .map_err(|_| StoreError::Database(format!("bad day_of_week {day}")))?,
                    start_time: row.try_get("start_time")?,
                    end_time: row.try_get("end_time")?,
                })
            })
            .collect()
    }
}
