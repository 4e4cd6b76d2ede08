use super::{id, text_enum, PgStore};
use crate::stores::{
    CompletionRequest, CourseFilter, CourseRepository, LessonCompletion, StoreError, StoreResult,
};
use crate::types::{
    Certificate, Course, CourseId, Enrollment, LearnerProfile, Lesson, LessonId, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

const COURSE_COLUMNS: &str =
    "id, author_id, title, language, level, description, published, created_at";

fn course_from_row(row: &PgRow) -> StoreResult<Course> {
    Ok(Course {
        id: id(row, "id")?,
        author_id: id(row, "author_id")?,
        title: row.try_get("title")?,
        language: row.try_get("language")?,
        level: text_enum(row, "level")?,
        description: row.try_get("description")?,
        published: row.try_get("published")?,
        created_at: row.try_get("created_at")?,
    })
}

fn lesson_from_row(row: &PgRow) -> StoreResult<Lesson> {
    Ok(Lesson {
        id: id(row, "id")?,
        course_id: id(row, "course_id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        position: row.try_get("position")?,
        xp_reward: row.try_get("xp_reward")?,
    })
}

fn learner_from_row(row: &PgRow) -> StoreResult<LearnerProfile> {
    Ok(LearnerProfile {
        user_id: id(row, "user_id")?,
        xp: row.try_get("xp")?,
        level: row.try_get("level")?,
        current_streak: row.try_get("current_streak")?,
        longest_streak: row.try_get("longest_streak")?,
        last_activity_on: row.try_get("last_activity_on")?,
    })
}

fn certificate_from_row(row: &PgRow) -> StoreResult<Certificate> {
    Ok(Certificate {
        id: id(row, "id")?,
        user_id: id(row, "user_id")?,
        course_id: id(row, "course_id")?,
        code: row.try_get("code")?,
        issued_at: row.try_get("issued_at")?,
    })
}

impl PgStore {
    async fn completed_lessons(&self, course: CourseId, user: UserId) -> StoreResult<Vec<LessonId>> {
        let lessons: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT lesson_id FROM lesson_completions
            WHERE course_id = $1 AND user_id = $2
            ORDER BY completed_at, lesson_id
            ",
        )
        .bind(course.into_uuid())
        .bind(user.into_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(lessons.into_iter().map(LessonId::from).collect())
    }

    async fn enrollment_from_row(&self, row: &PgRow) -> StoreResult<Enrollment> {
        let course_id: CourseId = id(row, "course_id")?;
        let user_id: UserId = id(row, "user_id")?;
        Ok(Enrollment {
            course_id,
            user_id,
            completed_lessons: self.completed_lessons(course_id, user_id).await?,
            enrolled_at: row.try_get("enrolled_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

#[async_trait]
impl CourseRepository for PgStore {
    async fn insert_course(&self, course: &Course) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO courses
                (id, author_id, title, language, level, description, published, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(course.id.into_uuid())
        .bind(course.author_id.into_uuid())
        .bind(&course.title)
        .bind(&course.language)
        .bind(course.level.as_str())
        .bind(&course.description)
        .bind(course.published)
        .bind(course.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_course(&self, course: CourseId) -> StoreResult<Option<Course>> {
        let row = sqlx::query(&format!("SELECT {COURSE_COLUMNS} FROM courses WHERE id = $1"))
            .bind(course.into_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(course_from_row).transpose()
    }

    async fn list_courses(&self, filter: &CourseFilter) -> StoreResult<Vec<Course>> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {COURSE_COLUMNS} FROM courses WHERE (published"));
        if let Some(author) = filter.author {
            qb.push(" OR author_id = ").push_bind(author.into_uuid());
        }
        qb.push(")");
        if let Some(language) = &filter.language {
            qb.push(" AND lower(language) = lower(")
                .push_bind(language.clone())
                .push(")");
        }
        if let Some(level) = filter.level {
            qb.push(" AND level = ").push_bind(level.as_str());
        }
        qb.push(" ORDER BY created_at DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(course_from_row).collect()
    }

    async fn insert_lesson(&self, lesson: &Lesson) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO lessons (id, course_id, title, content, position, xp_reward)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(lesson.id.into_uuid())
        .bind(lesson.course_id.into_uuid())
        .bind(&lesson.title)
        .bind(&lesson.content)
        .bind(lesson.position)
        .bind(lesson.xp_reward)
        .execute(&self.pool)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => {
                StoreError::Conflict(format!("position {} is already used", lesson.position))
            }
            other => other,
        })?;
        Ok(())
    }

    async fn lessons(&self, course: CourseId) -> StoreResult<Vec<Lesson>> {
        let rows = sqlx::query(
            r"
            SELECT id, course_id, title, content, position, xp_reward
            FROM lessons
            WHERE course_id = $1
            ORDER BY position
            ",
        )
        .bind(course.into_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(lesson_from_row).collect()
    }

    async fn enrollment(&self, course: CourseId, user: UserId) -> StoreResult<Option<Enrollment>> {
        let row = sqlx::query(
            r"
            SELECT course_id, user_id, enrolled_at, completed_at
            FROM enrollments
            WHERE course_id = $1 AND user_id = $2
            ",
        )
        .bind(course.into_uuid())
        .bind(user.into_uuid())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.enrollment_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StoreResult<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO enrollments (course_id, user_id, enrolled_at, completed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (course_id, user_id) DO NOTHING
            ",
        )
        .bind(enrollment.course_id.into_uuid())
        .bind(enrollment.user_id.into_uuid())
        .bind(enrollment.enrolled_at)
        .bind(enrollment.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn enrollments_for(&self, user: UserId) -> StoreResult<Vec<Enrollment>> {
        let rows = sqlx::query(
            r"
            SELECT course_id, user_id, enrolled_at, completed_at
            FROM enrollments
            WHERE user_id = $1
            ORDER BY enrolled_at DESC
            ",
        )
        .bind(user.into_uuid())
        .fetch_all(&self.pool)
        .await?;

        let mut enrollments = Vec::with_capacity(rows.len());
        for row in &rows {
            enrollments.push(self.enrollment_from_row(row).await?);
        }
        Ok(enrollments)
    }

    async fn record_completion(
        &self,
        request: &CompletionRequest,
    ) -> StoreResult<LessonCompletion> {
        let course = request.course_id.into_uuid();
        let user = request.user_id.into_uuid();
        let mut tx = self.pool.begin().await?;

        // Completions of one enrollment serialize on its row.
        let enrollment = sqlx::query(
            r"
            SELECT course_id, user_id, enrolled_at, completed_at
            FROM enrollments
            WHERE course_id = $1 AND user_id = $2
            FOR UPDATE
            ",
        )
        .bind(course)
        .bind(user)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            entity: "enrollment",
            id: format!("{course}/{user}"),
        })?;
        let enrolled_at: DateTime<Utc> = enrollment.try_get("enrolled_at")?;
        let mut completed_at: Option<DateTime<Utc>> = enrollment.try_get("completed_at")?;

        sqlx::query(
            r"
            INSERT INTO lesson_completions (user_id, lesson_id, course_id, completed_at)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(user)
        .bind(request.lesson_id.into_uuid())
        .bind(course)
        .bind(request.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => StoreError::Conflict("lesson already completed".to_string()),
            other => other,
        })?;

        let open_lessons: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*) FROM lessons l
            WHERE l.course_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM lesson_completions c
                  WHERE c.lesson_id = l.id AND c.user_id = $2
              )
            ",
        )
        .bind(course)
        .bind(user)
        .fetch_one(&mut *tx)
        .await?;

        let mut certificate = None;
        if open_lessons == 0 && completed_at.is_none() {
            completed_at = Some(request.completed_at);
            sqlx::query(
                "UPDATE enrollments SET completed_at = $3 WHERE course_id = $1 AND user_id = $2",
            )
            .bind(course)
            .bind(user)
            .bind(completed_at)
            .execute(&mut *tx)
            .await?;

            let issued = &request.certificate;
            sqlx::query(
                r"
                INSERT INTO certificates (id, user_id, course_id, code, issued_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(issued.id.into_uuid())
            .bind(user)
            .bind(course)
            .bind(&issued.code)
            .bind(issued.issued_at)
            .execute(&mut *tx)
            .await?;
            certificate = Some(issued.clone());
        }

        // The profile row is locked too, since other courses award XP to it.
        sqlx::query("INSERT INTO learner_profiles (user_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(user)
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query(
            r"
            SELECT user_id, xp, level, current_streak, longest_streak, last_activity_on
            FROM learner_profiles
            WHERE user_id = $1
            FOR UPDATE
            ",
        )
        .bind(user)
        .fetch_one(&mut *tx)
        .await?;
        let mut profile = learner_from_row(&row)?;
        profile.award(request.xp, request.activity_day);
        sqlx::query(
            r"
            UPDATE learner_profiles
            SET xp = $2, level = $3, current_streak = $4, longest_streak = $5,
                last_activity_on = $6
            WHERE user_id = $1
            ",
        )
        .bind(user)
        .bind(profile.xp)
        .bind(profile.level)
        .bind(profile.current_streak)
        .bind(profile.longest_streak)
        .bind(profile.last_activity_on)
        .execute(&mut *tx)
        .await?;

        let completed_lessons: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT lesson_id FROM lesson_completions
            WHERE course_id = $1 AND user_id = $2
            ORDER BY completed_at, lesson_id
            ",
        )
        .bind(course)
        .bind(user)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(LessonCompletion {
            lesson_id: request.lesson_id,
            enrollment: Enrollment {
                course_id: request.course_id,
                user_id: request.user_id,
                completed_lessons: completed_lessons.into_iter().map(LessonId::from).collect(),
                enrolled_at,
                completed_at,
            },
            profile,
            certificate,
            completed_at: request.completed_at,
        })
    }

    async fn learner_profile(&self, user: UserId) -> StoreResult<Option<LearnerProfile>> {
        let row = sqlx::query(
            r"
            SELECT user_id, xp, level, current_streak, longest_streak, last_activity_on
            FROM learner_profiles
            WHERE user_id = $1
            ",
        )
        .bind(user.into_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(learner_from_row).transpose()
    }

    async fn certificates_for(&self, user: UserId) -> StoreResult<Vec<Certificate>> {
        let rows = sqlx::query(
            r"
            SELECT id, user_id, course_id, code, issued_at
            FROM certificates
            WHERE user_id = $1
            ORDER BY issued_at DESC
            ",
        )
        .bind(user.into_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(certificate_from_row).collect()
    }
}
