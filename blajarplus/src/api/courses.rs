//! Language course endpoints.
//!
//! - GET /api/courses - Catalogue (plus the caller's drafts)
//! - POST /api/courses - Create a course (tutor, admin)
//! - GET /api/courses/:id - Course with lessons
//! - POST /api/courses/:id/lessons - Add a lesson (author, admin)
//! - POST /api/courses/:id/enroll - Enroll (idempotent)
//! - POST /api/courses/:id/lessons/:lesson_id/complete - Complete a lesson
//! - GET /api/me/progress - XP, level, streaks and enrollments
//! - GET /api/me/certificates - Earned certificates

use crate::auth::{MaybeUser, SessionUser};
use crate::server::state::AppState;
use crate::services::courses::{CourseDetails, CourseQuery, LessonProgress, Progress};
use crate::services::{NewCourse, NewLesson};
use crate::types::{Certificate, Course, CourseId, Enrollment, Lesson, LessonId};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use blajarplus_web::{ApiJson, ApiQuery, WebResult};

/// Browse courses.
pub async fn list_courses(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    ApiQuery(query): ApiQuery<CourseQuery>,
) -> WebResult<Json<Vec<Course>>> {
    Ok(Json(state.courses.list(viewer.as_ref(), query).await?))
}

/// Create a course.
pub async fn create_course(
    State(state): State<AppState>,
    session: SessionUser,
    ApiJson(course): ApiJson<NewCourse>,
) -> WebResult<(StatusCode, Json<Course>)> {
    let course = state.courses.create(&session.user, course).await?;
    Ok((StatusCode::CREATED, Json(course)))
}

/// Get a course and its lessons.
pub async fn get_course(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path(id): Path<CourseId>,
) -> WebResult<Json<CourseDetails>> {
    Ok(Json(state.courses.get(viewer.as_ref(), id).await?))
}

/// Add a lesson.
pub async fn add_lesson(
    State(state): State<AppState>,
    session: SessionUser,
    Path(id): Path<CourseId>,
    ApiJson(lesson): ApiJson<NewLesson>,
) -> WebResult<(StatusCode, Json<Lesson>)> {
    let lesson = state.courses.add_lesson(&session.user, id, lesson).await?;
    Ok((StatusCode::CREATED, Json(lesson)))
}

/// Enroll in a course.
pub async fn enroll(
    State(state): State<AppState>,
    session: SessionUser,
    Path(id): Path<CourseId>,
) -> WebResult<Json<Enrollment>> {
    Ok(Json(state.courses.enroll(&session.user, id).await?))
}

/// Complete a lesson.
pub async fn complete_lesson(
    State(state): State<AppState>,
    session: SessionUser,
    Path((course_id, lesson_id)): Path<(CourseId, LessonId)>,
) -> WebResult<Json<LessonProgress>> {
    Ok(Json(
        state
            .courses
            .complete_lesson(&session.user, course_id, lesson_id)
            .await?,
    ))
}

/// The caller's learning progress.
pub async fn my_progress(
    State(state): State<AppState>,
    session: SessionUser,
) -> WebResult<Json<Progress>> {
    Ok(Json(state.courses.progress(&session.user).await?))
}

/// The caller's certificates.
pub async fn my_certificates(
    State(state): State<AppState>,
    session: SessionUser,
) -> WebResult<Json<Vec<Certificate>>> {
    Ok(Json(state.courses.certificates(&session.user).await?))
}
