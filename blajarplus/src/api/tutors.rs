//! Tutor discovery and tutor self-service endpoints.
//!
//! - GET /api/tutors - Search tutors (public)
//! - GET /api/tutors/:id - Tutor listing (public)
//! - GET /api/tutors/:id/availability - Weekly availability (public)
//! - GET /api/tutors/:id/reviews - Reviews, newest first (public)
//! - PUT /api/tutors/me - Create or update the caller's profile (tutor)
//! - PUT /api/tutors/me/availability - Replace weekly availability (tutor)
//! - GET /api/tutors/me/earnings - Escrow totals (tutor)
//! - POST /api/admin/tutors/:id/verify - Set the verified flag (admin)

use crate::auth::{RequireAdmin, RequireTutor};
use crate::server::state::AppState;
use crate::services::tutors::TutorQuery;
use crate::services::ProfileUpdate;
use crate::stores::Page;
use crate::types::{AvailabilitySlot, EarningsSummary, Review, TutorId, TutorListing, TutorProfile};
use axum::{
    extract::{Path, State},
    Json,
};
use blajarplus_web::{ApiJson, ApiQuery, WebResult};
use serde::Deserialize;

/// Body of `PUT /api/tutors/me/availability`.
#[derive(Debug, Deserialize)]
pub struct AvailabilityRequest {
    /// New weekly windows; empty removes every restriction
    pub slots: Vec<AvailabilitySlot>,
}

/// Body of `POST /api/admin/tutors/:id/verify`.
#[derive(Debug, Deserialize)]
pub struct VerifyTutorRequest {
    /// New flag (defaults to `true`)
    #[serde(default = "default_verified")]
    pub verified: bool,
}

const fn default_verified() -> bool {
    true
}

/// Paging for review lists.
#[derive(Debug, Default, Deserialize)]
pub struct ReviewQuery {
    /// Page size (at most 100)
    pub limit: Option<i64>,
    /// Rows to skip
    pub offset: Option<i64>,
}

/// Search tutors.
///
/// ```text
/// GET /api/tutors?subject=math&city=bandung&mode=offline&sort=price_asc&page=2
/// ```
pub async fn search_tutors(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<TutorQuery>,
) -> WebResult<Json<Page<TutorListing>>> {
    Ok(Json(state.tutors.search(query).await?))
}

/// Get one tutor.
pub async fn get_tutor(
    State(state): State<AppState>,
    Path(id): Path<TutorId>,
) -> WebResult<Json<TutorListing>> {
    Ok(Json(state.tutors.get(id).await?))
}

/// Get a tutor's weekly availability.
pub async fn get_availability(
    State(state): State<AppState>,
    Path(id): Path<TutorId>,
) -> WebResult<Json<Vec<AvailabilitySlot>>> {
    Ok(Json(state.tutors.availability(id).await?))
}

/// List a tutor's reviews.
pub async fn list_reviews(
    State(state): State<AppState>,
    Path(id): Path<TutorId>,
    ApiQuery(query): ApiQuery<ReviewQuery>,
) -> WebResult<Json<Vec<Review>>> {
    Ok(Json(state.reviews.for_tutor(id, query.limit, query.offset).await?))
}

/// Create or update the caller's profile.
pub async fn upsert_my_profile(
    State(state): State<AppState>,
    RequireTutor(tutor): RequireTutor,
    ApiJson(update): ApiJson<ProfileUpdate>,
) -> WebResult<Json<TutorProfile>> {
    Ok(Json(state.tutors.upsert_profile(&tutor, update).await?))
}

/// Replace the caller's weekly availability.
pub async fn replace_my_availability(
    State(state): State<AppState>,
    RequireTutor(tutor): RequireTutor,
    ApiJson(request): ApiJson<AvailabilityRequest>,
) -> WebResult<Json<Vec<AvailabilitySlot>>> {
    Ok(Json(
        state
            .tutors
            .replace_availability(&tutor, request.slots)
            .await?,
    ))
}

/// Escrow totals for the caller.
pub async fn my_earnings(
    State(state): State<AppState>,
    RequireTutor(tutor): RequireTutor,
) -> WebResult<Json<EarningsSummary>> {
    Ok(Json(state.tutors.earnings(&tutor).await?))
}

/// Verify (or un-verify) a tutor.
pub async fn verify_tutor(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(id): Path<TutorId>,
    body: Option<ApiJson<VerifyTutorRequest>>,
) -> WebResult<Json<TutorListing>> {
    let verified = body.map_or(true, |ApiJson(request)| request.verified);
    Ok(Json(state.tutors.set_verified(&admin, id, verified).await?))
}
