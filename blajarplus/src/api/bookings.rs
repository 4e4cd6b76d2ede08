//! Booking lifecycle endpoints.
//!
//! - POST /api/bookings - Request a session (student)
//! - GET /api/bookings - The caller's bookings (admins see all)
//! - GET /api/bookings/:id - Booking with its latest payment (participants)
//! - POST /api/bookings/:id/payments - Start a checkout (student)
//! - GET /api/bookings/:id/payment - Latest payment attempt (participants)
//! - POST /api/bookings/:id/cancel - Cancel (participants, admins)
//! - POST /api/bookings/:id/complete - Mark the session done (participants, admins)
//! - POST /api/bookings/:id/review - Review a completed session (student)
//!
//! # State Machine
//!
//! ```text
//! pending_payment → confirmed → completed
//!        ↓              ↓
//!    cancelled      cancelled (refund)
//! ```

use crate::auth::SessionUser;
use crate::server::state::AppState;
use crate::services::booking::BookingDetails;
use crate::services::{BookingRequest, NewReview};
use crate::types::{Booking, BookingId, BookingStatus, Payment, Review};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use blajarplus_web::{ApiJson, ApiQuery, WebResult};
use serde::Deserialize;
use tracing::info;

/// Query string of `GET /api/bookings`.
#[derive(Debug, Default, Deserialize)]
pub struct BookingListQuery {
    /// Only bookings in this status
    pub status: Option<BookingStatus>,
    /// Page size (at most 100)
    pub limit: Option<i64>,
    /// Rows to skip
    pub offset: Option<i64>,
}

/// Body of `POST /api/bookings/:id/cancel`.
#[derive(Debug, Default, Deserialize)]
pub struct CancelBookingRequest {
    /// Why the session is cancelled
    #[serde(default)]
    pub reason: Option<String>,
}

/// Request a session.
///
/// Returns `201` with the booking in `pending_payment`; `409` when either
/// party already has a session at that time.
pub async fn create_booking(
    State(state): State<AppState>,
    session: SessionUser,
    ApiJson(request): ApiJson<BookingRequest>,
) -> WebResult<(StatusCode, Json<Booking>)> {
    let booking = state.bookings.create(&session.user, request).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// List the caller's bookings.
pub async fn list_bookings(
    State(state): State<AppState>,
    session: SessionUser,
    ApiQuery(query): ApiQuery<BookingListQuery>,
) -> WebResult<Json<Vec<Booking>>> {
    Ok(Json(
        state
            .bookings
            .list(&session.user, query.status, query.limit, query.offset)
            .await?,
    ))
}

/// Get one booking.
pub async fn get_booking(
    State(state): State<AppState>,
    session: SessionUser,
    Path(id): Path<BookingId>,
) -> WebResult<Json<BookingDetails>> {
    Ok(Json(state.bookings.get(&session.user, id).await?))
}

/// Start (or resume) a checkout.
///
/// Returns `201` with the payment; its `redirect_url` is the provider's
/// checkout page.
pub async fn initiate_payment(
    State(state): State<AppState>,
    session: SessionUser,
    Path(id): Path<BookingId>,
) -> WebResult<(StatusCode, Json<Payment>)> {
    let payment = state.bookings.initiate_payment(&session.user, id).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

/// Latest payment attempt.
pub async fn get_payment(
    State(state): State<AppState>,
    session: SessionUser,
    Path(id): Path<BookingId>,
) -> WebResult<Json<Payment>> {
    Ok(Json(state.bookings.payment(&session.user, id).await?))
}

/// Cancel a booking. Paid bookings are refunded.
pub async fn cancel_booking(
    State(state): State<AppState>,
    session: SessionUser,
    Path(id): Path<BookingId>,
    body: Option<ApiJson<CancelBookingRequest>>,
) -> WebResult<Json<BookingDetails>> {
    let reason = body
        .and_then(|ApiJson(request)| request.reason)
        .unwrap_or_default();
    let details = state.bookings.cancel(&session.user, id, reason).await?;
    info!(booking_id = %id, user_id = %session.user.id, "Booking cancelled via API");
    Ok(Json(details))
}

/// Mark a session complete and release escrow to the tutor.
pub async fn complete_booking(
    State(state): State<AppState>,
    session: SessionUser,
    Path(id): Path<BookingId>,
) -> WebResult<Json<BookingDetails>> {
    Ok(Json(state.bookings.complete(&session.user, id).await?))
}

/// Review a completed session.
pub async fn review_booking(
    State(state): State<AppState>,
    session: SessionUser,
    Path(id): Path<BookingId>,
    ApiJson(review): ApiJson<NewReview>,
) -> WebResult<(StatusCode, Json<Review>)> {
    let review = state.reviews.create(&session.user, id, review).await?;
    Ok((StatusCode::CREATED, Json(review)))
}
