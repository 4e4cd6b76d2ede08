//! Payment provider callbacks and admin payment operations.
//!
//! - POST /api/payments/webhook - Provider notification (signed, no session)
//! - POST /api/admin/payments/:booking_id/refund - Retry a failed refund (admin)

use crate::auth::RequireAdmin;
use crate::payment_gateway::WebhookPayload;
use crate::server::state::AppState;
use crate::services::booking::BookingDetails;
use crate::services::WebhookOutcome;
use crate::types::BookingId;
use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use blajarplus_web::{AppError, CorrelationId, WebResult};
use serde::Serialize;
use tracing::{info, warn};

/// Acknowledgement returned to the provider.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// What the notification did
    pub outcome: WebhookOutcome,
}

/// Receive a payment notification.
///
/// The body is parsed by hand so malformed payloads answer `400` rather than
/// `422`. A bad signature answers `403`. Notifications for unknown or
/// superseded orders answer `200` with `"ignored"` so the provider stops
/// retrying them.
pub async fn payment_webhook(
    State(state): State<AppState>,
    CorrelationId(correlation_id): CorrelationId,
    body: Bytes,
) -> WebResult<Json<WebhookResponse>> {
    let payload: WebhookPayload = serde_json::from_slice(&body).map_err(|e| {
        warn!(%correlation_id, error = %e, "Malformed payment notification");
        AppError::bad_request(format!("malformed notification: {e}"))
    })?;
    let order_id = payload.order_id.clone();
    let outcome = state.bookings.apply_notification(payload).await?;
    info!(%correlation_id, %order_id, outcome = outcome.as_str(), "Payment notification handled");
    Ok(Json(WebhookResponse { outcome }))
}

/// Ask the provider again for a refund that failed.
pub async fn retry_refund(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(booking_id): Path<BookingId>,
) -> WebResult<Json<BookingDetails>> {
    Ok(Json(state.bookings.retry_refund(&admin, booking_id).await?))
}
