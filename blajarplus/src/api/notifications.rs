//! Notification inbox endpoints.
//!
//! - GET /api/notifications - Newest first (`?unread=true` for unread only)
//! - POST /api/notifications/:id/read - Mark one read

use crate::auth::SessionUser;
use crate::server::state::AppState;
use crate::services::notifications::NotificationQuery;
use crate::types::{Notification, NotificationId};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use blajarplus_web::{ApiQuery, WebResult};

/// List the caller's notifications.
pub async fn list_notifications(
    State(state): State<AppState>,
    session: SessionUser,
    ApiQuery(query): ApiQuery<NotificationQuery>,
) -> WebResult<Json<Vec<Notification>>> {
    Ok(Json(state.notifications.list(&session.user, query).await?))
}

/// Mark a notification read.
pub async fn mark_read(
    State(state): State<AppState>,
    session: SessionUser,
    Path(id): Path<NotificationId>,
) -> WebResult<StatusCode> {
    state.notifications.mark_read(&session.user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
