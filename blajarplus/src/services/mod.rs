//! Application services.
//!
//! Services sit between HTTP handlers and the repositories. They enforce
//! ownership and role rules, validate input, and translate storage and
//! reducer failures into [`ServiceError`], which maps onto
//! [`blajarplus_web::AppError`] at the HTTP boundary.

pub mod booking;
pub mod chat;
pub mod courses;
pub mod notifications;
pub mod reviews;
pub mod tutors;

#[cfg(test)]
pub(crate) mod fixtures;

pub use booking::{BookingRequest, BookingService, WebhookOutcome};
pub use chat::ChatService;
pub use courses::{CourseService, NewCourse, NewLesson};
pub use notifications::NotificationService;
pub use reviews::{NewReview, ReviewService};
pub use tutors::{ProfileUpdate, TutorService};

use crate::aggregates::BookingError;
use crate::stores::StoreError;
use axum::http::StatusCode;
use blajarplus_web::AppError;

/// Service result
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Why a service call failed.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Resource does not exist (or is invisible to the caller)
    #[error("{resource} {id} not found")]
    NotFound {
        /// Resource name
        resource: &'static str,
        /// Requested id
        id: String,
    },

    /// Caller lacks the role or is not a participant
    #[error("{0}")]
    Forbidden(String),

    /// Input failed validation
    #[error("{0}")]
    Validation(String),

    /// Uniqueness, overlap or concurrent modification
    #[error("{0}")]
    Conflict(String),

    /// Malformed request
    #[error("{0}")]
    BadRequest(String),

    /// The payment provider failed
    #[error("payment provider error: {0}")]
    Upstream(String),

    /// Booking reducer rejection
    #[error(transparent)]
    Booking(#[from] BookingError),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl ServiceError {
    pub(crate) fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub(crate) fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => Self::NotFound {
                resource: entity,
                id,
            },
            StoreError::Conflict(message) => Self::Conflict(message),
            slot @ StoreError::SlotTaken { .. } => Self::Conflict(slot.to_string()),
            StoreError::Database(message) => Self::Storage(message),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::NotFound { resource, id } => Self::not_found(resource, id),
            ServiceError::Forbidden(message) => Self::forbidden(message),
            ServiceError::Validation(message) => Self::validation(message),
            ServiceError::Conflict(message) => Self::conflict(message),
            ServiceError::BadRequest(message) => Self::bad_request(message),
            ServiceError::Upstream(message) => Self::bad_gateway(message),
            ServiceError::Booking(error) => booking_error(error),
            ServiceError::Storage(message) => Self::internal("An internal error occurred")
                .with_source(anyhow::anyhow!(message)),
        }
    }
}

fn booking_error(error: BookingError) -> AppError {
    let message = error.to_string();
    match error {
        BookingError::NotFound => {
            AppError::new(StatusCode::NOT_FOUND, message, "NOT_FOUND".to_string())
        }
        BookingError::Validation(_) => AppError::validation(message),
        BookingError::Forbidden(_) => AppError::forbidden(message),
        BookingError::UnknownOrder(_) | BookingError::AmountMismatch { .. } => {
            AppError::bad_request(message)
        }
        BookingError::InvalidTransition { .. }
        | BookingError::AlreadyPaid
        | BookingError::DeadlinePassed
        | BookingError::DeadlineNotReached
        | BookingError::NotYetEnded
        | BookingError::AlreadyStarted
        | BookingError::CancellationWindowClosed { .. }
        | BookingError::EscrowMismatch(_) => AppError::conflict(message),
    }
}

/// Trim `value` and check its length in characters.
pub(crate) fn text_field(field: &str, value: &str, min: usize, max: usize) -> ServiceResult<String> {
    let trimmed = value.trim();
    let len = trimmed.chars().count();
    if len < min {
        return Err(if min == 1 {
            ServiceError::validation(format!("{field} must not be empty"))
        } else {
            ServiceError::validation(format!("{field} must be at least {min} characters"))
        });
    }
    if len > max {
        return Err(ServiceError::validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Like [`text_field`], but empty input becomes `None`.
pub(crate) fn optional_text(
    field: &str,
    value: Option<&str>,
    max: usize,
) -> ServiceResult<Option<String>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => text_field(field, v, 1, max).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::BookingStatus;

    #[test]
    fn test_store_errors_map_to_service_errors() {
        let slot: ServiceError = StoreError::SlotTaken { party: "tutor" }.into();
        assert!(matches!(slot, ServiceError::Conflict(ref m) if m.contains("tutor")));

        let missing: ServiceError = StoreError::not_found("booking", "x").into();
        assert!(matches!(missing, ServiceError::NotFound { resource: "booking", .. }));
    }

    #[test]
    fn test_booking_errors_map_to_http_status() {
        let cases = [
            (BookingError::Validation("bad".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (BookingError::Forbidden("no".into()), StatusCode::FORBIDDEN),
            (
                BookingError::InvalidTransition {
                    action: "cancel",
                    status: BookingStatus::Completed,
                },
                StatusCode::CONFLICT,
            ),
            (BookingError::UnknownOrder("BP-1".into()), StatusCode::BAD_REQUEST),
            (BookingError::NotFound, StatusCode::NOT_FOUND),
        ];
        for (error, status) in cases {
            let app: AppError = ServiceError::Booking(error).into();
            assert_eq!(app.status(), status);
        }
    }

    #[test]
    fn test_text_field() {
        assert_eq!(text_field("reason", "  late  ", 1, 10).unwrap(), "late");
        assert!(text_field("reason", "   ", 1, 10).is_err());
        assert!(text_field("reason", &"a".repeat(11), 1, 10).is_err());
        assert_eq!(optional_text("notes", Some("  "), 10).unwrap(), None);
    }
}
