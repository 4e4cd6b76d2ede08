//! Router configuration for BlajarPlus.

use super::state::AppState;
use crate::api::{bookings, chat, courses, notifications, payments, tutors};
use crate::auth::handlers as auth;
use axum::{
    routing::{get, post, put},
    Router,
};
use blajarplus_web::correlation_id_layer;
use blajarplus_web::handlers::health::{health_check, readiness_check};
use tower_http::trace::TraceLayer;

/// Build the complete Axum router.
///
/// Health checks live at the root; everything else under `/api`. Every
/// request gets a correlation ID and a trace span.
pub fn build_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/magic-link", post(auth::send_magic_link))
        .route("/verify", post(auth::verify_magic_link))
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me));

    let api_routes = Router::new()
        .nest("/auth", auth_routes)
        .route("/users/me", put(auth::update_me))
        // Tutors
        .route("/tutors", get(tutors::search_tutors))
        .route("/tutors/me", put(tutors::upsert_my_profile))
        .route("/tutors/me/availability", put(tutors::replace_my_availability))
        .route("/tutors/me/earnings", get(tutors::my_earnings))
        .route("/tutors/:id", get(tutors::get_tutor))
        .route("/tutors/:id/availability", get(tutors::get_availability))
        .route("/tutors/:id/reviews", get(tutors::list_reviews))
        // Bookings
        .route(
            "/bookings",
            post(bookings::create_booking).get(bookings::list_bookings),
        )
        .route("/bookings/:id", get(bookings::get_booking))
        .route("/bookings/:id/payments", post(bookings::initiate_payment))
        .route("/bookings/:id/payment", get(bookings::get_payment))
        .route("/bookings/:id/cancel", post(bookings::cancel_booking))
        .route("/bookings/:id/complete", post(bookings::complete_booking))
        .route("/bookings/:id/review", post(bookings::review_booking))
        // Payments
        .route("/payments/webhook", post(payments::payment_webhook))
        // Chat
        .route(
            "/conversations",
            get(chat::list_conversations).post(chat::start_conversation),
        )
        .route(
            "/conversations/:id/messages",
            get(chat::list_messages).post(chat::send_message),
        )
        .route("/conversations/:id/read", post(chat::mark_read))
        // Notifications
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/:id/read", post(notifications::mark_read))
        // Courses
        .route(
            "/courses",
            get(courses::list_courses).post(courses::create_course),
        )
        .route("/courses/:id", get(courses::get_course))
        .route("/courses/:id/lessons", post(courses::add_lesson))
        .route("/courses/:id/enroll", post(courses::enroll))
        .route(
            "/courses/:id/lessons/:lesson_id/complete",
            post(courses::complete_lesson),
        )
        .route("/me/progress", get(courses::my_progress))
        .route("/me/certificates", get(courses::my_certificates))
        // Admin
        .route("/admin/tutors/:id/verify", post(tutors::verify_tutor))
        .route("/admin/payments/:booking_id/refund", post(payments::retry_refund));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(correlation_id_layer())
        .with_state(state)
}
