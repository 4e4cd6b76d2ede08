//! End-to-end tests of the HTTP API over the in-memory stores.
//!
//! Requests go through the full router (extractors, auth, services, reducer)
//! with a manual clock so session times can be reached without waiting.

#![allow(clippy::unwrap_used)]

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use blajarplus::config::Config;
use blajarplus::notify::ConsoleEmailProvider;
use blajarplus::payment_gateway::MockPaymentGateway;
use blajarplus::server::{build_router, AppState};
use blajarplus::stores::Stores;
use blajarplus::types::Money;
use blajarplus_core::environment::Clock;
use blajarplus_testing::{init_test_tracing, test_clock, ManualClock};
use blajarplus_web::handlers::health::ReadinessProbe;
use blajarplus_web::CORRELATION_ID_HEADER;
use chrono::Duration;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const ADMIN_EMAIL: &str = "ops@blajarplus.id";

struct TestApp {
    router: Router,
    clock: ManualClock,
}

impl TestApp {
    fn new() -> Self {
        init_test_tracing();
        let config = Config::from_lookup(|key| match key {
            "ADMIN_EMAILS" => Some(ADMIN_EMAIL.to_string()),
            "AUTH_EXPOSE_MAGIC_LINKS_FOR_TESTING" => Some("true".to_string()),
            _ => None,
        });
        let (stores, store) = Stores::memory();
        let clock = ManualClock::new(test_clock().now());
        let state = AppState::new(
            config,
            &stores,
            MockPaymentGateway::shared(),
            Arc::new(ConsoleEmailProvider::new()),
            Arc::new(clock.clone()),
            vec![store as Arc<dyn ReadinessProbe>],
        );
        Self {
            router: build_router(state),
            clock,
        }
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.send(Method::POST, uri, token, Some(body)).await
    }

    async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, Some(token), None).await
    }

    /// Register an account and sign in through the magic link flow.
    async fn sign_up(&self, email: &str, name: &str, role: Option<&str>) -> (String, String) {
        let (status, user) = self
            .post(
                "/api/auth/register",
                None,
                json!({ "email": email, "name": name, "role": role }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{user}");

        let (status, link) = self
            .post("/api/auth/magic-link", None, json!({ "email": email }))
            .await;
        assert_eq!(status, StatusCode::OK);
        let link_token = link["magic_link_token"].as_str().unwrap().to_string();

        let (status, grant) = self
            .post("/api/auth/verify", None, json!({ "token": link_token }))
            .await;
        assert_eq!(status, StatusCode::OK, "{grant}");
        (
            grant["token"].as_str().unwrap().to_string(),
            user["id"].as_str().unwrap().to_string(),
        )
    }

    /// A tutor with an online profile at Rp 100.000/hour.
    async fn tutor(&self) -> (String, String) {
        let (token, id) = self.sign_up("budi@example.com", "Budi", Some("tutor")).await;
        let (status, profile) = self
            .send(
                Method::PUT,
                "/api/tutors/me",
                Some(&token),
                Some(json!({
                    "headline": "Matematika SMA",
                    "subjects": ["Mathematics"],
                    "hourly_rate": 100_000,
                    "teaching_modes": ["online"],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{profile}");
        (token, id)
    }

    async fn book(&self, student: &str, tutor_id: &str) -> Value {
        let start = test_clock().now() + Duration::days(2) + Duration::hours(3);
        let (status, booking) = self
            .post(
                "/api/bookings",
                Some(student),
                json!({
                    "tutor_id": tutor_id,
                    "subject": "Mathematics",
                    "mode": "online",
                    "start_at": start,
                    "duration_minutes": 60,
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{booking}");
        booking
    }
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = TestApp::new();
    let (status, _) = app.send(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.send(Method::GET, "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_booking_paid_completed_and_reviewed() {
    let app = TestApp::new();
    let (tutor, tutor_id) = app.tutor().await;
    let (student, _) = app.sign_up("siti@example.com", "Siti", None).await;

    let booking = app.book(&student, &tutor_id).await;
    let booking_id = booking["id"].as_str().unwrap().to_string();
    assert_eq!(booking["status"], "pending_payment");
    assert_eq!(booking["price"], 100_000);

    let (status, payment) = app
        .post(&format!("/api/bookings/{booking_id}/payments"), Some(&student), json!({}))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{payment}");
    let order_id = payment["order_id"].as_str().unwrap().to_string();

    let settlement =
        MockPaymentGateway::signed_payload(&order_id, "settlement", Money::from_rupiah(100_000));
    let (status, ack) = app
        .post("/api/payments/webhook", None, serde_json::to_value(&settlement).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "applied");

    // Duplicate delivery is acknowledged without changing anything.
    let (status, _) = app
        .post("/api/payments/webhook", None, serde_json::to_value(&settlement).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, details) = app.get(&format!("/api/bookings/{booking_id}"), &tutor).await;
    assert_eq!(details["status"], "confirmed");
    assert_eq!(details["payment"]["escrow"], "held");

    // Too early to complete.
    let (status, _) = app
        .post(&format!("/api/bookings/{booking_id}/complete"), Some(&student), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    app.clock.advance(Duration::days(3));
    let (status, details) = app
        .post(&format!("/api/bookings/{booking_id}/complete"), Some(&student), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK, "{details}");
    assert_eq!(details["status"], "completed");
    assert_eq!(details["payment"]["escrow"], "released");

    let (status, review) = app
        .post(
            &format!("/api/bookings/{booking_id}/review"),
            Some(&student),
            json!({ "rating": 5, "comment": "Sabar dan jelas" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{review}");

    let (status, _) = app
        .post(
            &format!("/api/bookings/{booking_id}/review"),
            Some(&student),
            json!({ "rating": 4 }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, listing) = app.get(&format!("/api/tutors/{tutor_id}"), &student).await;
    assert_eq!(listing["rating_count"], 1);

    let (_, earnings) = app.get("/api/tutors/me/earnings", &tutor).await;
    assert_eq!(earnings["completed_sessions"], 1);
    assert_eq!(earnings["held"], 0);

    let (_, inbox) = app.get("/api/notifications", &tutor).await;
    assert!(!inbox.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_webhook_rejects_bad_input() {
    let app = TestApp::new();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/payments/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .header(CORRELATION_ID_HEADER, "6f1c5d2e-8a3b-4c7d-9e0f-1a2b3c4d5e6f")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get(CORRELATION_ID_HEADER).unwrap(),
        "6f1c5d2e-8a3b-4c7d-9e0f-1a2b3c4d5e6f"
    );

    let mut forged =
        MockPaymentGateway::signed_payload("BP-unknown-1", "settlement", Money::from_rupiah(1));
    forged.signature_key = "0".repeat(128);
    let (status, _) = app
        .post("/api/payments/webhook", None, serde_json::to_value(&forged).unwrap())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let unknown =
        MockPaymentGateway::signed_payload("BP-unknown-1", "settlement", Money::from_rupiah(1));
    let (status, ack) = app
        .post("/api/payments/webhook", None, serde_json::to_value(&unknown).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "ignored");
}

#[tokio::test]
async fn test_access_control() {
    let app = TestApp::new();
    let (tutor, tutor_id) = app.tutor().await;
    let (student, _) = app.sign_up("siti@example.com", "Siti", None).await;
    let (outsider, _) = app.sign_up("andi@example.com", "Andi", None).await;
    let (admin, _) = app.sign_up(ADMIN_EMAIL, "Ops", None).await;

    let (status, _) = app.send(Method::GET, "/api/bookings", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = app.get("/api/auth/me", "not-a-token").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Tutors cannot book, students cannot publish tutor profiles.
    let start = test_clock().now() + Duration::days(2);
    let (status, _) = app
        .post(
            "/api/bookings",
            Some(&tutor),
            json!({
                "tutor_id": tutor_id,
                "subject": "Mathematics",
                "mode": "online",
                "start_at": start,
                "duration_minutes": 60,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = app
        .send(
            Method::PUT,
            "/api/tutors/me",
            Some(&student),
            Some(json!({ "headline": "x", "hourly_rate": 1, "teaching_modes": ["online"] })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let booking = app.book(&student, &tutor_id).await;
    let booking_id = booking["id"].as_str().unwrap();
    let (status, _) = app.get(&format!("/api/bookings/{booking_id}"), &outsider).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = app
        .get(&format!("/api/bookings/{}", uuid::Uuid::new_v4()), &admin)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = app.get(&format!("/api/bookings/{booking_id}"), &admin).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .post(&format!("/api/admin/tutors/{tutor_id}/verify"), Some(&student), json!({}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, listing) = app
        .post(&format!("/api/admin/tutors/{tutor_id}/verify"), Some(&admin), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK, "{listing}");
    assert_eq!(listing["verified"], true);
}

#[tokio::test]
async fn test_overlapping_booking_is_rejected() {
    let app = TestApp::new();
    let (_, tutor_id) = app.tutor().await;
    let (first, _) = app.sign_up("siti@example.com", "Siti", None).await;
    let (second, _) = app.sign_up("andi@example.com", "Andi", None).await;

    app.book(&first, &tutor_id).await;
    let start = test_clock().now() + Duration::days(2) + Duration::hours(3) + Duration::minutes(30);
    let (status, _) = app
        .post(
            "/api/bookings",
            Some(&second),
            json!({
                "tutor_id": tutor_id,
                "subject": "Mathematics",
                "mode": "online",
                "start_at": start,
                "duration_minutes": 60,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_cancel_pending_booking_and_logout() {
    let app = TestApp::new();
    let (_, tutor_id) = app.tutor().await;
    let (student, _) = app.sign_up("siti@example.com", "Siti", None).await;
    let booking = app.book(&student, &tutor_id).await;
    let booking_id = booking["id"].as_str().unwrap();

    let (status, _) = app
        .post(&format!("/api/bookings/{booking_id}/cancel"), Some(&student), json!({}))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, details) = app
        .post(
            &format!("/api/bookings/{booking_id}/cancel"),
            Some(&student),
            json!({ "reason": "Jadwal bentrok" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{details}");
    assert_eq!(details["status"], "cancelled");

    let (status, _) = app.send(Method::POST, "/api/auth/logout", Some(&student), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.get("/api/auth/me", &student).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_chat_between_student_and_tutor() {
    let app = TestApp::new();
    let (tutor, tutor_id) = app.tutor().await;
    let (student, _) = app.sign_up("siti@example.com", "Siti", None).await;

    let (status, conversation) = app
        .post("/api/conversations", Some(&student), json!({ "participant_id": tutor_id }))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{conversation}");
    let conversation_id = conversation["id"].as_str().unwrap();

    let (status, _) = app
        .post(
            &format!("/api/conversations/{conversation_id}/messages"),
            Some(&student),
            json!({ "body": "Halo, bisa les hari Rabu?" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, messages) = app
        .get(&format!("/api/conversations/{conversation_id}/messages"), &tutor)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(messages.as_array().unwrap().len(), 1);
}
