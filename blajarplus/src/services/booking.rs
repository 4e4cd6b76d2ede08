//! Booking service.
//!
//! Runs the booking reducer against stored state:
//!
//! 1. Load the booking and its latest payment
//! 2. Reduce the command; a rejection is returned to the caller
//! 3. Save changed rows with an optimistic version check
//! 4. Run the effects and feed their results back through steps 1-3
//!
//! Feedback actions (checkout links, refund outcomes) are retried a few
//! times on version conflicts and otherwise only logged, because the command
//! that caused them has already been committed.

use super::{ServiceError, ServiceResult};
use crate::aggregates::{
    Actor, BookingAction, BookingEnvironment, BookingError, BookingReducer, BookingState,
    TutorSnapshot,
};
use crate::metrics::{record_transition, record_webhook, BOOKING_COMMAND_DURATION};
use crate::payment_gateway::{TransactionStatus, WebhookPayload};
use crate::stores::{BookingFilter, BookingRepository, Stores, TutorRepository, UserRepository};
use crate::types::{
    Booking, BookingId, BookingStatus, LessonMode, Payment, PaymentStatus, Role, TutorId, User,
};
use blajarplus_core::{effect::Effect, reducer::Reducer, Effects};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const MAX_FEEDBACK_ATTEMPTS: u32 = 3;
const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

/// Body of `POST /api/bookings`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BookingRequest {
    /// Tutor to book
    pub tutor_id: TutorId,
    /// Lesson subject
    pub subject: String,
    /// Online or offline
    pub mode: LessonMode,
    /// Meeting place for offline lessons
    #[serde(default)]
    pub location: Option<String>,
    /// Notes for the tutor
    #[serde(default)]
    pub notes: Option<String>,
    /// Session start
    pub start_at: DateTime<Utc>,
    /// Session length
    pub duration_minutes: i64,
}

/// A booking with its latest payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingDetails {
    /// Booking
    #[serde(flatten)]
    pub booking: Booking,
    /// Latest payment attempt
    pub payment: Option<Payment>,
}

/// What happened to a provider notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Reduced against the booking (possibly as a no-op duplicate)
    Applied,
    /// Unknown or superseded order, or a status we do not act on
    Ignored,
    /// Amount did not match the payment
    Rejected,
}

impl WebhookOutcome {
    /// Metric label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Ignored => "ignored",
            Self::Rejected => "rejected",
        }
    }
}

fn actor(user: &User) -> Actor {
    Actor::User {
        id: user.id,
        role: user.role,
    }
}

const fn command_name(action: &BookingAction) -> &'static str {
    match action {
        BookingAction::CreateBooking { .. } => "create",
        BookingAction::InitiatePayment { .. } => "initiate_payment",
        BookingAction::ApplyPaymentNotification { .. } => "payment_notification",
        BookingAction::CompleteBooking { .. } => "complete",
        BookingAction::CancelBooking { .. } => "cancel",
        BookingAction::ExpireBooking => "expire",
        BookingAction::RetryRefund { .. } => "retry_refund",
        _ => "feedback",
    }
}

/// Booking commands and queries.
#[derive(Clone)]
pub struct BookingService {
    reducer: BookingReducer,
    env: BookingEnvironment,
    bookings: Arc<dyn BookingRepository>,
    tutors: Arc<dyn TutorRepository>,
    users: Arc<dyn UserRepository>,
}

impl BookingService {
    /// Create the service.
    #[must_use]
    pub fn new(env: BookingEnvironment, stores: &Stores) -> Self {
        Self {
            reducer: BookingReducer::new(),
            env,
            bookings: Arc::clone(&stores.bookings),
            tutors: Arc::clone(&stores.tutors),
            users: Arc::clone(&stores.users),
        }
    }

    /// Environment the reducer runs with.
    #[must_use]
    pub const fn environment(&self) -> &BookingEnvironment {
        &self.env
    }

    // ========== Queries ==========

    /// A booking visible to `viewer` (participants and admins).
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `Forbidden` for outsiders.
    pub async fn get(&self, viewer: &User, id: BookingId) -> ServiceResult<BookingDetails> {
        let state = self.load(id).await?;
        let (Some(booking), payment) = (state.booking, state.payment) else {
            return Err(ServiceError::not_found("booking", id));
        };
        if viewer.role != Role::Admin && !booking.involves(viewer.id) {
            return Err(ServiceError::forbidden("not a participant of this booking"));
        }
        Ok(BookingDetails { booking, payment })
    }

    /// Latest payment attempt of a booking visible to `viewer`.
    ///
    /// # Errors
    ///
    /// As [`Self::get`], plus `NotFound` when no payment was started.
    pub async fn payment(&self, viewer: &User, id: BookingId) -> ServiceResult<Payment> {
        self.get(viewer, id)
            .await?
            .payment
            .ok_or_else(|| ServiceError::not_found("payment for booking", id))
    }

    /// The viewer's bookings (every booking for admins), soonest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn list(
        &self,
        viewer: &User,
        status: Option<BookingStatus>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> ServiceResult<Vec<Booking>> {
        let filter = BookingFilter {
            participant: (viewer.role != Role::Admin).then_some(viewer.id),
            status,
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            offset: offset.unwrap_or(0).max(0),
        };
        Ok(self.bookings.list_bookings(&filter).await?)
    }

    // ========== Commands ==========

    /// Book a session.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-students, `NotFound` for unknown tutors, reducer
    /// rejections, and `Conflict` when either party is already booked.
    pub async fn create(&self, student: &User, request: BookingRequest) -> ServiceResult<Booking> {
        if student.role != Role::Student {
            return Err(ServiceError::forbidden("only students can book sessions"));
        }
        let started = Instant::now();
        let tutor_id = request.tutor_id;
        let is_tutor = self
            .users
            .get_user(tutor_id)
            .await?
            .is_some_and(|u| u.role == Role::Tutor);
        let profile = match self.tutors.get_profile(tutor_id).await? {
            Some(profile) if is_tutor => profile,
            _ => return Err(ServiceError::not_found("tutor", tutor_id)),
        };
        let availability = self.tutors.availability(tutor_id).await?;

        let action = BookingAction::CreateBooking {
            booking_id: BookingId::new(),
            student_id: student.id,
            tutor: TutorSnapshot {
                tutor_id,
                hourly_rate: profile.hourly_rate,
                subjects: profile.subjects,
                teaching_modes: profile.teaching_modes,
                verified: profile.verified,
                availability,
            },
            subject: request.subject,
            mode: request.mode,
            location: request.location,
            notes: request.notes,
            start_at: request.start_at,
            duration_minutes: request.duration_minutes,
        };

        let mut state = BookingState::new();
        let effects = self.reducer.reduce(&mut state, action, &self.env);
        if let Some(error) = state.last_error.take() {
            return Err(error.into());
        }
        let Some(booking) = state.booking.clone() else {
            return Err(ServiceError::Booking(BookingError::NotFound));
        };

        self.bookings.insert_booking(&booking).await?;
        record_transition(&BookingState::new(), &state);
        info!(
            booking_id = %booking.id,
            student_id = %booking.student_id,
            tutor_id = %booking.tutor_id,
            price = booking.price.rupiah(),
            "Booking created"
        );

        self.drive(booking.id, effects).await;
        observe("create", started);
        Ok(booking)
    }

    /// Open (or reuse) a checkout for the booking.
    ///
    /// # Errors
    ///
    /// Reducer rejections, and `Upstream` when the provider refused to open
    /// the checkout. The failed attempt is kept; paying again starts a new one.
    pub async fn initiate_payment(&self, student: &User, id: BookingId) -> ServiceResult<Payment> {
        let state = self
            .send(id, BookingAction::InitiatePayment { actor: actor(student) })
            .await?;
        let payment = state
            .payment
            .ok_or_else(|| ServiceError::not_found("payment for booking", id))?;
        if payment.status == PaymentStatus::Failed {
            let reason = payment
                .failure_reason
                .unwrap_or_else(|| "checkout could not be created".to_string());
            return Err(ServiceError::Upstream(reason));
        }
        Ok(payment)
    }

    /// Cancel a booking.
    ///
    /// # Errors
    ///
    /// Reducer rejections and version conflicts.
    pub async fn cancel(
        &self,
        user: &User,
        id: BookingId,
        reason: String,
    ) -> ServiceResult<BookingDetails> {
        let action = BookingAction::CancelBooking {
            actor: actor(user),
            reason,
        };
        details(self.send(id, action).await?, id)
    }

    /// Mark a finished session completed and release the escrow.
    ///
    /// # Errors
    ///
    /// Reducer rejections and version conflicts.
    pub async fn complete(&self, user: &User, id: BookingId) -> ServiceResult<BookingDetails> {
        let action = BookingAction::CompleteBooking { actor: actor(user) };
        details(self.send(id, action).await?, id)
    }

    /// Ask the provider again for a refund that failed (admins).
    ///
    /// # Errors
    ///
    /// Reducer rejections and version conflicts.
    pub async fn retry_refund(&self, admin: &User, id: BookingId) -> ServiceResult<BookingDetails> {
        let action = BookingAction::RetryRefund { actor: actor(admin) };
        details(self.send(id, action).await?, id)
    }

    /// Cancel an unpaid booking past its deadline.
    ///
    /// # Errors
    ///
    /// Reducer rejections and version conflicts.
    pub async fn expire(&self, id: BookingId) -> ServiceResult<()> {
        self.send(id, BookingAction::ExpireBooking).await.map(drop)
    }

    /// Complete a confirmed booking on behalf of the system.
    ///
    /// # Errors
    ///
    /// Reducer rejections and version conflicts.
    pub async fn auto_complete(&self, id: BookingId) -> ServiceResult<()> {
        let action = BookingAction::CompleteBooking {
            actor: Actor::System,
        };
        self.send(id, action).await.map(drop)
    }

    /// Handle a payment provider notification.
    ///
    /// # Errors
    ///
    /// `Forbidden` for a bad signature, `BadRequest` for a malformed payload,
    /// storage failures and version conflicts. Notifications the booking
    /// does not accept are reported through the outcome instead, so the
    /// provider stops retrying them.
    pub async fn apply_notification(&self, payload: WebhookPayload) -> ServiceResult<WebhookOutcome> {
        if !self.env.gateway.verify_signature(&payload) {
            warn!(order_id = %payload.order_id, "Payment notification with invalid signature");
            record_webhook("invalid_signature");
            return Err(ServiceError::forbidden("invalid notification signature"));
        }
        let notification = payload.into_notification().map_err(|e| {
            record_webhook("invalid_payload");
            ServiceError::BadRequest(e.to_string())
        })?;

        if let TransactionStatus::Unknown(status) = &notification.status {
            info!(order_id = %notification.order_id, %status, "Ignoring payment status");
            record_webhook(WebhookOutcome::Ignored.as_str());
            return Ok(WebhookOutcome::Ignored);
        }
        let Some(booking_id) = self.bookings.find_by_order_id(&notification.order_id).await? else {
            warn!(order_id = %notification.order_id, "Payment notification for unknown order");
            record_webhook(WebhookOutcome::Ignored.as_str());
            return Ok(WebhookOutcome::Ignored);
        };

        let order_id = notification.order_id.clone();
        let outcome = match self
            .send(booking_id, BookingAction::ApplyPaymentNotification { notification })
            .await
        {
            Ok(_) => WebhookOutcome::Applied,
            Err(ServiceError::Booking(BookingError::UnknownOrder(_))) => {
                info!(%booking_id, %order_id, "Notification for a superseded payment attempt");
                WebhookOutcome::Ignored
            }
            Err(ServiceError::Booking(error @ BookingError::AmountMismatch { .. })) => {
                warn!(%booking_id, %order_id, %error, "Payment notification rejected");
                WebhookOutcome::Rejected
            }
            Err(error) => return Err(error),
        };
        record_webhook(outcome.as_str());
        Ok(outcome)
    }

    /// Run one command against a stored booking and its effects.
    ///
    /// Returns the state after every feedback action was applied.
    ///
    /// # Errors
    ///
    /// `NotFound`, reducer rejections of `action`, and version conflicts.
    pub async fn send(&self, id: BookingId, action: BookingAction) -> ServiceResult<BookingState> {
        let started = Instant::now();
        let command = command_name(&action);

        let mut state = self.load(id).await?;
        let effects = self.apply(&mut state, action).await.inspect_err(|error| {
            debug!(booking_id = %id, command, %error, "Booking command rejected");
        })?;
        if !effects.is_empty() {
            self.drive(id, effects).await;
            state = self.load(id).await?;
        }

        observe(command, started);
        Ok(state)
    }

    // ========== Internals ==========

    async fn load(&self, id: BookingId) -> ServiceResult<BookingState> {
        let (booking, payment) = self
            .bookings
            .load(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("booking", id))?;
        Ok(BookingState::loaded(booking, payment))
    }

    /// Reduce and persist one action.
    async fn apply(
        &self,
        state: &mut BookingState,
        action: BookingAction,
    ) -> ServiceResult<Effects<BookingAction>> {
        let before = state.clone();
        let effects = self.reducer.reduce(state, action, &self.env);
        if let Some(error) = state.last_error.take() {
            return Err(error.into());
        }
        self.persist(&before, state).await?;
        Ok(effects)
    }

    async fn persist(&self, before: &BookingState, after: &mut BookingState) -> ServiceResult<()> {
        let payment_changed = before.payment != after.payment;
        let Some(booking) = after.booking.as_mut() else {
            return Ok(());
        };
        if !payment_changed && before.booking.as_ref() == Some(&*booking) {
            return Ok(());
        }

        let expected = booking.version;
        booking.version = expected + 1;
        self.bookings
            .save_booking(booking, expected, after.payment.as_ref())
            .await?;
        record_transition(before, after);
        Ok(())
    }

    /// Run effects until no more feedback actions are produced.
    async fn drive(&self, id: BookingId, effects: Effects<BookingAction>) {
        let mut pending: Vec<Effect<BookingAction>> = effects.into_vec();
        while !pending.is_empty() {
            let actions = Effect::merge(std::mem::take(&mut pending)).run().await;
            for action in actions {
                match self.feed_back(id, action).await {
                    Ok(more) => pending.extend(more),
                    Err(error) => {
                        warn!(booking_id = %id, %error, "Failed to apply effect result");
                    }
                }
            }
        }
    }

    async fn feed_back(
        &self,
        id: BookingId,
        action: BookingAction,
    ) -> ServiceResult<Effects<BookingAction>> {
        if let BookingAction::RefundFailed { reason, .. } = &action {
            warn!(booking_id = %id, %reason, "Refund failed; escrow stays refund_pending");
        }
        let mut attempt = 1;
        loop {
            let mut state = self.load(id).await?;
            match self.apply(&mut state, action.clone()).await {
                Err(ServiceError::Conflict(message)) if attempt < MAX_FEEDBACK_ATTEMPTS => {
                    debug!(booking_id = %id, attempt, %message, "Retrying effect result");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl std::fmt::Debug for BookingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookingService")
            .field("policy", &self.env.policy)
            .finish_non_exhaustive()
    }
}

fn details(state: BookingState, id: BookingId) -> ServiceResult<BookingDetails> {
    let BookingState { booking, payment, .. } = state;
    booking
        .map(|booking| BookingDetails { booking, payment })
        .ok_or_else(|| ServiceError::not_found("booking", id))
}

fn observe(command: &'static str, started: Instant) {
    metrics::histogram!(BOOKING_COMMAND_DURATION, "command" => command)
        .record(started.elapsed().as_secs_f64());
}
