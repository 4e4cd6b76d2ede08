//! Booking aggregate.
//!
//! One booking and its most recent payment attempt form the aggregate. The
//! reducer validates commands against that state, applies the resulting
//! events, and describes the side effects (payment provider calls and
//! notifications) for [`crate::services::BookingService`] to run.
//!
//! ```text
//! pending_payment ──settled──▶ confirmed ──complete──▶ completed (escrow released)
//!        │                        │
//!        └──cancel / expire──▶ cancelled ◀──cancel── (escrow refund_pending → refunded)
//! ```
//!
//! Rejected commands leave the state untouched apart from `last_error`.

use crate::notify::BookingNotifier;
use crate::payment_gateway::{
    PaymentGateway, PaymentNotification, RefundRequest, TransactionRequest, TransactionStatus,
};
use crate::types::{
    AvailabilitySlot, Booking, BookingId, BookingStatus, Cancellation, CancelledBy, EscrowStatus,
    LessonMode, Money, NotificationKind, Payment, PaymentId, PaymentStatus, Role, UserId,
};
use blajarplus_core::{
    effect::Effect, environment::Clock, reducer::Reducer, smallvec, Effects, SmallVec,
};
use chrono::{DateTime, Datelike, Duration, FixedOffset, Offset, Utc};
use std::sync::Arc;

// ============================================================================
// Errors
// ============================================================================

/// Why the reducer rejected a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookingError {
    /// No booking in state
    #[error("booking not found")]
    NotFound,

    /// Input failed a business rule
    #[error("{0}")]
    Validation(String),

    /// Caller is not allowed to perform the command
    #[error("{0}")]
    Forbidden(String),

    /// Command does not apply to the booking's current status
    #[error("cannot {action} a booking that is {status}")]
    InvalidTransition {
        /// Attempted command
        action: &'static str,
        /// Current status
        status: BookingStatus,
    },

    /// The booking already has a settled payment
    #[error("booking is already paid")]
    AlreadyPaid,

    /// The payment window is over
    #[error("payment deadline has passed")]
    DeadlinePassed,

    /// The payment window is still open
    #[error("payment deadline has not passed yet")]
    DeadlineNotReached,

    /// Completion before the session ended
    #[error("session has not ended yet")]
    NotYetEnded,

    /// Confirmed sessions can no longer be cancelled
    #[error("session has already started")]
    AlreadyStarted,

    /// Student cancellation too close to the start time
    #[error("students must cancel at least {cutoff_hours} hours before the session")]
    CancellationWindowClosed {
        /// Configured cutoff
        cutoff_hours: i64,
    },

    /// Escrow is not in the state the command needs
    #[error("payment escrow is {0}")]
    EscrowMismatch(EscrowStatus),

    /// Notification for an order that is not the current attempt
    #[error("unknown order id {0}")]
    UnknownOrder(String),

    /// Notification amount differs from the payment amount
    #[error("gross amount {actual} does not match payment amount {expected}")]
    AmountMismatch {
        /// Payment amount
        expected: Money,
        /// Amount the provider reported
        actual: Money,
    },
}

// ============================================================================
// Inputs
// ============================================================================

/// Who issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// An authenticated user
    User {
        /// User id
        id: UserId,
        /// Account role
        role: Role,
    },
    /// Background jobs (expiry, auto-completion)
    System,
}

/// How an actor relates to a particular booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Party {
    Student,
    Tutor,
    Admin,
    System,
    Outsider,
}

impl Actor {
    fn party(self, booking: &Booking) -> Party {
        match self {
            Self::System => Party::System,
            Self::User { role: Role::Admin, .. } => Party::Admin,
            Self::User { id, .. } if id == booking.student_id => Party::Student,
            Self::User { id, .. } if id == booking.tutor_id => Party::Tutor,
            Self::User { .. } => Party::Outsider,
        }
    }
}

/// What the booking needs to know about the tutor at creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct TutorSnapshot {
    /// Tutor user id
    pub tutor_id: UserId,
    /// Price per hour
    pub hourly_rate: Money,
    /// Subjects taught (empty = any)
    pub subjects: Vec<String>,
    /// Supported modes
    pub teaching_modes: Vec<LessonMode>,
    /// Admin-verified
    pub verified: bool,
    /// Weekly windows (empty = no restriction)
    pub availability: Vec<AvailabilitySlot>,
}

/// Marketplace rules the reducer enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingPolicy {
    /// Share of the price the marketplace keeps
    pub platform_fee_percent: u8,
    /// Minimum time between booking and session start
    pub min_lead_time: Duration,
    /// Shortest session
    pub min_duration_minutes: i64,
    /// Longest session
    pub max_duration_minutes: i64,
    /// How long a student has to pay
    pub payment_window: Duration,
    /// Students cannot cancel a paid session closer to its start than this
    pub student_cancellation_cutoff: Duration,
    /// Only admin-verified tutors can be booked
    pub require_verified_tutor: bool,
    /// Offset used to read weekly availability windows
    pub utc_offset: FixedOffset,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            platform_fee_percent: 10,
            min_lead_time: Duration::hours(2),
            min_duration_minutes: 30,
            max_duration_minutes: 240,
            payment_window: Duration::hours(1),
            student_cancellation_cutoff: Duration::hours(24),
            require_verified_tutor: false,
            utc_offset: FixedOffset::east_opt(7 * 3600).unwrap_or_else(|| Utc.fix()),
        }
    }
}

const SLOT_GRANULARITY_MINUTES: i64 = 15;

/// Provider order id for a payment attempt.
///
/// Midtrans requires order ids to be unique across all transactions, so each
/// retry gets its own attempt suffix.
#[must_use]
pub fn order_id_for(booking_id: BookingId, attempt: i32) -> String {
    let simple = booking_id.as_uuid().simple().to_string();
    format!("BP-{}-{attempt}", &simple[..12])
}

// ============================================================================
// State
// ============================================================================

/// One booking and its latest payment attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingState {
    /// The booking, once created
    pub booking: Option<Booking>,
    /// Latest payment attempt
    pub payment: Option<Payment>,
    /// Last rejection
    pub last_error: Option<BookingError>,
}

impl BookingState {
    /// Empty state (no booking yet)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State loaded from storage
    #[must_use]
    pub const fn loaded(booking: Booking, payment: Option<Payment>) -> Self {
        Self {
            booking: Some(booking),
            payment,
            last_error: None,
        }
    }

    /// Booking status, if a booking exists
    #[must_use]
    pub fn status(&self) -> Option<BookingStatus> {
        self.booking.as_ref().map(|b| b.status)
    }

    /// Escrow label of the latest payment
    #[must_use]
    pub fn escrow(&self) -> EscrowStatus {
        self.payment.as_ref().map_or(EscrowStatus::None, |p| p.escrow)
    }
}

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Actions for the booking aggregate
#[derive(Debug, Clone, PartialEq)]
pub enum BookingAction {
    // Commands
    /// Book a session with a tutor
    CreateBooking {
        /// New booking id
        booking_id: BookingId,
        /// Booking student
        student_id: UserId,
        /// Tutor details at booking time
        tutor: TutorSnapshot,
        /// Lesson subject
        subject: String,
        /// Online or offline
        mode: LessonMode,
        /// Meeting place (offline)
        location: Option<String>,
        /// Notes for the tutor
        notes: Option<String>,
        /// Session start
        start_at: DateTime<Utc>,
        /// Session length
        duration_minutes: i64,
    },

    /// Open (or reuse) a checkout for the booking
    InitiatePayment {
        /// Caller
        actor: Actor,
    },

    /// Provider reported a payment status
    ApplyPaymentNotification {
        /// Verified notification
        notification: PaymentNotification,
    },

    /// Mark the session as held and release the escrow
    CompleteBooking {
        /// Caller
        actor: Actor,
    },

    /// Cancel the booking
    CancelBooking {
        /// Caller
        actor: Actor,
        /// Why
        reason: String,
    },

    /// Cancel an unpaid booking whose payment window is over
    ExpireBooking,

    /// Ask the provider again for a refund that failed
    RetryRefund {
        /// Caller (admins only)
        actor: Actor,
    },

    // Events
    /// Booking was created
    BookingCreated {
        /// Full booking record
        booking: Booking,
    },

    /// A payment attempt was opened
    PaymentInitiated {
        /// Payment id
        payment_id: PaymentId,
        /// Provider order id
        order_id: String,
        /// Attempt number
        attempt: i32,
        /// Amount to charge
        amount: Money,
        /// When
        at: DateTime<Utc>,
    },

    /// The provider returned a checkout link
    PaymentLinkCreated {
        /// Order id
        order_id: String,
        /// Snap token
        token: String,
        /// Checkout page
        redirect_url: String,
        /// When
        at: DateTime<Utc>,
    },

    /// The provider refused to open a checkout
    PaymentLinkFailed {
        /// Order id
        order_id: String,
        /// Provider error
        reason: String,
        /// When
        at: DateTime<Utc>,
    },

    /// Provider says the payment is still pending
    PaymentPending {
        /// Order id
        order_id: String,
        /// Provider transaction id
        transaction_id: Option<String>,
        /// Payment channel
        payment_type: Option<String>,
        /// When
        at: DateTime<Utc>,
    },

    /// Money captured; escrow held
    PaymentSettled {
        /// Order id
        order_id: String,
        /// Provider transaction id
        transaction_id: Option<String>,
        /// Payment channel
        payment_type: Option<String>,
        /// When
        at: DateTime<Utc>,
    },

    /// Booking confirmed by payment
    BookingConfirmed {
        /// When
        at: DateTime<Utc>,
    },

    /// Payment attempt failed, expired or was cancelled at the provider
    PaymentFailed {
        /// Order id
        order_id: String,
        /// Resulting payment status
        status: PaymentStatus,
        /// Provider reason
        reason: String,
        /// When
        at: DateTime<Utc>,
    },

    /// Session completed
    BookingCompleted {
        /// When
        at: DateTime<Utc>,
    },

    /// Escrow released to the tutor
    FundsReleased {
        /// Amount the tutor receives
        payout: Money,
        /// Amount the marketplace keeps
        platform_fee: Money,
        /// When
        at: DateTime<Utc>,
    },

    /// Booking cancelled
    BookingCancelled {
        /// Cancelling party
        by: CancelledBy,
        /// Why
        reason: String,
        /// When
        at: DateTime<Utc>,
    },

    /// Refund requested from the provider
    RefundRequested {
        /// Amount to return
        amount: Money,
        /// When
        at: DateTime<Utc>,
    },

    /// Refund confirmed
    RefundSucceeded {
        /// Provider refund reference
        reference: Option<String>,
        /// When
        at: DateTime<Utc>,
    },

    /// Refund request failed; escrow stays `refund_pending`
    RefundFailed {
        /// Provider error
        reason: String,
        /// When
        at: DateTime<Utc>,
    },

    /// Validation failed
    ValidationFailed {
        /// Rejection
        error: BookingError,
    },
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the booking aggregate
#[derive(Clone)]
pub struct BookingEnvironment {
    /// Clock for timestamps and deadlines
    pub clock: Arc<dyn Clock>,
    /// Payment provider
    pub gateway: Arc<dyn PaymentGateway>,
    /// In-app and email notifications
    pub notifier: Arc<dyn BookingNotifier>,
    /// Marketplace rules
    pub policy: BookingPolicy,
}

impl BookingEnvironment {
    /// Creates a new `BookingEnvironment`
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn BookingNotifier>,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            clock,
            gateway,
            notifier,
            policy,
        }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the booking aggregate
#[derive(Clone, Debug, Default)]
pub struct BookingReducer;

impl BookingReducer {
    /// Creates a new `BookingReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Applies an event to state
    #[allow(clippy::too_many_lines)]
    fn apply_event(state: &mut BookingState, action: &BookingAction) {
        match action {
            BookingAction::BookingCreated { booking } => {
                state.booking = Some(booking.clone());
                state.payment = None;
                state.last_error = None;
            }

            BookingAction::PaymentInitiated {
                payment_id,
                order_id,
                attempt,
                amount,
                at,
            } => {
                if let Some(booking) = &mut state.booking {
                    booking.updated_at = *at;
                    state.payment = Some(Payment {
                        id: *payment_id,
                        booking_id: booking.id,
                        order_id: order_id.clone(),
                        attempt: *attempt,
                        amount: *amount,
                        status: PaymentStatus::Pending,
                        escrow: EscrowStatus::None,
                        checkout_token: None,
                        redirect_url: None,
                        provider_transaction_id: None,
                        payment_type: None,
                        failure_reason: None,
                        refund_reference: None,
                        paid_at: None,
                        released_at: None,
                        refunded_at: None,
                        created_at: *at,
                        updated_at: *at,
                    });
                }
                state.last_error = None;
            }

            BookingAction::PaymentLinkCreated {
                order_id,
                token,
                redirect_url,
                at,
            } => {
                if let Some(payment) = current_payment(state, order_id) {
                    payment.checkout_token = Some(token.clone());
                    payment.redirect_url = Some(redirect_url.clone());
                    payment.updated_at = *at;
                }
            }

            BookingAction::PaymentLinkFailed {
                order_id,
                reason,
                at,
            } => {
                // A repeated checkout request losing to one that already
                // produced a link leaves the attempt usable.
                if let Some(payment) = current_payment(state, order_id)
                    .filter(|p| p.status == PaymentStatus::Pending && p.redirect_url.is_none())
                {
                    payment.status = PaymentStatus::Failed;
                    payment.failure_reason = Some(reason.clone());
                    payment.updated_at = *at;
                }
            }

            BookingAction::PaymentPending {
                order_id,
                transaction_id,
                payment_type,
                at,
            } => {
                if let Some(payment) = current_payment(state, order_id) {
                    if transaction_id.is_some() {
                        payment.provider_transaction_id.clone_from(transaction_id);
                    }
                    if payment_type.is_some() {
                        payment.payment_type.clone_from(payment_type);
                    }
                    payment.updated_at = *at;
                }
            }

            BookingAction::PaymentSettled {
                order_id,
                transaction_id,
                payment_type,
                at,
            } => {
                if let Some(payment) = current_payment(state, order_id) {
                    payment.status = PaymentStatus::Paid;
                    payment.escrow = EscrowStatus::Held;
                    payment.paid_at = Some(*at);
                    payment.failure_reason = None;
                    if transaction_id.is_some() {
                        payment.provider_transaction_id.clone_from(transaction_id);
                    }
                    if payment_type.is_some() {
                        payment.payment_type.clone_from(payment_type);
                    }
                    payment.updated_at = *at;
                }
            }

            BookingAction::BookingConfirmed { at } => {
                if let Some(booking) = &mut state.booking {
                    booking.status = BookingStatus::Confirmed;
                    booking.confirmed_at = Some(*at);
                    booking.updated_at = *at;
                }
            }

            BookingAction::PaymentFailed {
                order_id,
                status,
                reason,
                at,
            } => {
                if let Some(payment) = current_payment(state, order_id) {
                    payment.status = *status;
                    payment.failure_reason = Some(reason.clone());
                    payment.updated_at = *at;
                }
            }

            BookingAction::BookingCompleted { at } => {
                if let Some(booking) = &mut state.booking {
                    booking.status = BookingStatus::Completed;
                    booking.completed_at = Some(*at);
                    booking.updated_at = *at;
                }
            }

            BookingAction::FundsReleased { at, .. } => {
                if let Some(payment) = &mut state.payment {
                    payment.escrow = EscrowStatus::Released;
                    payment.released_at = Some(*at);
                    payment.updated_at = *at;
                }
            }

            BookingAction::BookingCancelled { by, reason, at } => {
                if let Some(booking) = &mut state.booking {
                    booking.status = BookingStatus::Cancelled;
                    booking.cancellation = Some(Cancellation {
                        by: *by,
                        reason: reason.clone(),
                        at: *at,
                    });
                    booking.updated_at = *at;
                }
                if let Some(payment) = &mut state.payment {
                    if payment.status == PaymentStatus::Pending {
                        payment.status = if *by == CancelledBy::System {
                            PaymentStatus::Expired
                        } else {
                            PaymentStatus::Cancelled
                        };
                        payment.updated_at = *at;
                    }
                }
            }

            BookingAction::RefundRequested { at, .. } => {
                if let Some(payment) = &mut state.payment {
                    payment.escrow = EscrowStatus::RefundPending;
                    payment.failure_reason = None;
                    payment.updated_at = *at;
                }
            }

            BookingAction::RefundSucceeded { reference, at } => {
                if let Some(payment) = &mut state.payment {
                    payment.status = PaymentStatus::Refunded;
                    payment.escrow = EscrowStatus::Refunded;
                    payment.refund_reference.clone_from(reference);
                    payment.refunded_at = Some(*at);
                    payment.failure_reason = None;
                    payment.updated_at = *at;
                }
            }

            BookingAction::RefundFailed { reason, at } => {
                if let Some(payment) = &mut state.payment {
                    payment.failure_reason = Some(reason.clone());
                    payment.updated_at = *at;
                }
            }

            BookingAction::ValidationFailed { error } => {
                state.last_error = Some(error.clone());
            }

            // Commands don't modify state
            BookingAction::CreateBooking { .. }
            | BookingAction::InitiatePayment { .. }
            | BookingAction::ApplyPaymentNotification { .. }
            | BookingAction::CompleteBooking { .. }
            | BookingAction::CancelBooking { .. }
            | BookingAction::ExpireBooking
            | BookingAction::RetryRefund { .. } => {}
        }
    }

    fn reject(state: &mut BookingState, error: BookingError) -> Effects<BookingAction> {
        Self::apply_event(state, &BookingAction::ValidationFailed { error });
        SmallVec::new()
    }

    fn emit(state: &mut BookingState, events: &[BookingAction]) {
        for event in events {
            Self::apply_event(state, event);
        }
        state.last_error = None;
    }

    // ========== Create ==========

    #[allow(clippy::too_many_arguments)]
    fn create_booking(
        state: &mut BookingState,
        env: &BookingEnvironment,
        booking_id: BookingId,
        student_id: UserId,
        tutor: &TutorSnapshot,
        subject: String,
        mode: LessonMode,
        location: Option<String>,
        notes: Option<String>,
        start_at: DateTime<Utc>,
        duration_minutes: i64,
    ) -> Effects<BookingAction> {
        if let Some(existing) = &state.booking {
            let status = existing.status;
            return Self::reject(
                state,
                BookingError::InvalidTransition {
                    action: "create",
                    status,
                },
            );
        }

        let now = env.clock.now();
        let policy = &env.policy;
        let subject = subject.trim().to_string();
        let location = location
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());
        let notes = notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());

        let validation = validate_request(
            policy,
            now,
            student_id,
            tutor,
            &subject,
            mode,
            location.as_deref(),
            start_at,
            duration_minutes,
        );
        if let Err(error) = validation {
            return Self::reject(state, error);
        }

        let Some(price) = price_for(tutor.hourly_rate, duration_minutes) else {
            return Self::reject(
                state,
                BookingError::Validation("price is out of range".to_string()),
            );
        };
        let end_at = start_at + Duration::minutes(duration_minutes);
        let payment_deadline = (now + policy.payment_window).min(start_at);

        let booking = Booking {
            id: booking_id,
            student_id,
            tutor_id: tutor.tutor_id,
            subject,
            mode,
            location,
            notes,
            start_at,
            end_at,
            price,
            platform_fee: price.percent(policy.platform_fee_percent),
            status: BookingStatus::PendingPayment,
            payment_deadline,
            cancellation: None,
            confirmed_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        let notify = notify(env, NotificationKind::BookingRequested, &booking);
        Self::emit(state, &[BookingAction::BookingCreated { booking }]);
        smallvec![notify]
    }

    // ========== Payment ==========

    fn initiate_payment(
        state: &mut BookingState,
        env: &BookingEnvironment,
        actor: Actor,
    ) -> Effects<BookingAction> {
        let Some(booking) = &state.booking else {
            return Self::reject(state, BookingError::NotFound);
        };
        if actor.party(booking) != Party::Student {
            return Self::reject(
                state,
                BookingError::Forbidden("only the booking's student can pay for it".to_string()),
            );
        }
        if booking.status != BookingStatus::PendingPayment {
            let status = booking.status;
            return Self::reject(
                state,
                BookingError::InvalidTransition {
                    action: "pay for",
                    status,
                },
            );
        }
        let now = env.clock.now();
        if now >= booking.payment_deadline {
            return Self::reject(state, BookingError::DeadlinePassed);
        }

        let booking_id = booking.id;
        let amount = booking.price;
        let item_name = format!("{} session", booking.subject);

        let attempt = match &state.payment {
            Some(payment) if payment.status == PaymentStatus::Paid => {
                return Self::reject(state, BookingError::AlreadyPaid);
            }
            // An open attempt is reused; the student gets the same checkout.
            Some(payment) if payment.status == PaymentStatus::Pending => {
                if payment.redirect_url.is_some() {
                    return SmallVec::new();
                }
                // The checkout was never stored: ask again for the same order.
                let request = TransactionRequest {
                    order_id: payment.order_id.clone(),
                    booking_id,
                    amount: payment.amount,
                    item_name,
                };
                state.last_error = None;
                return smallvec![checkout(env, request)];
            }
            Some(payment) => payment.attempt + 1,
            None => 1,
        };

        let order_id = order_id_for(booking_id, attempt);

        Self::emit(
            state,
            &[BookingAction::PaymentInitiated {
                payment_id: PaymentId::new(),
                order_id: order_id.clone(),
                attempt,
                amount,
                at: now,
            }],
        );

        let request = TransactionRequest {
            order_id,
            booking_id,
            amount,
            item_name,
        };
        smallvec![checkout(env, request)]
    }

    #[allow(clippy::too_many_lines)]
    fn apply_notification(
        state: &mut BookingState,
        env: &BookingEnvironment,
        notification: PaymentNotification,
    ) -> Effects<BookingAction> {
        let Some(booking) = &state.booking else {
            return Self::reject(state, BookingError::NotFound);
        };
        let Some(payment) = state
            .payment
            .as_ref()
            .filter(|p| p.order_id == notification.order_id)
        else {
            return Self::reject(state, BookingError::UnknownOrder(notification.order_id));
        };
        if notification.gross_amount != payment.amount {
            let expected = payment.amount;
            return Self::reject(
                state,
                BookingError::AmountMismatch {
                    expected,
                    actual: notification.gross_amount,
                },
            );
        }

        let now = env.clock.now();
        let PaymentNotification {
            order_id,
            status,
            transaction_id,
            payment_type,
            ..
        } = notification;

        match status {
            TransactionStatus::Settled => {
                if matches!(payment.status, PaymentStatus::Paid | PaymentStatus::Refunded) {
                    return SmallVec::new();
                }
                let booking_status = booking.status;
                let amount = payment.amount;
                Self::emit(
                    state,
                    &[BookingAction::PaymentSettled {
                        order_id: order_id.clone(),
                        transaction_id,
                        payment_type,
                        at: now,
                    }],
                );

                match booking_status {
                    BookingStatus::PendingPayment => {
                        Self::emit(state, &[BookingAction::BookingConfirmed { at: now }]);
                        effects_for(env, state, NotificationKind::BookingConfirmed)
                    }
                    // Money captured for a dead booking goes straight back.
                    BookingStatus::Cancelled => {
                        Self::emit(state, &[BookingAction::RefundRequested { amount, at: now }]);
                        smallvec![refund(
                            env,
                            order_id,
                            amount,
                            "payment settled after the booking was cancelled".to_string()
                        )]
                    }
                    BookingStatus::Confirmed | BookingStatus::Completed => SmallVec::new(),
                }
            }

            TransactionStatus::Pending => {
                if payment.status != PaymentStatus::Pending {
                    return SmallVec::new();
                }
                Self::emit(
                    state,
                    &[BookingAction::PaymentPending {
                        order_id,
                        transaction_id,
                        payment_type,
                        at: now,
                    }],
                );
                SmallVec::new()
            }

            TransactionStatus::Failed | TransactionStatus::Expired | TransactionStatus::Cancelled => {
                if payment.status != PaymentStatus::Pending {
                    return SmallVec::new();
                }
                let (status, reason) = match status {
                    TransactionStatus::Expired => (PaymentStatus::Expired, "payment expired"),
                    TransactionStatus::Cancelled => {
                        (PaymentStatus::Cancelled, "payment cancelled at provider")
                    }
                    _ => (PaymentStatus::Failed, "payment denied by provider"),
                };
                Self::emit(
                    state,
                    &[BookingAction::PaymentFailed {
                        order_id,
                        status,
                        reason: reason.to_string(),
                        at: now,
                    }],
                );
                effects_for(env, state, NotificationKind::PaymentFailed)
            }

            TransactionStatus::Refunded => {
                if payment.status != PaymentStatus::Paid {
                    return SmallVec::new();
                }
                let booking_status = booking.status;
                let mut events = Vec::with_capacity(2);
                // Refunded at the provider dashboard: the session cannot go ahead unpaid.
                if booking_status == BookingStatus::Confirmed {
                    events.push(BookingAction::BookingCancelled {
                        by: CancelledBy::Admin,
                        reason: "payment refunded at the provider".to_string(),
                        at: now,
                    });
                }
                events.push(BookingAction::RefundSucceeded {
                    reference: transaction_id,
                    at: now,
                });
                Self::emit(state, &events);
                effects_for(env, state, NotificationKind::RefundIssued)
            }

            TransactionStatus::Unknown(_) => SmallVec::new(),
        }
    }

    // ========== Complete ==========

    fn complete_booking(
        state: &mut BookingState,
        env: &BookingEnvironment,
        actor: Actor,
    ) -> Effects<BookingAction> {
        let Some(booking) = &state.booking else {
            return Self::reject(state, BookingError::NotFound);
        };
        if actor.party(booking) == Party::Outsider {
            return Self::reject(
                state,
                BookingError::Forbidden("not a participant of this booking".to_string()),
            );
        }
        if booking.status != BookingStatus::Confirmed {
            let status = booking.status;
            return Self::reject(
                state,
                BookingError::InvalidTransition {
                    action: "complete",
                    status,
                },
            );
        }
        let now = env.clock.now();
        if now < booking.end_at {
            return Self::reject(state, BookingError::NotYetEnded);
        }
        let escrow = state.escrow();
        if escrow != EscrowStatus::Held {
            return Self::reject(state, BookingError::EscrowMismatch(escrow));
        }

        let payout = booking.tutor_payout();
        let platform_fee = booking.platform_fee;
        Self::emit(
            state,
            &[
                BookingAction::BookingCompleted { at: now },
                BookingAction::FundsReleased {
                    payout,
                    platform_fee,
                    at: now,
                },
            ],
        );
        effects_for(env, state, NotificationKind::BookingCompleted)
    }

    // ========== Cancel / expire ==========

    fn cancel_booking(
        state: &mut BookingState,
        env: &BookingEnvironment,
        actor: Actor,
        reason: String,
    ) -> Effects<BookingAction> {
        let Some(booking) = &state.booking else {
            return Self::reject(state, BookingError::NotFound);
        };
        let by = match actor.party(booking) {
            Party::Student => CancelledBy::Student,
            Party::Tutor => CancelledBy::Tutor,
            Party::Admin => CancelledBy::Admin,
            Party::System | Party::Outsider => {
                return Self::reject(
                    state,
                    BookingError::Forbidden("not a participant of this booking".to_string()),
                );
            }
        };
        let reason = reason.trim().to_string();
        if reason.is_empty() || reason.chars().count() > 500 {
            return Self::reject(
                state,
                BookingError::Validation(
                    "cancellation reason must be 1 to 500 characters".to_string(),
                ),
            );
        }

        let now = env.clock.now();
        match booking.status {
            BookingStatus::PendingPayment => {
                Self::emit(state, &[BookingAction::BookingCancelled { by, reason, at: now }]);
                effects_for(env, state, NotificationKind::BookingCancelled)
            }
            BookingStatus::Confirmed => {
                if now >= booking.start_at {
                    return Self::reject(state, BookingError::AlreadyStarted);
                }
                let cutoff = env.policy.student_cancellation_cutoff;
                if by == CancelledBy::Student && booking.start_at - now < cutoff {
                    return Self::reject(
                        state,
                        BookingError::CancellationWindowClosed {
                            cutoff_hours: cutoff.num_hours(),
                        },
                    );
                }
                let Some(payment) = state.payment.as_ref().filter(|p| p.escrow == EscrowStatus::Held)
                else {
                    let escrow = state.escrow();
                    return Self::reject(state, BookingError::EscrowMismatch(escrow));
                };
                let amount = payment.amount;
                let order_id = payment.order_id.clone();

                Self::emit(
                    state,
                    &[
                        BookingAction::BookingCancelled {
                            by,
                            reason: reason.clone(),
                            at: now,
                        },
                        BookingAction::RefundRequested { amount, at: now },
                    ],
                );
                // The refund goes out before either party hears about it.
                let mut steps = vec![refund(env, order_id, amount, reason)];
                steps.extend(effects_for(env, state, NotificationKind::BookingCancelled));
                smallvec![Effect::chain(steps)]
            }
            status @ (BookingStatus::Completed | BookingStatus::Cancelled) => Self::reject(
                state,
                BookingError::InvalidTransition {
                    action: "cancel",
                    status,
                },
            ),
        }
    }

    fn expire_booking(state: &mut BookingState, env: &BookingEnvironment) -> Effects<BookingAction> {
        let Some(booking) = &state.booking else {
            return Self::reject(state, BookingError::NotFound);
        };
        if booking.status != BookingStatus::PendingPayment {
            let status = booking.status;
            return Self::reject(
                state,
                BookingError::InvalidTransition {
                    action: "expire",
                    status,
                },
            );
        }
        let now = env.clock.now();
        if now < booking.payment_deadline {
            return Self::reject(state, BookingError::DeadlineNotReached);
        }

        Self::emit(
            state,
            &[BookingAction::BookingCancelled {
                by: CancelledBy::System,
                reason: "payment window expired".to_string(),
                at: now,
            }],
        );
        effects_for(env, state, NotificationKind::BookingCancelled)
    }

    fn retry_refund(
        state: &mut BookingState,
        env: &BookingEnvironment,
        actor: Actor,
    ) -> Effects<BookingAction> {
        if state.booking.is_none() {
            return Self::reject(state, BookingError::NotFound);
        }
        if !matches!(actor, Actor::User { role: Role::Admin, .. }) {
            return Self::reject(
                state,
                BookingError::Forbidden("only admins can retry refunds".to_string()),
            );
        }
        let Some(payment) = state
            .payment
            .as_ref()
            .filter(|p| p.escrow == EscrowStatus::RefundPending)
        else {
            let escrow = state.escrow();
            return Self::reject(state, BookingError::EscrowMismatch(escrow));
        };

        let effect = refund(
            env,
            payment.order_id.clone(),
            payment.amount,
            "refund retried by admin".to_string(),
        );
        state.last_error = None;
        smallvec![effect]
    }
}

impl Reducer for BookingReducer {
    type State = BookingState;
    type Action = BookingAction;
    type Environment = BookingEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> Effects<Self::Action> {
        match action {
            BookingAction::CreateBooking {
                booking_id,
                student_id,
                tutor,
                subject,
                mode,
                location,
                notes,
                start_at,
                duration_minutes,
            } => Self::create_booking(
                state,
                env,
                booking_id,
                student_id,
                &tutor,
                subject,
                mode,
                location,
                notes,
                start_at,
                duration_minutes,
            ),

            BookingAction::InitiatePayment { actor } => Self::initiate_payment(state, env, actor),

            BookingAction::ApplyPaymentNotification { notification } => {
                Self::apply_notification(state, env, notification)
            }

            BookingAction::CompleteBooking { actor } => Self::complete_booking(state, env, actor),

            BookingAction::CancelBooking { actor, reason } => {
                Self::cancel_booking(state, env, actor, reason)
            }

            BookingAction::ExpireBooking => Self::expire_booking(state, env),

            BookingAction::RetryRefund { actor } => Self::retry_refund(state, env, actor),

            // ========== Effect feedback ==========
            event @ BookingAction::RefundSucceeded { .. } => {
                Self::apply_event(state, &event);
                effects_for(env, state, NotificationKind::RefundIssued)
            }

            event @ BookingAction::PaymentLinkFailed { .. } => {
                let was_failed = state
                    .payment
                    .as_ref()
                    .is_some_and(|p| p.status == PaymentStatus::Failed);
                Self::apply_event(state, &event);
                let failed = state
                    .payment
                    .as_ref()
                    .is_some_and(|p| p.status == PaymentStatus::Failed);
                if failed && !was_failed {
                    effects_for(env, state, NotificationKind::PaymentFailed)
                } else {
                    SmallVec::new()
                }
            }

            // ========== Events ==========
            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Ask the gateway for a checkout link and report the outcome.
fn checkout(env: &BookingEnvironment, request: TransactionRequest) -> Effect<BookingAction> {
    let gateway = Arc::clone(&env.gateway);
    let clock = Arc::clone(&env.clock);
    Effect::future(async move {
        let order_id = request.order_id.clone();
        let result = gateway.create_transaction(request).await;
        let at = clock.now();
        Some(match result {
            Ok(link) => BookingAction::PaymentLinkCreated {
                order_id,
                token: link.token,
                redirect_url: link.redirect_url,
                at,
            },
            Err(error) => BookingAction::PaymentLinkFailed {
                order_id,
                reason: error.to_string(),
                at,
            },
        })
    })
}

fn current_payment<'a>(state: &'a mut BookingState, order_id: &str) -> Option<&'a mut Payment> {
    state.payment.as_mut().filter(|p| p.order_id == order_id)
}

/// Hourly rate × minutes / 60, rounded down.
fn price_for(hourly_rate: Money, duration_minutes: i64) -> Option<Money> {
    hourly_rate
        .rupiah()
        .checked_mul(duration_minutes)
        .map(|total| Money::from_rupiah(total / 60))
}

#[allow(clippy::too_many_arguments)]
fn validate_request(
    policy: &BookingPolicy,
    now: DateTime<Utc>,
    student_id: UserId,
    tutor: &TutorSnapshot,
    subject: &str,
    mode: LessonMode,
    location: Option<&str>,
    start_at: DateTime<Utc>,
    duration_minutes: i64,
) -> Result<(), BookingError> {
    let invalid = |message: &str| Err(BookingError::Validation(message.to_string()));

    if student_id == tutor.tutor_id {
        return invalid("you cannot book yourself");
    }
    if policy.require_verified_tutor && !tutor.verified {
        return invalid("tutor is not verified yet");
    }
    if subject.is_empty() || subject.chars().count() > 100 {
        return invalid("subject must be 1 to 100 characters");
    }
    if !tutor.subjects.is_empty()
        && !tutor.subjects.iter().any(|s| s.eq_ignore_ascii_case(subject))
    {
        return invalid("tutor does not teach this subject");
    }
    if !tutor.teaching_modes.contains(&mode) {
        return invalid("tutor does not offer this lesson mode");
    }
    if mode == LessonMode::Offline && location.is_none() {
        return invalid("offline lessons need a location");
    }
    if duration_minutes < policy.min_duration_minutes
        || duration_minutes > policy.max_duration_minutes
    {
        return Err(BookingError::Validation(format!(
            "duration must be between {} and {} minutes",
            policy.min_duration_minutes, policy.max_duration_minutes
        )));
    }
    if duration_minutes % SLOT_GRANULARITY_MINUTES != 0 {
        return invalid("duration must be a multiple of 15 minutes");
    }
    if start_at < now + policy.min_lead_time {
        return Err(BookingError::Validation(format!(
            "sessions must be booked at least {} minutes in advance",
            policy.min_lead_time.num_minutes()
        )));
    }
    let end_at = start_at + Duration::minutes(duration_minutes);
    if !tutor.availability.is_empty()
        && !within_availability(&tutor.availability, policy.utc_offset, start_at, end_at)
    {
        return invalid("tutor is not available at that time");
    }
    Ok(())
}

/// Whether `[start, end)` fits inside one weekly window, read in local time.
fn within_availability(
    slots: &[AvailabilitySlot],
    offset: FixedOffset,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
) -> bool {
    let start = start_at.with_timezone(&offset);
    let end = end_at.with_timezone(&offset);
    if start.date_naive() != end.date_naive() {
        return false;
    }
    let Ok(day) = u8::try_from(start.weekday().num_days_from_monday()) else {
        return false;
    };
    slots.iter().any(|slot| {
        slot.day_of_week == day && slot.start_time <= start.time() && end.time() <= slot.end_time
    })
}

fn notify(env: &BookingEnvironment, kind: NotificationKind, booking: &Booking) -> Effect<BookingAction> {
    let notifier = Arc::clone(&env.notifier);
    let booking = booking.clone();
    Effect::future(async move {
        notifier.notify(kind, booking).await;
        None
    })
}

fn effects_for(
    env: &BookingEnvironment,
    state: &BookingState,
    kind: NotificationKind,
) -> Effects<BookingAction> {
    state
        .booking
        .as_ref()
        .map(|booking| notify(env, kind, booking))
        .into_iter()
        .collect()
}

fn refund(
    env: &BookingEnvironment,
    order_id: String,
    amount: Money,
    reason: String,
) -> Effect<BookingAction> {
    let gateway = Arc::clone(&env.gateway);
    let clock = Arc::clone(&env.clock);
    Effect::future(async move {
        let result = gateway
            .refund(RefundRequest {
                order_id,
                amount,
                reason,
            })
            .await;
        let at = clock.now();
        Some(match result {
            Ok(receipt) => BookingAction::RefundSucceeded {
                reference: receipt.reference,
                at,
            },
            Err(error) => BookingAction::RefundFailed {
                reason: error.to_string(),
                at,
            },
        })
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::payment_gateway::MockPaymentGateway;
    use blajarplus_testing::{assertions, test_clock, FixedClock, ReducerTest};
    use chrono::NaiveTime;
    use proptest::prelude::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    fn env_at(now: DateTime<Utc>) -> BookingEnvironment {
        BookingEnvironment::new(
            Arc::new(FixedClock::new(now)),
            MockPaymentGateway::shared(),
            Arc::new(RecordingNotifier::default()),
            BookingPolicy::default(),
        )
    }

    fn test_env() -> BookingEnvironment {
        env_at(test_clock().now())
    }

    struct Ids {
        booking: BookingId,
        student: UserId,
        tutor: UserId,
    }

    fn ids() -> Ids {
        Ids {
            booking: BookingId::new(),
            student: UserId::new(),
            tutor: UserId::new(),
        }
    }

    fn tutor(ids: &Ids) -> TutorSnapshot {
        TutorSnapshot {
            tutor_id: ids.tutor,
            hourly_rate: Money::from_rupiah(100_000),
            subjects: vec!["Mathematics".to_string()],
            teaching_modes: vec![LessonMode::Online],
            verified: true,
            availability: Vec::new(),
        }
    }

    // 2025-01-07 10:00 WIB (Tuesday)
    fn tuesday_ten() -> DateTime<Utc> {
        at("2025-01-07T03:00:00Z")
    }

    fn create(ids: &Ids, snapshot: TutorSnapshot, duration_minutes: i64) -> BookingAction {
        BookingAction::CreateBooking {
            booking_id: ids.booking,
            student_id: ids.student,
            tutor: snapshot,
            subject: "mathematics".to_string(),
            mode: LessonMode::Online,
            location: None,
            notes: Some("  chapter 3 please ".to_string()),
            start_at: tuesday_ten(),
            duration_minutes,
        }
    }

    fn student(ids: &Ids) -> Actor {
        Actor::User {
            id: ids.student,
            role: Role::Student,
        }
    }

    fn tutor_actor(ids: &Ids) -> Actor {
        Actor::User {
            id: ids.tutor,
            role: Role::Tutor,
        }
    }

    fn admin() -> Actor {
        Actor::User {
            id: UserId::new(),
            role: Role::Admin,
        }
    }

    fn settle(ids: &Ids, attempt: i32, amount: Money) -> BookingAction {
        BookingAction::ApplyPaymentNotification {
            notification: PaymentNotification {
                order_id: order_id_for(ids.booking, attempt),
                status: TransactionStatus::Settled,
                gross_amount: amount,
                transaction_id: Some("txn-1".to_string()),
                payment_type: Some("gopay".to_string()),
            },
        }
    }

    fn notification(ids: &Ids, status: TransactionStatus) -> BookingAction {
        BookingAction::ApplyPaymentNotification {
            notification: PaymentNotification {
                order_id: order_id_for(ids.booking, 1),
                status,
                gross_amount: Money::from_rupiah(100_000),
                transaction_id: None,
                payment_type: None,
            },
        }
    }

    fn link_created(ids: &Ids, attempt: i32) -> BookingAction {
        BookingAction::PaymentLinkCreated {
            order_id: order_id_for(ids.booking, attempt),
            token: "tok".to_string(),
            redirect_url: "https://pay.test/1".to_string(),
            at: test_clock().now(),
        }
    }

    /// Replay actions directly, ignoring effects.
    fn replay(env: &BookingEnvironment, actions: Vec<BookingAction>) -> BookingState {
        let reducer = BookingReducer::new();
        let mut state = BookingState::new();
        for action in actions {
            let _ = reducer.reduce(&mut state, action, env);
        }
        state
    }

    fn pending_with_link(ids: &Ids) -> Vec<BookingAction> {
        vec![
            create(ids, tutor(ids), 60),
            BookingAction::InitiatePayment { actor: student(ids) },
            link_created(ids, 1),
        ]
    }

    fn confirmed(ids: &Ids) -> BookingState {
        let mut actions = pending_with_link(ids);
        actions.push(settle(ids, 1, Money::from_rupiah(100_000)));
        replay(&test_env(), actions)
    }

    #[test]
    fn test_create_booking_prices_and_notifies() {
        let ids = ids();
        ReducerTest::new(BookingReducer::new())
            .with_env(test_env())
            .given_state(BookingState::new())
            .when_action(create(&ids, tutor(&ids), 90))
            .then_state(|state| {
                let booking = state.booking.as_ref().unwrap();
                assert_eq!(booking.status, BookingStatus::PendingPayment);
                assert_eq!(booking.price, Money::from_rupiah(150_000));
                assert_eq!(booking.platform_fee, Money::from_rupiah(15_000));
                assert_eq!(booking.notes.as_deref(), Some("chapter 3 please"));
                assert_eq!(booking.end_at - booking.start_at, Duration::minutes(90));
                assert_eq!(
                    booking.payment_deadline,
                    test_clock().now() + Duration::hours(1)
                );
                assert!(state.last_error.is_none());
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 1))
            .run();
    }

    #[test]
    fn test_payment_deadline_clamped_to_start() {
        let ids = ids();
        let mut policy = BookingPolicy::default();
        policy.payment_window = Duration::days(3);
        let mut env = test_env();
        env.policy = policy;

        let state = replay(&env, vec![create(&ids, tutor(&ids), 60)]);
        assert_eq!(state.booking.unwrap().payment_deadline, tuesday_ten());
    }

    #[test]
    fn test_create_rejects_self_booking() {
        let ids = ids();
        let mut snapshot = tutor(&ids);
        snapshot.tutor_id = ids.student;

        ReducerTest::new(BookingReducer::new())
            .with_env(test_env())
            .given_state(BookingState::new())
            .when_action(create(&ids, snapshot, 60))
            .then_state(|state| {
                assert!(state.booking.is_none());
                assert!(matches!(state.last_error, Some(BookingError::Validation(_))));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_create_rejects_bad_durations() {
        let ids = ids();
        for minutes in [15, 50, 300] {
            let state = replay(&test_env(), vec![create(&ids, tutor(&ids), minutes)]);
            assert!(state.booking.is_none(), "{minutes} minutes accepted");
        }
    }

    #[test]
    fn test_create_rejects_unknown_subject_and_mode() {
        let ids = ids();
        let mut snapshot = tutor(&ids);
        snapshot.subjects = vec!["Physics".to_string()];
        let state = replay(&test_env(), vec![create(&ids, snapshot, 60)]);
        assert_eq!(
            state.last_error,
            Some(BookingError::Validation(
                "tutor does not teach this subject".to_string()
            ))
        );

        let ids = self::ids();
        let state = replay(
            &test_env(),
            vec![BookingAction::CreateBooking {
                booking_id: ids.booking,
                student_id: ids.student,
                tutor: tutor(&ids),
                subject: "Mathematics".to_string(),
                mode: LessonMode::Offline,
                location: Some("Perpustakaan UI".to_string()),
                notes: None,
                start_at: tuesday_ten(),
                duration_minutes: 60,
            }],
        );
        assert!(state.booking.is_none());
    }

    #[test]
    fn test_create_requires_lead_time() {
        let ids = ids();
        // 1 hour before the session; default lead time is 2 hours.
        let env = env_at(tuesday_ten() - Duration::hours(1));
        let state = replay(&env, vec![create(&ids, tutor(&ids), 60)]);
        assert!(state.booking.is_none());
    }

    #[test]
    fn test_create_rejects_unverified_when_required() {
        let ids = ids();
        let mut env = test_env();
        env.policy.require_verified_tutor = true;
        let mut snapshot = tutor(&ids);
        snapshot.verified = false;
        let state = replay(&env, vec![create(&ids, snapshot, 60)]);
        assert!(state.booking.is_none());
    }

    #[test]
    fn test_create_checks_availability_in_local_time() {
        let ids = ids();
        let mut snapshot = tutor(&ids);
        // Tuesday 09:00–12:00 local
        snapshot.availability = vec![AvailabilitySlot {
            day_of_week: 1,
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        }];

        let state = replay(&test_env(), vec![create(&ids, snapshot.clone(), 120)]);
        assert!(state.booking.is_some(), "{:?}", state.last_error);

        let ids = self::ids();
        snapshot.tutor_id = ids.tutor;
        let state = replay(&test_env(), vec![create(&ids, snapshot, 180)]);
        assert_eq!(
            state.last_error,
            Some(BookingError::Validation(
                "tutor is not available at that time".to_string()
            ))
        );
    }

    #[test]
    fn test_initiate_payment_emits_gateway_effect() {
        let ids = ids();
        ReducerTest::new(BookingReducer::new())
            .with_env(test_env())
            .given_state(BookingState::new())
            .given_actions(vec![create(&ids, tutor(&ids), 60)])
            .when_action(BookingAction::InitiatePayment {
                actor: student(&ids),
            })
            .then_state(move |state| {
                let payment = state.payment.as_ref().unwrap();
                assert_eq!(payment.status, PaymentStatus::Pending);
                assert_eq!(payment.attempt, 1);
                assert_eq!(payment.amount, Money::from_rupiah(100_000));
                assert_eq!(payment.order_id, order_id_for(ids.booking, 1));
            })
            .then_effects(assertions::assert_has_future_effect)
            .run();
    }

    #[test]
    fn test_initiate_payment_is_idempotent_while_pending() {
        let ids = ids();
        ReducerTest::new(BookingReducer::new())
            .with_env(test_env())
            .given_state(BookingState::new())
            .given_actions(pending_with_link(&ids))
            .when_action(BookingAction::InitiatePayment {
                actor: student(&ids),
            })
            .then_state(|state| {
                let payment = state.payment.as_ref().unwrap();
                assert_eq!(payment.attempt, 1);
                assert_eq!(payment.redirect_url.as_deref(), Some("https://pay.test/1"));
                assert!(state.last_error.is_none());
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[tokio::test]
    async fn test_initiate_payment_reissues_missing_checkout() {
        let ids = ids();
        let env = test_env();
        let mut state = replay(
            &env,
            vec![
                create(&ids, tutor(&ids), 60),
                BookingAction::InitiatePayment { actor: student(&ids) },
            ],
        );
        assert!(state.payment.as_ref().unwrap().redirect_url.is_none());

        let reducer = BookingReducer::new();
        let effects = reducer.reduce(
            &mut state,
            BookingAction::InitiatePayment { actor: student(&ids) },
            &env,
        );
        assert!(state.last_error.is_none());
        assert_eq!(effects.len(), 1);
        assert_eq!(state.payment.as_ref().unwrap().attempt, 1);

        let reported = Effect::merge(effects.into_vec()).run().await;
        assert_eq!(reported.len(), 1);
        assert!(matches!(
            &reported[0],
            BookingAction::PaymentLinkCreated { order_id, .. } if *order_id == order_id_for(ids.booking, 1)
        ));
        for action in reported {
            let _ = reducer.reduce(&mut state, action, &env);
        }
        let payment = state.payment.as_ref().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.redirect_url.is_some());
    }

    #[test]
    fn test_late_link_failure_keeps_usable_checkout() {
        let ids = ids();
        ReducerTest::new(BookingReducer::new())
            .with_env(test_env())
            .given_state(BookingState::new())
            .given_actions(pending_with_link(&ids))
            .when_action(BookingAction::PaymentLinkFailed {
                order_id: order_id_for(ids.booking, 1),
                reason: "duplicate order id".to_string(),
                at: test_clock().now(),
            })
            .then_state(|state| {
                let payment = state.payment.as_ref().unwrap();
                assert_eq!(payment.status, PaymentStatus::Pending);
                assert!(payment.failure_reason.is_none());
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_only_student_can_pay() {
        let ids = ids();
        let state = replay(
            &test_env(),
            vec![
                create(&ids, tutor(&ids), 60),
                BookingAction::InitiatePayment {
                    actor: tutor_actor(&ids),
                },
            ],
        );
        assert!(matches!(state.last_error, Some(BookingError::Forbidden(_))));
        assert!(state.payment.is_none());
    }

    #[test]
    fn test_payment_after_deadline_rejected() {
        let ids = ids();
        let state = replay(&test_env(), vec![create(&ids, tutor(&ids), 60)]);
        let late = env_at(test_clock().now() + Duration::hours(2));
        let mut state = state;
        let effects = BookingReducer::new().reduce(
            &mut state,
            BookingAction::InitiatePayment {
                actor: student(&ids),
            },
            &late,
        );
        assert!(effects.is_empty());
        assert_eq!(state.last_error, Some(BookingError::DeadlinePassed));
    }

    #[test]
    fn test_failed_attempt_can_be_retried() {
        let ids = ids();
        let mut actions = pending_with_link(&ids);
        actions.push(notification(&ids, TransactionStatus::Expired));
        actions.push(BookingAction::InitiatePayment {
            actor: student(&ids),
        });
        let state = replay(&test_env(), actions);

        let payment = state.payment.unwrap();
        assert_eq!(payment.attempt, 2);
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.order_id, order_id_for(ids.booking, 2));
        assert_eq!(state.booking.unwrap().status, BookingStatus::PendingPayment);
    }

    #[test]
    fn test_settlement_confirms_and_holds_escrow() {
        let ids = ids();
        ReducerTest::new(BookingReducer::new())
            .with_env(test_env())
            .given_state(BookingState::new())
            .given_actions(pending_with_link(&ids))
            .when_action(settle(&ids, 1, Money::from_rupiah(100_000)))
            .then_state(|state| {
                assert_eq!(state.status(), Some(BookingStatus::Confirmed));
                let payment = state.payment.as_ref().unwrap();
                assert_eq!(payment.status, PaymentStatus::Paid);
                assert_eq!(payment.escrow, EscrowStatus::Held);
                assert_eq!(payment.payment_type.as_deref(), Some("gopay"));
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 1))
            .run();
    }

    #[test]
    fn test_duplicate_settlement_is_ignored() {
        let ids = ids();
        let before = confirmed(&ids);
        ReducerTest::new(BookingReducer::new())
            .with_env(test_env())
            .given_state(before.clone())
            .when_action(settle(&ids, 1, Money::from_rupiah(100_000)))
            .then_state(move |state| assert_eq!(state, &before))
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_amount_mismatch_rejected() {
        let ids = ids();
        ReducerTest::new(BookingReducer::new())
            .with_env(test_env())
            .given_state(BookingState::new())
            .given_actions(pending_with_link(&ids))
            .when_action(settle(&ids, 1, Money::from_rupiah(1)))
            .then_state(|state| {
                assert_eq!(state.status(), Some(BookingStatus::PendingPayment));
                assert!(matches!(
                    state.last_error,
                    Some(BookingError::AmountMismatch { .. })
                ));
            })
            .run();
    }

    #[test]
    fn test_stale_order_rejected() {
        let ids = ids();
        let state = replay(&test_env(), {
            let mut actions = pending_with_link(&ids);
            actions.push(settle(&ids, 7, Money::from_rupiah(100_000)));
            actions
        });
        assert!(matches!(state.last_error, Some(BookingError::UnknownOrder(_))));
        assert_eq!(state.status(), Some(BookingStatus::PendingPayment));
    }

    #[test]
    fn test_failure_after_settlement_does_not_downgrade() {
        let ids = ids();
        let before = confirmed(&ids);
        let mut state = before.clone();
        let effects = BookingReducer::new().reduce(
            &mut state,
            notification(&ids, TransactionStatus::Failed),
            &test_env(),
        );
        assert!(effects.is_empty());
        assert_eq!(state, before);
    }

    #[test]
    fn test_pending_notification_records_channel() {
        let ids = ids();
        let mut actions = pending_with_link(&ids);
        actions.push(BookingAction::ApplyPaymentNotification {
            notification: PaymentNotification {
                order_id: order_id_for(ids.booking, 1),
                status: TransactionStatus::Pending,
                gross_amount: Money::from_rupiah(100_000),
                transaction_id: Some("txn-9".to_string()),
                payment_type: Some("bank_transfer".to_string()),
            },
        });
        let state = replay(&test_env(), actions);
        let payment = state.payment.unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.payment_type.as_deref(), Some("bank_transfer"));
        assert_eq!(payment.provider_transaction_id.as_deref(), Some("txn-9"));
    }

    #[test]
    fn test_complete_releases_escrow() {
        let ids = ids();
        let after_session = env_at(tuesday_ten() + Duration::hours(2));
        ReducerTest::new(BookingReducer::new())
            .with_env(after_session)
            .given_state(confirmed(&ids))
            .when_action(BookingAction::CompleteBooking {
                actor: tutor_actor(&ids),
            })
            .then_state(|state| {
                assert_eq!(state.status(), Some(BookingStatus::Completed));
                assert_eq!(state.escrow(), EscrowStatus::Released);
                assert!(state.payment.as_ref().unwrap().released_at.is_some());
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 1))
            .run();
    }

    #[test]
    fn test_complete_before_end_rejected() {
        let ids = ids();
        ReducerTest::new(BookingReducer::new())
            .with_env(env_at(tuesday_ten() + Duration::minutes(30)))
            .given_state(confirmed(&ids))
            .when_action(BookingAction::CompleteBooking {
                actor: student(&ids),
            })
            .then_state(|state| {
                assert_eq!(state.status(), Some(BookingStatus::Confirmed));
                assert_eq!(state.last_error, Some(BookingError::NotYetEnded));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_outsider_cannot_complete() {
        let ids = ids();
        let mut state = confirmed(&ids);
        let _ = BookingReducer::new().reduce(
            &mut state,
            BookingAction::CompleteBooking {
                actor: Actor::User {
                    id: UserId::new(),
                    role: Role::Student,
                },
            },
            &env_at(tuesday_ten() + Duration::hours(2)),
        );
        assert!(matches!(state.last_error, Some(BookingError::Forbidden(_))));
    }

    #[test]
    fn test_cancel_pending_cancels_live_payment() {
        let ids = ids();
        ReducerTest::new(BookingReducer::new())
            .with_env(test_env())
            .given_state(BookingState::new())
            .given_actions(pending_with_link(&ids))
            .when_action(BookingAction::CancelBooking {
                actor: student(&ids),
                reason: "changed my mind".to_string(),
            })
            .then_state(|state| {
                let booking = state.booking.as_ref().unwrap();
                assert_eq!(booking.status, BookingStatus::Cancelled);
                assert_eq!(booking.cancellation.as_ref().unwrap().by, CancelledBy::Student);
                assert_eq!(
                    state.payment.as_ref().unwrap().status,
                    PaymentStatus::Cancelled
                );
                assert_eq!(state.escrow(), EscrowStatus::None);
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 1))
            .run();
    }

    #[test]
    fn test_cancel_confirmed_requests_refund() {
        let ids = ids();
        ReducerTest::new(BookingReducer::new())
            .with_env(test_env())
            .given_state(confirmed(&ids))
            .when_action(BookingAction::CancelBooking {
                actor: student(&ids),
                reason: "sick".to_string(),
            })
            .then_state(|state| {
                assert_eq!(state.status(), Some(BookingStatus::Cancelled));
                assert_eq!(state.escrow(), EscrowStatus::RefundPending);
                assert_eq!(state.payment.as_ref().unwrap().status, PaymentStatus::Paid);
            })
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assert!(matches!(&effects[0], Effect::Sequential(steps) if steps.len() == 2));
            })
            .run();
    }

    #[test]
    fn test_student_cancellation_cutoff() {
        let ids = ids();
        // 12 hours before start; students need 24.
        let env = env_at(tuesday_ten() - Duration::hours(12));
        let mut state = confirmed(&ids);
        let effects = BookingReducer::new().reduce(
            &mut state,
            BookingAction::CancelBooking {
                actor: student(&ids),
                reason: "busy".to_string(),
            },
            &env,
        );
        assert!(effects.is_empty());
        assert_eq!(
            state.last_error,
            Some(BookingError::CancellationWindowClosed { cutoff_hours: 24 })
        );

        // Tutors may still cancel.
        let effects = BookingReducer::new().reduce(
            &mut state,
            BookingAction::CancelBooking {
                actor: tutor_actor(&ids),
                reason: "emergency".to_string(),
            },
            &env,
        );
        assert_eq!(effects.len(), 1);
        assert_eq!(state.status(), Some(BookingStatus::Cancelled));
    }

    #[test]
    fn test_cannot_cancel_started_session() {
        let ids = ids();
        let mut state = confirmed(&ids);
        let _ = BookingReducer::new().reduce(
            &mut state,
            BookingAction::CancelBooking {
                actor: admin(),
                reason: "late".to_string(),
            },
            &env_at(tuesday_ten() + Duration::minutes(5)),
        );
        assert_eq!(state.last_error, Some(BookingError::AlreadyStarted));
    }

    #[test]
    fn test_cancel_twice_is_invalid_transition() {
        let ids = ids();
        let mut actions = pending_with_link(&ids);
        actions.push(BookingAction::CancelBooking {
            actor: student(&ids),
            reason: "first".to_string(),
        });
        actions.push(BookingAction::CancelBooking {
            actor: student(&ids),
            reason: "second".to_string(),
        });
        let state = replay(&test_env(), actions);
        assert_eq!(
            state.last_error,
            Some(BookingError::InvalidTransition {
                action: "cancel",
                status: BookingStatus::Cancelled
            })
        );
        assert_eq!(
            state.booking.unwrap().cancellation.unwrap().reason,
            "first"
        );
    }

    #[test]
    fn test_refund_feedback_marks_refunded() {
        let ids = ids();
        let mut actions = vec![];
        actions.push(BookingAction::CancelBooking {
            actor: tutor_actor(&ids),
            reason: "cannot make it".to_string(),
        });
        actions.push(BookingAction::RefundSucceeded {
            reference: Some("ref-1".to_string()),
            at: test_clock().now(),
        });
        let mut state = confirmed(&ids);
        for action in actions {
            let _ = BookingReducer::new().reduce(&mut state, action, &test_env());
        }
        let payment = state.payment.unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(payment.escrow, EscrowStatus::Refunded);
        assert_eq!(payment.refund_reference.as_deref(), Some("ref-1"));
    }

    #[test]
    fn test_expire_after_deadline() {
        let ids = ids();
        let state = replay(&test_env(), pending_with_link(&ids));
        ReducerTest::new(BookingReducer::new())
            .with_env(env_at(test_clock().now() + Duration::hours(1)))
            .given_state(state)
            .when_action(BookingAction::ExpireBooking)
            .then_state(|state| {
                let booking = state.booking.as_ref().unwrap();
                assert_eq!(booking.status, BookingStatus::Cancelled);
                assert_eq!(booking.cancellation.as_ref().unwrap().by, CancelledBy::System);
                assert_eq!(state.payment.as_ref().unwrap().status, PaymentStatus::Expired);
            })
            .run();
    }

    #[test]
    fn test_expire_before_deadline_rejected() {
        let ids = ids();
        let state = replay(
            &test_env(),
            vec![create(&ids, tutor(&ids), 60), BookingAction::ExpireBooking],
        );
        assert_eq!(state.last_error, Some(BookingError::DeadlineNotReached));
        assert_eq!(state.status(), Some(BookingStatus::PendingPayment));
    }

    #[test]
    fn test_late_settlement_on_cancelled_booking_is_refunded() {
        let ids = ids();
        let mut state = replay(&test_env(), pending_with_link(&ids));
        let expired_env = env_at(test_clock().now() + Duration::hours(1));
        let _ = BookingReducer::new().reduce(&mut state, BookingAction::ExpireBooking, &expired_env);

        let effects = BookingReducer::new().reduce(
            &mut state,
            settle(&ids, 1, Money::from_rupiah(100_000)),
            &expired_env,
        );
        assert_eq!(effects.len(), 1);
        assert_eq!(state.status(), Some(BookingStatus::Cancelled));
        let payment = state.payment.unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(payment.escrow, EscrowStatus::RefundPending);
    }

    #[test]
    fn test_retry_refund_admin_only() {
        let ids = ids();
        let mut state = confirmed(&ids);
        let reducer = BookingReducer::new();
        let _ = reducer.reduce(
            &mut state,
            BookingAction::CancelBooking {
                actor: tutor_actor(&ids),
                reason: "ill".to_string(),
            },
            &test_env(),
        );
        let _ = reducer.reduce(
            &mut state,
            BookingAction::RefundFailed {
                reason: "provider down".to_string(),
                at: test_clock().now(),
            },
            &test_env(),
        );
        assert_eq!(state.escrow(), EscrowStatus::RefundPending);

        let effects = reducer.reduce(
            &mut state,
            BookingAction::RetryRefund {
                actor: student(&ids),
            },
            &test_env(),
        );
        assert!(effects.is_empty());
        assert!(matches!(state.last_error, Some(BookingError::Forbidden(_))));

        let effects = reducer.reduce(
            &mut state,
            BookingAction::RetryRefund { actor: admin() },
            &test_env(),
        );
        assert_eq!(effects.len(), 1);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_provider_side_refund_cancels_confirmed_booking() {
        let ids = ids();
        let mut state = confirmed(&ids);
        let _ = BookingReducer::new().reduce(
            &mut state,
            notification(&ids, TransactionStatus::Refunded),
            &test_env(),
        );
        assert_eq!(state.status(), Some(BookingStatus::Cancelled));
        assert_eq!(state.escrow(), EscrowStatus::Refunded);
    }

    #[tokio::test]
    async fn test_gateway_effect_feeds_back_link() {
        let ids = ids();
        let env = test_env();
        let reducer = BookingReducer::new();
        let mut state = replay(&env, vec![create(&ids, tutor(&ids), 60)]);
        let effects = reducer.reduce(
            &mut state,
            BookingAction::InitiatePayment {
                actor: student(&ids),
            },
            &env,
        );

        let mut feedback = Vec::new();
        for effect in effects {
            feedback.extend(effect.run().await);
        }
        assert_eq!(feedback.len(), 1);
        for action in feedback {
            let _ = reducer.reduce(&mut state, action, &env);
        }
        let payment = state.payment.unwrap();
        assert!(payment.redirect_url.unwrap().contains(&payment.order_id));
    }

    proptest! {
        #[test]
        fn prop_price_splits_into_fee_and_payout(
            rate in 10_000i64..2_000_000,
            quarters in 2i64..=16,
            fee in 0u8..=50,
        ) {
            let minutes = quarters * 15;
            let price = price_for(Money::from_rupiah(rate), minutes).unwrap();
            let platform_fee = price.percent(fee);
            prop_assert!(price.rupiah() * 60 <= rate * minutes);
            prop_assert!(rate * minutes - price.rupiah() * 60 < 60);
            prop_assert!(platform_fee <= price);
            prop_assert_eq!(
                price.checked_sub(platform_fee).unwrap() + platform_fee,
                price
            );
        }

        #[test]
        fn prop_availability_never_spans_days(
            start_minute in 0i64..(7 * 24 * 60),
            quarters in 1i64..=16,
        ) {
            let slots: Vec<AvailabilitySlot> = (0..7)
                .map(|day| AvailabilitySlot {
                    day_of_week: day,
                    start_time: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                    end_time: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
                })
                .collect();
            let offset = BookingPolicy::default().utc_offset;
            let start = tuesday_ten() + Duration::minutes(start_minute);
            let end = start + Duration::minutes(quarters * 15);
            let local_start = start.with_timezone(&offset);
            let local_end = end.with_timezone(&offset);
            let fits = within_availability(&slots, offset, start, end);
            prop_assert_eq!(fits, local_start.date_naive() == local_end.date_naive());
        }
    }
}
