//! Domain types for the BlajarPlus marketplace.
//!
//! Value objects (identifiers, [`Money`], status enums) and the entities the
//! repositories store. Every status enum is stored as TEXT using its
//! snake_case name, which is also its JSON form.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Unwrap into the inner UUID
            #[must_use]
            pub const fn into_uuid(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

define_id!(
    /// Unique identifier for a user (students, tutors and admins alike)
    UserId
);
define_id!(
    /// Unique identifier for a booking
    BookingId
);
define_id!(
    /// Unique identifier for a payment attempt
    PaymentId
);
define_id!(
    /// Unique identifier for a review
    ReviewId
);
define_id!(
    /// Unique identifier for a chat conversation
    ConversationId
);
define_id!(
    /// Unique identifier for a chat message
    MessageId
);
define_id!(
    /// Unique identifier for an in-app notification
    NotificationId
);
define_id!(
    /// Unique identifier for a course
    CourseId
);
define_id!(
    /// Unique identifier for a course lesson
    LessonId
);
define_id!(
    /// Unique identifier for a login session
    SessionId
);
define_id!(
    /// Unique identifier for a magic link
    MagicLinkId
);
define_id!(
    /// Unique identifier for a course certificate
    CertificateId
);

/// Tutors are users; the alias documents intent at call sites.
pub type TutorId = UserId;

// ============================================================================
// Money
// ============================================================================

/// An amount in whole Indonesian rupiah.
///
/// Rupiah has no minor unit in practice, and the payment provider reports
/// `gross_amount` as an integer with a `.00` suffix.
///
/// Amounts received over the wire must be non-negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Money(i64);

/// Error for a negative amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("amount must not be negative, got {0}")]
pub struct NegativeAmount(pub i64);

impl TryFrom<i64> for Money {
    type Error = NegativeAmount;

    fn try_from(rupiah: i64) -> Result<Self, Self::Error> {
        if rupiah < 0 {
            Err(NegativeAmount(rupiah))
        } else {
            Ok(Self(rupiah))
        }
    }
}

impl From<Money> for i64 {
    fn from(money: Money) -> Self {
        money.0
    }
}

impl Money {
    /// Zero rupiah
    pub const ZERO: Self = Self(0);

    /// Creates an amount from whole rupiah
    #[must_use]
    pub const fn from_rupiah(rupiah: i64) -> Self {
        Self(rupiah)
    }

    /// Whole rupiah
    #[must_use]
    pub const fn rupiah(self) -> i64 {
        self.0
    }

    /// `percent`% of this amount, rounded down.
    #[must_use]
    pub const fn percent(self, percent: u8) -> Self {
        // Widened so the product cannot overflow; the result is at most `self`.
        #[allow(clippy::cast_possible_truncation)]
        let value = (self.0 as i128 * percent as i128 / 100) as i64;
        Self(value)
    }

    /// Adds two amounts with overflow checking.
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(total) => Some(Self(total)),
            None => None,
        }
    }

    /// Subtraction that refuses to go below zero.
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        if other.0 > self.0 {
            None
        } else {
            Some(Self(self.0 - other.0))
        }
    }

    /// Parse the provider's decimal string (`"150000.00"`).
    ///
    /// Returns `None` for negative values or non-zero fractions.
    #[must_use]
    pub fn parse_decimal(raw: &str) -> Option<Self> {
        let (whole, fraction) = raw.trim().split_once('.').unwrap_or((raw.trim(), ""));
        if !fraction.chars().all(|c| c == '0') {
            return None;
        }
        let value: i64 = whole.parse().ok()?;
        (value >= 0).then_some(Self(value))
    }
}

impl std::ops::Add for Money {
    type Output = Self;

    /// Saturates at `i64::MAX` rupiah instead of wrapping.
    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rp{}", self.0)
    }
}

// ============================================================================
// Text-backed enums
// ============================================================================

/// Error returned when a stored or submitted enum value is unknown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    /// Enum name
    pub kind: &'static str,
    /// Rejected input
    pub value: String,
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Stable snake_case name (used in storage and JSON)
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(
    /// Account role
    Role {
        /// Books lessons, takes courses
        Student => "student",
        /// Offers lessons
        Tutor => "tutor",
        /// Operates the marketplace
        Admin => "admin",
    }
);

text_enum!(
    /// Where a lesson happens
    LessonMode {
        /// Video call
        Online => "online",
        /// In person at an agreed location
        Offline => "offline",
    }
);

text_enum!(
    /// Booking lifecycle status
    BookingStatus {
        /// Created, waiting for the student to pay
        PendingPayment => "pending_payment",
        /// Paid; the session will take place
        Confirmed => "confirmed",
        /// Session done; funds released to the tutor
        Completed => "completed",
        /// Cancelled by a participant, an admin, or expiry
        Cancelled => "cancelled",
    }
);

text_enum!(
    /// Status of one payment attempt
    PaymentStatus {
        /// Waiting for the provider to report the outcome
        Pending => "pending",
        /// Provider settled the charge
        Paid => "paid",
        /// Provider denied or failed the charge
        Failed => "failed",
        /// Provider or the payment window expired it
        Expired => "expired",
        /// Abandoned because the booking was cancelled
        Cancelled => "cancelled",
        /// Money returned to the student
        Refunded => "refunded",
    }
);

text_enum!(
    /// Escrow label on a payment
    EscrowStatus {
        /// No money captured
        None => "none",
        /// Captured, waiting for the session to complete
        Held => "held",
        /// Paid out to the tutor
        Released => "released",
        /// Refund requested from the provider
        RefundPending => "refund_pending",
        /// Returned to the student
        Refunded => "refunded",
    }
);

text_enum!(
    /// Who cancelled a booking
    CancelledBy {
        /// The booking's student
        Student => "student",
        /// The booking's tutor
        Tutor => "tutor",
        /// A marketplace admin
        Admin => "admin",
        /// The payment window expired
        System => "system",
    }
);

text_enum!(
    /// In-app notification category
    NotificationKind {
        /// Tutor received a booking request
        BookingRequested => "booking_requested",
        /// Booking paid and confirmed
        BookingConfirmed => "booking_confirmed",
        /// Booking cancelled
        BookingCancelled => "booking_cancelled",
        /// Session completed and funds released
        BookingCompleted => "booking_completed",
        /// A payment attempt failed
        PaymentFailed => "payment_failed",
        /// Refund reached the student
        RefundIssued => "refund_issued",
        /// Tutor received a review
        NewReview => "new_review",
        /// Certificate earned
        CertificateIssued => "certificate_issued",
    }
);

text_enum!(
    /// Course difficulty
    CourseLevel {
        /// No prior knowledge
        Beginner => "beginner",
        /// Conversational
        Intermediate => "intermediate",
        /// Fluent
        Advanced => "advanced",
    }
);

// ============================================================================
// Users
// ============================================================================

/// A registered account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Identifier
    pub id: UserId,
    /// Login email (lower-cased)
    pub email: String,
    /// Display name
    pub name: String,
    /// Account role
    pub role: Role,
    /// Contact phone
    pub phone: Option<String>,
    /// Avatar image URL
    pub avatar_url: Option<String>,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Last profile change
    pub updated_at: DateTime<Utc>,
}

/// Tutor's public profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TutorProfile {
    /// Owning user
    pub user_id: TutorId,
    /// One-line pitch
    pub headline: String,
    /// Longer description
    pub bio: String,
    /// Subjects taught
    pub subjects: Vec<String>,
    /// Price per hour
    pub hourly_rate: Money,
    /// City for offline lessons
    pub city: Option<String>,
    /// Supported lesson modes
    pub teaching_modes: Vec<LessonMode>,
    /// Years of teaching experience
    pub experience_years: i32,
    /// Education summary
    pub education: Option<String>,
    /// Checked by an admin
    pub verified: bool,
    /// Average review rating (0 when unrated)
    pub rating_avg: f64,
    /// Number of reviews
    pub rating_count: i64,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl TutorProfile {
    /// Whether the tutor lists `subject` (case-insensitive).
    ///
    /// A tutor with no listed subjects accepts any subject.
    #[must_use]
    pub fn teaches(&self, subject: &str) -> bool {
        self.subjects.is_empty()
            || self
                .subjects
                .iter()
                .any(|s| s.eq_ignore_ascii_case(subject.trim()))
    }
}

/// Search result row: profile plus the owner's public details.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TutorListing {
    /// Profile
    #[serde(flatten)]
    pub profile: TutorProfile,
    /// Tutor name
    pub name: String,
    /// Tutor avatar
    pub avatar_url: Option<String>,
}

/// A weekly window in which the tutor accepts bookings (local time).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    /// 0 = Monday … 6 = Sunday
    pub day_of_week: u8,
    /// Window start (inclusive)
    pub start_time: NaiveTime,
    /// Window end (exclusive)
    pub end_time: NaiveTime,
}

// ============================================================================
// Bookings and payments
// ============================================================================

/// Who cancelled, why, and when.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    /// Cancelling party
    pub by: CancelledBy,
    /// Free-text reason
    pub reason: String,
    /// When
    pub at: DateTime<Utc>,
}

/// One scheduled tutoring session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Identifier
    pub id: BookingId,
    /// Booking student
    pub student_id: UserId,
    /// Booked tutor
    pub tutor_id: TutorId,
    /// Lesson subject
    pub subject: String,
    /// Online or offline
    pub mode: LessonMode,
    /// Meeting place for offline lessons
    pub location: Option<String>,
    /// Student's notes for the tutor
    pub notes: Option<String>,
    /// Session start
    pub start_at: DateTime<Utc>,
    /// Session end
    pub end_at: DateTime<Utc>,
    /// Price charged to the student
    pub price: Money,
    /// Marketplace cut kept on release
    pub platform_fee: Money,
    /// Lifecycle status
    pub status: BookingStatus,
    /// Unpaid bookings are cancelled after this instant
    pub payment_deadline: DateTime<Utc>,
    /// Set when cancelled
    pub cancellation: Option<Cancellation>,
    /// When payment confirmed it
    pub confirmed_at: Option<DateTime<Utc>>,
    /// When it was completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency version, bumped on every save
    pub version: i64,
}

impl Booking {
    /// Session length in minutes.
    #[must_use]
    pub fn duration_minutes(&self) -> i64 {
        (self.end_at - self.start_at).num_minutes()
    }

    /// Whether the booking still holds its time slot.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self.status,
            BookingStatus::PendingPayment | BookingStatus::Confirmed
        )
    }

    /// Whether `[start, end)` intersects this booking's slot.
    #[must_use]
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_at < end && start < self.end_at
    }

    /// Whether `user` is the student or the tutor.
    #[must_use]
    pub fn involves(&self, user: UserId) -> bool {
        self.student_id == user || self.tutor_id == user
    }

    /// Amount the tutor receives on completion.
    #[must_use]
    pub fn tutor_payout(&self) -> Money {
        self.price.checked_sub(self.platform_fee).unwrap_or(Money::ZERO)
    }
}

/// One attempt to pay for a booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Identifier
    pub id: PaymentId,
    /// Paid booking
    pub booking_id: BookingId,
    /// Order id sent to the provider (unique per attempt)
    pub order_id: String,
    /// 1-based attempt number for this booking
    pub attempt: i32,
    /// Charged amount
    pub amount: Money,
    /// Provider-side outcome
    pub status: PaymentStatus,
    /// Escrow label
    pub escrow: EscrowStatus,
    /// Provider checkout token
    pub checkout_token: Option<String>,
    /// Provider checkout page
    pub redirect_url: Option<String>,
    /// Provider transaction id
    pub provider_transaction_id: Option<String>,
    /// Provider payment channel (`bank_transfer`, `gopay`, …)
    pub payment_type: Option<String>,
    /// Why it failed, or why a refund failed
    pub failure_reason: Option<String>,
    /// Provider refund reference
    pub refund_reference: Option<String>,
    /// Settlement time
    pub paid_at: Option<DateTime<Utc>>,
    /// Escrow release time
    pub released_at: Option<DateTime<Utc>>,
    /// Refund time
    pub refunded_at: Option<DateTime<Utc>>,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Pending and paid attempts block new attempts.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self.status, PaymentStatus::Pending | PaymentStatus::Paid)
    }
}

/// Escrow totals for one tutor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EarningsSummary {
    /// Paid, session not yet completed
    pub held: Money,
    /// Released to the tutor (after platform fee)
    pub released: Money,
    /// Platform fees kept on released bookings
    pub platform_fees: Money,
    /// Refunds in flight
    pub refund_pending: Money,
    /// Refunded to students
    pub refunded: Money,
    /// Number of completed bookings
    pub completed_sessions: i64,
}

// ============================================================================
// Reviews, chat, notifications
// ============================================================================

/// A student's review of a completed booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    /// Identifier
    pub id: ReviewId,
    /// Reviewed booking
    pub booking_id: BookingId,
    /// Reviewed tutor
    pub tutor_id: TutorId,
    /// Reviewer
    pub student_id: UserId,
    /// 1..=5
    pub rating: u8,
    /// Optional text
    pub comment: Option<String>,
    /// Created
    pub created_at: DateTime<Utc>,
}

/// A chat thread between one student and one tutor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Identifier
    pub id: ConversationId,
    /// Student participant
    pub student_id: UserId,
    /// Tutor participant
    pub tutor_id: TutorId,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Most recent message time
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Whether `user` takes part in the conversation.
    #[must_use]
    pub fn involves(&self, user: UserId) -> bool {
        self.student_id == user || self.tutor_id == user
    }
}

/// A single chat message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier
    pub id: MessageId,
    /// Thread
    pub conversation_id: ConversationId,
    /// Author
    pub sender_id: UserId,
    /// Text
    pub body: String,
    /// Sent
    pub created_at: DateTime<Utc>,
    /// Read by the other participant
    pub read_at: Option<DateTime<Utc>>,
}

/// Conversation with inbox details for one viewer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    /// Thread
    #[serde(flatten)]
    pub conversation: Conversation,
    /// Newest message
    pub last_message: Option<Message>,
    /// Messages from the other participant not yet read
    pub unread_count: i64,
}

/// An in-app notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Identifier
    pub id: NotificationId,
    /// Recipient
    pub user_id: UserId,
    /// Category
    pub kind: NotificationKind,
    /// Short title
    pub title: String,
    /// Body text
    pub body: String,
    /// Related booking
    pub booking_id: Option<BookingId>,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Read time
    pub read_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Language courses
// ============================================================================

/// A self-paced language course.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    /// Identifier
    pub id: CourseId,
    /// Tutor or admin who created it
    pub author_id: UserId,
    /// Title
    pub title: String,
    /// Taught language (`english`, `japanese`, …)
    pub language: String,
    /// Difficulty
    pub level: CourseLevel,
    /// Description
    pub description: String,
    /// Visible in the catalogue
    pub published: bool,
    /// Created
    pub created_at: DateTime<Utc>,
}

/// One lesson (material) of a course.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    /// Identifier
    pub id: LessonId,
    /// Parent course
    pub course_id: CourseId,
    /// Title
    pub title: String,
    /// Lesson material (markdown)
    pub content: String,
    /// Ordering within the course
    pub position: i32,
    /// XP awarded on completion
    pub xp_reward: i32,
}

/// A learner's membership in a course.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// Course
    pub course_id: CourseId,
    /// Learner
    pub user_id: UserId,
    /// Lessons finished, in completion order
    pub completed_lessons: Vec<LessonId>,
    /// Joined
    pub enrolled_at: DateTime<Utc>,
    /// All lessons finished
    pub completed_at: Option<DateTime<Utc>>,
}

/// Gamified progress for one learner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerProfile {
    /// Learner
    pub user_id: UserId,
    /// Total XP
    pub xp: i64,
    /// Derived from XP
    pub level: i32,
    /// Consecutive active days ending at `last_activity_on`
    pub current_streak: i32,
    /// Best streak ever
    pub longest_streak: i32,
    /// Last local day with a completed lesson
    pub last_activity_on: Option<NaiveDate>,
}

impl LearnerProfile {
    /// A learner who has not completed anything yet.
    #[must_use]
    pub const fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            xp: 0,
            level: 1,
            current_streak: 0,
            longest_streak: 0,
            last_activity_on: None,
        }
    }

    /// Add `xp` earned on the local day `today`, then refresh the level and
    /// streak.
    pub fn award(&mut self, xp: i64, today: NaiveDate) {
        self.xp = self.xp.saturating_add(xp);
        self.level = level_for(self.xp);
        self.record_activity(today);
    }

    /// Advance the daily streak for activity on `today`.
    ///
    /// Same day keeps the streak, the next day extends it, a gap restarts it.
    pub fn record_activity(&mut self, today: NaiveDate) {
        match self.last_activity_on {
            Some(last) if last == today && self.current_streak > 0 => {}
            Some(last) if last.succ_opt() == Some(today) => self.current_streak += 1,
            _ => self.current_streak = 1,
        }
        self.longest_streak = self.longest_streak.max(self.current_streak);
        self.last_activity_on = Some(today);
    }
}

/// XP needed per level.
pub const XP_PER_LEVEL: i64 = 500;

/// Level for a total XP.
#[must_use]
pub fn level_for(xp: i64) -> i32 {
    i32::try_from(1 + xp.max(0) / XP_PER_LEVEL).unwrap_or(i32::MAX)
}

/// Proof of course completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Identifier
    pub id: CertificateId,
    /// Holder
    pub user_id: UserId,
    /// Completed course
    pub course_id: CourseId,
    /// Public verification code (`BPC-XXXXXXXX`)
    pub code: String,
    /// Issued
    pub issued_at: DateTime<Utc>,
}

// ============================================================================
// Auth records
// ============================================================================

/// A login session. Only the hash of the bearer secret is kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// Identifier (first half of the bearer token)
    pub id: SessionId,
    /// Owner
    pub user_id: UserId,
    /// SHA-256 of the secret half, hex
    pub secret_hash: String,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
    /// Client address at login
    pub ip_address: Option<String>,
    /// Client user agent at login
    pub user_agent: Option<String>,
}

/// A single-use login link. Only the hash of the secret is kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MagicLink {
    /// Identifier (first half of the token)
    pub id: MagicLinkId,
    /// Account email
    pub email: String,
    /// SHA-256 of the secret half, hex
    pub secret_hash: String,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
    /// Set once used
    pub consumed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn booking_at(start_hour: u32, end_hour: u32) -> Booking {
        let day = |h| Utc.with_ymd_and_hms(2025, 1, 6, h, 0, 0).unwrap();
        Booking {
            id: BookingId::new(),
            student_id: UserId::new(),
            tutor_id: UserId::new(),
            subject: "Math".to_string(),
            mode: LessonMode::Online,
            location: None,
            notes: None,
            start_at: day(start_hour),
            end_at: day(end_hour),
            price: Money::from_rupiah(150_000),
            platform_fee: Money::from_rupiah(15_000),
            status: BookingStatus::Confirmed,
            payment_deadline: day(start_hour),
            cancellation: None,
            confirmed_at: None,
            completed_at: None,
            created_at: day(0),
            updated_at: day(0),
            version: 1,
        }
    }

    #[test]
    fn test_enum_round_trip() {
        for status in [
            BookingStatus::PendingPayment,
            BookingStatus::Confirmed,
            BookingStatus::Completed,
            BookingStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<BookingStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&EscrowStatus::RefundPending).unwrap(),
            "\"refund_pending\""
        );
        assert!("paid_twice".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_money_percent_rounds_down() {
        assert_eq!(Money::from_rupiah(99_999).percent(10), Money::from_rupiah(9_999));
        assert_eq!(Money::from_rupiah(100).checked_sub(Money::from_rupiah(101)), None);
    }

    #[test]
    fn test_money_addition_is_checked() {
        let max = Money::from_rupiah(i64::MAX);
        assert_eq!(max.checked_add(Money::from_rupiah(1)), None);
        assert_eq!(max + Money::from_rupiah(1), max);
        assert_eq!(
            Money::from_rupiah(40_000).checked_add(Money::from_rupiah(2_500)),
            Some(Money::from_rupiah(42_500))
        );
        assert_eq!(max.percent(100), max);
    }

    #[test]
    fn test_money_rejects_negative_json() {
        assert_eq!(
            serde_json::from_str::<Money>("150000").unwrap(),
            Money::from_rupiah(150_000)
        );
        assert!(serde_json::from_str::<Money>("-1").is_err());
        assert_eq!(serde_json::to_string(&Money::from_rupiah(7)).unwrap(), "7");
    }

    #[test]
    fn test_money_parse_decimal() {
        assert_eq!(Money::parse_decimal("150000.00"), Some(Money::from_rupiah(150_000)));
        assert_eq!(Money::parse_decimal("150000"), Some(Money::from_rupiah(150_000)));
        assert_eq!(Money::parse_decimal("150000.50"), None);
        assert_eq!(Money::parse_decimal("-1.00"), None);
        assert_eq!(Money::parse_decimal("abc"), None);
    }

    #[test]
    fn test_back_to_back_bookings_do_not_overlap() {
        let booking = booking_at(9, 10);
        assert!(!booking.overlaps(booking.end_at, booking.end_at + chrono::Duration::hours(1)));
        assert!(booking.overlaps(
            booking.start_at + chrono::Duration::minutes(30),
            booking.end_at + chrono::Duration::minutes(30)
        ));
    }

    #[test]
    fn test_tutor_payout() {
        let booking = booking_at(9, 10);
        assert_eq!(booking.tutor_payout(), Money::from_rupiah(135_000));
        assert_eq!(booking.duration_minutes(), 60);
    }

    #[test]
    fn test_teaches_is_case_insensitive() {
        let now = Utc::now();
        let profile = TutorProfile {
            user_id: UserId::new(),
            headline: String::new(),
            bio: String::new(),
            subjects: vec!["English".to_string()],
            hourly_rate: Money::from_rupiah(100_000),
            city: None,
            teaching_modes: vec![LessonMode::Online],
            experience_years: 2,
            education: None,
            verified: true,
            rating_avg: 0.0,
            rating_count: 0,
            created_at: now,
            updated_at: now,
        };
        assert!(profile.teaches(" english "));
        assert!(!profile.teaches("Physics"));
    }
}
