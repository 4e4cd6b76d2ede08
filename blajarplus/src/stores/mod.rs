//! Storage traits.
//!
//! Services depend on these traits through `Arc<dyn …>`. Two implementations
//! exist: [`memory::MemoryStore`] (tests, `STORAGE=memory`) and
//! [`postgres::PgStore`] (production). Both enforce the same invariants:
//!
//! - `insert_booking` checks tutor and student overlap and inserts atomically
//! - `save_booking` refuses stale versions
//! - at most one `pending`/`paid` payment per booking
//! - one review per booking, one conversation per student/tutor pair

pub mod memory;
pub mod postgres;

use crate::types::{
    AvailabilitySlot, Booking, BookingId, BookingStatus, Certificate, Conversation,
    ConversationId, ConversationSummary, Course, CourseId, CourseLevel, EarningsSummary,
    Enrollment, LearnerProfile, Lesson, LessonId, LessonMode, MagicLink, MagicLinkId, Message,
    MessageId, Money, Notification, NotificationId, Payment, Review, Session, SessionId, TutorId,
    TutorListing, TutorProfile, User, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Store result
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Row does not exist
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity name
        entity: &'static str,
        /// Looked-up key
        id: String,
    },

    /// Uniqueness or optimistic version check failed
    #[error("conflict: {0}")]
    Conflict(String),

    /// The time slot overlaps an active booking
    #[error("the {party} already has a session at that time")]
    SlotTaken {
        /// `"tutor"` or `"student"`
        party: &'static str,
    },

    /// Backend failure
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// A page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Total matches across all pages
    pub total: i64,
    /// 1-based page number
    pub page: u32,
    /// Page size
    pub per_page: u32,
}

/// Sort order for tutor search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TutorSort {
    /// Highest rating first (ties: more reviews first)
    #[default]
    Rating,
    /// Cheapest first
    PriceAsc,
    /// Most expensive first
    PriceDesc,
    /// Newest profiles first
    Newest,
}

/// Tutor search filters.
#[derive(Debug, Clone, PartialEq)]
pub struct TutorSearch {
    /// Free text over name, headline and bio
    pub query: Option<String>,
    /// Subject taught (case-insensitive)
    pub subject: Option<String>,
    /// City (case-insensitive)
    pub city: Option<String>,
    /// Lesson mode offered
    pub mode: Option<LessonMode>,
    /// Minimum hourly rate
    pub min_rate: Option<Money>,
    /// Maximum hourly rate
    pub max_rate: Option<Money>,
    /// Minimum average rating
    pub min_rating: Option<f64>,
    /// Only admin-verified tutors
    pub verified_only: bool,
    /// Ordering
    pub sort: TutorSort,
    /// 1-based page
    pub page: u32,
    /// Page size
    pub per_page: u32,
}

impl Default for TutorSearch {
    fn default() -> Self {
        Self {
            query: None,
            subject: None,
            city: None,
            mode: None,
            min_rate: None,
            max_rate: None,
            min_rating: None,
            verified_only: false,
            sort: TutorSort::Rating,
            page: 1,
            per_page: 20,
        }
    }
}

impl TutorSearch {
    /// Rows to skip for the requested page.
    #[must_use]
    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.per_page)
    }

    /// Whether a listing passes every filter (sorting and paging excluded).
    #[must_use]
    pub fn matches(&self, listing: &TutorListing) -> bool {
        let profile = &listing.profile;
        let contains = |haystack: &str, needle: &str| {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        };

        self.query.as_deref().is_none_or(|q| {
            contains(&listing.name, q) || contains(&profile.headline, q) || contains(&profile.bio, q)
        }) && self.subject.as_deref().is_none_or(|s| {
            profile.subjects.iter().any(|taught| taught.eq_ignore_ascii_case(s))
        }) && self.city.as_deref().is_none_or(|c| {
            profile.city.as_deref().is_some_and(|city| city.eq_ignore_ascii_case(c))
        }) && self.mode.is_none_or(|m| profile.teaching_modes.contains(&m))
            && self.min_rate.is_none_or(|r| profile.hourly_rate >= r)
            && self.max_rate.is_none_or(|r| profile.hourly_rate <= r)
            && self.min_rating.is_none_or(|r| profile.rating_avg >= r)
            && (!self.verified_only || profile.verified)
    }
}

/// Booking list filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    /// Student or tutor of the booking (`None` = everyone, admins only)
    pub participant: Option<UserId>,
    /// Status
    pub status: Option<BookingStatus>,
    /// Page size
    pub limit: i64,
    /// Rows to skip
    pub offset: i64,
}

/// Course catalogue filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourseFilter {
    /// Taught language
    pub language: Option<String>,
    /// Difficulty
    pub level: Option<CourseLevel>,
    /// Include unpublished courses by this author
    pub author: Option<UserId>,
}

/// A lesson a learner just finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    /// Course
    pub course_id: CourseId,
    /// Learner
    pub user_id: UserId,
    /// Completed lesson
    pub lesson_id: LessonId,
    /// XP the lesson awards
    pub xp: i64,
    /// When
    pub completed_at: DateTime<Utc>,
    /// Learner's local day, for the streak
    pub activity_day: NaiveDate,
    /// Issued only if this completion finishes the course
    pub certificate: Certificate,
}

/// Everything that changed when a learner completed a lesson.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonCompletion {
    /// Completed lesson
    pub lesson_id: LessonId,
    /// Enrollment after the completion
    pub enrollment: Enrollment,
    /// Learner profile after XP and streak updates
    pub profile: LearnerProfile,
    /// Certificate, when this completion finished the course
    pub certificate: Option<Certificate>,
    /// When
    pub completed_at: DateTime<Utc>,
}

/// Accounts.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a new user; `Conflict` if the email is taken.
    async fn insert_user(&self, user: &User) -> StoreResult<()>;

    /// Get a user by id.
    async fn get_user(&self, id: UserId) -> StoreResult<Option<User>>;

    /// Get a user by (lower-cased) email.
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    /// Update name, phone, avatar and role.
    async fn update_user(&self, user: &User) -> StoreResult<()>;
}

/// Magic links and sessions.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Store a new magic link.
    async fn insert_magic_link(&self, link: &MagicLink) -> StoreResult<()>;

    /// Get a magic link by id.
    async fn get_magic_link(&self, id: MagicLinkId) -> StoreResult<Option<MagicLink>>;

    /// Mark a link consumed. Returns `false` if it was already consumed.
    async fn consume_magic_link(&self, id: MagicLinkId, at: DateTime<Utc>) -> StoreResult<bool>;

    /// Store a new session.
    async fn insert_session(&self, session: &Session) -> StoreResult<()>;

    /// Get a session by id.
    async fn get_session(&self, id: SessionId) -> StoreResult<Option<Session>>;

    /// Delete a session (logout).
    async fn delete_session(&self, id: SessionId) -> StoreResult<()>;

    /// Drop expired sessions and links. Returns how many rows went away.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

/// Tutor profiles and availability.
#[async_trait]
pub trait TutorRepository: Send + Sync {
    /// Create or replace the tutor's profile (rating fields are kept).
    async fn upsert_profile(&self, profile: &TutorProfile) -> StoreResult<TutorProfile>;

    /// Get a profile.
    async fn get_profile(&self, id: TutorId) -> StoreResult<Option<TutorProfile>>;

    /// Get a profile with the owner's public details.
    async fn get_listing(&self, id: TutorId) -> StoreResult<Option<TutorListing>>;

    /// Filtered, sorted, paginated search.
    async fn search(&self, search: &TutorSearch) -> StoreResult<Page<TutorListing>>;

    /// Set the verified flag. Returns `false` if the tutor has no profile.
    async fn set_verified(&self, id: TutorId, verified: bool, at: DateTime<Utc>)
    -> StoreResult<bool>;

    /// Replace the weekly availability.
    async fn replace_availability(&self, id: TutorId, slots: &[AvailabilitySlot])
    -> StoreResult<()>;

    /// Weekly availability, ordered by day and start time.
    async fn availability(&self, id: TutorId) -> StoreResult<Vec<AvailabilitySlot>>;
}

/// Bookings and their payments.
#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Insert a booking if neither party has an overlapping active booking.
    async fn insert_booking(&self, booking: &Booking) -> StoreResult<()>;

    /// Booking and its latest payment attempt.
    async fn load(&self, id: BookingId) -> StoreResult<Option<(Booking, Option<Payment>)>>;

    /// Persist a changed booking and payment.
    ///
    /// The booking row is only written if its stored version equals
    /// `expected_version`; otherwise `Conflict`.
    async fn save_booking(
        &self,
        booking: &Booking,
        expected_version: i64,
        payment: Option<&Payment>,
    ) -> StoreResult<()>;

    /// Bookings matching a filter, soonest session first.
    async fn list_bookings(&self, filter: &BookingFilter) -> StoreResult<Vec<Booking>>;

    /// Booking owning a payment order id.
    async fn find_by_order_id(&self, order_id: &str) -> StoreResult<Option<BookingId>>;

    /// Unpaid bookings whose payment deadline is at or before `now`,
    /// leaving out `skip`.
    async fn due_for_expiry(
        &self,
        now: DateTime<Utc>,
        skip: &[BookingId],
        limit: i64,
    ) -> StoreResult<Vec<BookingId>>;

    /// Confirmed bookings that ended at or before `ended_before`, leaving out
    /// `skip`.
    async fn due_for_completion(
        &self,
        ended_before: DateTime<Utc>,
        skip: &[BookingId],
        limit: i64,
    ) -> StoreResult<Vec<BookingId>>;

    /// Escrow totals for a tutor.
    async fn earnings(&self, tutor: TutorId) -> StoreResult<EarningsSummary>;
}

/// Reviews and tutor ratings.
#[async_trait]
pub trait ReviewRepository: Send + Sync {
    /// Insert a review and update the tutor's rating in one step.
    /// `Conflict` if the booking was already reviewed.
    async fn insert_review(&self, review: &Review) -> StoreResult<()>;

    /// Review for a booking.
    async fn review_for_booking(&self, booking: BookingId) -> StoreResult<Option<Review>>;

    /// Reviews for a tutor, newest first.
    async fn reviews_for_tutor(
        &self,
        tutor: TutorId,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Review>>;
}

/// Chat.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    /// Conversation for a student/tutor pair, created if missing.
    async fn get_or_create_conversation(
        &self,
        student: UserId,
        tutor: TutorId,
        now: DateTime<Utc>,
    ) -> StoreResult<Conversation>;

    /// Get a conversation.
    async fn get_conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>>;

    /// Inbox for a user, most recently active first.
    async fn conversations_for(&self, user: UserId) -> StoreResult<Vec<ConversationSummary>>;

    /// Append a message and bump the conversation's activity time.
    async fn insert_message(&self, message: &Message) -> StoreResult<()>;

    /// Messages newest first, optionally only those older than `before`.
    async fn messages(
        &self,
        conversation: ConversationId,
        before: Option<MessageCursor>,
        limit: i64,
    ) -> StoreResult<Vec<Message>>;

    /// Mark the other participant's messages read. Returns how many changed.
    async fn mark_read(
        &self,
        conversation: ConversationId,
        reader: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<u64>;
}

/// Keyset position in a conversation, ordered by `(created_at, id)`.
///
/// Without an id only messages strictly older than `created_at` follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCursor {
    /// Send time of the last message already seen
    pub created_at: DateTime<Utc>,
    /// Its id, to split messages sent in the same instant
    pub id: Option<MessageId>,
}

impl MessageCursor {
    /// The `(created_at, id)` key; a missing id sorts before every real one.
    #[must_use]
    pub fn key(&self) -> (DateTime<Utc>, Uuid) {
        (
            self.created_at,
            self.id.map_or(Uuid::nil(), MessageId::into_uuid),
        )
    }

    /// Whether `message` comes after this cursor in newest-first order.
    #[must_use]
    pub fn precedes(&self, message: &Message) -> bool {
        (message.created_at, message.id.into_uuid()) < self.key()
    }
}

/// In-app notifications.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Store a notification.
    async fn insert_notification(&self, notification: &Notification) -> StoreResult<()>;

    /// A user's notifications, newest first.
    async fn notifications_for(
        &self,
        user: UserId,
        unread_only: bool,
        limit: i64,
    ) -> StoreResult<Vec<Notification>>;

    /// Mark read. Returns `false` if it does not exist or belongs to someone else.
    async fn mark_notification_read(
        &self,
        id: NotificationId,
        user: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;
}

/// Language courses and learner progress.
#[async_trait]
pub trait CourseRepository: Send + Sync {
    /// Create a course.
    async fn insert_course(&self, course: &Course) -> StoreResult<()>;

    /// Get a course.
    async fn get_course(&self, id: CourseId) -> StoreResult<Option<Course>>;

    /// Published courses (plus the author's own drafts), newest first.
    async fn list_courses(&self, filter: &CourseFilter) -> StoreResult<Vec<Course>>;

    /// Add a lesson.
    async fn insert_lesson(&self, lesson: &Lesson) -> StoreResult<()>;

    /// Lessons ordered by position.
    async fn lessons(&self, course: CourseId) -> StoreResult<Vec<Lesson>>;

    /// A learner's enrollment.
    async fn enrollment(&self, course: CourseId, user: UserId) -> StoreResult<Option<Enrollment>>;

    /// Enroll. Returns `false` if already enrolled.
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StoreResult<bool>;

    /// All of a learner's enrollments.
    async fn enrollments_for(&self, user: UserId) -> StoreResult<Vec<Enrollment>>;

    /// Record a lesson completion, award its XP and issue the certificate
    /// when no lesson of the course is left. Runs as one unit per learner.
    /// `Conflict` if the lesson was already completed, `NotFound` without
    /// an enrollment.
    async fn record_completion(
        &self,
        request: &CompletionRequest,
    ) -> StoreResult<LessonCompletion>;

    /// Learner profile, if the learner completed anything.
    async fn learner_profile(&self, user: UserId) -> StoreResult<Option<LearnerProfile>>;

    /// Certificates, newest first.
    async fn certificates_for(&self, user: UserId) -> StoreResult<Vec<Certificate>>;
}

/// Every repository the application needs.
#[derive(Clone)]
pub struct Stores {
    /// Accounts
    pub users: Arc<dyn UserRepository>,
    /// Auth sessions
    pub sessions: Arc<dyn SessionRepository>,
    /// Tutors
    pub tutors: Arc<dyn TutorRepository>,
    /// Bookings and payments
    pub bookings: Arc<dyn BookingRepository>,
    /// Reviews
    pub reviews: Arc<dyn ReviewRepository>,
    /// Chat
    pub chat: Arc<dyn ChatRepository>,
    /// Notifications
    pub notifications: Arc<dyn NotificationRepository>,
    /// Courses
    pub courses: Arc<dyn CourseRepository>,
}

impl Stores {
    /// All repositories backed by one in-memory store.
    #[must_use]
    pub fn memory() -> (Self, Arc<memory::MemoryStore>) {
        let store = Arc::new(memory::MemoryStore::new());
        (Self::from_backend(&store), store)
    }

    /// All repositories backed by PostgreSQL.
    #[must_use]
    pub fn postgres(store: postgres::PgStore) -> (Self, Arc<postgres::PgStore>) {
        let store = Arc::new(store);
        (Self::from_backend(&store), store)
    }

    fn from_backend<B>(backend: &Arc<B>) -> Self
    where
        B: UserRepository
            + SessionRepository
            + TutorRepository
            + BookingRepository
            + ReviewRepository
            + ChatRepository
            + NotificationRepository
            + CourseRepository
            + 'static,
    {
        Self {
            users: backend.clone(),
            sessions: backend.clone(),
            tutors: backend.clone(),
            bookings: backend.clone(),
            reviews: backend.clone(),
            chat: backend.clone(),
            notifications: backend.clone(),
            courses: backend.clone(),
        }
    }
}
