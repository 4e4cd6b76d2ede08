//! In-memory implementation of every repository.
//!
//! A single mutex guards all tables, so multi-table operations (booking
//! insert with overlap check, review insert with rating update) are atomic
//! exactly like their PostgreSQL transactions. Used by the test suites and by
//! `STORAGE=memory` for local demos.

use super::{
    BookingFilter, BookingRepository, ChatRepository, CompletionRequest, CourseFilter,
    CourseRepository, LessonCompletion, MessageCursor, NotificationRepository, Page, ReviewRepository,
    SessionRepository, StoreError, StoreResult, TutorRepository, TutorSearch, TutorSort,
    UserRepository,
};
use crate::types::{
    AvailabilitySlot, Booking, BookingId, BookingStatus, Certificate, Conversation,
    ConversationId, ConversationSummary, Course, CourseId, EarningsSummary, Enrollment,
    EscrowStatus, LearnerProfile, Lesson, LessonId, MagicLink, MagicLinkId, Message,
    Notification, NotificationId, Payment, PaymentId, Review, Session, SessionId, TutorId,
    TutorListing, TutorProfile, User, UserId,
};
use async_trait::async_trait;
use blajarplus_web::handlers::health::ReadinessProbe;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    magic_links: HashMap<MagicLinkId, MagicLink>,
    sessions: HashMap<SessionId, Session>,
    tutor_profiles: HashMap<TutorId, TutorProfile>,
    availability: HashMap<TutorId, Vec<AvailabilitySlot>>,
    bookings: HashMap<BookingId, Booking>,
    payments: HashMap<PaymentId, Payment>,
    reviews: Vec<Review>,
    conversations: HashMap<ConversationId, Conversation>,
    messages: Vec<Message>,
    notifications: Vec<Notification>,
    courses: HashMap<CourseId, Course>,
    lessons: Vec<Lesson>,
    enrollments: HashMap<(CourseId, UserId), Enrollment>,
    completions: HashSet<(UserId, LessonId)>,
    learners: HashMap<UserId, LearnerProfile>,
    certificates: Vec<Certificate>,
}

impl Tables {
    fn listing(&self, profile: &TutorProfile) -> TutorListing {
        let user = self.users.get(&profile.user_id);
        TutorListing {
            profile: profile.clone(),
            name: user.map(|u| u.name.clone()).unwrap_or_default(),
            avatar_url: user.and_then(|u| u.avatar_url.clone()),
        }
    }

    fn latest_payment(&self, booking: BookingId) -> Option<&Payment> {
        self.payments
            .values()
            .filter(|p| p.booking_id == booking)
            .max_by_key(|p| p.attempt)
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl ReadinessProbe for MemoryStore {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn check(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        let mut tables = self.tables();
        if tables.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict("email is already registered".to_string()));
        }
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.tables().users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self
            .tables()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn update_user(&self, user: &User) -> StoreResult<()> {
        let mut tables = self.tables();
        let stored = tables
            .users
            .get_mut(&user.id)
            .ok_or_else(|| StoreError::not_found("user", user.id))?;
        *stored = user.clone();
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn insert_magic_link(&self, link: &MagicLink) -> StoreResult<()> {
        self.tables().magic_links.insert(link.id, link.clone());
        Ok(())
    }

    async fn get_magic_link(&self, id: MagicLinkId) -> StoreResult<Option<MagicLink>> {
        Ok(self.tables().magic_links.get(&id).cloned())
    }

    async fn consume_magic_link(&self, id: MagicLinkId, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables();
        match tables.magic_links.get_mut(&id) {
            Some(link) if link.consumed_at.is_none() => {
                link.consumed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        self.tables().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> StoreResult<Option<Session>> {
        Ok(self.tables().sessions.get(&id).cloned())
    }

    async fn delete_session(&self, id: SessionId) -> StoreResult<()> {
        self.tables().sessions.remove(&id);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables();
        let before = tables.sessions.len() + tables.magic_links.len();
        tables.sessions.retain(|_, s| s.expires_at > now);
        tables.magic_links.retain(|_, l| l.expires_at > now);
        let after = tables.sessions.len() + tables.magic_links.len();
        Ok((before - after) as u64)
    }
}

#[async_trait]
impl TutorRepository for MemoryStore {
    async fn upsert_profile(&self, profile: &TutorProfile) -> StoreResult<TutorProfile> {
        let mut tables = self.tables();
        let mut stored = profile.clone();
        if let Some(existing) = tables.tutor_profiles.get(&profile.user_id) {
            stored.rating_avg = existing.rating_avg;
            stored.rating_count = existing.rating_count;
            stored.verified = existing.verified;
            stored.created_at = existing.created_at;
        }
        tables.tutor_profiles.insert(stored.user_id, stored.clone());
        Ok(stored)
    }

    async fn get_profile(&self, id: TutorId) -> StoreResult<Option<TutorProfile>> {
        Ok(self.tables().tutor_profiles.get(&id).cloned())
    }

    async fn get_listing(&self, id: TutorId) -> StoreResult<Option<TutorListing>> {
        let tables = self.tables();
        Ok(tables
            .tutor_profiles
            .get(&id)
            .map(|profile| tables.listing(profile)))
    }

    async fn search(&self, search: &TutorSearch) -> StoreResult<Page<TutorListing>> {
        let tables = self.tables();
        let mut matches: Vec<TutorListing> = tables
            .tutor_profiles
            .values()
            .map(|profile| tables.listing(profile))
            .filter(|listing| search.matches(listing))
            .collect();

        matches.sort_by(|a, b| {
            let (a, b) = (&a.profile, &b.profile);
            match search.sort {
                TutorSort::Rating => b
                    .rating_avg
                    .total_cmp(&a.rating_avg)
                    .then(b.rating_count.cmp(&a.rating_count)),
                TutorSort::PriceAsc => a.hourly_rate.cmp(&b.hourly_rate),
                TutorSort::PriceDesc => b.hourly_rate.cmp(&a.hourly_rate),
                TutorSort::Newest => b.created_at.cmp(&a.created_at),
            }
            .then(a.user_id.cmp(&b.user_id))
        });

        let total = i64::try_from(matches.len()).unwrap_or(i64::MAX);
        let offset = usize::try_from(search.offset()).unwrap_or(usize::MAX);
        let items = matches
            .into_iter()
            .skip(offset)
            .take(search.per_page as usize)
            .collect();

        Ok(Page {
            items,
            total,
            page: search.page,
            per_page: search.per_page,
        })
    }

    async fn set_verified(
        &self,
        id: TutorId,
        verified: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables();
        Ok(tables.tutor_profiles.get_mut(&id).is_some_and(|profile| {
            profile.verified = verified;
            profile.updated_at = at;
            true
        }))
    }

    async fn replace_availability(
        &self,
        id: TutorId,
        slots: &[AvailabilitySlot],
    ) -> StoreResult<()> {
        let mut sorted = slots.to_vec();
        sorted.sort_by_key(|s| (s.day_of_week, s.start_time));
        self.tables().availability.insert(id, sorted);
        Ok(())
    }

    async fn availability(&self, id: TutorId) -> StoreResult<Vec<AvailabilitySlot>> {
        Ok(self
            .tables()
            .availability
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl BookingRepository for MemoryStore {
    async fn insert_booking(&self, booking: &Booking) -> StoreResult<()> {
        let mut tables = self.tables();
        let active = tables
            .bookings
            .values()
            .filter(|b| b.is_active() && b.overlaps(booking.start_at, booking.end_at));
        for existing in active {
            if existing.tutor_id == booking.tutor_id {
                return Err(StoreError::SlotTaken { party: "tutor" });
            }
            if existing.student_id == booking.student_id {
                return Err(StoreError::SlotTaken { party: "student" });
            }
        }
        if tables.bookings.contains_key(&booking.id) {
            return Err(StoreError::Conflict(format!("booking {} exists", booking.id)));
        }
        tables.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn load(&self, id: BookingId) -> StoreResult<Option<(Booking, Option<Payment>)>> {
        let tables = self.tables();
        Ok(tables
            .bookings
            .get(&id)
            .map(|booking| (booking.clone(), tables.latest_payment(id).cloned())))
    }

    async fn save_booking(
        &self,
        booking: &Booking,
        expected_version: i64,
        payment: Option<&Payment>,
    ) -> StoreResult<()> {
        let mut tables = self.tables();
        let stored_version = tables
            .bookings
            .get(&booking.id)
            .map(|b| b.version)
            .ok_or_else(|| StoreError::not_found("booking", booking.id))?;
        if stored_version != expected_version {
            return Err(StoreError::Conflict(
                "booking was modified concurrently".to_string(),
            ));
        }

        if let Some(payment) = payment {
            let other_live = tables.payments.values().any(|p| {
                p.booking_id == payment.booking_id && p.id != payment.id && p.is_live()
            });
            if payment.is_live() && other_live {
                return Err(StoreError::Conflict(
                    "booking already has a live payment".to_string(),
                ));
            }
            let order_taken = tables
                .payments
                .values()
                .any(|p| p.order_id == payment.order_id && p.id != payment.id);
            if order_taken {
                return Err(StoreError::Conflict(format!(
                    "order id {} is already used",
                    payment.order_id
                )));
            }
            tables.payments.insert(payment.id, payment.clone());
        }

        tables.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn list_bookings(&self, filter: &BookingFilter) -> StoreResult<Vec<Booking>> {
        let tables = self.tables();
        let mut bookings: Vec<Booking> = tables
            .bookings
            .values()
            .filter(|b| filter.participant.is_none_or(|user| b.involves(user)))
            .filter(|b| filter.status.is_none_or(|status| b.status == status))
            .cloned()
            .collect();
        bookings.sort_by(|a, b| a.start_at.cmp(&b.start_at).then(a.id.cmp(&b.id)));
        Ok(bookings
            .into_iter()
            .skip(usize::try_from(filter.offset).unwrap_or(0))
            .take(usize::try_from(filter.limit).unwrap_or(0))
            .collect())
    }

    async fn find_by_order_id(&self, order_id: &str) -> StoreResult<Option<BookingId>> {
        Ok(self
            .tables()
            .payments
            .values()
            .find(|p| p.order_id == order_id)
            .map(|p| p.booking_id))
    }

    async fn due_for_expiry(
        &self,
        now: DateTime<Utc>,
        skip: &[BookingId],
        limit: i64,
    ) -> StoreResult<Vec<BookingId>> {
        let tables = self.tables();
        let mut due: Vec<&Booking> = tables
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::PendingPayment && b.payment_deadline <= now)
            .filter(|b| !skip.contains(&b.id))
            .collect();
        due.sort_by_key(|b| b.payment_deadline);
        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|b| b.id)
            .collect())
    }

    async fn due_for_completion(
        &self,
        ended_before: DateTime<Utc>,
        skip: &[BookingId],
        limit: i64,
    ) -> StoreResult<Vec<BookingId>> {
        let tables = self.tables();
        let mut due: Vec<&Booking> = tables
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Confirmed && b.end_at <= ended_before)
            .filter(|b| !skip.contains(&b.id))
            .collect();
        due.sort_by_key(|b| b.end_at);
        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|b| b.id)
            .collect())
    }

    async fn earnings(&self, tutor: TutorId) -> StoreResult<EarningsSummary> {
        let tables = self.tables();
        let mut summary = EarningsSummary::default();
        for booking in tables.bookings.values().filter(|b| b.tutor_id == tutor) {
            if booking.status == BookingStatus::Completed {
                summary.completed_sessions += 1;
            }
            for payment in tables.payments.values().filter(|p| p.booking_id == booking.id) {
                match payment.escrow {
                    EscrowStatus::Held => summary.held = summary.held + payment.amount,
                    EscrowStatus::Released => {
                        summary.released = summary.released + booking.tutor_payout();
                        summary.platform_fees = summary.platform_fees + booking.platform_fee;
                    }
                    EscrowStatus::RefundPending => {
                        summary.refund_pending = summary.refund_pending + payment.amount;
                    }
                    EscrowStatus::Refunded => summary.refunded = summary.refunded + payment.amount,
                    EscrowStatus::None => {}
                }
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl ReviewRepository for MemoryStore {
    async fn insert_review(&self, review: &Review) -> StoreResult<()> {
        let mut tables = self.tables();
        if tables.reviews.iter().any(|r| r.booking_id == review.booking_id) {
            return Err(StoreError::Conflict(
                "booking has already been reviewed".to_string(),
            ));
        }
        let profile = tables
            .tutor_profiles
            .get_mut(&review.tutor_id)
            .ok_or_else(|| StoreError::not_found("tutor", review.tutor_id))?;
        #[allow(clippy::cast_precision_loss)]
        {
            let total = profile.rating_avg * profile.rating_count as f64 + f64::from(review.rating);
            profile.rating_count += 1;
            profile.rating_avg = total / profile.rating_count as f64;
        }
        tables.reviews.push(review.clone());
        Ok(())
    }

    async fn review_for_booking(&self, booking: BookingId) -> StoreResult<Option<Review>> {
        Ok(self
            .tables()
            .reviews
            .iter()
            .find(|r| r.booking_id == booking)
            .cloned())
    }

    async fn reviews_for_tutor(
        &self,
        tutor: TutorId,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Review>> {
        let tables = self.tables();
        let mut reviews: Vec<Review> = tables
            .reviews
            .iter()
            .filter(|r| r.tutor_id == tutor)
            .cloned()
            .collect();
        reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(reviews
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }
}

#[async_trait]
impl ChatRepository for MemoryStore {
    async fn get_or_create_conversation(
        &self,
        student: UserId,
        tutor: TutorId,
        now: DateTime<Utc>,
    ) -> StoreResult<Conversation> {
        let mut tables = self.tables();
        if let Some(existing) = tables
            .conversations
            .values()
            .find(|c| c.student_id == student && c.tutor_id == tutor)
        {
            return Ok(existing.clone());
        }
        let conversation = Conversation {
            id: ConversationId::new(),
            student_id: student,
            tutor_id: tutor,
            created_at: now,
            last_message_at: None,
        };
        tables
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        Ok(self.tables().conversations.get(&id).cloned())
    }

    async fn conversations_for(&self, user: UserId) -> StoreResult<Vec<ConversationSummary>> {
        let tables = self.tables();
        let mut summaries: Vec<ConversationSummary> = tables
            .conversations
            .values()
            .filter(|c| c.involves(user))
            .map(|conversation| {
                let thread = tables
                    .messages
                    .iter()
                    .filter(|m| m.conversation_id == conversation.id);
                let last_message = thread.clone().max_by_key(|m| m.created_at).cloned();
                let unread = thread
                    .filter(|m| m.sender_id != user && m.read_at.is_none())
                    .count();
                ConversationSummary {
                    conversation: conversation.clone(),
                    last_message,
                    unread_count: i64::try_from(unread).unwrap_or(i64::MAX),
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            let activity = |s: &ConversationSummary| {
                s.conversation
                    .last_message_at
                    .unwrap_or(s.conversation.created_at)
            };
            activity(b).cmp(&activity(a))
        });
        Ok(summaries)
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let mut tables = self.tables();
        let conversation = tables
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| StoreError::not_found("conversation", message.conversation_id))?;
        conversation.last_message_at = Some(message.created_at);
        tables.messages.push(message.clone());
        Ok(())
    }

    async fn messages(
        &self,
        conversation: ConversationId,
        before: Option<MessageCursor>,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        let tables = self.tables();
        let mut messages: Vec<Message> = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation)
            .filter(|m| before.is_none_or(|cursor| cursor.precedes(m)))
            .cloned()
            .collect();
        messages.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        messages.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(messages)
    }

    async fn mark_read(
        &self,
        conversation: ConversationId,
        reader: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut tables = self.tables();
        let mut changed = 0;
        for message in tables.messages.iter_mut().filter(|m| {
            m.conversation_id == conversation && m.sender_id != reader && m.read_at.is_none()
        }) {
            message.read_at = Some(at);
            changed += 1;
        }
        Ok(changed)
    }
}

#[async_trait]
impl NotificationRepository for MemoryStore {
    async fn insert_notification(&self, notification: &Notification) -> StoreResult<()> {
        self.tables().notifications.push(notification.clone());
        Ok(())
    }

    async fn notifications_for(
        &self,
        user: UserId,
        unread_only: bool,
        limit: i64,
    ) -> StoreResult<Vec<Notification>> {
        let tables = self.tables();
        let mut notifications: Vec<Notification> = tables
            .notifications
            .iter()
            .filter(|n| n.user_id == user && (!unread_only || n.read_at.is_none()))
            .cloned()
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        notifications.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(notifications)
    }

    async fn mark_notification_read(
        &self,
        id: NotificationId,
        user: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables();
        Ok(tables
            .notifications
            .iter_mut()
            .find(|n| n.id == id && n.user_id == user)
            .is_some_and(|n| {
                n.read_at.get_or_insert(at);
                true
            }))
    }
}

#[async_trait]
impl CourseRepository for MemoryStore {
    async fn insert_course(&self, course: &Course) -> StoreResult<()> {
        self.tables().courses.insert(course.id, course.clone());
        Ok(())
    }

    async fn get_course(&self, id: CourseId) -> StoreResult<Option<Course>> {
        Ok(self.tables().courses.get(&id).cloned())
    }

    async fn list_courses(&self, filter: &CourseFilter) -> StoreResult<Vec<Course>> {
        let tables = self.tables();
        let mut courses: Vec<Course> = tables
            .courses
            .values()
            .filter(|c| c.published || filter.author == Some(c.author_id))
            .filter(|c| {
                filter
                    .language
                    .as_deref()
                    .is_none_or(|l| c.language.eq_ignore_ascii_case(l))
            })
            .filter(|c| filter.level.is_none_or(|level| c.level == level))
            .cloned()
            .collect();
        courses.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(courses)
    }

    async fn insert_lesson(&self, lesson: &Lesson) -> StoreResult<()> {
        let mut tables = self.tables();
        if tables
            .lessons
            .iter()
            .any(|l| l.course_id == lesson.course_id && l.position == lesson.position)
        {
            return Err(StoreError::Conflict(format!(
                "position {} is already used",
                lesson.position
            )));
        }
        tables.lessons.push(lesson.clone());
        Ok(())
    }

    async fn lessons(&self, course: CourseId) -> StoreResult<Vec<Lesson>> {
        let tables = self.tables();
        let mut lessons: Vec<Lesson> = tables
            .lessons
            .iter()
            .filter(|l| l.course_id == course)
            .cloned()
            .collect();
        lessons.sort_by_key(|l| l.position);
        Ok(lessons)
    }

    async fn enrollment(&self, course: CourseId, user: UserId) -> StoreResult<Option<Enrollment>> {
        Ok(self.tables().enrollments.get(&(course, user)).cloned())
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StoreResult<bool> {
        let mut tables = self.tables();
        let key = (enrollment.course_id, enrollment.user_id);
        if tables.enrollments.contains_key(&key) {
            return Ok(false);
        }
        tables.enrollments.insert(key, enrollment.clone());
        Ok(true)
    }

    async fn enrollments_for(&self, user: UserId) -> StoreResult<Vec<Enrollment>> {
        let tables = self.tables();
        let mut enrollments: Vec<Enrollment> = tables
            .enrollments
            .values()
            .filter(|e| e.user_id == user)
            .cloned()
            .collect();
        enrollments.sort_by(|a, b| b.enrolled_at.cmp(&a.enrolled_at));
        Ok(enrollments)
    }

    async fn record_completion(
        &self,
        request: &CompletionRequest,
    ) -> StoreResult<LessonCompletion> {
        let mut tables = self.tables();
        let user = request.user_id;
        let key = (request.course_id, user);
        let missing = || StoreError::NotFound {
            entity: "enrollment",
            id: format!("{}/{user}", request.course_id),
        };
        if !tables.enrollments.contains_key(&key) {
            return Err(missing());
        }
        if !tables.completions.insert((user, request.lesson_id)) {
            return Err(StoreError::Conflict("lesson already completed".to_string()));
        }

        let lessons: Vec<LessonId> = tables
            .lessons
            .iter()
            .filter(|l| l.course_id == request.course_id)
            .map(|l| l.id)
            .collect();
        let finished = lessons
            .iter()
            .all(|lesson| tables.completions.contains(&(user, *lesson)));

        let Some(enrollment) = tables.enrollments.get_mut(&key) else {
            return Err(missing());
        };
        enrollment.completed_lessons.push(request.lesson_id);
        let mut certificate = None;
        if finished && enrollment.completed_at.is_none() {
            enrollment.completed_at = Some(request.completed_at);
            certificate = Some(request.certificate.clone());
        }
        let enrollment = enrollment.clone();

        let profile = tables
            .learners
            .entry(user)
            .or_insert_with(|| LearnerProfile::new(user));
        profile.award(request.xp, request.activity_day);
        let profile = profile.clone();

        if let Some(certificate) = &certificate {
            tables.certificates.push(certificate.clone());
        }
        Ok(LessonCompletion {
            lesson_id: request.lesson_id,
            enrollment,
            profile,
            certificate,
            completed_at: request.completed_at,
        })
    }

    async fn learner_profile(&self, user: UserId) -> StoreResult<Option<LearnerProfile>> {
        Ok(self.tables().learners.get(&user).cloned())
    }

    async fn certificates_for(&self, user: UserId) -> StoreResult<Vec<Certificate>> {
        let tables = self.tables();
        let mut certificates: Vec<Certificate> = tables
            .certificates
            .iter()
            .filter(|c| c.user_id == user)
            .cloned()
            .collect();
        certificates.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(certificates)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{LessonMode, Money, PaymentStatus, Role};
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-06T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn booking(student: UserId, tutor: UserId, start_hour: i64) -> Booking {
        let start_at = now() + Duration::hours(start_hour);
        Booking {
            id: BookingId::new(),
            student_id: student,
            tutor_id: tutor,
            subject: "English".to_string(),
            mode: LessonMode::Online,
            location: None,
            notes: None,
            start_at,
            end_at: start_at + Duration::hours(1),
            price: Money::from_rupiah(100_000),
            platform_fee: Money::from_rupiah(10_000),
            status: BookingStatus::PendingPayment,
            payment_deadline: now() + Duration::hours(1),
            cancellation: None,
            confirmed_at: None,
            completed_at: None,
            created_at: now(),
            updated_at: now(),
            version: 0,
        }
    }

    fn payment(booking: &Booking, attempt: i32, status: PaymentStatus) -> Payment {
        Payment {
            id: PaymentId::new(),
            booking_id: booking.id,
            order_id: format!("BP-{}-{attempt}", booking.id),
            attempt,
            amount: booking.price,
            status,
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
            created_at: now(),
            updated_at: now(),
        }
    }

    #[tokio::test]
    async fn test_overlapping_booking_rejected_for_tutor_and_student() {
        let store = MemoryStore::new();
        let (student, tutor) = (UserId::new(), UserId::new());
        store.insert_booking(&booking(student, tutor, 10)).await.unwrap();

        let clash = store.insert_booking(&booking(UserId::new(), tutor, 10)).await;
        assert!(matches!(clash, Err(StoreError::SlotTaken { party: "tutor" })));

        let clash = store.insert_booking(&booking(student, UserId::new(), 10)).await;
        assert!(matches!(clash, Err(StoreError::SlotTaken { party: "student" })));

        // Back-to-back is fine.
        store.insert_booking(&booking(student, tutor, 11)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_booking_frees_slot() {
        let store = MemoryStore::new();
        let (student, tutor) = (UserId::new(), UserId::new());
        let mut first = booking(student, tutor, 10);
        store.insert_booking(&first).await.unwrap();

        first.status = BookingStatus::Cancelled;
        first.version = 1;
        store.save_booking(&first, 0, None).await.unwrap();

        store.insert_booking(&booking(UserId::new(), tutor, 10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let store = MemoryStore::new();
        let mut b = booking(UserId::new(), UserId::new(), 10);
        store.insert_booking(&b).await.unwrap();
        b.version = 1;
        store.save_booking(&b, 0, None).await.unwrap();
        b.version = 2;
        let stale = store.save_booking(&b, 0, None).await;
        assert!(matches!(stale, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_second_live_payment_rejected() {
        let store = MemoryStore::new();
        let mut b = booking(UserId::new(), UserId::new(), 10);
        store.insert_booking(&b).await.unwrap();

        let first = payment(&b, 1, PaymentStatus::Pending);
        b.version = 1;
        store.save_booking(&b, 0, Some(&first)).await.unwrap();

        let second = payment(&b, 2, PaymentStatus::Pending);
        b.version = 2;
        let result = store.save_booking(&b, 1, Some(&second)).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        let (_, latest) = store.load(b.id).await.unwrap().unwrap();
        assert_eq!(latest.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_review_updates_rating() {
        let store = MemoryStore::new();
        let tutor = UserId::new();
        store
            .insert_user(&User {
                id: tutor,
                email: "guru@example.com".to_string(),
                name: "Guru".to_string(),
                role: Role::Tutor,
                phone: None,
                avatar_url: None,
                created_at: now(),
                updated_at: now(),
            })
            .await
            .unwrap();
        store
            .upsert_profile(&TutorProfile {
                user_id: tutor,
                headline: "Math".to_string(),
                bio: String::new(),
                subjects: vec![],
                hourly_rate: Money::from_rupiah(100_000),
                city: None,
                teaching_modes: vec![LessonMode::Online],
                experience_years: 1,
                education: None,
                verified: false,
                rating_avg: 0.0,
                rating_count: 0,
                created_at: now(),
                updated_at: now(),
            })
            .await
            .unwrap();

        for rating in [5, 4] {
            store
                .insert_review(&Review {
                    id: crate::types::ReviewId::new(),
                    booking_id: BookingId::new(),
                    tutor_id: tutor,
                    student_id: UserId::new(),
                    rating,
                    comment: None,
                    created_at: now(),
                })
                .await
                .unwrap();
        }

        let profile = store.get_profile(tutor).await.unwrap().unwrap();
        assert_eq!(profile.rating_count, 2);
        assert!((profile.rating_avg - 4.5).abs() < f64::EPSILON);
    }
}
