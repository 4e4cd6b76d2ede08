//! Reviews of completed bookings.

use super::{optional_text, ServiceError, ServiceResult};
use crate::aggregates::BookingError;
use crate::notify::StoreNotifier;
use crate::stores::{BookingRepository, ReviewRepository, StoreError, Stores};
use crate::types::{
    BookingId, BookingStatus, NotificationKind, Review, ReviewId, TutorId, User,
};
use blajarplus_core::environment::Clock;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Body of `POST /api/bookings/:id/review`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewReview {
    /// 1..=5
    pub rating: u8,
    /// Optional text
    #[serde(default)]
    pub comment: Option<String>,
}

/// Review operations.
#[derive(Clone)]
pub struct ReviewService {
    bookings: Arc<dyn BookingRepository>,
    reviews: Arc<dyn ReviewRepository>,
    notifier: StoreNotifier,
    clock: Arc<dyn Clock>,
}

impl ReviewService {
    /// Create the service.
    #[must_use]
    pub fn new(stores: &Stores, notifier: StoreNotifier, clock: Arc<dyn Clock>) -> Self {
        Self {
            bookings: Arc::clone(&stores.bookings),
            reviews: Arc::clone(&stores.reviews),
            notifier,
            clock,
        }
    }

    /// Review a completed booking. Each booking can be reviewed once, by its
    /// student.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Forbidden` for anyone but the student, `Conflict` for
    /// bookings that are not completed or already reviewed, `Validation`.
    pub async fn create(&self, student: &User, booking_id: BookingId, input: NewReview) -> ServiceResult<Review> {
        let (booking, _) = self
            .bookings
            .load(booking_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("booking", booking_id))?;
        if booking.student_id != student.id {
            return Err(ServiceError::forbidden(
                "only the booking's student can review it",
            ));
        }
        if booking.status != BookingStatus::Completed {
            return Err(BookingError::InvalidTransition {
                action: "review",
                status: booking.status,
            }
            .into());
        }
        if !(1..=5).contains(&input.rating) {
            return Err(ServiceError::validation("rating must be between 1 and 5"));
        }
        let comment = optional_text("comment", input.comment.as_deref(), 2000)?;

        let review = Review {
            id: ReviewId::new(),
            booking_id,
            tutor_id: booking.tutor_id,
            student_id: student.id,
            rating: input.rating,
            comment,
            created_at: self.clock.now(),
        };
        self.reviews.insert_review(&review).await.map_err(|e| match e {
            StoreError::Conflict(_) => ServiceError::Conflict("booking was already reviewed".to_string()),
            other => other.into(),
        })?;
        info!(
            review_id = %review.id,
            booking_id = %booking_id,
            tutor_id = %review.tutor_id,
            rating = review.rating,
            "Review created"
        );

        self.notifier
            .deliver(
                review.tutor_id,
                NotificationKind::NewReview,
                Some(booking_id),
                format!("New {}-star review", review.rating),
                format!(
                    "{} reviewed your {} session.",
                    student.name, booking.subject
                ),
            )
            .await;
        Ok(review)
    }

    /// Reviews for a tutor, newest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn for_tutor(
        &self,
        tutor: TutorId,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> ServiceResult<Vec<Review>> {
        let limit = limit.unwrap_or(20).clamp(1, 100);
        let offset = offset.unwrap_or(0).max(0);
        Ok(self.reviews.reviews_for_tutor(tutor, limit, offset).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::notify::ConsoleEmailProvider;
    use crate::services::fixtures::{seed_tutor, seed_user};
    use crate::stores::memory::MemoryStore;
    use crate::stores::{NotificationRepository, TutorRepository};
    use crate::types::{Booking, LessonMode, Money, Role};
    use blajarplus_testing::test_clock;
    use chrono::{Duration, FixedOffset};

    async fn setup() -> (ReviewService, Arc<MemoryStore>, User, User) {
        let (stores, store) = Stores::memory();
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        let notifier = StoreNotifier::new(
            Arc::clone(&stores.notifications),
            Arc::clone(&stores.users),
            Arc::new(ConsoleEmailProvider::new()),
            Arc::clone(&clock),
            FixedOffset::east_opt(7 * 3600).unwrap(),
        );
        let student = seed_user(&store, Role::Student, "Siti").await;
        let tutor = seed_tutor(&store, "Budi").await;
        (ReviewService::new(&stores, notifier, clock), store, student, tutor)
    }

    async fn booking(
        store: &MemoryStore,
        student: &User,
        tutor: &User,
        status: BookingStatus,
        days_ago: i64,
    ) -> Booking {
        let start = test_clock().now() - Duration::days(days_ago);
        let booking = Booking {
            id: BookingId::new(),
            student_id: student.id,
            tutor_id: tutor.id,
            subject: "Mathematics".to_string(),
            mode: LessonMode::Online,
            location: None,
            notes: None,
            start_at: start,
            end_at: start + Duration::hours(1),
            price: Money::from_rupiah(100_000),
            platform_fee: Money::from_rupiah(10_000),
            status,
            payment_deadline: start,
            cancellation: None,
            confirmed_at: None,
            completed_at: None,
            created_at: start,
            updated_at: start,
            version: 0,
        };
        store.insert_booking(&booking).await.unwrap();
        booking
    }

    fn five_stars() -> NewReview {
        NewReview {
            rating: 5,
            comment: Some("Very clear explanations".to_string()),
        }
    }

    #[tokio::test]
    async fn test_review_updates_rating_and_notifies_tutor() {
        let (service, store, student, tutor) = setup().await;
        let done = booking(&store, &student, &tutor, BookingStatus::Completed, 1).await;

        service.create(&student, done.id, five_stars()).await.unwrap();

        let profile = store.get_profile(tutor.id).await.unwrap().unwrap();
        assert_eq!(profile.rating_count, 1);
        assert!((profile.rating_avg - 5.0).abs() < f64::EPSILON);
        let inbox = store.notifications_for(tutor.id, true, 10).await.unwrap();
        assert_eq!(inbox[0].kind, NotificationKind::NewReview);
        assert_eq!(service.for_tutor(tutor.id, None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_review_once_per_booking() {
        let (service, store, student, tutor) = setup().await;
        let done = booking(&store, &student, &tutor, BookingStatus::Completed, 1).await;

        service.create(&student, done.id, five_stars()).await.unwrap();
        assert!(matches!(
            service.create(&student, done.id, five_stars()).await,
            Err(ServiceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_review_rules() {
        let (service, store, student, tutor) = setup().await;
        let confirmed = booking(&store, &student, &tutor, BookingStatus::Confirmed, 1).await;
        assert!(matches!(
            service.create(&student, confirmed.id, five_stars()).await,
            Err(ServiceError::Booking(BookingError::InvalidTransition { .. }))
        ));

        let done = booking(&store, &student, &tutor, BookingStatus::Completed, 2).await;
        assert!(matches!(
            service.create(&tutor, done.id, five_stars()).await,
            Err(ServiceError::Forbidden(_))
        ));
        let zero = NewReview {
            rating: 0,
            comment: None,
        };
        assert!(matches!(
            service.create(&student, done.id, zero).await,
            Err(ServiceError::Validation(_))
        ));
    }
}
