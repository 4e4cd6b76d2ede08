//! Notifications: in-app rows plus best-effort email.
//!
//! The booking reducer only describes *that* somebody should hear about a
//! transition ([`BookingNotifier`]). [`StoreNotifier`] decides who, renders the
//! text, stores a [`Notification`] per recipient and mails them. Delivery
//! failures are logged and never fail the booking operation.

pub mod email;

pub use email::{ConsoleEmailProvider, EmailError, EmailProvider, SmtpEmailProvider, SmtpSettings};

use crate::stores::{NotificationRepository, UserRepository};
use crate::types::{Booking, BookingId, Notification, NotificationId, NotificationKind, UserId};
use blajarplus_core::environment::Clock;
use chrono::FixedOffset;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Receives booking transitions worth telling people about.
pub trait BookingNotifier: Send + Sync {
    /// Deliver a notification about `booking`.
    fn notify(
        &self,
        kind: NotificationKind,
        booking: Booking,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Remembers every call. Test double.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    calls: Arc<Mutex<Vec<(NotificationKind, BookingId)>>>,
}

impl RecordingNotifier {
    /// Calls so far, in order.
    #[must_use]
    pub fn recorded(&self) -> Vec<(NotificationKind, BookingId)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BookingNotifier for RecordingNotifier {
    fn notify(
        &self,
        kind: NotificationKind,
        booking: Booking,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, booking.id));
        Box::pin(async {})
    }
}

/// Who hears about a booking transition.
#[must_use]
pub fn recipients(kind: NotificationKind, booking: &Booking) -> Vec<UserId> {
    match kind {
        NotificationKind::BookingRequested | NotificationKind::NewReview => {
            vec![booking.tutor_id]
        }
        NotificationKind::BookingConfirmed
        | NotificationKind::BookingCancelled
        | NotificationKind::BookingCompleted => vec![booking.student_id, booking.tutor_id],
        NotificationKind::PaymentFailed
        | NotificationKind::RefundIssued
        | NotificationKind::CertificateIssued => vec![booking.student_id],
    }
}

/// Title and body for a booking notification, times in local time.
#[must_use]
pub fn render(kind: NotificationKind, booking: &Booking, offset: FixedOffset) -> (String, String) {
    let when = booking
        .start_at
        .with_timezone(&offset)
        .format("%A %d %B %Y, %H:%M");
    let session = format!("{} session on {when}", booking.subject);

    match kind {
        NotificationKind::BookingRequested => (
            "New booking request".to_string(),
            format!(
                "A student booked a {session} ({} minutes). It is confirmed once payment arrives.",
                booking.duration_minutes()
            ),
        ),
        NotificationKind::BookingConfirmed => (
            "Booking confirmed".to_string(),
            format!("Payment received. Your {session} is confirmed."),
        ),
        NotificationKind::BookingCancelled => {
            let reason = booking
                .cancellation
                .as_ref()
                .map(|c| format!(" Reason: {}", c.reason))
                .unwrap_or_default();
            (
                "Booking cancelled".to_string(),
                format!("The {session} was cancelled.{reason}"),
            )
        }
        NotificationKind::BookingCompleted => (
            "Session completed".to_string(),
            format!("The {session} is complete. Thank you for learning with BlajarPlus."),
        ),
        NotificationKind::PaymentFailed => (
            "Payment failed".to_string(),
            format!(
                "Payment for your {session} did not go through. You can try again before {}.",
                booking
                    .payment_deadline
                    .with_timezone(&offset)
                    .format("%H:%M")
            ),
        ),
        NotificationKind::RefundIssued => (
            "Refund issued".to_string(),
            format!(
                "{} for your {session} has been refunded.",
                booking.price
            ),
        ),
        NotificationKind::NewReview => (
            "New review".to_string(),
            format!("A student reviewed your {session}."),
        ),
        NotificationKind::CertificateIssued => (
            "Certificate issued".to_string(),
            "Congratulations, you earned a certificate.".to_string(),
        ),
    }
}

/// Stores notifications and sends email.
#[derive(Clone)]
pub struct StoreNotifier {
    notifications: Arc<dyn NotificationRepository>,
    users: Arc<dyn UserRepository>,
    email: Arc<dyn EmailProvider>,
    clock: Arc<dyn Clock>,
    utc_offset: FixedOffset,
}

impl StoreNotifier {
    /// Create a notifier.
    #[must_use]
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        users: Arc<dyn UserRepository>,
        email: Arc<dyn EmailProvider>,
        clock: Arc<dyn Clock>,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            notifications,
            users,
            email,
            clock,
            utc_offset,
        }
    }

    /// Store one notification for `user` and mail it.
    pub async fn deliver(
        &self,
        user: UserId,
        kind: NotificationKind,
        booking_id: Option<BookingId>,
        title: String,
        body: String,
    ) {
        let notification = Notification {
            id: NotificationId::new(),
            user_id: user,
            kind,
            title,
            body,
            booking_id,
            created_at: self.clock.now(),
            read_at: None,
        };

        if let Err(e) = self.notifications.insert_notification(&notification).await {
            warn!(user_id = %user, kind = %kind, error = %e, "failed to store notification");
        }

        match self.users.get_user(user).await {
            Ok(Some(recipient)) => {
                if let Err(e) = self
                    .email
                    .send_notification(&recipient.email, &notification.title, &notification.body)
                    .await
                {
                    warn!(user_id = %user, kind = %kind, error = %e, "notification email failed");
                }
            }
            Ok(None) => debug!(user_id = %user, "notification recipient has no account"),
            Err(e) => warn!(user_id = %user, error = %e, "failed to look up recipient"),
        }
    }

    /// Notify the parties of a booking.
    pub async fn booking_event(&self, kind: NotificationKind, booking: &Booking) {
        let (title, body) = render(kind, booking, self.utc_offset);
        for user in recipients(kind, booking) {
            self.deliver(user, kind, Some(booking.id), title.clone(), body.clone())
                .await;
        }
    }
}

impl BookingNotifier for StoreNotifier {
    fn notify(
        &self,
        kind: NotificationKind,
        booking: Booking,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let notifier = self.clone();
        Box::pin(async move { notifier.booking_event(kind, &booking).await })
    }
}

impl std::fmt::Debug for StoreNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreNotifier")
            .field("utc_offset", &self.utc_offset)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stores::memory::MemoryStore;
    use crate::types::{BookingStatus, LessonMode, Money, Role, User};
    use async_trait::async_trait;
    use blajarplus_testing::{test_clock, FixedClock};
    use chrono::Duration;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl EmailProvider for Outbox {
        async fn send_magic_link(
            &self,
            _to: &str,
            _link: &str,
            _expires_at: chrono::DateTime<chrono::Utc>,
        ) -> Result<(), EmailError> {
            Ok(())
        }

        async fn send_notification(
            &self,
            to: &str,
            subject: &str,
            _body: &str,
        ) -> Result<(), EmailError> {
            self.0
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string()));
            Ok(())
        }
    }

    fn user(role: Role, email: &str) -> User {
        User {
            id: UserId::new(),
            email: email.to_string(),
            name: email.to_string(),
            role,
            phone: None,
            avatar_url: None,
            created_at: test_clock().now(),
            updated_at: test_clock().now(),
        }
    }

    fn booking(student: UserId, tutor: UserId) -> Booking {
        let now = test_clock().now();
        let start_at = now + Duration::days(2) + Duration::hours(3);
        Booking {
            id: BookingId::new(),
            student_id: student,
            tutor_id: tutor,
            subject: "Matematika".to_string(),
            mode: LessonMode::Online,
            location: None,
            notes: None,
            start_at,
            end_at: start_at + Duration::minutes(90),
            price: Money::from_rupiah(150_000),
            platform_fee: Money::from_rupiah(15_000),
            status: BookingStatus::Confirmed,
            payment_deadline: now + Duration::hours(1),
            cancellation: None,
            confirmed_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[test]
    fn test_recipients() {
        let b = booking(UserId::new(), UserId::new());
        assert_eq!(recipients(NotificationKind::BookingRequested, &b), vec![b.tutor_id]);
        assert_eq!(
            recipients(NotificationKind::BookingConfirmed, &b),
            vec![b.student_id, b.tutor_id]
        );
        assert_eq!(recipients(NotificationKind::RefundIssued, &b), vec![b.student_id]);
    }

    #[test]
    fn test_render_uses_local_time() {
        let b = booking(UserId::new(), UserId::new());
        let offset = FixedOffset::east_opt(7 * 3600).unwrap();
        let (title, body) = render(NotificationKind::BookingConfirmed, &b, offset);
        assert_eq!(title, "Booking confirmed");
        // 2025-01-08T03:00Z is 10:00 in UTC+7.
        assert!(body.contains("Wednesday 08 January 2025, 10:00"), "{body}");
    }

    #[tokio::test]
    async fn test_store_notifier_stores_and_mails_each_party() {
        let store = Arc::new(MemoryStore::new());
        let student = user(Role::Student, "siti@example.com");
        let tutor = user(Role::Tutor, "budi@example.com");
        store.insert_user(&student).await.unwrap();
        store.insert_user(&tutor).await.unwrap();

        let outbox = Arc::new(Outbox::default());
        let notifier = StoreNotifier::new(
            store.clone(),
            store.clone(),
            outbox.clone(),
            Arc::new(FixedClock::new(test_clock().now())),
            FixedOffset::east_opt(7 * 3600).unwrap(),
        );

        let b = booking(student.id, tutor.id);
        notifier.notify(NotificationKind::BookingCompleted, b.clone()).await;

        for party in [student.id, tutor.id] {
            let rows = store.notifications_for(party, true, 10).await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].kind, NotificationKind::BookingCompleted);
            assert_eq!(rows[0].booking_id, Some(b.id));
        }
        let sent = outbox.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().any(|(to, _)| to == "siti@example.com"));
    }

    #[tokio::test]
    async fn test_recording_notifier() {
        let recorder = RecordingNotifier::default();
        let b = booking(UserId::new(), UserId::new());
        recorder.notify(NotificationKind::PaymentFailed, b.clone()).await;
        assert_eq!(recorder.recorded(), vec![(NotificationKind::PaymentFailed, b.id)]);
    }
}
