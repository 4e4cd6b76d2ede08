//! Application state shared by every HTTP handler.

use crate::aggregates::BookingEnvironment;
use crate::auth::AuthService;
use crate::config::Config;
use crate::notify::{EmailProvider, StoreNotifier};
use crate::payment_gateway::PaymentGateway;
use crate::services::{
    BookingService, ChatService, CourseService, NotificationService, ReviewService, TutorService,
};
use crate::stores::Stores;
use axum::extract::FromRef;
use blajarplus_core::environment::Clock;
use blajarplus_web::handlers::health::ReadinessProbe;
use std::sync::Arc;

/// Readiness probes run by `GET /ready`.
pub type Probes = Arc<Vec<Arc<dyn ReadinessProbe>>>;

/// Application state shared across all HTTP handlers.
///
/// Every field is a cheap clone (services hold `Arc`s to the repositories).
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<Config>,
    /// Sign-in and sessions
    pub auth: AuthService,
    /// Booking lifecycle
    pub bookings: BookingService,
    /// Tutor profiles, search and availability
    pub tutors: TutorService,
    /// Reviews
    pub reviews: ReviewService,
    /// Chat
    pub chat: ChatService,
    /// Notification inbox
    pub notifications: NotificationService,
    /// Language courses
    pub courses: CourseService,
    /// Dependencies checked by the readiness endpoint
    pub probes: Probes,
}

impl AppState {
    /// Wire every service to the given stores and providers.
    #[must_use]
    pub fn new(
        config: Config,
        stores: &Stores,
        gateway: Arc<dyn PaymentGateway>,
        email: Arc<dyn EmailProvider>,
        clock: Arc<dyn Clock>,
        probes: Vec<Arc<dyn ReadinessProbe>>,
    ) -> Self {
        let utc_offset = config.booking.utc_offset();
        let notifier = StoreNotifier::new(
            Arc::clone(&stores.notifications),
            Arc::clone(&stores.users),
            Arc::clone(&email),
            Arc::clone(&clock),
            utc_offset,
        );
        let environment = BookingEnvironment::new(
            Arc::clone(&clock),
            gateway,
            Arc::new(notifier.clone()),
            config.booking.policy(),
        );

        Self {
            auth: AuthService::new(stores, email, Arc::clone(&clock), config.auth.clone()),
            bookings: BookingService::new(environment, stores),
            tutors: TutorService::new(stores, Arc::clone(&clock)),
            reviews: ReviewService::new(stores, notifier.clone(), Arc::clone(&clock)),
            chat: ChatService::new(stores, Arc::clone(&clock)),
            notifications: NotificationService::new(stores, Arc::clone(&clock)),
            courses: CourseService::new(stores, notifier, clock, utc_offset),
            probes: Arc::new(probes),
            config: Arc::new(config),
        }
    }
}

impl FromRef<AppState> for Probes {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.probes)
    }
}
