//! Tutor profiles, search, availability and earnings.

use super::{optional_text, text_field, ServiceError, ServiceResult};
use crate::stores::{BookingRepository, Page, Stores, TutorRepository, TutorSearch, TutorSort};
use crate::types::{
    AvailabilitySlot, EarningsSummary, LessonMode, Money, Role, TutorId, TutorListing,
    TutorProfile, User,
};
use blajarplus_core::environment::Clock;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

const MAX_PER_PAGE: u32 = 50;
const DEFAULT_PER_PAGE: u32 = 20;
const MAX_SUBJECTS: usize = 20;
const MAX_SLOTS: usize = 50;
const MAX_HOURLY_RATE: i64 = 10_000_000;

/// Body of `PUT /api/tutors/me`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProfileUpdate {
    /// One-line pitch
    pub headline: String,
    /// Longer description
    #[serde(default)]
    pub bio: String,
    /// Subjects taught
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Price per hour
    pub hourly_rate: Money,
    /// City for offline lessons
    #[serde(default)]
    pub city: Option<String>,
    /// Supported lesson modes
    pub teaching_modes: Vec<LessonMode>,
    /// Years of experience
    #[serde(default)]
    pub experience_years: i32,
    /// Education summary
    #[serde(default)]
    pub education: Option<String>,
}

/// Query string of `GET /api/tutors`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TutorQuery {
    /// Free text
    pub q: Option<String>,
    /// Subject
    pub subject: Option<String>,
    /// City
    pub city: Option<String>,
    /// Lesson mode
    pub mode: Option<LessonMode>,
    /// Minimum hourly rate (rupiah)
    pub min_rate: Option<i64>,
    /// Maximum hourly rate (rupiah)
    pub max_rate: Option<i64>,
    /// Minimum average rating
    pub min_rating: Option<f64>,
    /// Only verified tutors
    pub verified: Option<bool>,
    /// Ordering
    pub sort: Option<TutorSort>,
    /// 1-based page
    pub page: Option<u32>,
    /// Page size
    pub per_page: Option<u32>,
}

impl TutorQuery {
    /// Normalize into store filters: blank strings dropped, paging clamped.
    #[must_use]
    pub fn into_search(self) -> TutorSearch {
        let text = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        TutorSearch {
            query: text(self.q),
            subject: text(self.subject),
            city: text(self.city),
            mode: self.mode,
            min_rate: self.min_rate.map(Money::from_rupiah),
            max_rate: self.max_rate.map(Money::from_rupiah),
            min_rating: self.min_rating.filter(|r| r.is_finite()),
            verified_only: self.verified.unwrap_or(false),
            sort: self.sort.unwrap_or_default(),
            page: self.page.unwrap_or(1).max(1),
            per_page: self
                .per_page
                .unwrap_or(DEFAULT_PER_PAGE)
                .clamp(1, MAX_PER_PAGE),
        }
    }
}

/// Tutor operations.
#[derive(Clone)]
pub struct TutorService {
    tutors: Arc<dyn TutorRepository>,
    bookings: Arc<dyn BookingRepository>,
    clock: Arc<dyn Clock>,
}

impl TutorService {
    /// Create the service.
    #[must_use]
    pub fn new(stores: &Stores, clock: Arc<dyn Clock>) -> Self {
        Self {
            tutors: Arc::clone(&stores.tutors),
            bookings: Arc::clone(&stores.bookings),
            clock,
        }
    }

    /// Create or update the caller's profile.
    ///
    /// Rating and verification are kept; only admins change verification.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-tutors, `Validation` for bad input.
    pub async fn upsert_profile(&self, user: &User, update: ProfileUpdate) -> ServiceResult<TutorProfile> {
        require_tutor(user)?;
        let profile = self.validate_profile(user.id, update)?;
        let saved = self.tutors.upsert_profile(&profile).await?;
        info!(tutor_id = %user.id, "Tutor profile saved");
        Ok(saved)
    }

    fn validate_profile(&self, tutor: TutorId, update: ProfileUpdate) -> ServiceResult<TutorProfile> {
        let headline = text_field("headline", &update.headline, 1, 120)?;
        let bio = optional_text("bio", Some(&update.bio), 2000)?.unwrap_or_default();

        if update.subjects.len() > MAX_SUBJECTS {
            return Err(ServiceError::validation(format!(
                "at most {MAX_SUBJECTS} subjects are allowed"
            )));
        }
        let mut subjects: Vec<String> = Vec::with_capacity(update.subjects.len());
        for subject in &update.subjects {
            let subject = text_field("subject", subject, 1, 50)?;
            if !subjects.iter().any(|s| s.eq_ignore_ascii_case(&subject)) {
                subjects.push(subject);
            }
        }

        let rate = update.hourly_rate.rupiah();
        if rate <= 0 || rate > MAX_HOURLY_RATE {
            return Err(ServiceError::validation(format!(
                "hourly rate must be between 1 and {MAX_HOURLY_RATE} rupiah"
            )));
        }

        let mut teaching_modes = update.teaching_modes;
        teaching_modes.sort_by_key(LessonMode::as_str);
        teaching_modes.dedup();
        if teaching_modes.is_empty() {
            return Err(ServiceError::validation("at least one teaching mode is required"));
        }
        let city = optional_text("city", update.city.as_deref(), 100)?;
        if teaching_modes.contains(&LessonMode::Offline) && city.is_none() {
            return Err(ServiceError::validation("offline tutors must set a city"));
        }
        if !(0..=80).contains(&update.experience_years) {
            return Err(ServiceError::validation(
                "experience years must be between 0 and 80",
            ));
        }

        let now = self.clock.now();
        Ok(TutorProfile {
            user_id: tutor,
            headline,
            bio,
            subjects,
            hourly_rate: update.hourly_rate,
            city,
            teaching_modes,
            experience_years: update.experience_years,
            education: optional_text("education", update.education.as_deref(), 500)?,
            verified: false,
            rating_avg: 0.0,
            rating_count: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Public profile of a tutor.
    ///
    /// # Errors
    ///
    /// `NotFound` if the tutor has no profile.
    pub async fn get(&self, id: TutorId) -> ServiceResult<TutorListing> {
        self.tutors
            .get_listing(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("tutor", id))
    }

    /// Search tutors.
    ///
    /// # Errors
    ///
    /// `Validation` for an inverted rate range, storage failures.
    pub async fn search(&self, query: TutorQuery) -> ServiceResult<Page<TutorListing>> {
        let search = query.into_search();
        if let (Some(min), Some(max)) = (search.min_rate, search.max_rate) {
            if min > max {
                return Err(ServiceError::validation("min_rate must not exceed max_rate"));
            }
        }
        Ok(self.tutors.search(&search).await?)
    }

    /// Weekly availability of a tutor.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn availability(&self, id: TutorId) -> ServiceResult<Vec<AvailabilitySlot>> {
        Ok(self.tutors.availability(id).await?)
    }

    /// Replace the caller's weekly availability.
    ///
    /// An empty list removes every restriction.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-tutors, `NotFound` without a profile,
    /// `Validation` for bad or overlapping slots.
    pub async fn replace_availability(
        &self,
        user: &User,
        slots: Vec<AvailabilitySlot>,
    ) -> ServiceResult<Vec<AvailabilitySlot>> {
        require_tutor(user)?;
        if self.tutors.get_profile(user.id).await?.is_none() {
            return Err(ServiceError::not_found("tutor profile", user.id));
        }
        let slots = validate_slots(slots)?;
        self.tutors.replace_availability(user.id, &slots).await?;
        info!(tutor_id = %user.id, slots = slots.len(), "Availability replaced");
        Ok(slots)
    }

    /// Set or clear a tutor's verified flag (admins).
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-admins, `NotFound` without a profile.
    pub async fn set_verified(&self, admin: &User, id: TutorId, verified: bool) -> ServiceResult<TutorListing> {
        if admin.role != Role::Admin {
            return Err(ServiceError::forbidden("admin role required"));
        }
        if !self.tutors.set_verified(id, verified, self.clock.now()).await? {
            return Err(ServiceError::not_found("tutor", id));
        }
        info!(tutor_id = %id, verified, admin_id = %admin.id, "Tutor verification changed");
        self.get(id).await
    }

    /// Escrow totals for the calling tutor.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-tutors.
    pub async fn earnings(&self, user: &User) -> ServiceResult<EarningsSummary> {
        require_tutor(user)?;
        Ok(self.bookings.earnings(user.id).await?)
    }
}

fn require_tutor(user: &User) -> ServiceResult<()> {
    if user.role == Role::Tutor {
        Ok(())
    } else {
        Err(ServiceError::forbidden("tutor role required"))
    }
}

/// Check ranges and same-day overlaps; returns the slots ordered by day and start.
fn validate_slots(mut slots: Vec<AvailabilitySlot>) -> ServiceResult<Vec<AvailabilitySlot>> {
    if slots.len() > MAX_SLOTS {
        return Err(ServiceError::validation(format!(
            "at most {MAX_SLOTS} availability slots are allowed"
        )));
    }
    for slot in &slots {
        if slot.day_of_week > 6 {
            return Err(ServiceError::validation(
                "day_of_week must be 0 (Monday) to 6 (Sunday)",
            ));
        }
        if slot.start_time >= slot.end_time {
            return Err(ServiceError::validation(
                "availability start_time must be before end_time",
            ));
        }
    }
    slots.sort_by_key(|s| (s.day_of_week, s.start_time));
    if let Some(pair) = slots
        .windows(2)
        .find(|w| w[0].day_of_week == w[1].day_of_week && w[1].start_time < w[0].end_time)
    {
        return Err(ServiceError::validation(format!(
            "availability slots overlap on day {}",
            pair[0].day_of_week
        )));
    }
    Ok(slots)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::services::fixtures::{seed_tutor, seed_user};
    use crate::stores::memory::MemoryStore;
    use blajarplus_testing::test_clock;
    use chrono::NaiveTime;

    fn service() -> (TutorService, Arc<MemoryStore>) {
        let (stores, store) = Stores::memory();
        (TutorService::new(&stores, Arc::new(test_clock())), store)
    }

    fn slot(day: u8, start: u32, end: u32) -> AvailabilitySlot {
        AvailabilitySlot {
            day_of_week: day,
            start_time: NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
        }
    }

    fn update() -> ProfileUpdate {
        ProfileUpdate {
            headline: "  English conversation ".to_string(),
            bio: String::new(),
            subjects: vec!["English".to_string(), "english".to_string()],
            hourly_rate: Money::from_rupiah(120_000),
            city: None,
            teaching_modes: vec![LessonMode::Online, LessonMode::Online],
            experience_years: 3,
            education: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_profile_normalizes_input() {
        let (service, store) = service();
        let tutor = seed_user(&store, Role::Tutor, "Ayu").await;

        let profile = service.upsert_profile(&tutor, update()).await.unwrap();
        assert_eq!(profile.headline, "English conversation");
        assert_eq!(profile.subjects, vec!["English".to_string()]);
        assert_eq!(profile.teaching_modes, vec![LessonMode::Online]);
        assert!(!profile.verified);
    }

    #[tokio::test]
    async fn test_upsert_profile_rules() {
        let (service, store) = service();
        let student = seed_user(&store, Role::Student, "Dewi").await;
        let tutor = seed_user(&store, Role::Tutor, "Ayu").await;

        assert!(matches!(
            service.upsert_profile(&student, update()).await,
            Err(ServiceError::Forbidden(_))
        ));

        let mut offline_without_city = update();
        offline_without_city.teaching_modes = vec![LessonMode::Offline];
        assert!(matches!(
            service.upsert_profile(&tutor, offline_without_city).await,
            Err(ServiceError::Validation(_))
        ));

        let mut free = update();
        free.hourly_rate = Money::ZERO;
        assert!(service.upsert_profile(&tutor, free).await.is_err());
    }

    #[test]
    fn test_query_clamps_paging() {
        let search = TutorQuery {
            q: Some("   ".to_string()),
            page: Some(0),
            per_page: Some(500),
            ..TutorQuery::default()
        }
        .into_search();
        assert_eq!(search.query, None);
        assert_eq!(search.page, 1);
        assert_eq!(search.per_page, 50);
        assert_eq!(search.sort, TutorSort::Rating);
    }

    #[tokio::test]
    async fn test_search_rejects_inverted_rate_range() {
        let (service, _) = service();
        let query = TutorQuery {
            min_rate: Some(200_000),
            max_rate: Some(100_000),
            ..TutorQuery::default()
        };
        assert!(matches!(
            service.search(query).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn test_slots_are_validated_and_sorted() {
        let sorted = validate_slots(vec![slot(2, 13, 15), slot(0, 9, 12), slot(0, 12, 14)]).unwrap();
        assert_eq!(sorted[0], slot(0, 9, 12));
        assert_eq!(sorted[2], slot(2, 13, 15));

        assert!(validate_slots(vec![slot(7, 9, 10)]).is_err());
        assert!(validate_slots(vec![slot(1, 10, 10)]).is_err());
        assert!(validate_slots(vec![slot(1, 9, 12), slot(1, 11, 13)]).is_err());
    }

    #[tokio::test]
    async fn test_availability_requires_profile() {
        let (service, store) = service();
        let bare = seed_user(&store, Role::Tutor, "Ayu").await;
        assert!(matches!(
            service.replace_availability(&bare, vec![slot(0, 9, 12)]).await,
            Err(ServiceError::NotFound { .. })
        ));

        let tutor = seed_tutor(&store, "Budi").await;
        service
            .replace_availability(&tutor, vec![slot(0, 9, 12)])
            .await
            .unwrap();
        assert_eq!(service.availability(tutor.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_only_admins_verify() {
        let (service, store) = service();
        let tutor = seed_tutor(&store, "Budi").await;
        let admin = seed_user(&store, Role::Admin, "Ops").await;

        assert!(service.set_verified(&tutor, tutor.id, true).await.is_err());
        let listing = service.set_verified(&admin, tutor.id, false).await.unwrap();
        assert!(!listing.profile.verified);
    }
}
