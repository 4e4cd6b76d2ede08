//! Seed data shared by the service tests.

#![allow(clippy::unwrap_used)]

use crate::stores::memory::MemoryStore;
use crate::stores::{TutorRepository, UserRepository};
use crate::types::{LessonMode, Money, Role, TutorProfile, User, UserId};
use blajarplus_core::environment::Clock;
use blajarplus_testing::test_clock;

pub(crate) fn user(role: Role, name: &str) -> User {
    let now = test_clock().now();
    User {
        id: UserId::new(),
        email: format!("{}@example.com", name.to_lowercase().replace(' ', ".")),
        name: name.to_string(),
        role,
        phone: None,
        avatar_url: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) async fn seed_user(store: &MemoryStore, role: Role, name: &str) -> User {
    let user = user(role, name);
    store.insert_user(&user).await.unwrap();
    user
}

pub(crate) fn profile(tutor: &User) -> TutorProfile {
    let now = test_clock().now();
    TutorProfile {
        user_id: tutor.id,
        headline: "Patient maths tutor".to_string(),
        bio: "Ten years of high school mathematics".to_string(),
        subjects: vec!["Mathematics".to_string()],
        hourly_rate: Money::from_rupiah(100_000),
        city: Some("Bandung".to_string()),
        teaching_modes: vec![LessonMode::Online, LessonMode::Offline],
        experience_years: 10,
        education: None,
        verified: true,
        rating_avg: 0.0,
        rating_count: 0,
        created_at: now,
        updated_at: now,
    }
}

/// A tutor account with a verified profile and no availability limits.
pub(crate) async fn seed_tutor(store: &MemoryStore, name: &str) -> User {
    let tutor = seed_user(store, Role::Tutor, name).await;
    store.upsert_profile(&profile(&tutor)).await.unwrap();
    tutor
}
