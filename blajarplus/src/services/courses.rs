//! Self-paced language courses with XP, levels, streaks and certificates.

use super::{optional_text, text_field, ServiceError, ServiceResult};
use crate::notify::StoreNotifier;
use crate::stores::{
    CompletionRequest, CourseFilter, CourseRepository, LessonCompletion, StoreError, Stores,
};
use crate::types::{
    Certificate, CertificateId, Course, CourseId, CourseLevel, Enrollment, LearnerProfile,
    Lesson, LessonId, NotificationKind, Role, User,
};
use blajarplus_core::environment::Clock;
use chrono::FixedOffset;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub use crate::types::{level_for, XP_PER_LEVEL};

const DEFAULT_XP_REWARD: i32 = 10;
const MAX_XP_REWARD: i32 = 1000;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Body of `POST /api/courses`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewCourse {
    /// Title
    pub title: String,
    /// Taught language
    pub language: String,
    /// Difficulty
    pub level: CourseLevel,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Visible in the catalogue
    #[serde(default)]
    pub published: bool,
}

/// Body of `POST /api/courses/:id/lessons`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewLesson {
    /// Title
    pub title: String,
    /// Material (markdown)
    #[serde(default)]
    pub content: String,
    /// Ordering; defaults to after the last lesson
    #[serde(default)]
    pub position: Option<i32>,
    /// XP awarded on completion
    #[serde(default)]
    pub xp_reward: Option<i32>,
}

/// Query string of `GET /api/courses`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CourseQuery {
    /// Taught language
    pub language: Option<String>,
    /// Difficulty
    pub level: Option<CourseLevel>,
}

/// A course with its lessons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourseDetails {
    /// Course
    #[serde(flatten)]
    pub course: Course,
    /// Lessons by position
    pub lessons: Vec<Lesson>,
}

/// Result of completing a lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LessonProgress {
    /// XP just earned
    pub xp_awarded: i32,
    /// Enrollment after the completion
    pub enrollment: Enrollment,
    /// Learner profile after the completion
    pub profile: LearnerProfile,
    /// Certificate, if the course is now finished
    pub certificate: Option<Certificate>,
}

/// A learner's overall progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// XP, level and streaks
    pub profile: LearnerProfile,
    /// Course memberships
    pub enrollments: Vec<Enrollment>,
}

/// Random `BPC-XXXXXXXX` certificate code.
#[must_use]
pub fn certificate_code() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
        .collect();
    format!("BPC-{suffix}")
}

/// Course operations.
#[derive(Clone)]
pub struct CourseService {
    courses: Arc<dyn CourseRepository>,
    notifier: StoreNotifier,
    clock: Arc<dyn Clock>,
    utc_offset: FixedOffset,
}

impl CourseService {
    /// Create the service.
    #[must_use]
    pub fn new(
        stores: &Stores,
        notifier: StoreNotifier,
        clock: Arc<dyn Clock>,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            courses: Arc::clone(&stores.courses),
            notifier,
            clock,
            utc_offset,
        }
    }

    /// Create a course (tutors and admins).
    ///
    /// # Errors
    ///
    /// `Forbidden` for students, `Validation`.
    pub async fn create(&self, author: &User, input: NewCourse) -> ServiceResult<Course> {
        if author.role == Role::Student {
            return Err(ServiceError::forbidden("only tutors and admins can create courses"));
        }
        let course = Course {
            id: CourseId::new(),
            author_id: author.id,
            title: text_field("title", &input.title, 1, 200)?,
            language: text_field("language", &input.language, 1, 50)?.to_lowercase(),
            level: input.level,
            description: optional_text("description", Some(&input.description), 5000)?
                .unwrap_or_default(),
            published: input.published,
            created_at: self.clock.now(),
        };
        self.courses.insert_course(&course).await?;
        info!(course_id = %course.id, author_id = %author.id, "Course created");
        Ok(course)
    }

    /// Add a lesson to a course (its author or an admin).
    ///
    /// # Errors
    ///
    /// `NotFound`, `Forbidden`, `Validation`, `Conflict` for a taken position.
    pub async fn add_lesson(&self, user: &User, course_id: CourseId, input: NewLesson) -> ServiceResult<Lesson> {
        let course = self.course(course_id).await?;
        if course.author_id != user.id && user.role != Role::Admin {
            return Err(ServiceError::forbidden("only the course author can add lessons"));
        }
        let xp_reward = input.xp_reward.unwrap_or(DEFAULT_XP_REWARD);
        if !(0..=MAX_XP_REWARD).contains(&xp_reward) {
            return Err(ServiceError::validation(format!(
                "xp_reward must be between 0 and {MAX_XP_REWARD}"
            )));
        }
        let position = match input.position {
            Some(position) if position < 1 => {
                return Err(ServiceError::validation("position must be at least 1"));
            }
            Some(position) => position,
            None => {
                let lessons = self.courses.lessons(course_id).await?;
                lessons.iter().map(|l| l.position).max().unwrap_or(0) + 1
            }
        };

        let lesson = Lesson {
            id: LessonId::new(),
            course_id,
            title: text_field("title", &input.title, 1, 200)?,
            content: input.content,
            position,
            xp_reward,
        };
        self.courses.insert_lesson(&lesson).await?;
        Ok(lesson)
    }

    /// Catalogue: published courses, plus the viewer's own drafts.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn list(&self, viewer: Option<&User>, query: CourseQuery) -> ServiceResult<Vec<Course>> {
        let filter = CourseFilter {
            language: query
                .language
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty()),
            level: query.level,
            author: viewer.map(|u| u.id),
        };
        Ok(self.courses.list_courses(&filter).await?)
    }

    /// A course with its lessons. Drafts are visible to their author and admins.
    ///
    /// # Errors
    ///
    /// `NotFound`.
    pub async fn get(&self, viewer: Option<&User>, id: CourseId) -> ServiceResult<CourseDetails> {
        let course = self.visible_course(viewer, id).await?;
        let lessons = self.courses.lessons(id).await?;
        Ok(CourseDetails { course, lessons })
    }

    /// Join a course. Enrolling twice returns the existing enrollment.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or unpublished courses.
    pub async fn enroll(&self, user: &User, id: CourseId) -> ServiceResult<Enrollment> {
        self.visible_course(Some(user), id).await?;
        let enrollment = Enrollment {
            course_id: id,
            user_id: user.id,
            completed_lessons: Vec::new(),
            enrolled_at: self.clock.now(),
            completed_at: None,
        };
        if self.courses.insert_enrollment(&enrollment).await? {
            info!(course_id = %id, user_id = %user.id, "Enrolled");
            return Ok(enrollment);
        }
        self.courses
            .enrollment(id, user.id)
            .await?
            .ok_or_else(|| ServiceError::not_found("enrollment", id))
    }

    /// Complete a lesson: award XP, update the streak, and issue a
    /// certificate when it was the course's last open lesson.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown lessons, `Forbidden` when not enrolled,
    /// `Conflict` when the lesson was already completed.
    pub async fn complete_lesson(
        &self,
        user: &User,
        course_id: CourseId,
        lesson_id: LessonId,
    ) -> ServiceResult<LessonProgress> {
        let lessons = self.courses.lessons(course_id).await?;
        let lesson = lessons
            .iter()
            .find(|l| l.id == lesson_id)
            .ok_or_else(|| ServiceError::not_found("lesson", lesson_id))?;
        let enrollment = self
            .courses
            .enrollment(course_id, user.id)
            .await?
            .ok_or_else(|| ServiceError::forbidden("enroll in the course first"))?;
        if enrollment.completed_lessons.contains(&lesson_id) {
            return Err(ServiceError::Conflict("lesson already completed".to_string()));
        }

        // XP, streak and the finished check are applied by the store inside
        // one locked unit, so concurrent completions cannot lose updates.
        let now = self.clock.now();
        let request = CompletionRequest {
            course_id,
            user_id: user.id,
            lesson_id,
            xp: i64::from(lesson.xp_reward),
            completed_at: now,
            activity_day: now.with_timezone(&self.utc_offset).date_naive(),
            certificate: Certificate {
                id: CertificateId::new(),
                user_id: user.id,
                course_id,
                code: certificate_code(),
                issued_at: now,
            },
        };
        let completion = self
            .courses
            .record_completion(&request)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(message) => ServiceError::Conflict(message),
                StoreError::NotFound { .. } => ServiceError::forbidden("enroll in the course first"),
                other => other.into(),
            })?;

        if let Some(certificate) = &completion.certificate {
            info!(
                course_id = %course_id,
                user_id = %user.id,
                code = %certificate.code,
                "Certificate issued"
            );
            let title = self.course(course_id).await.map_or_else(
                |_| "your course".to_string(),
                |course| course.title,
            );
            self.notifier
                .deliver(
                    user.id,
                    NotificationKind::CertificateIssued,
                    None,
                    "Certificate earned".to_string(),
                    format!(
                        "You completed {title}. Certificate code: {}",
                        certificate.code
                    ),
                )
                .await;
        }

        let LessonCompletion {
            enrollment,
            profile,
            certificate,
            ..
        } = completion;
        Ok(LessonProgress {
            xp_awarded: lesson.xp_reward,
            enrollment,
            profile,
            certificate,
        })
    }

    /// XP, level, streaks and enrollments.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn progress(&self, user: &User) -> ServiceResult<Progress> {
        let profile = self
            .courses
            .learner_profile(user.id)
            .await?
            .unwrap_or_else(|| LearnerProfile::new(user.id));
        let enrollments = self.courses.enrollments_for(user.id).await?;
        Ok(Progress {
            profile,
            enrollments,
        })
    }

    /// Certificates, newest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn certificates(&self, user: &User) -> ServiceResult<Vec<Certificate>> {
        Ok(self.courses.certificates_for(user.id).await?)
    }

    async fn course(&self, id: CourseId) -> ServiceResult<Course> {
        self.courses
            .get_course(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("course", id))
    }

    async fn visible_course(&self, viewer: Option<&User>, id: CourseId) -> ServiceResult<Course> {
        let course = self.course(id).await?;
        let privileged =
            viewer.is_some_and(|u| u.id == course.author_id || u.role == Role::Admin);
        if course.published || privileged {
            Ok(course)
        } else {
            Err(ServiceError::not_found("course", id))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::notify::ConsoleEmailProvider;
    use crate::services::fixtures::seed_user;
    use crate::stores::NotificationRepository;
    use crate::stores::memory::MemoryStore;
    use crate::types::UserId;
    use blajarplus_testing::{test_clock, ManualClock};
    use chrono::{Duration, NaiveDate};
    use proptest::prelude::*;

    struct Setup {
        service: CourseService,
        store: Arc<MemoryStore>,
        clock: ManualClock,
        tutor: User,
        learner: User,
    }

    async fn setup() -> Setup {
        let (stores, store) = Stores::memory();
        let clock = ManualClock::new(test_clock().now());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let offset = FixedOffset::east_opt(7 * 3600).unwrap();
        let notifier = StoreNotifier::new(
            Arc::clone(&stores.notifications),
            Arc::clone(&stores.users),
            Arc::new(ConsoleEmailProvider::new()),
            Arc::clone(&shared),
            offset,
        );
        Setup {
            service: CourseService::new(&stores, notifier, shared, offset),
            tutor: seed_user(&store, Role::Tutor, "Budi").await,
            learner: seed_user(&store, Role::Student, "Siti").await,
            store,
            clock,
        }
    }

    fn course(published: bool) -> NewCourse {
        NewCourse {
            title: "Japanese for travellers".to_string(),
            language: "Japanese".to_string(),
            level: CourseLevel::Beginner,
            description: String::new(),
            published,
        }
    }

    fn lesson(title: &str, xp: i32) -> NewLesson {
        NewLesson {
            title: title.to_string(),
            content: "# Greetings".to_string(),
            position: None,
            xp_reward: Some(xp),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    #[test]
    fn test_level_thresholds() {
        assert_eq!(level_for(0), 1);
        assert_eq!(level_for(499), 1);
        assert_eq!(level_for(500), 2);
        assert_eq!(level_for(1250), 3);
    }

    #[test]
    fn test_streak_rules() {
        let mut profile = LearnerProfile::new(UserId::new());
        profile.record_activity(day(6));
        assert_eq!(profile.current_streak, 1);
        profile.record_activity(day(6));
        assert_eq!(profile.current_streak, 1);
        profile.record_activity(day(7));
        profile.record_activity(day(8));
        assert_eq!(profile.current_streak, 3);
        profile.record_activity(day(10));
        assert_eq!(profile.current_streak, 1);
        assert_eq!(profile.longest_streak, 3);
    }

    #[test]
    fn test_certificate_code_format() {
        let code = certificate_code();
        assert_eq!(code.len(), 12);
        assert!(code.starts_with("BPC-"));
        assert!(code[4..].bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[tokio::test]
    async fn test_students_cannot_author_courses() {
        let s = setup().await;
        assert!(matches!(
            s.service.create(&s.learner, course(true)).await,
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_drafts_are_hidden_from_learners() {
        let s = setup().await;
        let draft = s.service.create(&s.tutor, course(false)).await.unwrap();

        assert!(s.service.list(Some(&s.learner), CourseQuery::default()).await.unwrap().is_empty());
        assert_eq!(s.service.list(Some(&s.tutor), CourseQuery::default()).await.unwrap().len(), 1);
        assert!(matches!(
            s.service.enroll(&s.learner, draft.id).await,
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_enroll_is_idempotent() {
        let s = setup().await;
        let published = s.service.create(&s.tutor, course(true)).await.unwrap();
        let first = s.service.enroll(&s.learner, published.id).await.unwrap();
        s.clock.advance(Duration::hours(1));
        let second = s.service.enroll(&s.learner, published.id).await.unwrap();
        assert_eq!(first.enrolled_at, second.enrolled_at);
    }

    #[tokio::test]
    async fn test_completing_every_lesson_issues_certificate() {
        let s = setup().await;
        let published = s.service.create(&s.tutor, course(true)).await.unwrap();
        let first = s.service.add_lesson(&s.tutor, published.id, lesson("Hiragana", 300)).await.unwrap();
        let second = s.service.add_lesson(&s.tutor, published.id, lesson("Greetings", 250)).await.unwrap();
        assert_eq!(second.position, 2);

        let not_enrolled = s.service.complete_lesson(&s.learner, published.id, first.id).await;
        assert!(matches!(not_enrolled, Err(ServiceError::Forbidden(_))));

        s.service.enroll(&s.learner, published.id).await.unwrap();
        let progress = s.service.complete_lesson(&s.learner, published.id, first.id).await.unwrap();
        assert_eq!(progress.profile.xp, 300);
        assert!(progress.certificate.is_none());

        let again = s.service.complete_lesson(&s.learner, published.id, first.id).await;
        assert!(matches!(again, Err(ServiceError::Conflict(_))));

        s.clock.advance(Duration::days(1));
        let done = s.service.complete_lesson(&s.learner, published.id, second.id).await.unwrap();
        assert_eq!(done.profile.level, 2);
        assert_eq!(done.profile.current_streak, 2);
        assert!(done.enrollment.completed_at.is_some());
        let certificate = done.certificate.unwrap();
        assert_eq!(s.service.certificates(&s.learner).await.unwrap(), vec![certificate]);

        let inbox = s.store.notifications_for(s.learner.id, false, 10).await.unwrap();
        assert_eq!(inbox[0].kind, NotificationKind::CertificateIssued);
    }

    #[tokio::test]
    async fn test_concurrent_final_lessons_keep_xp_and_issue_certificate() {
        let s = setup().await;
        let published = s.service.create(&s.tutor, course(true)).await.unwrap();
        let first = s.service.add_lesson(&s.tutor, published.id, lesson("Hiragana", 300)).await.unwrap();
        let second = s.service.add_lesson(&s.tutor, published.id, lesson("Greetings", 250)).await.unwrap();
        s.service.enroll(&s.learner, published.id).await.unwrap();

        let (a, b) = tokio::join!(
            s.service.complete_lesson(&s.learner, published.id, first.id),
            s.service.complete_lesson(&s.learner, published.id, second.id),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let issued: Vec<_> = [&a, &b].iter().filter_map(|p| p.certificate.clone()).collect();
        assert_eq!(issued.len(), 1);
        assert_eq!(s.service.certificates(&s.learner).await.unwrap(), issued);

        let progress = s.service.progress(&s.learner).await.unwrap();
        assert_eq!(progress.profile.xp, 550);
        assert_eq!(progress.profile.level, 2);
        assert!(progress.enrollments[0].completed_at.is_some());
        assert_eq!(progress.enrollments[0].completed_lessons.len(), 2);
    }

    #[tokio::test]
    async fn test_only_author_adds_lessons() {
        let s = setup().await;
        let published = s.service.create(&s.tutor, course(true)).await.unwrap();
        let other = seed_user(&s.store, Role::Tutor, "Ayu").await;
        assert!(matches!(
            s.service.add_lesson(&other, published.id, lesson("Katakana", 10)).await,
            Err(ServiceError::Forbidden(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_level_never_decreases(a in 0i64..1_000_000, b in 0i64..1_000_000) {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(level_for(low) <= level_for(high));
        }
    }
}
