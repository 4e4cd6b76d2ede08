//! API endpoints for BlajarPlus.
//!
//! Handlers are thin: extract, call a service, map the result. Organized by
//! domain:
//! - Tutors: discovery, profiles, availability, earnings
//! - Bookings: the paid-session lifecycle and reviews
//! - Payments: provider notifications and refunds
//! - Chat and notifications
//! - Courses: self-paced language learning

pub mod bookings;
pub mod chat;
pub mod courses;
pub mod notifications;
pub mod payments;
pub mod tutors;
