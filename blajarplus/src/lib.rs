//! BlajarPlus - a tutoring marketplace for Indonesia.
//!
//! Students find tutors, book paid sessions, chat with them and review them
//! afterwards; they can also study self-paced language courses. Payments go
//! through Midtrans and are held in escrow until the session completes.
//!
//! # Architecture
//!
//! ```text
//!  HTTP (axum) ──► SessionUser ──► services ──► repositories (Postgres | memory)
//!                                     │
//!                                     ▼
//!                              BookingReducer (pure)
//!                                     │ effects
//!                                     ▼
//!                     payment gateway, notifier ──► feedback actions
//! ```
//!
//! # Booking lifecycle
//!
//! ```text
//! pending_payment ──pay──► confirmed ──complete──► completed
//!        │                     │
//!   expire/cancel           cancel (refund)
//!        ▼                     ▼
//!    cancelled             cancelled
//! ```
//!
//! Double-booking is prevented at insert time (a tutor or student cannot hold
//! two overlapping active bookings), concurrent updates by an optimistic
//! version check, and a booking has at most one live payment attempt.
//!
//! # Usage
//!
//! See [`aggregates::booking`] for the reducer and its tests, and
//! [`server::build_router`] for the HTTP surface.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregates;
pub mod api;
pub mod auth;
pub mod config;
pub mod metrics;
pub mod notify;
pub mod payment_gateway;
pub mod reaper;
pub mod server;
pub mod services;
pub mod stores;
pub mod types;

pub use aggregates::{BookingAction, BookingReducer, BookingState};
pub use config::Config;
pub use server::{build_router, AppState};
pub use types::*;
