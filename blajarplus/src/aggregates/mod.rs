//! Aggregates for BlajarPlus.
//!
//! The booking lifecycle is the only part of the marketplace with real
//! invariants (no double-booking, one live payment, escrow transitions), so it
//! is the only one modelled as a reducer. Everything else is plain CRUD in
//! [`crate::services`].

pub mod booking;

pub use booking::{
    order_id_for, Actor, BookingAction, BookingEnvironment, BookingError, BookingPolicy,
    BookingReducer, BookingState, TutorSnapshot,
};
