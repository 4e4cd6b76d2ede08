//! HTTP request handlers shared by BlajarPlus services.

pub mod health;

pub use health::{health_check, readiness_check, ReadinessProbe};
