//! Prometheus metrics.
//!
//! Business counters for the booking lifecycle, recorded by
//! [`crate::services::BookingService`] after every persisted transition, plus
//! a histogram for HTTP-facing service calls.
//!
//! ```text
//! blajarplus_bookings_total{status}        bookings entering a status
//! blajarplus_payments_total{status}        payment attempts entering a status
//! blajarplus_payment_revenue_total         rupiah captured into escrow
//! blajarplus_escrow_released_total         rupiah released to tutors
//! blajarplus_refunds_total                 refunds completed
//! blajarplus_webhooks_total{outcome}       provider notifications handled
//! ```

use crate::aggregates::BookingState;
use crate::types::EscrowStatus;
use metrics::{counter, describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use thiserror::Error;

/// Bookings entering a status
pub const BOOKINGS_TOTAL: &str = "blajarplus_bookings_total";
/// Payment attempts entering a status
pub const PAYMENTS_TOTAL: &str = "blajarplus_payments_total";
/// Rupiah captured into escrow
pub const PAYMENT_REVENUE_TOTAL: &str = "blajarplus_payment_revenue_total";
/// Rupiah released to tutors
pub const ESCROW_RELEASED_TOTAL: &str = "blajarplus_escrow_released_total";
/// Completed refunds
pub const REFUNDS_TOTAL: &str = "blajarplus_refunds_total";
/// Provider notifications by outcome
pub const WEBHOOKS_TOTAL: &str = "blajarplus_webhooks_total";
/// Background sweep results
pub const REAPER_TOTAL: &str = "blajarplus_reaper_bookings_total";
/// Booking command latency
pub const BOOKING_COMMAND_DURATION: &str = "blajarplus_booking_command_duration_seconds";

/// Errors from installing the exporter.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Exporter configuration rejected
    #[error("failed to build metrics exporter: {0}")]
    Build(String),
    /// Recorder or listener could not be installed
    #[error("failed to install metrics exporter: {0}")]
    Install(String),
}

/// Install the global recorder and serve `/metrics` on `addr`.
///
/// # Errors
///
/// Returns [`MetricsError`] if the exporter cannot be built or a recorder is
/// already installed.
pub fn install(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))?
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    describe();
    tracing::info!(%addr, "metrics exporter listening on http://{addr}/metrics");
    Ok(())
}

fn describe() {
    describe_counter!(BOOKINGS_TOTAL, "Bookings entering each status");
    describe_counter!(PAYMENTS_TOTAL, "Payment attempts entering each status");
    describe_counter!(
        PAYMENT_REVENUE_TOTAL,
        "Rupiah captured into escrow by settled payments"
    );
    describe_counter!(ESCROW_RELEASED_TOTAL, "Rupiah released to tutors after completion");
    describe_counter!(REFUNDS_TOTAL, "Refunds confirmed by the payment provider");
    describe_counter!(WEBHOOKS_TOTAL, "Payment provider notifications by outcome");
    describe_counter!(REAPER_TOTAL, "Bookings expired or auto-completed by the reaper");
    describe_histogram!(
        BOOKING_COMMAND_DURATION,
        "Time to run a booking command including persistence"
    );
}

fn non_negative(rupiah: i64) -> u64 {
    u64::try_from(rupiah).unwrap_or(0)
}

/// Count what changed between two states of one booking.
pub fn record_transition(before: &BookingState, after: &BookingState) {
    let status_before = before.status();
    if let Some(status) = after.status().filter(|s| Some(*s) != status_before) {
        counter!(BOOKINGS_TOTAL, "status" => status.as_str()).increment(1);
    }

    let Some(payment) = &after.payment else {
        return;
    };
    let previous = before.payment.as_ref().filter(|p| p.id == payment.id);

    if previous.is_none_or(|p| p.status != payment.status) {
        counter!(PAYMENTS_TOTAL, "status" => payment.status.as_str()).increment(1);
    }

    let escrow_before = previous.map_or(EscrowStatus::None, |p| p.escrow);
    if escrow_before == payment.escrow {
        return;
    }
    match payment.escrow {
        EscrowStatus::Held => {
            counter!(PAYMENT_REVENUE_TOTAL).increment(non_negative(payment.amount.rupiah()));
        }
        EscrowStatus::Released => {
            if let Some(booking) = &after.booking {
                counter!(ESCROW_RELEASED_TOTAL)
                    .increment(non_negative(booking.tutor_payout().rupiah()));
            }
        }
        EscrowStatus::Refunded => counter!(REFUNDS_TOTAL).increment(1),
        EscrowStatus::None | EscrowStatus::RefundPending => {}
    }
}

/// Count a handled provider notification.
pub fn record_webhook(outcome: &'static str) {
    counter!(WEBHOOKS_TOTAL, "outcome" => outcome).increment(1);
}

/// Count bookings the reaper touched.
pub fn record_reaper(action: &'static str, count: usize) {
    counter!(REAPER_TOTAL, "action" => action).increment(count as u64);
}
