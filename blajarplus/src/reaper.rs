//! Background sweep over time-driven booking transitions.
//!
//! Each sweep expires unpaid bookings whose payment deadline passed,
//! completes confirmed sessions that ended more than the grace period ago,
//! and purges expired sessions and magic links. A booking that cannot be
//! moved is retried with exponential backoff and left out of the due lists
//! meanwhile, so one stuck row never fills every batch.

use crate::auth::AuthService;
use crate::metrics::record_reaper;
use crate::services::{BookingService, ServiceError};
use crate::stores::BookingRepository;
use crate::types::BookingId;
use blajarplus_core::environment::Clock;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BATCH_SIZE: i64 = 100;

/// Delay before the first retry of a failed booking; doubles per failure.
const RETRY_BASE_SECS: i64 = 60;

/// Longest delay between retries.
const RETRY_MAX_SECS: i64 = 3600;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Bookings expired
    pub expired: usize,
    /// Bookings auto-completed
    pub completed: usize,
    /// Bookings that could not be moved (retried after a backoff)
    pub failed: usize,
    /// Failed bookings still waiting out their backoff
    pub deferred: usize,
    /// Sessions and links purged
    pub purged: u64,
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    retry_at: DateTime<Utc>,
}

/// Failed bookings and when each may be tried again.
#[derive(Debug, Default)]
struct RetryBook {
    entries: HashMap<BookingId, Backoff>,
}

impl RetryBook {
    fn deferred(&self, now: DateTime<Utc>) -> Vec<BookingId> {
        self.entries
            .iter()
            .filter(|(_, backoff)| backoff.retry_at > now)
            .map(|(id, _)| *id)
            .collect()
    }

    fn failed(&mut self, id: BookingId, now: DateTime<Utc>) -> DateTime<Utc> {
        let entry = self.entries.entry(id).or_insert(Backoff {
            failures: 0,
            retry_at: now,
        });
        entry.failures = entry.failures.saturating_add(1);
        let shift = (entry.failures - 1).min(16);
        let delay = RETRY_BASE_SECS.saturating_mul(1 << shift).min(RETRY_MAX_SECS);
        entry.retry_at = now + Duration::seconds(delay);
        entry.retry_at
    }

    fn succeeded(&mut self, id: BookingId) {
        self.entries.remove(&id);
    }

    /// Drop entries nobody retried for a full maximum delay; those bookings
    /// have left the due lists.
    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::seconds(RETRY_MAX_SECS);
        self.entries.retain(|_, backoff| backoff.retry_at > horizon);
    }
}

/// Drives time-based transitions.
#[derive(Clone)]
pub struct Reaper {
    bookings: BookingService,
    repository: Arc<dyn BookingRepository>,
    auth: AuthService,
    clock: Arc<dyn Clock>,
    auto_complete_after: Duration,
    batch_size: i64,
    retries: Arc<Mutex<RetryBook>>,
}

impl Reaper {
    /// Create a reaper.
    #[must_use]
    pub fn new(
        bookings: BookingService,
        repository: Arc<dyn BookingRepository>,
        auth: AuthService,
        clock: Arc<dyn Clock>,
        auto_complete_after: Duration,
    ) -> Self {
        Self {
            bookings,
            repository,
            auth,
            clock,
            auto_complete_after,
            batch_size: BATCH_SIZE,
            retries: Arc::default(),
        }
    }

    /// Limit how many bookings of each kind one sweep moves.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn retries(&self) -> MutexGuard<'_, RetryBook> {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, id: BookingId, outcome: Result<(), ServiceError>, action: &str) -> bool {
        match outcome {
            Ok(()) => {
                self.retries().succeeded(id);
                true
            }
            Err(error) => {
                let retry_at = self.retries().failed(id, self.clock.now());
                warn!(booking_id = %id, %error, %retry_at, action, "Failed to move booking");
                false
            }
        }
    }

    /// Run one sweep.
    ///
    /// # Errors
    ///
    /// Storage failures while listing due bookings. Failures on individual
    /// bookings are counted in [`SweepReport::failed`] instead.
    pub async fn sweep_once(&self) -> Result<SweepReport, ServiceError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        let skip = {
            let mut retries = self.retries();
            retries.prune(now);
            retries.deferred(now)
        };
        report.deferred = skip.len();

        for id in self
            .repository
            .due_for_expiry(now, &skip, self.batch_size)
            .await?
        {
            if self.settle(id, self.bookings.expire(id).await, "expire") {
                report.expired += 1;
            } else {
                report.failed += 1;
            }
        }

        let ended_before = now - self.auto_complete_after;
        for id in self
            .repository
            .due_for_completion(ended_before, &skip, self.batch_size)
            .await?
        {
            if self.settle(id, self.bookings.auto_complete(id).await, "auto_complete") {
                report.completed += 1;
            } else {
                report.failed += 1;
            }
        }

        report.purged = match self.auth.purge_expired().await {
            Ok(purged) => purged,
            Err(error) => {
                warn!(%error, "Failed to purge expired sessions");
                0
            }
        };

        record_reaper("expired", report.expired);
        record_reaper("completed", report.completed);
        record_reaper("failed", report.failed);
        if report.expired + report.completed + report.failed > 0 {
            info!(
                expired = report.expired,
                completed = report.completed,
                failed = report.failed,
                deferred = report.deferred,
                "Reaper sweep finished"
            );
        } else {
            debug!(purged = report.purged, "Reaper sweep found nothing due");
        }
        Ok(report)
    }

    /// Sweep every `interval` until the task is aborted.
    #[must_use]
    pub fn spawn(self, interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = self.sweep_once().await {
                    warn!(%error, "Reaper sweep failed");
                }
            }
        })
    }
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("auto_complete_after", &self.auto_complete_after)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}
