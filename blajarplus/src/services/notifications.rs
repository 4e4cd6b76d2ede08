//! In-app notification inbox.

use super::{ServiceError, ServiceResult};
use crate::stores::{NotificationRepository, Stores};
use crate::types::{Notification, NotificationId, User};
use blajarplus_core::environment::Clock;
use serde::Deserialize;
use std::sync::Arc;

/// Query string of `GET /api/notifications`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct NotificationQuery {
    /// Only unread notifications
    #[serde(default)]
    pub unread: bool,
    /// Page size (at most 100)
    pub limit: Option<i64>,
}

/// Notification inbox operations.
#[derive(Clone)]
pub struct NotificationService {
    notifications: Arc<dyn NotificationRepository>,
    clock: Arc<dyn Clock>,
}

impl NotificationService {
    /// Create the service.
    #[must_use]
    pub fn new(stores: &Stores, clock: Arc<dyn Clock>) -> Self {
        Self {
            notifications: Arc::clone(&stores.notifications),
            clock,
        }
    }

    /// The caller's notifications, newest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn list(&self, user: &User, query: NotificationQuery) -> ServiceResult<Vec<Notification>> {
        let limit = query.limit.unwrap_or(50).clamp(1, 100);
        Ok(self
            .notifications
            .notifications_for(user.id, query.unread, limit)
            .await?)
    }

    /// Mark one of the caller's notifications read.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids and other users' notifications.
    pub async fn mark_read(&self, user: &User, id: NotificationId) -> ServiceResult<()> {
        if self
            .notifications
            .mark_notification_read(id, user.id, self.clock.now())
            .await?
        {
            Ok(())
        } else {
            Err(ServiceError::not_found("notification", id))
        }
    }
}
