//! Per-user listing tracking: sessions, scheduling, dedup and delivery.

pub mod dispatcher;
pub mod engine;
pub mod metrics;
pub mod scheduler;
pub mod session;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use engine::{TickReport, TrackingEngine};
pub use metrics::{MetricsSnapshot, TrackerMetrics};
pub use scheduler::{TickHandler, TickOutcome, TrackingScheduler};
pub use session::{ActiveSession, SessionManager, SessionOrigin};

use std::sync::Arc;
use std::time::Duration;

use crate::api::Marketplace;
use crate::core::{HealthChecker, MessageId, Result, UserId};
use crate::crypto::Vault;
use crate::notify::format::tracking_keyboard;
use crate::notify::{ListingLinks, Notifier};
use crate::storage::CredentialStore;

/// Collaborators a [`Tracker`] is assembled from.
pub struct TrackerParts {
    pub marketplace: Arc<dyn Marketplace>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn CredentialStore>,
    pub vault: Arc<Vault>,
    pub links: ListingLinks,
    pub poll_interval: Duration,
    pub health: HealthChecker,
}

/// Entry point for everything a user can ask of the tracking service.
pub struct Tracker {
    sessions: Arc<SessionManager>,
    store: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
    scheduler: TrackingScheduler,
    metrics: Arc<TrackerMetrics>,
}

impl Tracker {
    pub fn new(parts: TrackerParts) -> Self {
        let TrackerParts {
            marketplace,
            notifier,
            store,
            vault,
            links,
            poll_interval,
            health,
        } = parts;

        let metrics = Arc::new(TrackerMetrics::new());
        let sessions = Arc::new(SessionManager::new(
            marketplace.clone(),
            vault,
            store.clone(),
        ));
        let dispatcher = Dispatcher::new(marketplace.clone(), notifier.clone(), links);
        let engine = TrackingEngine::new(
            sessions.clone(),
            marketplace,
            store.clone(),
            notifier.clone(),
            dispatcher,
            health,
            metrics.clone(),
        );

        Self {
            sessions,
            store,
            notifier,
            scheduler: TrackingScheduler::new(Arc::new(engine), poll_interval),
            metrics,
        }
    }

    pub async fn authenticate(&self, user_id: UserId, login: &str, password: &str) -> Result<()> {
        self.sessions.authenticate(user_id, login, password).await
    }

    /// Log in with the stored credentials and start polling. A failed login
    /// leaves nothing scheduled and no cookie stored.
    pub async fn enable_tracking(&self, user_id: UserId, origin: Option<MessageId>) -> Result<()> {
        self.sessions.establish(user_id).await?;
        self.scheduler.enable(user_id).await;
        tracing::info!("🟢 Tracking enabled for user {}", user_id);

        self.refresh_toggle(user_id, origin, true).await;
        Ok(())
    }

    /// Stop polling and drop the session. Returns whether a job was running;
    /// the cookie is cleared either way.
    pub async fn disable_tracking(&self, user_id: UserId, origin: Option<MessageId>) -> Result<bool> {
        let was_running = self.scheduler.disable(user_id).await;
        self.sessions.invalidate(user_id).await?;
        tracing::info!("🔴 Tracking disabled for user {}", user_id);

        self.refresh_toggle(user_id, origin, false).await;
        Ok(was_running)
    }

    pub async fn is_tracking(&self, user_id: UserId) -> bool {
        self.scheduler.is_enabled(user_id).await
    }

    /// Reschedule every user whose session survived the last shutdown.
    pub async fn resume(&self) -> Result<usize> {
        let users = self.store.tracked_users().await?;
        for user_id in &users {
            self.scheduler.enable(*user_id).await;
        }
        tracing::info!("🔁 Resumed tracking for {} user(s)", users.len());
        Ok(users.len())
    }

    pub async fn active_jobs(&self) -> usize {
        self.scheduler.active_jobs().await
    }

    pub fn metrics(&self) -> &TrackerMetrics {
        &self.metrics
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.metrics.log_report();
    }

    async fn refresh_toggle(&self, user_id: UserId, origin: Option<MessageId>, enabled: bool) {
        let Some(message_id) = origin else {
            return;
        };
        if let Err(e) = self
            .notifier
            .edit_message_markup(user_id, message_id, Some(tracking_keyboard(enabled)))
            .await
        {
            tracing::warn!(
                "Could not update tracking toggle for user {}: {}",
                user_id,
                e
            );
        }
    }
}
