use async_trait::async_trait;
use std::sync::Arc;

use super::dispatcher::Dispatcher;
use super::metrics::TrackerMetrics;
use super::scheduler::{TickHandler, TickOutcome};
use super::session::{ActiveSession, SessionManager, SessionOrigin};
use crate::api::{Listing, Marketplace};
use crate::core::{Component, HealthChecker, Result, TrackerError, UserId};
use crate::notify::format::{auth_failure_notice, tracking_keyboard};
use crate::notify::Notifier;
use crate::storage::{CredentialRecord, CredentialStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub new: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// One poll cycle per tick: session, fetch, diff, dispatch, persist.
pub struct TrackingEngine {
    sessions: Arc<SessionManager>,
    marketplace: Arc<dyn Marketplace>,
    store: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
    dispatcher: Dispatcher,
    health: HealthChecker,
    metrics: Arc<TrackerMetrics>,
}

impl TrackingEngine {
    pub fn new(
        sessions: Arc<SessionManager>,
        marketplace: Arc<dyn Marketplace>,
        store: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
        dispatcher: Dispatcher,
        health: HealthChecker,
        metrics: Arc<TrackerMetrics>,
    ) -> Self {
        Self {
            sessions,
            marketplace,
            store,
            notifier,
            dispatcher,
            health,
            metrics,
        }
    }

    pub async fn run_tick(&self, user_id: UserId) -> Result<TickReport> {
        let record = self.store.load_credentials(user_id).await?;
        self.poll(user_id, &record).await
    }

    async fn poll(&self, user_id: UserId, record: &CredentialRecord) -> Result<TickReport> {
        let session = self.sessions.session_from(user_id, record).await?;
        let (session, fetched) = self.fetch_listings(user_id, session).await?;

        let seen = self.store.load_seen_ids(user_id).await?;
        let fetched_count = fetched.len();
        let diff = seen.diff(fetched);

        let dispatch = self
            .dispatcher
            .dispatch(user_id, &session, &diff.new_listings)
            .await;
        if !dispatch.delivered.is_empty() {
            self.health.report(Component::Notifier, true).await;
        } else if !dispatch.failed.is_empty() {
            self.health.report(Component::Notifier, false).await;
        }
        self.metrics.add_listings_delivered(dispatch.delivered.len());
        self.metrics.add_delivery_failures(dispatch.failed.len());

        // Undelivered listings stay unseen so the next tick retries them.
        let persisted = diff.updated_seen.without(&dispatch.failed);
        self.store.save_seen_ids(user_id, &persisted).await?;

        Ok(TickReport {
            fetched: fetched_count,
            new: diff.new_listings.len(),
            delivered: dispatch.delivered.len(),
            failed: dispatch.failed.len(),
        })
    }

    /// A stored cookie the marketplace no longer honours gets one fresh login.
    async fn fetch_listings(
        &self,
        user_id: UserId,
        session: ActiveSession,
    ) -> Result<(ActiveSession, Vec<Listing>)> {
        let result = self.marketplace.fetch_listings(session.cookie()).await;
        match result {
            Ok(listings) => {
                self.health.report(Component::Marketplace, true).await;
                Ok((session, listings))
            }
            Err(TrackerError::Network(reason)) if session.origin == SessionOrigin::Stored => {
                tracing::debug!(
                    "Listing fetch with stored session failed for user {} ({}), renewing",
                    user_id,
                    reason
                );
                let renewed = self.sessions.renew(user_id).await?;
                let listings = self.fetch_with_health(&renewed).await?;
                Ok((renewed, listings))
            }
            Err(e) => {
                self.health.report(Component::Marketplace, false).await;
                Err(e)
            }
        }
    }

    async fn fetch_with_health(&self, session: &ActiveSession) -> Result<Vec<Listing>> {
        let result = self.marketplace.fetch_listings(session.cookie()).await;
        self.health
            .report(Component::Marketplace, result.is_ok())
            .await;
        result
    }

    /// `observed` is the cookie this tick started from. Only that session is
    /// torn down; a re-enable that raced the failed login wins.
    async fn handle_auth_failure(&self, user_id: UserId, observed: Option<&[u8]>, reason: &str) {
        self.metrics.increment_auth_failures();

        let cleared = match observed {
            Some(cookie_cipher) => self.sessions.invalidate_if(user_id, cookie_cipher).await,
            None => Ok(false),
        };
        match cleared {
            Ok(true) => tracing::warn!(
                "🔒 Marketplace rejected login for user {} ({}), disabling tracking",
                user_id,
                reason
            ),
            Ok(false) => {
                tracing::info!(
                    "Login for user {} rejected ({}) but the session changed meanwhile, leaving it",
                    user_id,
                    reason
                );
                return;
            }
            Err(e) => tracing::error!("Failed to clear session for user {}: {}", user_id, e),
        }

        if let Err(e) = self
            .notifier
            .send_text(
                user_id,
                &auth_failure_notice(reason),
                Some(tracking_keyboard(false)),
            )
            .await
        {
            tracing::warn!("Could not notify user {} about auth failure: {}", user_id, e);
        }
    }
}

#[async_trait]
impl TickHandler for TrackingEngine {
    async fn on_tick(&self, user_id: UserId) -> TickOutcome {
        let record = match self.store.load_credentials(user_id).await {
            Ok(record) => record,
            Err(e) => {
                self.metrics.increment_ticks_failed();
                tracing::warn!("⚠️ Tick for user {} failed: {}", user_id, e);
                return TickOutcome::Continue;
            }
        };

        match self.poll(user_id, &record).await {
            Ok(report) => {
                self.metrics.increment_ticks_completed();
                if report.new > 0 {
                    tracing::info!(
                        "User {}: {} new of {} listings, {} delivered, {} failed",
                        user_id,
                        report.new,
                        report.fetched,
                        report.delivered,
                        report.failed
                    );
                } else {
                    tracing::debug!("User {}: no new listings", user_id);
                }
                TickOutcome::Continue
            }
            Err(TrackerError::Auth(reason)) => {
                self.metrics.increment_ticks_failed();
                self.handle_auth_failure(user_id, record.cookie_cipher.as_deref(), &reason)
                    .await;
                TickOutcome::Stop
            }
            Err(TrackerError::TrackingDisabled(_)) => {
                tracing::info!("Tracking for user {} is off, ending job", user_id);
                TickOutcome::Stop
            }
            Err(e) => {
                self.metrics.increment_ticks_failed();
                tracing::warn!("⚠️ Tick for user {} failed: {}", user_id, e);
                TickOutcome::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LoginResponse, MockMarketplace};
    use crate::crypto::vault::test_vault;
    use crate::crypto::Vault;
    use crate::notify::{ListingLinks, MockNotifier};
    use crate::scanner::SeenSet;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn listings(ids: &[u64]) -> Vec<Listing> {
        ids.iter()
            .map(|id| serde_json::from_value(json!({"id": id, "name": format!("Listing {}", id)})).unwrap())
            .collect()
    }

    async fn tracked_store(vault: &Vault, user_id: UserId) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .save_login(
                user_id,
                vault.encrypt("user").unwrap(),
                vault.encrypt("pw").unwrap(),
            )
            .await
            .unwrap();
        store
            .store_cookie(user_id, vault.encrypt("sid=live").unwrap())
            .await
            .unwrap();
        store
    }

    fn engine(
        marketplace: MockMarketplace,
        notifier: MockNotifier,
        store: &MemoryStore,
    ) -> (TrackingEngine, Arc<TrackerMetrics>, HealthChecker) {
        let marketplace: Arc<dyn Marketplace> = Arc::new(marketplace);
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);
        let store: Arc<dyn CredentialStore> = Arc::new(store.clone());
        let metrics = Arc::new(TrackerMetrics::new());
        let health = HealthChecker::new();

        let sessions = Arc::new(SessionManager::new(
            marketplace.clone(),
            Arc::new(test_vault()),
            store.clone(),
        ));
        let dispatcher = Dispatcher::new(
            marketplace.clone(),
            notifier.clone(),
            ListingLinks::new("https://kwork.ru"),
        );

        (
            TrackingEngine::new(
                sessions,
                marketplace,
                store,
                notifier,
                dispatcher,
                health.clone(),
                metrics.clone(),
            ),
            metrics,
            health,
        )
    }

    #[tokio::test]
    async fn test_tick_delivers_only_new_listings() {
        let store = tracked_store(&test_vault(), 1).await;
        store.save_seen_ids(1, &SeenSet::new([101, 102])).await.unwrap();

        let mut marketplace = MockMarketplace::new();
        marketplace
            .expect_fetch_listings()
            .withf(|cookie| cookie == "sid=live")
            .returning(|_| Ok(listings(&[103, 101])));
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_text()
            .withf(|user, html, _| *user == 1 && html.contains("Listing 103"))
            .times(1)
            .returning(|_, _, _| Ok(1));

        let (engine, metrics, health) = engine(marketplace, notifier, &store);
        let report = engine.run_tick(1).await.unwrap();

        assert_eq!(report, TickReport { fetched: 2, new: 1, delivered: 1, failed: 0 });
        assert_eq!(store.load_seen_ids(1).await.unwrap(), SeenSet::new([103, 101]));
        assert_eq!(metrics.get_listings_delivered(), 1);
        assert_eq!(health.get_status().await.is_up(Component::Marketplace), Some(true));
        assert_eq!(health.get_status().await.is_up(Component::Notifier), Some(true));
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried_next_tick() {
        let store = tracked_store(&test_vault(), 2).await;

        let mut marketplace = MockMarketplace::new();
        marketplace
            .expect_fetch_listings()
            .returning(|_| Ok(listings(&[5, 6])));
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_text()
            .withf(|_, html, _| html.contains("Listing 5"))
            .returning(|_, _, _| Err(TrackerError::Delivery("chat blocked".into())));
        notifier
            .expect_send_text()
            .withf(|_, html, _| html.contains("Listing 6"))
            .returning(|_, _, _| Ok(2));

        let (engine, metrics, _) = engine(marketplace, notifier, &store);
        let report = engine.run_tick(2).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(store.load_seen_ids(2).await.unwrap(), SeenSet::new([6]));
        assert_eq!(metrics.get_delivery_failures(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_disables_tracking() {
        let store = tracked_store(&test_vault(), 3).await;
        // Unreadable cookie forces a login.
        store.store_cookie(3, vec![0xEE]).await.unwrap();

        let mut marketplace = MockMarketplace::new();
        marketplace
            .expect_login()
            .returning(|_, _| Err(TrackerError::Auth("invalid password".into())));
        marketplace.expect_fetch_listings().never();
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_text()
            .withf(|user, html, keyboard| {
                *user == 3 && html.contains("invalid password") && keyboard.is_some()
            })
            .times(1)
            .returning(|_, _, _| Ok(9));

        let (engine, metrics, _) = engine(marketplace, notifier, &store);
        assert_eq!(engine.on_tick(3).await, TickOutcome::Stop);

        assert!(!store.load_credentials(3).await.unwrap().tracking_enabled());
        assert_eq!(metrics.get_auth_failures(), 1);
    }

    #[tokio::test]
    async fn test_stale_auth_failure_keeps_reenabled_session() {
        let vault = test_vault();
        let store = tracked_store(&vault, 3).await;
        store.store_cookie(3, vec![0xEE]).await.unwrap();
        let fresh = vault.encrypt("sid=fresh").unwrap();

        let reenabler = store.clone();
        let mut marketplace = MockMarketplace::new();
        marketplace.expect_login().times(1).returning(move |_, _| {
            // The user re-enables while this tick's login is in flight.
            futures::executor::block_on(reenabler.store_cookie(3, fresh.clone()))?;
            Err(TrackerError::Auth("invalid password".into()))
        });
        let mut notifier = MockNotifier::new();
        notifier.expect_send_text().never();

        let (engine, metrics, _) = engine(marketplace, notifier, &store);
        assert_eq!(engine.on_tick(3).await, TickOutcome::Stop);

        let cipher = store.load_credentials(3).await.unwrap().cookie_cipher.unwrap();
        assert_eq!(vault.decrypt(&cipher).unwrap(), "sid=fresh");
        assert_eq!(metrics.get_auth_failures(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_keeps_job_and_seen_set() {
        let store = tracked_store(&test_vault(), 4).await;
        store.save_seen_ids(4, &SeenSet::new([1])).await.unwrap();

        let mut marketplace = MockMarketplace::new();
        marketplace
            .expect_fetch_listings()
            .returning(|_| Err(TrackerError::Network("status 502".into())));
        marketplace.expect_login().times(1).returning(|_, _| {
            Ok(LoginResponse {
                session_cookie: "sid=fresh".into(),
                raw: serde_json::Value::Null,
            })
        });

        let (engine, metrics, health) = engine(marketplace, MockNotifier::new(), &store);
        assert_eq!(engine.on_tick(4).await, TickOutcome::Continue);

        assert_eq!(store.load_seen_ids(4).await.unwrap(), SeenSet::new([1]));
        assert!(store.load_credentials(4).await.unwrap().tracking_enabled());
        assert_eq!(metrics.get_ticks_failed(), 1);
        assert_eq!(health.get_status().await.is_up(Component::Marketplace), Some(false));
    }

    #[tokio::test]
    async fn test_rejected_stored_cookie_is_renewed() {
        let vault = test_vault();
        let store = tracked_store(&vault, 5).await;

        let mut marketplace = MockMarketplace::new();
        marketplace
            .expect_fetch_listings()
            .withf(|cookie| cookie == "sid=live")
            .returning(|_| Err(TrackerError::Network("session expired".into())));
        marketplace
            .expect_fetch_listings()
            .withf(|cookie| cookie == "sid=fresh")
            .returning(|_| Ok(Vec::new()));
        marketplace.expect_login().times(1).returning(|_, _| {
            Ok(LoginResponse {
                session_cookie: "sid=fresh".into(),
                raw: serde_json::Value::Null,
            })
        });

        let (engine, _, _) = engine(marketplace, MockNotifier::new(), &store);
        engine.run_tick(5).await.unwrap();

        let cipher = store.load_credentials(5).await.unwrap().cookie_cipher.unwrap();
        assert_eq!(vault.decrypt(&cipher).unwrap(), "sid=fresh");
    }

    #[tokio::test]
    async fn test_disabled_user_stops_job() {
        let store = MemoryStore::new();
        let (engine, _, _) = engine(MockMarketplace::new(), MockNotifier::new(), &store);
        assert_eq!(engine.on_tick(6).await, TickOutcome::Stop);
    }
}
