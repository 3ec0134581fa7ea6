use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::api::Marketplace;
use crate::core::{Result, TrackerError, UserId};
use crate::crypto::Vault;
use crate::storage::{CredentialRecord, CredentialStore};

/// Where the cookie of an [`ActiveSession`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Decrypted from the stored cookie.
    Stored,
    /// Issued by a fresh marketplace login.
    Login,
}

/// Plaintext session cookie for the duration of one request chain.
#[derive(Clone)]
pub struct ActiveSession {
    pub user_id: UserId,
    pub origin: SessionOrigin,
    pub established_at: DateTime<Utc>,
    cookie: String,
}

impl ActiveSession {
    fn new(user_id: UserId, cookie: String, origin: SessionOrigin) -> Self {
        Self {
            user_id,
            origin,
            established_at: Utc::now(),
            cookie,
        }
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }
}

impl fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSession")
            .field("user_id", &self.user_id)
            .field("origin", &self.origin)
            .field("established_at", &self.established_at)
            .field("cookie", &"<redacted>")
            .finish()
    }
}

/// Establishes and refreshes per-user marketplace sessions. Plaintext
/// credentials exist only on the stack of these calls.
pub struct SessionManager {
    marketplace: Arc<dyn Marketplace>,
    vault: Arc<Vault>,
    store: Arc<dyn CredentialStore>,
}

impl SessionManager {
    pub fn new(
        marketplace: Arc<dyn Marketplace>,
        vault: Arc<Vault>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            marketplace,
            vault,
            store,
        }
    }

    /// Verify credentials against the marketplace and store them encrypted.
    /// Tracking state is left untouched.
    pub async fn authenticate(&self, user_id: UserId, login: &str, password: &str) -> Result<()> {
        tracing::info!("🔑 Authenticating user {}", user_id);
        self.store.ensure_user(user_id).await?;

        self.marketplace.login(login, password).await.map_err(|e| {
            tracing::warn!("Authentication for user {} rejected: {}", user_id, e);
            e
        })?;

        let login_cipher = self.vault.encrypt(login)?;
        let password_cipher = self.vault.encrypt(password)?;
        self.store
            .save_login(user_id, login_cipher, password_cipher)
            .await?;

        tracing::info!("✅ Credentials stored for user {}", user_id);
        Ok(())
    }

    /// Log in with the stored credentials and store the issued cookie,
    /// which switches tracking on.
    pub async fn establish(&self, user_id: UserId) -> Result<ActiveSession> {
        let record = self.store.load_credentials(user_id).await?;
        let cookie = self.login_with(user_id, &record).await?;

        let cookie_cipher = self.vault.encrypt(&cookie)?;
        self.store.store_cookie(user_id, cookie_cipher).await?;

        Ok(ActiveSession::new(user_id, cookie, SessionOrigin::Login))
    }

    /// Session for a scheduled tick. Reuses the stored cookie when it still
    /// decrypts, otherwise logs in again.
    pub async fn ensure_session(&self, user_id: UserId) -> Result<ActiveSession> {
        let record = self.store.load_credentials(user_id).await?;
        self.session_from(user_id, &record).await
    }

    /// [`Self::ensure_session`] against a record the caller already loaded.
    pub async fn session_from(
        &self,
        user_id: UserId,
        record: &CredentialRecord,
    ) -> Result<ActiveSession> {
        let Some(cookie_cipher) = record.cookie_cipher.as_deref() else {
            return Err(TrackerError::TrackingDisabled(user_id));
        };

        match self.vault.decrypt(cookie_cipher) {
            Ok(cookie) => return Ok(ActiveSession::new(user_id, cookie, SessionOrigin::Stored)),
            Err(failure) => tracing::warn!(
                "Stored session for user {} is unusable ({}), logging in again",
                user_id,
                failure
            ),
        }

        self.refresh(user_id, record).await
    }

    /// Replace a session the marketplace no longer accepts.
    pub async fn renew(&self, user_id: UserId) -> Result<ActiveSession> {
        let record = self.store.load_credentials(user_id).await?;
        if !record.tracking_enabled() {
            return Err(TrackerError::TrackingDisabled(user_id));
        }
        self.refresh(user_id, &record).await
    }

    pub async fn invalidate(&self, user_id: UserId) -> Result<()> {
        self.store.clear_cookie(user_id).await
    }

    /// Drop the session whose cookie was `observed`. A cookie stored since
    /// then (a re-enable) is left alone and `false` is returned.
    pub async fn invalidate_if(&self, user_id: UserId, observed: &[u8]) -> Result<bool> {
        self.store.clear_cookie_if(user_id, observed).await
    }

    async fn refresh(&self, user_id: UserId, record: &CredentialRecord) -> Result<ActiveSession> {
        let cookie = self.login_with(user_id, record).await?;
        let cookie_cipher = self.vault.encrypt(&cookie)?;

        // A disable that landed while we were logging in must stay in effect.
        if !self.store.refresh_cookie(user_id, cookie_cipher).await? {
            tracing::info!("Tracking for user {} was disabled during login", user_id);
            return Err(TrackerError::TrackingDisabled(user_id));
        }

        tracing::debug!("Session refreshed for user {}", user_id);
        Ok(ActiveSession::new(user_id, cookie, SessionOrigin::Login))
    }

    async fn login_with(&self, user_id: UserId, record: &CredentialRecord) -> Result<String> {
        let (Some(login_cipher), Some(password_cipher)) =
            (record.login_cipher.as_deref(), record.password_cipher.as_deref())
        else {
            return Err(TrackerError::NotAuthenticated(user_id));
        };

        let login = self.vault.decrypt(login_cipher)?;
        let password = self.vault.decrypt(password_cipher)?;

        let response = self.marketplace.login(&login, &password).await?;
        Ok(response.session_cookie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LoginResponse, MockMarketplace};
    use crate::crypto::vault::{shared_test_key, test_vault};
    use crate::crypto::DecryptionFailure;
    use crate::storage::MemoryStore;
    use mockall::predicate::eq;

    fn login_ok(
        cookie: &'static str,
    ) -> impl Fn(&str, &str) -> Result<LoginResponse> + Send + 'static {
        move |_, _| {
            Ok(LoginResponse {
                session_cookie: cookie.to_string(),
                raw: serde_json::json!({"success": true}),
            })
        }
    }

    fn manager(marketplace: MockMarketplace, store: &MemoryStore) -> SessionManager {
        SessionManager::new(
            Arc::new(marketplace),
            Arc::new(test_vault()),
            Arc::new(store.clone()),
        )
    }

    #[tokio::test]
    async fn test_authenticate_stores_only_ciphertext() {
        let store = MemoryStore::new();
        let mut marketplace = MockMarketplace::new();
        marketplace
            .expect_login()
            .with(eq("alice"), eq("secret"))
            .times(1)
            .returning(login_ok("sid=1"));

        let sessions = manager(marketplace, &store);
        sessions.authenticate(7, "alice", "secret").await.unwrap();

        let record = store.load_credentials(7).await.unwrap();
        let login_cipher = record.login_cipher.clone().unwrap();
        assert_ne!(login_cipher, b"alice".to_vec());
        assert_eq!(test_vault().decrypt(&login_cipher).unwrap(), "alice");
        assert!(!record.tracking_enabled());
    }

    #[tokio::test]
    async fn test_rejected_authentication_stores_nothing() {
        let store = MemoryStore::new();
        let mut marketplace = MockMarketplace::new();
        marketplace
            .expect_login()
            .returning(|_, _| Err(TrackerError::Auth("invalid password".into())));

        let sessions = manager(marketplace, &store);
        let err = sessions.authenticate(7, "bad", "creds").await.unwrap_err();

        assert!(matches!(err, TrackerError::Auth(ref reason) if reason == "invalid password"));
        assert!(!store.load_credentials(7).await.unwrap().has_login());
    }

    #[tokio::test]
    async fn test_establish_requires_stored_login() {
        let store = MemoryStore::new();
        let sessions = manager(MockMarketplace::new(), &store);

        let err = sessions.establish(3).await.unwrap_err();
        assert!(matches!(err, TrackerError::NotAuthenticated(3)));
    }

    #[tokio::test]
    async fn test_establish_stores_encrypted_cookie() {
        let store = MemoryStore::new();
        let mut marketplace = MockMarketplace::new();
        marketplace.expect_login().times(2).returning(login_ok("sid=abc"));

        let sessions = manager(marketplace, &store);
        sessions.authenticate(5, "bob", "pw").await.unwrap();
        let session = sessions.establish(5).await.unwrap();

        assert_eq!(session.cookie(), "sid=abc");
        assert_eq!(session.origin, SessionOrigin::Login);
        let cipher = store.load_credentials(5).await.unwrap().cookie_cipher.unwrap();
        assert_eq!(test_vault().decrypt(&cipher).unwrap(), "sid=abc");
    }

    #[tokio::test]
    async fn test_ensure_session_reuses_stored_cookie() {
        let store = MemoryStore::new();
        store
            .store_cookie(4, test_vault().encrypt("sid=stored").unwrap())
            .await
            .unwrap();

        let mut marketplace = MockMarketplace::new();
        marketplace.expect_login().never();

        let session = manager(marketplace, &store).ensure_session(4).await.unwrap();
        assert_eq!(session.cookie(), "sid=stored");
        assert_eq!(session.origin, SessionOrigin::Stored);
    }

    #[tokio::test]
    async fn test_ensure_session_without_cookie_is_disabled() {
        let store = MemoryStore::new();
        let err = manager(MockMarketplace::new(), &store)
            .ensure_session(4)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::TrackingDisabled(4)));
    }

    #[tokio::test]
    async fn test_ensure_session_relogs_when_cookie_unreadable() {
        let store = MemoryStore::new();
        let vault = test_vault();
        store
            .save_login(
                2,
                vault.encrypt("carol").unwrap(),
                vault.encrypt("pw").unwrap(),
            )
            .await
            .unwrap();
        let foreign = Vault::from_key(1, shared_test_key(1));
        store
            .store_cookie(2, foreign.encrypt("sid=old").unwrap())
            .await
            .unwrap();

        let mut marketplace = MockMarketplace::new();
        marketplace
            .expect_login()
            .with(eq("carol"), eq("pw"))
            .times(1)
            .returning(login_ok("sid=new"));

        let session = manager(marketplace, &store).ensure_session(2).await.unwrap();
        assert_eq!(session.cookie(), "sid=new");
        let cipher = store.load_credentials(2).await.unwrap().cookie_cipher.unwrap();
        assert_eq!(vault.decrypt(&cipher).unwrap(), "sid=new");
    }

    #[tokio::test]
    async fn test_undecryptable_login_requires_reauthentication() {
        let store = MemoryStore::new();
        store.save_login(8, vec![2, 2, 3], vec![4, 5, 6]).await.unwrap();
        store.store_cookie(8, vec![9]).await.unwrap();

        let err = manager(MockMarketplace::new(), &store)
            .ensure_session(8)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Decryption(DecryptionFailure::UnknownKeyVersion(2))
        ));
    }

    #[tokio::test]
    async fn test_conditional_invalidate_keeps_newer_cookie() {
        let store = MemoryStore::new();
        store.store_cookie(9, vec![1, 1]).await.unwrap();
        let sessions = manager(MockMarketplace::new(), &store);

        store.store_cookie(9, vec![2, 2]).await.unwrap();
        assert!(!sessions.invalidate_if(9, &[1, 1]).await.unwrap());
        assert!(store.load_credentials(9).await.unwrap().tracking_enabled());

        assert!(sessions.invalidate_if(9, &[2, 2]).await.unwrap());
        assert!(!store.load_credentials(9).await.unwrap().tracking_enabled());
    }

    #[tokio::test]
    async fn test_renew_does_not_resurrect_disabled_tracking() {
        let store = MemoryStore::new();
        let vault = test_vault();
        store
            .save_login(6, vault.encrypt("dan").unwrap(), vault.encrypt("pw").unwrap())
            .await
            .unwrap();
        store.store_cookie(6, vault.encrypt("sid=1").unwrap()).await.unwrap();

        let disabler = store.clone();
        let mut marketplace = MockMarketplace::new();
        marketplace.expect_login().times(1).returning(move |_, _| {
            // Disable lands while the login request is in flight.
            futures::executor::block_on(disabler.clear_cookie(6))?;
            Ok(LoginResponse {
                session_cookie: "sid=2".into(),
                raw: serde_json::Value::Null,
            })
        });

        let err = manager(marketplace, &store).renew(6).await.unwrap_err();
        assert!(matches!(err, TrackerError::TrackingDisabled(6)));
        assert!(!store.load_credentials(6).await.unwrap().tracking_enabled());
    }
}
