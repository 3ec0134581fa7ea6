use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{CredentialRecord, CredentialStore};
use crate::core::{Result, UserId};
use crate::scanner::SeenSet;

#[derive(Debug, Clone, Default)]
struct UserState {
    credentials: CredentialRecord,
    seen: SeenSet,
}

/// Process-local store, handy for tests and ephemeral runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    users: Arc<RwLock<HashMap<UserId, UserState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn ensure_user(&self, user_id: UserId) -> Result<()> {
        self.users.write().await.entry(user_id).or_default();
        Ok(())
    }

    async fn load_credentials(&self, user_id: UserId) -> Result<CredentialRecord> {
        Ok(self
            .users
            .read()
            .await
            .get(&user_id)
            .map(|state| state.credentials.clone())
            .unwrap_or_default())
    }

    async fn save_login(
        &self,
        user_id: UserId,
        login_cipher: Vec<u8>,
        password_cipher: Vec<u8>,
    ) -> Result<()> {
        let mut users = self.users.write().await;
        let state = users.entry(user_id).or_default();
        state.credentials.login_cipher = Some(login_cipher);
        state.credentials.password_cipher = Some(password_cipher);
        Ok(())
    }

    async fn store_cookie(&self, user_id: UserId, cookie_cipher: Vec<u8>) -> Result<()> {
        self.users
            .write()
            .await
            .entry(user_id)
            .or_default()
            .credentials
            .cookie_cipher = Some(cookie_cipher);
        Ok(())
    }

    async fn refresh_cookie(&self, user_id: UserId, cookie_cipher: Vec<u8>) -> Result<bool> {
        let mut users = self.users.write().await;
        match users
            .get_mut(&user_id)
            .and_then(|state| state.credentials.cookie_cipher.as_mut())
        {
            Some(slot) => {
                *slot = cookie_cipher;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear_cookie(&self, user_id: UserId) -> Result<()> {
        if let Some(state) = self.users.write().await.get_mut(&user_id) {
            state.credentials.cookie_cipher = None;
        }
        Ok(())
    }

    async fn clear_cookie_if(&self, user_id: UserId, expected: &[u8]) -> Result<bool> {
        let mut users = self.users.write().await;
        match users.get_mut(&user_id) {
            Some(state) if state.credentials.cookie_cipher.as_deref() == Some(expected) => {
                state.credentials.cookie_cipher = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn load_seen_ids(&self, user_id: UserId) -> Result<SeenSet> {
        Ok(self
            .users
            .read()
            .await
            .get(&user_id)
            .map(|state| state.seen.clone())
            .unwrap_or_default())
    }

    async fn save_seen_ids(&self, user_id: UserId, seen: &SeenSet) -> Result<()> {
        self.users.write().await.entry(user_id).or_default().seen = seen.clone();
        Ok(())
    }

    async fn tracked_users(&self) -> Result<Vec<UserId>> {
        let mut users: Vec<UserId> = self
            .users
            .read()
            .await
            .iter()
            .filter(|(_, state)| state.credentials.tracking_enabled())
            .map(|(user_id, _)| *user_id)
            .collect();
        users.sort_unstable();
        Ok(users)
    }
}
