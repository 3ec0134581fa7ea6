use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

use super::{CredentialRecord, CredentialStore};
use crate::core::{Result, TrackerError, UserId};
use crate::scanner::SeenSet;

#[derive(Debug, sqlx::FromRow)]
struct CredentialRow {
    login_cipher: Option<Vec<u8>>,
    password_cipher: Option<Vec<u8>>,
    cookie_cipher: Option<Vec<u8>>,
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Accepts either a `sqlite:` URL or a plain file path.
    pub async fn connect(database: &str) -> Result<Self> {
        let in_memory = database.contains(":memory:");

        let connection_string = if database.starts_with("sqlite:") {
            database.to_string()
        } else {
            if let Some(parent) = Path::new(database).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| TrackerError::Persistence(e.to_string()))?;
                }
            }
            format!("sqlite://{}?mode=rwc", database)
        };

        // An in-memory database lives only as long as its single connection.
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options.connect(&connection_string).await?;

        let store = Self { pool };
        store.initialize_schema().await?;

        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS marketplace_sessions (
                user_id INTEGER PRIMARY KEY,
                login_cipher BLOB,
                password_cipher BLOB,
                cookie_cipher BLOB,
                seen_ids_json TEXT NOT NULL DEFAULT '[]',
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sessions_tracked
            ON marketplace_sessions(user_id) WHERE cookie_cipher IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("✅ Session store schema initialized");

        Ok(())
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn ensure_user(&self, user_id: UserId) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO marketplace_sessions (user_id, created_at, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_credentials(&self, user_id: UserId) -> Result<CredentialRecord> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT login_cipher, password_cipher, cookie_cipher
            FROM marketplace_sessions WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|row| CredentialRecord {
                login_cipher: row.login_cipher,
                password_cipher: row.password_cipher,
                cookie_cipher: row.cookie_cipher,
            })
            .unwrap_or_default())
    }

    async fn save_login(
        &self,
        user_id: UserId,
        login_cipher: Vec<u8>,
        password_cipher: Vec<u8>,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO marketplace_sessions (
                user_id, login_cipher, password_cipher, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                login_cipher = excluded.login_cipher,
                password_cipher = excluded.password_cipher,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(login_cipher)
        .bind(password_cipher)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn store_cookie(&self, user_id: UserId, cookie_cipher: Vec<u8>) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO marketplace_sessions (user_id, cookie_cipher, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                cookie_cipher = excluded.cookie_cipher,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(cookie_cipher)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn refresh_cookie(&self, user_id: UserId, cookie_cipher: Vec<u8>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE marketplace_sessions SET cookie_cipher = ?, updated_at = ?
            WHERE user_id = ? AND cookie_cipher IS NOT NULL
            "#,
        )
        .bind(cookie_cipher)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_cookie(&self, user_id: UserId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE marketplace_sessions SET cookie_cipher = NULL, updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_cookie_if(&self, user_id: UserId, expected: &[u8]) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE marketplace_sessions SET cookie_cipher = NULL, updated_at = ?
            WHERE user_id = ? AND cookie_cipher = ?
            "#,
        )
        .bind(Utc::now())
        .bind(user_id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn load_seen_ids(&self, user_id: UserId) -> Result<SeenSet> {
        let raw = sqlx::query_scalar::<_, String>(
            r#"
            SELECT seen_ids_json FROM marketplace_sessions WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(SeenSet::from_json(raw.as_deref()))
    }

    async fn save_seen_ids(&self, user_id: UserId, seen: &SeenSet) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO marketplace_sessions (user_id, seen_ids_json, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                seen_ids_json = excluded.seen_ids_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(seen.to_json())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn tracked_users(&self) -> Result<Vec<UserId>> {
        let users = sqlx::query_scalar::<_, UserId>(
            r#"
            SELECT user_id FROM marketplace_sessions
            WHERE cookie_cipher IS NOT NULL ORDER BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }
}
