use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub marketplace: MarketplaceConfig,
    pub telegram: TelegramConfig,
    pub database: DatabaseConfig,
    pub tracking: TrackingConfig,
    pub vault: VaultConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketplaceConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub api_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    pub key_dir: PathBuf,
    pub key_bits: usize,
    pub rotate_on_start: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub control_port: u16,
    pub log_level: String,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://kwork.ru".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl MarketplaceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
        }
    }
}

impl TrackingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("data/keys"),
            key_bits: 8192,
            rotate_on_start: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let marketplace_defaults = MarketplaceConfig::default();
        let vault_defaults = VaultConfig::default();

        Ok(Config {
            marketplace: MarketplaceConfig {
                base_url: env::var("MARKETPLACE_BASE_URL")
                    .unwrap_or(marketplace_defaults.base_url)
                    .trim_end_matches('/')
                    .to_string(),
                request_timeout_secs: parsed_or(
                    "REQUEST_TIMEOUT_SECS",
                    marketplace_defaults.request_timeout_secs,
                ),
            },
            telegram: TelegramConfig {
                bot_token: env::var("BOT_TOKEN").context("BOT_TOKEN must be set")?,
                api_url: env::var("TELEGRAM_API_URL")
                    .unwrap_or_else(|_| "https://api.telegram.org".to_string())
                    .trim_end_matches('/')
                    .to_string(),
            },
            database: DatabaseConfig {
                url: env::var("DB_URL").unwrap_or_else(|_| "data/tracker.db".to_string()),
            },
            tracking: TrackingConfig {
                poll_interval_secs: parsed_or(
                    "POLL_INTERVAL_SECS",
                    TrackingConfig::default().poll_interval_secs,
                ),
            },
            vault: VaultConfig {
                key_dir: env::var("VAULT_KEY_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(vault_defaults.key_dir),
                key_bits: parsed_or("VAULT_KEY_BITS", vault_defaults.key_bits),
                rotate_on_start: parsed_or("VAULT_ROTATE_ON_START", false),
            },
            monitoring: MonitoringConfig {
                control_port: parsed_or("CONTROL_PORT", 3000),
                log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            },
        })
    }
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}
