pub mod config;
pub mod error;
pub mod health;
pub mod logging;

pub use config::Config;
pub use error::{Result, TrackerError};
pub use health::{Component, HealthChecker};

/// Chat-side identity of a user; partition key for all per-user state.
pub type UserId = i64;

/// Marketplace listing identifier.
pub type ListingId = u64;

/// Identifier of a message previously delivered through the notification channel.
pub type MessageId = i64;
