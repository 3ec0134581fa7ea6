pub mod kwork;
pub mod types;

pub use kwork::KworkClient;
pub use types::*;

use async_trait::async_trait;

use crate::core::Result;

/// The three marketplace calls the tracking engine depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Authenticate; fails with `TrackerError::Auth` when the marketplace
    /// refuses the credentials.
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse>;

    /// First page of currently open listings, in marketplace order.
    async fn fetch_listings(&self, session_cookie: &str) -> Result<Vec<Listing>>;

    async fn fetch_attachment(&self, session_cookie: &str, url: &str) -> Result<Vec<u8>>;
}
