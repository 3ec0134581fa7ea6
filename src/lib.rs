//! Marketplace listing tracker: logs users in to the marketplace, polls for
//! newly published listings and delivers each one to the user's chat.

pub mod api;
pub mod control;
pub mod core;
pub mod crypto;
pub mod notify;
pub mod scanner;
pub mod storage;
pub mod tracking;
