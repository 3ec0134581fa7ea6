pub mod format;
pub mod telegram;

pub use format::ListingLinks;
pub use telegram::TelegramNotifier;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{MessageId, Result, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
}

impl InlineButton {
    pub fn link(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            url: Some(url.into()),
            callback_data: None,
        }
    }

    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            url: None,
            callback_data: Some(data.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboard {
    #[serde(rename = "inline_keyboard")]
    pub rows: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    pub fn single_column(buttons: impl IntoIterator<Item = InlineButton>) -> Self {
        Self {
            rows: buttons.into_iter().map(|button| vec![button]).collect(),
        }
    }
}

/// Outbound channel to the user. Implementations may throttle or fail; the
/// tracking engine treats every failure as a per-listing delivery failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(
        &self,
        user_id: UserId,
        html: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageId>;

    async fn send_document(
        &self,
        user_id: UserId,
        bytes: Vec<u8>,
        filename: String,
        caption: Option<String>,
    ) -> Result<MessageId>;

    async fn edit_message_markup(
        &self,
        user_id: UserId,
        message_id: MessageId,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<()>;
}
