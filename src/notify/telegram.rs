use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{InlineKeyboard, Notifier};
use crate::core::{MessageId, Result, TrackerError, UserId};

/// Telegram Bot API delivery. Users are addressed by their private chat id,
/// which equals their user id.
pub struct TelegramNotifier {
    client: Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: MessageId,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: UserId,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard>,
}

#[derive(Debug, Serialize)]
struct EditMarkup {
    chat_id: UserId,
    message_id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard>,
}

impl TelegramNotifier {
    pub fn new(api_url: &str, bot_token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrackerError::Delivery(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/bot{}", api_url.trim_end_matches('/'), bot_token),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.endpoint, method)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| TrackerError::Delivery(format!("{}: {}", method, e.without_url())))?;

        let status = response.status();
        let body: TelegramResponse<T> = response.json().await.map_err(|e| {
            TrackerError::Delivery(format!("{}: unreadable response ({}): {}", method, status, e))
        })?;

        if !body.ok {
            let description = body
                .description
                .unwrap_or_else(|| format!("status {}", status));
            return Err(match body.parameters.and_then(|p| p.retry_after) {
                Some(retry_after) => TrackerError::Delivery(format!(
                    "{}: {} (retry after {}s)",
                    method, description, retry_after
                )),
                None => TrackerError::Delivery(format!("{}: {}", method, description)),
            });
        }

        body.result
            .ok_or_else(|| TrackerError::Delivery(format!("{}: response without result", method)))
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_text(
        &self,
        user_id: UserId,
        html: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageId> {
        let payload = SendMessage {
            chat_id: user_id,
            text: html,
            parse_mode: "HTML",
            disable_web_page_preview: true,
            reply_markup: keyboard,
        };

        let request = self.client.post(self.method_url("sendMessage")).json(&payload);
        let sent: SentMessage = self.call("sendMessage", request).await?;
        Ok(sent.message_id)
    }

    async fn send_document(
        &self,
        user_id: UserId,
        bytes: Vec<u8>,
        filename: String,
        caption: Option<String>,
    ) -> Result<MessageId> {
        let mut form = Form::new()
            .text("chat_id", user_id.to_string())
            .part("document", Part::bytes(bytes).file_name(filename));
        if let Some(caption) = caption {
            form = form.text("caption", caption);
        }

        let request = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form);
        let sent: SentMessage = self.call("sendDocument", request).await?;
        Ok(sent.message_id)
    }

    async fn edit_message_markup(
        &self,
        user_id: UserId,
        message_id: MessageId,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<()> {
        let payload = EditMarkup {
            chat_id: user_id,
            message_id,
            reply_markup: keyboard,
        };

        let request = self
            .client
            .post(self.method_url("editMessageReplyMarkup"))
            .json(&payload);
        let _: serde_json::Value = self.call("editMessageReplyMarkup", request).await?;
        Ok(())
    }
}
