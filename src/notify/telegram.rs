//! Telegram Bot API channel.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::debug;

use crate::config::TelegramConfig;
use crate::error::NotifyError;
use crate::notify::{Alert, Notifier};

pub struct TelegramNotifier {
    config: TelegramConfig,
    token: SecretString,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    disable_web_page_preview: bool,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig, token: SecretString) -> Self {
        Self {
            config,
            token,
            http: reqwest::Client::new(),
        }
    }

    fn send_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.token.expose_secret()
        )
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn channel(&self) -> &str {
        "telegram"
    }

    async fn notify(&self, alert: &Alert<'_>) -> Result<(), NotifyError> {
        let payload = SendMessage {
            chat_id: &self.config.chat_id,
            text: alert.body(),
            disable_web_page_preview: false,
        };

        let response = self.http.post(self.send_url()).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::from_status(status.as_u16(), body));
        }

        debug!(chat_id = %self.config.chat_id, "Telegram message accepted");
        Ok(())
    }
}
