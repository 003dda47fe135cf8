//! Email through an HTTP mail relay.
//!
//! The relay receives `{from, to, subject, text}` as JSON with a bearer key.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::debug;

use crate::config::EmailConfig;
use crate::error::NotifyError;
use crate::notify::{Alert, Notifier};

pub struct EmailNotifier {
    config: EmailConfig,
    api_key: SecretString,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct OutgoingMail<'a> {
    from: &'a str,
    to: &'a [String],
    subject: String,
    text: String,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig, api_key: SecretString) -> Self {
        Self {
            config,
            api_key,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn channel(&self) -> &str {
        "email"
    }

    async fn notify(&self, alert: &Alert<'_>) -> Result<(), NotifyError> {
        let mail = OutgoingMail {
            from: &self.config.from,
            to: &self.config.to,
            subject: alert.subject(),
            text: alert.body(),
        };

        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&mail)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::from_status(status.as_u16(), body));
        }

        debug!(recipients = self.config.to.len(), "Email accepted by relay");
        Ok(())
    }
}
