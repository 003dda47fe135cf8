//! Alert delivery.
//!
//! Each configured channel is attempted independently under its own timeout.
//! A failing channel never stops delivery on the others, and nothing here
//! touches the offer store.

pub mod email;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{AppConfig, Secrets};
use crate::error::{ConfigError, NotifyError};
use crate::watch::decision::Decision;
use crate::watch::models::{Offer, ProductWatch};

use self::email::EmailNotifier;
use self::telegram::TelegramNotifier;

/// A qualifying offer on its way to the user.
#[derive(Debug, Clone, Copy)]
pub struct Alert<'a> {
    pub offer: &'a Offer,
    pub watch: &'a ProductWatch,
    pub decision: Decision,
}

impl Alert<'_> {
    pub fn subject(&self) -> String {
        format!(
            "{}: {} PLN w {} (limit {} PLN)",
            self.watch.name, self.offer.price_pln, self.offer.store, self.watch.max_price_pln
        )
    }

    /// Plain-text body: headline, store, title, price and link.
    pub fn body(&self) -> String {
        let headline = match self.decision {
            Decision::PriceDrop { previous } | Decision::FurtherDrop { previous } => format!(
                "Spadek ceny: {} PLN -> {} PLN",
                previous, self.offer.price_pln
            ),
            _ => "Nowa oferta".to_string(),
        };
        format!(
            "{headline}\n\
             Produkt: {product} (limit {limit} PLN)\n\
             Sklep: {store}\n\
             {title}\n\
             Cena: {price} PLN\n\
             {url}",
            product = self.watch.name,
            limit = self.watch.max_price_pln,
            store = self.offer.store,
            title = self.offer.title,
            price = self.offer.price_pln,
            url = self.offer.url,
        )
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name for logs and run reports (e.g. "telegram").
    fn channel(&self) -> &str;

    async fn notify(&self, alert: &Alert<'_>) -> Result<(), NotifyError>;
}

/// Result of one delivery attempt on one channel.
#[derive(Debug)]
pub struct ChannelOutcome {
    pub channel: String,
    pub result: Result<(), NotifyError>,
}

/// All configured channels.
#[derive(Clone)]
pub struct NotifierSet {
    channels: Vec<Arc<dyn Notifier>>,
    timeout: Duration,
}

impl NotifierSet {
    pub fn new(channels: Vec<Arc<dyn Notifier>>, timeout: Duration) -> Self {
        Self { channels, timeout }
    }

    pub fn from_config(config: &AppConfig, secrets: &Secrets) -> Result<Self, ConfigError> {
        let mut channels: Vec<Arc<dyn Notifier>> = Vec::new();

        if let Some(telegram) = config.notifications.telegram.as_ref().filter(|t| t.enabled) {
            let token = secrets
                .telegram_bot_token
                .clone()
                .ok_or(ConfigError::MissingSecret("TELEGRAM_BOT_TOKEN"))?;
            channels.push(Arc::new(TelegramNotifier::new(telegram.clone(), token)));
        }
        if let Some(email) = config.notifications.email.as_ref().filter(|e| e.enabled) {
            let api_key = secrets
                .email_api_key
                .clone()
                .ok_or(ConfigError::MissingSecret("EMAIL_API_KEY"))?;
            channels.push(Arc::new(EmailNotifier::new(email.clone(), api_key)));
        }

        Ok(Self::new(channels, config.agent.notify_timeout()))
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.channel()).collect()
    }

    /// Attempt every channel. With no channels configured the alert is only logged.
    pub async fn dispatch(&self, alert: &Alert<'_>) -> Vec<ChannelOutcome> {
        if self.channels.is_empty() {
            info!(
                product = %alert.watch.name,
                store = %alert.offer.store,
                price = %alert.offer.price_pln,
                url = %alert.offer.url,
                decision = alert.decision.label(),
                "Qualifying offer (no notification channels configured)"
            );
            return Vec::new();
        }

        let mut outcomes = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let result = match tokio::time::timeout(self.timeout, channel.notify(alert)).await {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Timeout {
                    seconds: self.timeout.as_secs(),
                }),
            };

            match &result {
                Ok(()) => info!(
                    channel = channel.channel(),
                    product = %alert.watch.name,
                    store = %alert.offer.store,
                    price = %alert.offer.price_pln,
                    decision = alert.decision.label(),
                    "Notification sent"
                ),
                Err(e) => warn!(
                    channel = channel.channel(),
                    product = %alert.watch.name,
                    store = %alert.offer.store,
                    error = %e,
                    "Notification failed"
                ),
            }

            outcomes.push(ChannelOutcome {
                channel: channel.channel().to_string(),
                result,
            });
        }
        outcomes
    }
}
