use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::RegexBuilder;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub database: DatabaseConfig,
    pub rate_limit: RateLimitConfig,
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub currency: CurrencyConfig,
    #[serde(default)]
    pub availability: AvailabilityConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    pub stores: Vec<StoreConfig>,
    pub products: Vec<ProductConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub frequency_minutes: u64,
    pub search_timeout_seconds: u64,
    pub notify_timeout_seconds: u64,
    pub max_concurrent_searches: usize,
}

impl AgentConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_seconds)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
    pub max_requests_per_run: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub log_level: String,
    #[serde(default)]
    pub json: bool,
}

/// Conversion rates into PLN. A currency without a rate is not parsed at all.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CurrencyConfig {
    pub eur_to_pln: Option<Decimal>,
    pub czk_to_pln: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AvailabilityConfig {
    #[serde(default)]
    pub require_in_stock: bool,
    #[serde(default)]
    pub out_of_stock: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: StoreKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreKind {
    /// Any store exposing a JSON search endpoint.
    JsonFeed(JsonFeedConfig),
    /// Google Custom Search across shops, with price extraction from each page.
    Websearch(WebsearchConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonFeedConfig {
    /// Search URL; `{query}` is replaced with the URL-encoded search term.
    pub url_template: String,
    /// Prefix for relative offer URLs.
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebsearchConfig {
    #[serde(default = "default_cse_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub site_whitelist: Vec<String>,
    #[serde(default)]
    pub site_blacklist: Vec<String>,
    #[serde(default)]
    pub url_whitelist_patterns: Vec<String>,
    #[serde(default)]
    pub url_blacklist_patterns: Vec<String>,
    #[serde(default)]
    pub exact_phrase: bool,
    #[serde(default = "default_true")]
    pub prefer_country_pl: bool,
}

fn default_cse_endpoint() -> String {
    "https://www.googleapis.com/customsearch/v1".to_string()
}

fn default_max_results() -> usize {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductConfig {
    pub name: String,
    /// Search term override; defaults to `name`.
    pub query: Option<String>,
    /// Title regex; defaults to the escaped `name`. Always case-insensitive.
    pub pattern: Option<String>,
    pub max_price_pln: Decimal,
    pub stores: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationsConfig {
    pub telegram: Option<TelegramConfig>,
    pub email: Option<EmailConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub chat_id: String,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub enabled: bool,
    /// Mail relay endpoint accepting a JSON message with bearer auth.
    pub endpoint: String,
    pub from: String,
    pub to: Vec<String>,
}

/// Secrets loaded exclusively from environment variables.
/// Not serializable, not stored in config files.
#[derive(Default)]
pub struct Secrets {
    pub telegram_bot_token: Option<SecretString>,
    pub email_api_key: Option<SecretString>,
    pub google_cse_key: Option<SecretString>,
    pub google_cse_cx: Option<SecretString>,
}

impl Secrets {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty()).map(SecretString::from);
        Self {
            telegram_bot_token: var("TELEGRAM_BOT_TOKEN"),
            email_api_key: var("EMAIL_API_KEY"),
            google_cse_key: var("GOOGLE_CSE_KEY"),
            google_cse_cx: var("GOOGLE_CSE_CX"),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, overlaying environment variables for secrets.
    pub fn load(config_path: &Path) -> Result<(Self, Secrets)> {
        dotenvy::dotenv().ok();

        let config = Self::read(config_path)?;
        let secrets = Secrets::from_env();
        config
            .validate(&secrets)
            .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;

        Ok((config, secrets))
    }

    /// Parse the TOML file without validating it or reading secrets.
    /// Enough for commands that only read the offer store.
    pub fn read(config_path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self, secrets: &Secrets) -> Result<(), ConfigError> {
        if self.agent.max_concurrent_searches == 0 {
            return Err(ConfigError::NonPositive { field: "agent.max_concurrent_searches" });
        }
        if self.agent.search_timeout_seconds == 0 {
            return Err(ConfigError::NonPositive { field: "agent.search_timeout_seconds" });
        }
        if self.agent.notify_timeout_seconds == 0 {
            return Err(ConfigError::NonPositive { field: "agent.notify_timeout_seconds" });
        }
        if self.rate_limit.request_timeout_seconds == 0 {
            return Err(ConfigError::NonPositive { field: "rate_limit.request_timeout_seconds" });
        }

        let mut store_ids = HashSet::new();
        for store in &self.stores {
            if store.id.trim().is_empty() {
                return Err(ConfigError::EmptyStoreId);
            }
            if !store_ids.insert(store.id.as_str()) {
                return Err(ConfigError::DuplicateStore(store.id.clone()));
            }
            match &store.kind {
                StoreKind::JsonFeed(feed) => {
                    if !feed.url_template.contains("{query}") {
                        return Err(ConfigError::InvalidStore {
                            store: store.id.clone(),
                            reason: "url_template must contain {query}".to_string(),
                        });
                    }
                }
                StoreKind::Websearch(ws) => {
                    if secrets.google_cse_key.is_none() {
                        return Err(ConfigError::MissingSecret("GOOGLE_CSE_KEY"));
                    }
                    if secrets.google_cse_cx.is_none() {
                        return Err(ConfigError::MissingSecret("GOOGLE_CSE_CX"));
                    }
                    for pattern in ws.url_whitelist_patterns.iter().chain(&ws.url_blacklist_patterns) {
                        if let Err(e) = regex::Regex::new(pattern) {
                            return Err(ConfigError::InvalidStore {
                                store: store.id.clone(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        if self.products.is_empty() {
            return Err(ConfigError::NoProducts);
        }
        for (index, product) in self.products.iter().enumerate() {
            if product.name.trim().is_empty() {
                return Err(ConfigError::EmptyProductName { index });
            }
            if product.max_price_pln.is_sign_negative() {
                return Err(ConfigError::NegativeThreshold { product: product.name.clone() });
            }
            if product.stores.is_empty() {
                return Err(ConfigError::NoStores { product: product.name.clone() });
            }
            if let Some(pattern) = &product.pattern {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ConfigError::InvalidPattern {
                        product: product.name.clone(),
                        reason: e.to_string(),
                    })?;
            }
            for store in &product.stores {
                if !store_ids.contains(store.as_str()) {
                    return Err(ConfigError::UnknownStore {
                        product: product.name.clone(),
                        store: store.clone(),
                    });
                }
            }
        }

        if let Some(telegram) = &self.notifications.telegram {
            if telegram.enabled && secrets.telegram_bot_token.is_none() {
                return Err(ConfigError::MissingSecret("TELEGRAM_BOT_TOKEN"));
            }
        }
        if let Some(email) = &self.notifications.email {
            if email.enabled && secrets.email_api_key.is_none() {
                return Err(ConfigError::MissingSecret("EMAIL_API_KEY"));
            }
        }

        Ok(())
    }
}
