use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ProductConfig;
use crate::error::ConfigError;

/// Configured intent: which product to look for, where, and at what price.
#[derive(Debug, Clone)]
pub struct ProductWatch {
    pub name: String,
    pub query: String,
    pub title_pattern: Regex,
    pub max_price_pln: Decimal,
    pub stores: Vec<String>,
}

impl ProductWatch {
    pub fn from_config(product: &ProductConfig) -> Result<Self, ConfigError> {
        let pattern = product
            .pattern
            .clone()
            .unwrap_or_else(|| regex::escape(product.name.trim()));
        let title_pattern = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ConfigError::InvalidPattern {
                product: product.name.clone(),
                reason: e.to_string(),
            })?;

        let query = product
            .query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(&product.name)
            .trim()
            .to_string();

        Ok(Self {
            name: product.name.clone(),
            query,
            title_pattern,
            max_price_pln: product.max_price_pln,
            stores: product.stores.clone(),
        })
    }

    pub fn matches_title(&self, title: &str) -> bool {
        self.title_pattern.is_match(title)
    }

    /// Inclusive threshold check.
    pub fn qualifies(&self, price: Decimal) -> bool {
        price <= self.max_price_pln
    }
}

/// One observation returned by an adapter. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub store: String,
    pub title: String,
    pub price_pln: Decimal,
    pub url: String,
    pub sku: Option<String>,
}

impl Offer {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::for_offer(self)
    }
}

/// Deduplication key: the SKU when present, otherwise a digest of normalized title and URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn for_offer(offer: &Offer) -> Self {
        if let Some(sku) = offer.sku.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            return Self(format!("sku:{}:{}", offer.store, sku.to_lowercase()));
        }

        let mut hasher = Sha256::new();
        hasher.update(normalize_title(&offer.title).as_bytes());
        hasher.update(b"\n");
        hasher.update(normalize_url(&offer.url).as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("url:{}:{hex}", offer.store))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let url = url.split_once('#').map_or(url, |(head, _)| head);
    url.trim_end_matches('/').to_string()
}

/// Persisted state for one identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfferRecord {
    pub identity_key: IdentityKey,
    pub store: String,
    pub title: String,
    pub url: String,
    pub sku: Option<String>,
    pub price_pln: Decimal,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// One row of price history for an identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceObservation {
    pub price_pln: Decimal,
    pub seen_at: DateTime<Utc>,
}
