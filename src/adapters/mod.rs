pub mod extract;
pub mod http;
pub mod json_feed;
pub mod websearch;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AppConfig, Secrets, StoreKind};
use crate::error::{AdapterError, ConfigError};
use crate::watch::models::Offer;

use self::json_feed::JsonFeedAdapter;
use self::websearch::WebsearchAdapter;

/// Contract every store integration fulfils.
///
/// `search` returns an empty list when nothing matches and reserves errors for
/// network, status and parse failures. Implementations own their rate limiting
/// and must not exceed their per-run request budget.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Store identifier used in offers and configuration.
    fn id(&self) -> &str;

    async fn search(&self, term: &str) -> Result<Vec<Offer>, AdapterError>;

    /// Start a new run with a fresh request budget.
    fn reset_budget(&self) {}
}

/// Reject empty search terms before any I/O happens.
pub fn validate_term(term: &str) -> Result<&str, AdapterError> {
    let term = term.trim();
    if term.is_empty() {
        Err(AdapterError::InvalidTerm)
    } else {
        Ok(term)
    }
}

/// Adapters by store id.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn StoreAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one adapter per configured store.
    pub fn from_config(config: &AppConfig, secrets: &Secrets) -> Result<Self, ConfigError> {
        let mut registry = Self::new();

        for store in &config.stores {
            let invalid = |reason: String| ConfigError::InvalidStore {
                store: store.id.clone(),
                reason,
            };
            let adapter: Arc<dyn StoreAdapter> = match &store.kind {
                StoreKind::JsonFeed(feed) => Arc::new(
                    JsonFeedAdapter::new(&store.id, feed.clone(), &config.rate_limit)
                        .map_err(|e| invalid(e.to_string()))?,
                ),
                StoreKind::Websearch(ws) => {
                    let key = secrets
                        .google_cse_key
                        .clone()
                        .ok_or(ConfigError::MissingSecret("GOOGLE_CSE_KEY"))?;
                    let cx = secrets
                        .google_cse_cx
                        .clone()
                        .ok_or(ConfigError::MissingSecret("GOOGLE_CSE_CX"))?;
                    Arc::new(
                        WebsearchAdapter::new(
                            &store.id,
                            ws.clone(),
                            key,
                            cx,
                            config.currency.clone(),
                            config.availability.clone(),
                            &config.rate_limit,
                        )
                        .map_err(|e| invalid(e.to_string()))?,
                    )
                }
            };
            registry.register(adapter);
        }

        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn StoreAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, store: &str) -> Option<Arc<dyn StoreAdapter>> {
        self.adapters.get(store).cloned()
    }

    pub fn reset_budgets(&self) {
        for adapter in self.adapters.values() {
            adapter.reset_budget();
        }
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
