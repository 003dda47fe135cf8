//! Generic adapter for stores that expose a JSON search endpoint.
//!
//! Accepts either a bare array of items or an object wrapping one under
//! `items`, `results` or `products`. Each item needs `title`, `price` and
//! `url`; `sku` is optional.

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::adapters::extract::parse_price_value;
use crate::adapters::http::HttpFetcher;
use crate::adapters::{validate_term, StoreAdapter};
use crate::config::{JsonFeedConfig, RateLimitConfig};
use crate::error::AdapterError;
use crate::watch::models::Offer;

pub struct JsonFeedAdapter {
    id: String,
    config: JsonFeedConfig,
    fetcher: HttpFetcher,
}

impl JsonFeedAdapter {
    pub fn new(
        id: &str,
        config: JsonFeedConfig,
        rate_limit: &RateLimitConfig,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            id: id.to_string(),
            config,
            fetcher: HttpFetcher::new(rate_limit)?,
        })
    }

    fn search_url(&self, term: &str) -> String {
        self.config
            .url_template
            .replace("{query}", &urlencoding::encode(term))
    }

    fn resolve_url(&self, raw: &str) -> Option<String> {
        if let Ok(url) = Url::parse(raw) {
            return Some(url.to_string());
        }
        let base = Url::parse(self.config.base_url.as_deref()?).ok()?;
        base.join(raw).ok().map(|u| u.to_string())
    }

    fn parse_item(&self, item: &Value) -> Option<Offer> {
        let title = item.get("title").or_else(|| item.get("name"))?.as_str()?.trim();
        let url = self.resolve_url(item.get("url").or_else(|| item.get("link"))?.as_str()?)?;
        let price_pln = item.get("price").and_then(parse_price_value)?;
        let sku = item.get("sku").and_then(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        if title.is_empty() {
            return None;
        }

        Some(Offer {
            store: self.id.clone(),
            title: title.to_string(),
            price_pln,
            url,
            sku,
        })
    }
}

fn items_of(body: &Value) -> Option<&Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(map) => ["items", "results", "products"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array)),
        _ => None,
    }
}

#[async_trait]
impl StoreAdapter for JsonFeedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self), fields(store = %self.id))]
    async fn search(&self, term: &str) -> Result<Vec<Offer>, AdapterError> {
        let term = validate_term(term)?;
        let url = self.search_url(term);

        let body: Value = self.fetcher.get_json(&url, &[]).await?;
        let items = items_of(&body)
            .ok_or_else(|| AdapterError::Parse(format!("{url}: no item list in response")))?;

        let offers: Vec<Offer> = items
            .iter()
            .filter_map(|item| {
                let offer = self.parse_item(item);
                if offer.is_none() {
                    debug!(item = %item, "Dropping feed item without title, url or price");
                }
                offer
            })
            .collect();

        debug!(items = items.len(), offers = offers.len(), "Feed parsed");
        Ok(offers)
    }

    fn reset_budget(&self) {
        self.fetcher.budget().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::http::tests::test_rate_limit;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> JsonFeedAdapter {
        JsonFeedAdapter::new(
            "x-kom",
            JsonFeedConfig {
                url_template: format!("{}/api/search?q={{query}}", server.uri()),
                base_url: Some("https://x-kom.pl".to_string()),
            },
            &test_rate_limit(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_search_parses_wrapped_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/search"))
            .and(query_param("q", "RTX 4070"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"title": "MSI GeForce RTX 4070 Ventus", "price": "2 999,99 zł", "url": "/p/1", "sku": "MSI-4070"},
                    {"title": "Gigabyte RTX 4070 Eagle", "price": 3149.00, "url": "https://x-kom.pl/p/2", "sku": 1234},
                    {"title": "Brak ceny", "url": "/p/3"}
                ]
            })))
            .mount(&server)
            .await;

        let offers = adapter(&server).search("RTX 4070").await.unwrap();
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].store, "x-kom");
        assert_eq!(offers[0].price_pln, dec!(2999.99));
        assert_eq!(offers[0].url, "https://x-kom.pl/p/1");
        assert_eq!(offers[0].sku.as_deref(), Some("MSI-4070"));
        assert_eq!(offers[1].sku.as_deref(), Some("1234"));
    }

    #[tokio::test]
    async fn test_empty_results_are_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let offers = adapter(&server).search("RTX 4070").await.unwrap();
        assert!(offers.is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_shape_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "maintenance"})))
            .mount(&server)
            .await;

        let err = adapter(&server).search("RTX 4070").await.unwrap_err();
        assert!(matches!(err, AdapterError::Parse(_)));
    }

    #[tokio::test]
    async fn test_empty_term_rejected_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let err = adapter(&server).search("  ").await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidTerm));
    }

    #[tokio::test]
    async fn test_server_error_surfaces_as_adapter_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = adapter(&server).search("RTX 4070").await.unwrap_err();
        assert!(matches!(err, AdapterError::UnexpectedStatus { status: 502, .. }));
    }
}
