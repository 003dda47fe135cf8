//! Web search adapter.
//!
//! Finds candidate product pages through Google Custom Search, fetches each
//! page and pulls a PLN price out of its JSON-LD, or failing that out of the
//! page text. Pages are filtered by domain, URL pattern and stock markers
//! before any price is read.

use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::adapters::extract::{
    extract_price_from_jsonld, extract_price_from_text, html_unescape, looks_out_of_stock,
};
use crate::adapters::http::HttpFetcher;
use crate::adapters::{validate_term, StoreAdapter};
use crate::config::{AvailabilityConfig, CurrencyConfig, RateLimitConfig, WebsearchConfig};
use crate::error::AdapterError;
use crate::watch::models::Offer;

/// Custom Search returns at most 10 results per page and 100 per query.
const PAGE_SIZE: usize = 10;
const MAX_START: usize = 91;

#[derive(Debug, Deserialize)]
struct CseResponse {
    #[serde(default)]
    items: Vec<CseItem>,
}

#[derive(Debug, Deserialize)]
struct CseItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
}

pub struct WebsearchAdapter {
    id: String,
    config: WebsearchConfig,
    api_key: SecretString,
    cx: SecretString,
    currency: CurrencyConfig,
    availability: AvailabilityConfig,
    url_whitelist: Vec<Regex>,
    url_blacklist: Vec<Regex>,
    fetcher: HttpFetcher,
}

/// Why a search result did not become an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    DomainNotWhitelisted,
    DomainBlacklisted,
    UrlNotWhitelisted,
    UrlBlacklisted,
}

impl WebsearchAdapter {
    pub fn new(
        id: &str,
        config: WebsearchConfig,
        api_key: SecretString,
        cx: SecretString,
        currency: CurrencyConfig,
        availability: AvailabilityConfig,
        rate_limit: &RateLimitConfig,
    ) -> Result<Self, AdapterError> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| Regex::new(p).map_err(|e| AdapterError::Parse(format!("pattern {p:?}: {e}"))))
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(Self {
            id: id.to_string(),
            url_whitelist: compile(&config.url_whitelist_patterns)?,
            url_blacklist: compile(&config.url_blacklist_patterns)?,
            config,
            api_key,
            cx,
            currency,
            availability,
            fetcher: HttpFetcher::new(rate_limit)?,
        })
    }

    fn query_params(&self, term: &str, start: usize) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("key", self.api_key.expose_secret().to_string()),
            ("cx", self.cx.expose_secret().to_string()),
            ("q", term.to_string()),
            ("num", PAGE_SIZE.to_string()),
            ("start", start.to_string()),
            ("hl", "pl".to_string()),
            ("gl", "pl".to_string()),
            ("safe", "off".to_string()),
        ];
        if self.config.exact_phrase {
            params.push(("exactTerms", term.to_string()));
        }
        if self.config.prefer_country_pl {
            params.push(("cr", "countryPL".to_string()));
        }
        params
    }

    fn screen(&self, link: &str) -> Result<(), Rejection> {
        let domain = registrable_domain(link).unwrap_or_default();

        if !self.config.site_whitelist.is_empty()
            && !self.config.site_whitelist.iter().any(|w| domain.ends_with(w.as_str()))
        {
            return Err(Rejection::DomainNotWhitelisted);
        }
        if self.config.site_blacklist.iter().any(|b| domain.ends_with(b.as_str())) {
            return Err(Rejection::DomainBlacklisted);
        }
        if !self.url_whitelist.is_empty() && !self.url_whitelist.iter().any(|p| p.is_match(link)) {
            return Err(Rejection::UrlNotWhitelisted);
        }
        if self.url_blacklist.iter().any(|p| p.is_match(link)) {
            return Err(Rejection::UrlBlacklisted);
        }
        Ok(())
    }

    /// Fetch a candidate page and read its price. `None` when the page is
    /// unreachable, out of stock, or carries no recognizable price.
    async fn price_page(&self, link: &str) -> Result<Option<rust_decimal::Decimal>, AdapterError> {
        let html = match self.fetcher.get_text(link).await {
            Ok(html) => html,
            Err(e @ AdapterError::BudgetExhausted { .. }) => return Err(e),
            Err(e) => {
                debug!(url = link, error = %e, "Candidate page fetch failed");
                return Ok(None);
            }
        };

        if self.availability.require_in_stock
            && looks_out_of_stock(&html, &self.availability.out_of_stock)
        {
            debug!(url = link, "Candidate page is out of stock");
            return Ok(None);
        }

        let price = extract_price_from_jsonld(&html, &self.currency)
            .or_else(|| extract_price_from_text(&html, &self.currency));
        if price.is_none() {
            debug!(url = link, "No price found on candidate page");
        }
        Ok(price)
    }
}

#[async_trait]
impl StoreAdapter for WebsearchAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self), fields(store = %self.id))]
    async fn search(&self, term: &str) -> Result<Vec<Offer>, AdapterError> {
        let term = validate_term(term)?;
        let mut offers = Vec::new();
        let mut seen_urls = HashSet::new();
        let mut start = 1;

        'pages: while offers.len() < self.config.max_results && start <= MAX_START {
            let page: CseResponse = match self
                .fetcher
                .get_json(&self.config.endpoint, &self.query_params(term, start))
                .await
            {
                Ok(page) => page,
                Err(e @ AdapterError::BudgetExhausted { .. }) if !offers.is_empty() => {
                    warn!(offers = offers.len(), error = %e, "Keeping offers priced before the budget ran out");
                    break 'pages;
                }
                Err(e) => return Err(e),
            };

            if page.items.is_empty() {
                debug!(start, "Search returned no more results");
                break;
            }

            for item in &page.items {
                if item.link.is_empty() || !seen_urls.insert(item.link.clone()) {
                    continue;
                }
                if let Err(reason) = self.screen(&item.link) {
                    debug!(url = %item.link, ?reason, "Search result filtered out");
                    continue;
                }

                let price_pln = match self.price_page(&item.link).await {
                    Ok(Some(price)) => price,
                    Ok(None) => continue,
                    Err(e @ AdapterError::BudgetExhausted { .. }) if !offers.is_empty() => {
                        warn!(offers = offers.len(), error = %e, "Keeping offers priced before the budget ran out");
                        break 'pages;
                    }
                    Err(e) => return Err(e),
                };

                offers.push(Offer {
                    store: self.id.clone(),
                    title: html_unescape(&item.title),
                    price_pln,
                    url: item.link.clone(),
                    sku: None,
                });

                if offers.len() >= self.config.max_results {
                    break;
                }
            }

            start += PAGE_SIZE;
        }

        info!(
            offers = offers.len(),
            requests_used = self.fetcher.budget().used(),
            "Web search finished"
        );
        Ok(offers)
    }

    fn reset_budget(&self) {
        self.fetcher.budget().reset();
    }
}

/// Last two labels of a link's host, or three when the TLD is short (`www.x-kom.pl`, `example.com.pl`).
fn registrable_domain(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    let host = url.host_str()?;
    let parts: Vec<&str> = host.split('.').collect();
    let take = if parts.len() >= 3 && parts.last().is_some_and(|tld| tld.len() <= 3) {
        3
    } else {
        2
    };
    Some(parts[parts.len().saturating_sub(take)..].join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::http::tests::test_rate_limit;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: String) -> WebsearchConfig {
        WebsearchConfig {
            endpoint,
            max_results: 10,
            site_whitelist: vec![],
            site_blacklist: vec![],
            url_whitelist_patterns: vec![],
            url_blacklist_patterns: vec![r"/blog/".to_string()],
            exact_phrase: true,
            prefer_country_pl: true,
        }
    }

    fn adapter(config: WebsearchConfig) -> WebsearchAdapter {
        WebsearchAdapter::new(
            "web",
            config,
            SecretString::from("test-key".to_string()),
            SecretString::from("test-cx".to_string()),
            CurrencyConfig::default(),
            AvailabilityConfig {
                require_in_stock: true,
                out_of_stock: vec!["niedostępny".to_string()],
            },
            &test_rate_limit(),
        )
        .unwrap()
    }

    #[test]
    fn test_registrable_domain() {
        assert_eq!(registrable_domain("https://www.x-kom.pl/p/1").as_deref(), Some("www.x-kom.pl"));
        assert_eq!(registrable_domain("https://shop.example.com.pl/x").as_deref(), Some("example.com.pl"));
        assert_eq!(registrable_domain("https://allegro.pl").as_deref(), Some("allegro.pl"));
        assert_eq!(registrable_domain("not a url"), None);
    }

    #[test]
    fn test_screen_filters() {
        let mut cfg = config("http://unused".to_string());
        cfg.site_whitelist = vec!["x-kom.pl".to_string(), "euro.com.pl".to_string()];
        cfg.site_blacklist = vec!["allegro.pl".to_string()];
        let adapter = adapter(cfg);

        assert!(adapter.screen("https://www.x-kom.pl/p/1").is_ok());
        assert_eq!(
            adapter.screen("https://www.morele.net/p/1"),
            Err(Rejection::DomainNotWhitelisted)
        );
        assert_eq!(
            adapter.screen("https://www.x-kom.pl/blog/rtx"),
            Err(Rejection::UrlBlacklisted)
        );
    }

    #[tokio::test]
    async fn test_search_extracts_prices_and_skips_unusable_pages() {
        let server = MockServer::start().await;
        let base = server.uri();

        Mock::given(method("GET"))
            .and(path("/customsearch"))
            .and(query_param("q", "RTX 4070"))
            .and(query_param("exactTerms", "RTX 4070"))
            .and(query_param("cr", "countryPL"))
            .and(query_param("start", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"title": "MSI RTX 4070 &amp; gra", "link": format!("{base}/p/jsonld")},
                    {"title": "Gigabyte RTX 4070", "link": format!("{base}/p/text")},
                    {"title": "RTX 4070 niedostępny", "link": format!("{base}/p/gone")},
                    {"title": "Recenzja RTX 4070", "link": format!("{base}/blog/review")},
                    {"title": "Bez ceny", "link": format!("{base}/p/noprice")},
                    {"title": "MSI RTX 4070 duplicate", "link": format!("{base}/p/jsonld")}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/customsearch"))
            .and(query_param("start", "11"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/p/jsonld"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<script type="application/ld+json">{"@type":"Product","offers":{"@type":"Offer","price":"2899.00","priceCurrency":"PLN"}}</script>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/p/text"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<span>2 999,99 zł</span>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/p/gone"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<b>Produkt niedostępny</b> 2 500 zł"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/p/noprice"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>Zapytaj o cenę</p>"))
            .mount(&server)
            .await;

        let adapter = adapter(config(format!("{base}/customsearch")));
        let offers = adapter.search("RTX 4070").await.unwrap();

        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].title, "MSI RTX 4070 & gra");
        assert_eq!(offers[0].price_pln, dec!(2899.00));
        assert_eq!(offers[0].store, "web");
        assert_eq!(offers[1].price_pln, dec!(2999.99));
        assert!(offers.iter().all(|o| o.sku.is_none()));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_keeps_priced_offers() {
        let server = MockServer::start().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/customsearch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"title": "MSI RTX 4070", "link": format!("{base}/p/first")},
                    {"title": "Gigabyte RTX 4070", "link": format!("{base}/p/second")}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/p/first"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<span>2 899,00 zł</span>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/p/second"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<span>2 799,00 zł</span>"))
            .expect(0)
            .mount(&server)
            .await;

        // One search page plus one product page.
        let mut rate_limit = test_rate_limit();
        rate_limit.max_requests_per_run = 2;
        let adapter = WebsearchAdapter::new(
            "web",
            config(format!("{base}/customsearch")),
            SecretString::from("test-key".to_string()),
            SecretString::from("test-cx".to_string()),
            CurrencyConfig::default(),
            AvailabilityConfig::default(),
            &rate_limit,
        )
        .unwrap();

        let offers = adapter.search("RTX 4070").await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].price_pln, dec!(2899.00));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_without_offers_is_error() {
        let server = MockServer::start().await;
        let mut rate_limit = test_rate_limit();
        rate_limit.max_requests_per_run = 0;
        let adapter = WebsearchAdapter::new(
            "web",
            config(format!("{}/customsearch", server.uri())),
            SecretString::from("test-key".to_string()),
            SecretString::from("test-cx".to_string()),
            CurrencyConfig::default(),
            AvailabilityConfig::default(),
            &rate_limit,
        )
        .unwrap();

        let err = adapter.search("RTX 4070").await.unwrap_err();
        assert!(matches!(err, AdapterError::BudgetExhausted { limit: 0 }));
    }

    #[tokio::test]
    async fn test_search_failure_is_adapter_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/customsearch"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let adapter = adapter(config(format!("{}/customsearch", server.uri())));
        let err = adapter.search("RTX 4070").await.unwrap_err();
        assert!(matches!(err, AdapterError::UnexpectedStatus { status: 403, .. }));
    }
}
