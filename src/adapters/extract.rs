//! Price and text extraction from store responses and product pages.

use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::config::CurrencyConfig;

/// A bare number, optionally with space-grouped thousands and a `,`/`.` decimal part.
fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{1,3}(?:[ \u{a0}\u{202f}]\d{3})+|\d+)(?:[.,](\d{1,2}))?").expect("valid regex")
    })
}

/// A number followed by a currency unit, as printed on Polish and Czech shop pages.
fn priced_text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(\d{1,5}(?:[ \u{a0}]?\d{3})*(?:[.,]\d{1,2})?)\s*((?:zł|pln|eur|kč|kc|czk)\b|€)",
        )
        .expect("valid regex")
    })
}

fn jsonld_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<script[^>]+type=["']application/ld\+json["'][^>]*>(.*?)</script>"#)
            .expect("valid regex")
    })
}

/// Parse a human-formatted price such as `"2 999,99 zł"` or `"3000.00"`.
pub fn parse_price(raw: &str) -> Option<Decimal> {
    let caps = number_re().captures(raw)?;
    let integer: String = caps[1].chars().filter(char::is_ascii_digit).collect();
    let value = match caps.get(2) {
        Some(frac) => format!("{integer}.{}", frac.as_str()),
        None => integer,
    };
    Decimal::from_str(&value).ok()
}

/// Parse a price that may arrive as a JSON number or string.
pub fn parse_price_value(value: &Value) -> Option<Decimal> {
    let price = match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => parse_price(s),
        _ => None,
    }?;
    (!price.is_sign_negative()).then_some(price)
}

/// Convert an amount into PLN. Currencies without a configured rate yield `None`.
pub fn convert_to_pln(value: Decimal, unit: &str, rates: &CurrencyConfig) -> Option<Decimal> {
    match unit.trim().to_lowercase().as_str() {
        "" | "zł" | "pln" => Some(value),
        "€" | "eur" => rates.eur_to_pln.map(|rate| (value * rate).round_dp(2)),
        "kč" | "kc" | "czk" => rates.czk_to_pln.map(|rate| (value * rate).round_dp(2)),
        _ => None,
    }
}

/// Lowest PLN price among `<number> <currency>` occurrences in the text.
pub fn extract_price_from_text(text: &str, rates: &CurrencyConfig) -> Option<Decimal> {
    priced_text_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let value = parse_price(&caps[1])?;
            convert_to_pln(value, &caps[2], rates)
        })
        .min()
}

/// Lowest PLN price found in `application/ld+json` Product/Offer blocks.
pub fn extract_price_from_jsonld(html: &str, rates: &CurrencyConfig) -> Option<Decimal> {
    let mut prices = Vec::new();

    for caps in jsonld_re().captures_iter(html) {
        let block = caps[1].trim();
        if block.is_empty() {
            continue;
        }

        // Some shops glue several JSON documents into one script tag, one per line.
        let documents: Vec<Value> = match serde_json::from_str::<Value>(block) {
            Ok(doc) => vec![doc],
            Err(_) => block
                .lines()
                .filter_map(|line| serde_json::from_str(line.trim()).ok())
                .collect(),
        };

        let mut stack: Vec<&Value> = documents.iter().collect();
        while let Some(node) = stack.pop() {
            match node {
                Value::Object(map) => {
                    let kind = schema_type(map.get("@type").or_else(|| map.get("type")));
                    if kind.contains("product") || kind.contains("offer") {
                        if let Some(offers) = map.get("offers") {
                            stack.push(offers);
                        } else if let Some(price) = ["price", "lowPrice", "highPrice"]
                            .iter()
                            .find_map(|k| map.get(*k).and_then(parse_price_value))
                        {
                            let currency = map
                                .get("priceCurrency")
                                .or_else(|| map.get("pricecurrency"))
                                .and_then(Value::as_str)
                                .unwrap_or("");
                            if let Some(pln) = convert_to_pln(price, currency, rates) {
                                prices.push(pln);
                            }
                        }
                    }
                    stack.extend(map.values().filter(|v| v.is_object() || v.is_array()));
                }
                Value::Array(items) => {
                    stack.extend(items.iter().filter(|v| v.is_object() || v.is_array()));
                }
                _ => {}
            }
        }
    }

    prices.into_iter().min()
}

fn schema_type(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.to_lowercase(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase(),
        _ => String::new(),
    }
}

/// Decode the handful of HTML entities that show up in search result titles.
pub fn html_unescape(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let decoded = tail.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &tail[1..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .map(|hex| u32::from_str_radix(hex, 16).ok())
                    .unwrap_or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            }?;
            Some((ch, end))
        });
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// True when the page text contains any of the out-of-stock markers.
pub fn looks_out_of_stock(html: &str, markers: &[String]) -> bool {
    if markers.is_empty() {
        return false;
    }
    let lower = html.to_lowercase();
    markers
        .iter()
        .filter(|m| !m.trim().is_empty())
        .any(|m| lower.contains(&m.to_lowercase()))
}
