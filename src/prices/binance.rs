//! Binance 24h ticker price source (tertiary, exchange-based).
//!
//! API: `GET /api/v3/ticker/24hr?symbol={SYMBOL}USDT`, one request per
//! symbol, issued concurrently. Numbers arrive as strings.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{ids_by_symbol, AssetRef, PriceSource, SourceQuote};

const SOURCE_NAME: &str = "binance";
const QUOTE_ASSET: &str = "USDT";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    last_price: String,
    #[serde(default)]
    price_change_percent: Option<String>,
}

pub struct BinanceTickerSource {
    http: Client,
    base_url: String,
}

impl BinanceTickerSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("cycle-engine/0.1.0")
            .build()
            .context("Failed to build HTTP client for Binance")?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<SourceQuote> {
        let pair = format!("{symbol}{QUOTE_ASSET}");
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.base_url, urlencoding::encode(&pair));

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Binance ticker request failed for {pair}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error for {pair} {status}: {body}");
        }

        let ticker: Ticker24h = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse Binance ticker for {pair}"))?;

        let price: f64 = ticker
            .last_price
            .parse()
            .with_context(|| format!("Invalid Binance lastPrice for {pair}: {}", ticker.last_price))?;
        let change_24h = ticker.price_change_percent.and_then(|s| s.parse().ok());

        Ok(SourceQuote { price, change_24h })
    }
}

#[async_trait]
impl PriceSource for BinanceTickerSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch_quotes(&self, assets: &[AssetRef]) -> Result<HashMap<String, SourceQuote>> {
        let by_symbol = ids_by_symbol(assets);
        if by_symbol.is_empty() {
            return Ok(HashMap::new());
        }

        let symbols: Vec<&String> = by_symbol.keys().collect();
        let results = join_all(symbols.iter().map(|s| self.fetch_ticker(s))).await;

        let mut quotes = HashMap::new();
        let mut first_error = None;
        for (symbol, result) in symbols.iter().zip(results) {
            match result {
                Ok(quote) => {
                    for id in &by_symbol[*symbol] {
                        quotes.insert(id.clone(), quote);
                    }
                }
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "Binance ticker unavailable");
                    first_error.get_or_insert(e);
                }
            }
        }

        if quotes.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        debug!(symbols = symbols.len(), quoted = quotes.len(), "Binance quotes fetched");
        Ok(quotes)
    }
}
