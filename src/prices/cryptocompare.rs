//! CryptoCompare price source (secondary, symbol-based).
//!
//! API: `GET /data/pricemultifull?fsyms=BTC,ETH&tsyms=USD`
//! Auth: optional `Authorization: Apikey {key}`.
//! Errors come back as HTTP 200 with `"Response": "Error"`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{ids_by_symbol, AssetRef, PriceSource, SourceQuote};

const SOURCE_NAME: &str = "cryptocompare";
const QUOTE_CURRENCY: &str = "USD";

#[derive(Debug, Deserialize)]
struct PriceMultiFull {
    #[serde(rename = "RAW", default)]
    raw: Option<HashMap<String, HashMap<String, RawQuote>>>,
    #[serde(rename = "Response", default)]
    response: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQuote {
    #[serde(rename = "PRICE", default)]
    price: Option<f64>,
    #[serde(rename = "CHANGEPCT24HOUR", default)]
    change_pct_24h: Option<f64>,
}

pub struct CryptoCompareSource {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl CryptoCompareSource {
    pub fn new(base_url: &str, api_key: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("cycle-engine/0.1.0")
            .build()
            .context("Failed to build HTTP client for CryptoCompare")?;
        Ok(Self::with_client(http, base_url, api_key))
    }

    pub fn with_client(http: Client, base_url: &str, api_key: Option<SecretString>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl PriceSource for CryptoCompareSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch_quotes(&self, assets: &[AssetRef]) -> Result<HashMap<String, SourceQuote>> {
        let by_symbol = ids_by_symbol(assets);
        if by_symbol.is_empty() {
            return Ok(HashMap::new());
        }

        let mut symbols: Vec<&str> = by_symbol.keys().map(String::as_str).collect();
        symbols.sort_unstable();
        let fsyms = symbols.iter().map(|s| urlencoding::encode(s).into_owned()).collect::<Vec<_>>().join(",");
        let url = format!("{}/data/pricemultifull?fsyms={fsyms}&tsyms={QUOTE_CURRENCY}", self.base_url);

        let mut req = self.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.header("authorization", format!("Apikey {}", key.expose_secret()));
        }

        let resp = req.send().await.context("CryptoCompare request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("CryptoCompare API error {status}: {body}");
        }

        let body: PriceMultiFull = resp
            .json()
            .await
            .context("Failed to parse CryptoCompare pricemultifull response")?;

        if body.response.as_deref() == Some("Error") {
            anyhow::bail!("CryptoCompare error: {}", body.message.unwrap_or_default());
        }

        let mut quotes = HashMap::new();
        for (symbol, per_currency) in body.raw.unwrap_or_default() {
            let Some(raw) = per_currency.get(QUOTE_CURRENCY) else { continue };
            let Some(price) = raw.price else { continue };
            if let Some(ids) = by_symbol.get(&symbol.to_uppercase()) {
                for id in ids {
                    quotes.insert(id.clone(), SourceQuote { price, change_24h: raw.change_pct_24h });
                }
            }
        }

        debug!(symbols = symbols.len(), quoted = quotes.len(), "CryptoCompare quotes fetched");
        Ok(quotes)
    }
}
