//! CoinGecko price source (primary, index-based).
//!
//! API: `GET /simple/price?ids=..&vs_currencies=usd&include_24hr_change=true`
//! Auth: optional demo key via the `x-cg-demo-api-key` header.
//! Ids are sent in batches; batches are fetched concurrently.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{AssetRef, PriceSource, SourceQuote};

const SOURCE_NAME: &str = "coingecko";

/// Ids per request; the public endpoint rejects very long query strings.
const BATCH_SIZE: usize = 50;

#[derive(Debug, Deserialize)]
struct SimplePrice {
    #[serde(default)]
    usd: Option<f64>,
    #[serde(default)]
    usd_24h_change: Option<f64>,
}

pub struct CoinGeckoSource {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl CoinGeckoSource {
    pub fn new(base_url: &str, api_key: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("cycle-engine/0.1.0")
            .build()
            .context("Failed to build HTTP client for CoinGecko")?;
        Ok(Self::with_client(http, base_url, api_key))
    }

    pub fn with_client(http: Client, base_url: &str, api_key: Option<SecretString>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn fetch_batch(&self, ids: &[&str]) -> Result<HashMap<String, SimplePrice>> {
        let joined = ids.iter().map(|id| urlencoding::encode(id).into_owned()).collect::<Vec<_>>().join(",");
        let url = format!(
            "{}/simple/price?ids={joined}&vs_currencies=usd&include_24hr_change=true",
            self.base_url
        );

        let mut req = self.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.header("x-cg-demo-api-key", key.expose_secret());
        }

        let resp = req.send().await.context("CoinGecko request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("CoinGecko API error {status}: {body}");
        }

        resp.json().await.context("Failed to parse CoinGecko simple/price response")
    }
}

#[async_trait]
impl PriceSource for CoinGeckoSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch_quotes(&self, assets: &[AssetRef]) -> Result<HashMap<String, SourceQuote>> {
        let ids: Vec<&str> = assets.iter().map(|a| a.id.as_str()).collect();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let results = join_all(ids.chunks(BATCH_SIZE).map(|chunk| self.fetch_batch(chunk))).await;

        let mut quotes = HashMap::new();
        let mut first_error = None;
        let mut any_ok = false;
        for result in results {
            match result {
                Ok(batch) => {
                    any_ok = true;
                    for (id, p) in batch {
                        if let Some(price) = p.usd {
                            quotes.insert(id, SourceQuote { price, change_24h: p.usd_24h_change });
                        }
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if !any_ok {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        debug!(requested = ids.len(), quoted = quotes.len(), "CoinGecko quotes fetched");
        Ok(quotes)
    }
}
