//! Price resolution.
//!
//! Defines the `PriceSource` trait and the three HTTP feeds behind it,
//! plus the `PriceResolver` that cascades through them with retries and
//! falls back to last-known prices.

pub mod retry;
pub mod resolver;
pub mod coingecko;
pub mod cryptocompare;
pub mod binance;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::config::PricesConfig;
use binance::BinanceTickerSource;
use coingecko::CoinGeckoSource;
use cryptocompare::CryptoCompareSource;
use resolver::PriceResolver;

/// An asset to price: its index id and, when known, its ticker symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    pub id: String,
    pub symbol: Option<String>,
}

impl AssetRef {
    pub fn new(id: impl Into<String>, symbol: Option<String>) -> Self {
        Self { id: id.into(), symbol }
    }
}

/// A quote normalised from whatever shape a feed returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceQuote {
    pub price: f64,
    /// 24h change in percent, when the feed reports it.
    pub change_24h: Option<f64>,
}

impl SourceQuote {
    /// Only strictly positive finite prices are usable.
    pub fn is_usable(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }
}

/// Abstraction over an external price feed.
///
/// A returned `Err` counts as a failed attempt and is retried; an `Ok` with
/// a partial map means the missing ids were not available from this feed.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Source name recorded on every price it resolves.
    fn name(&self) -> &str;

    /// Fetch quotes for the given assets, keyed by asset id.
    async fn fetch_quotes(&self, assets: &[AssetRef]) -> Result<HashMap<String, SourceQuote>>;
}

/// Group asset ids by upper-cased symbol. Assets without a symbol are skipped.
pub(crate) fn ids_by_symbol(assets: &[AssetRef]) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for a in assets {
        if let Some(sym) = a.symbol.as_deref().filter(|s| !s.is_empty()) {
            map.entry(sym.to_uppercase()).or_default().push(a.id.clone());
        }
    }
    map
}

/// Build the enabled sources in cascade order: CoinGecko, CryptoCompare, Binance.
pub fn sources_from_config(config: &PricesConfig) -> Result<Vec<Box<dyn PriceSource>>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let mut sources: Vec<Box<dyn PriceSource>> = Vec::new();

    if config.coingecko.enabled {
        sources.push(Box::new(CoinGeckoSource::new(
            &config.coingecko.base_url,
            config.coingecko.api_key(),
            timeout,
        )?));
    }
    if config.cryptocompare.enabled {
        sources.push(Box::new(CryptoCompareSource::new(
            &config.cryptocompare.base_url,
            config.cryptocompare.api_key(),
            timeout,
        )?));
    }
    if config.binance.enabled {
        sources.push(Box::new(BinanceTickerSource::new(&config.binance.base_url, timeout)?));
    }

    if sources.is_empty() {
        anyhow::bail!("No price sources enabled");
    }
    Ok(sources)
}

/// Resolver over the configured sources and retry policy.
pub fn resolver_from_config(config: &PricesConfig) -> Result<PriceResolver> {
    let resolver = PriceResolver::new(sources_from_config(config)?, config.retry_policy());
    info!(sources = ?resolver.source_names(), max_attempts = config.max_attempts, "Price resolver ready");
    Ok(resolver)
}
