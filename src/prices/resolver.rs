//! Multi-source price resolution cascade.
//!
//! Sources are tried in order. Each source step retries under the
//! configured policy; any successful step removes the ids it priced and
//! hands the remainder to the next source. Ids no source could price fall
//! back to their last-known price (flagged stale) or, without history,
//! are reported in `failed_ids`. A zero or missing price never leaves
//! this module.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::retry::{attempt_with_policy, RetryPolicy};
use super::{AssetRef, PriceSource};
use crate::types::{FetchStats, LastKnownPrice, ResolvedPrice};

/// Output of one resolution pass.
#[derive(Debug, Clone, Default)]
pub struct PriceResolution {
    pub prices: HashMap<String, ResolvedPrice>,
    /// Ids with neither a fresh nor a last-known price, in request order.
    pub failed_ids: Vec<String>,
    pub stats: FetchStats,
}

impl PriceResolution {
    pub fn price_of(&self, id: &str) -> Option<f64> {
        self.prices.get(id).map(|p| p.price)
    }
}

pub struct PriceResolver {
    sources: Vec<Box<dyn PriceSource>>,
    policy: RetryPolicy,
}

impl PriceResolver {
    pub fn new(sources: Vec<Box<dyn PriceSource>>, policy: RetryPolicy) -> Self {
        Self { sources, policy }
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Resolve prices for `ids`.
    ///
    /// `symbols` maps asset id to ticker; `last_known` holds the most recent
    /// successful price per id and its timestamp.
    pub async fn resolve(
        &self,
        ids: &[String],
        symbols: &HashMap<String, String>,
        last_known: &HashMap<String, LastKnownPrice>,
        now: DateTime<Utc>,
    ) -> PriceResolution {
        let mut seen = HashSet::new();
        let requested: Vec<AssetRef> = ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .map(|id| AssetRef::new(id.clone(), symbols.get(id).cloned()))
            .collect();

        let mut out = PriceResolution::default();
        let mut unresolved: Vec<AssetRef> = requested.clone();

        for source in &self.sources {
            if unresolved.is_empty() {
                break;
            }

            let pending: &[AssetRef] = &unresolved;
            let attempted = attempt_with_policy(&self.policy, move |_| source.fetch_quotes(pending)).await;
            out.stats.retries += attempted.retries();

            let quotes = match attempted.result {
                Ok(q) => q,
                Err(e) => {
                    warn!(
                        source = source.name(),
                        attempts = attempted.attempts,
                        pending = unresolved.len(),
                        error = %e,
                        "Price source exhausted, falling through"
                    );
                    continue;
                }
            };

            let mut resolved_here = 0usize;
            unresolved.retain(|asset| match quotes.get(&asset.id) {
                Some(q) if q.is_usable() => {
                    out.prices.insert(
                        asset.id.clone(),
                        ResolvedPrice {
                            price: q.price,
                            change_24h: q.change_24h,
                            source: source.name().to_string(),
                            is_stale: false,
                            stale_ms: None,
                        },
                    );
                    resolved_here += 1;
                    false
                }
                Some(q) => {
                    warn!(source = source.name(), id = %asset.id, price = q.price, "Discarding unusable quote");
                    true
                }
                None => true,
            });

            if resolved_here > 0 {
                out.stats.sources_used.push(source.name().to_string());
            }

            debug!(
                source = source.name(),
                attempts = attempted.attempts,
                resolved = resolved_here,
                remaining = unresolved.len(),
                "Price source step complete"
            );
        }

        out.stats.resolved_count = out.prices.len();

        for asset in unresolved {
            match last_known.get(&asset.id).filter(|lk| lk.price.is_finite() && lk.price > 0.0) {
                Some(lk) => {
                    let stale_ms = (now - lk.timestamp).num_milliseconds().max(0);
                    out.prices.insert(
                        asset.id.clone(),
                        ResolvedPrice {
                            price: lk.price,
                            change_24h: None,
                            source: "last_known".to_string(),
                            is_stale: true,
                            stale_ms: Some(stale_ms),
                        },
                    );
                    out.stats.stale_count += 1;
                }
                None => out.failed_ids.push(asset.id),
            }
        }
        out.stats.failed_count = out.failed_ids.len();

        if out.stats.stale_count > 0 || !out.failed_ids.is_empty() {
            warn!(
                requested = requested.len(),
                fresh = out.stats.resolved_count,
                stale = out.stats.stale_count,
                failed = ?out.failed_ids,
                "Price resolution degraded"
            );
        } else {
            info!(
                requested = requested.len(),
                sources = ?out.stats.sources_used,
                retries = out.stats.retries,
                "Prices resolved"
            );
        }

        out
    }
}
