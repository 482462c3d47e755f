//! Order executor.
//!
//! Routes market orders to an `ExchangeGateway`. Simulated mode uses the
//! built-in `SimulatedGateway`, which fills deterministically at the
//! reference price and never touches the network. Real mode requires a
//! gateway to be injected.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{InvestConfig, TradingMode};
use crate::types::EngineError;

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Buys are sized in quote currency (USD), sells in base units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderSize {
    Quote(f64),
    Base(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub size: OrderSize,
    /// Last resolved price; the simulated gateway fills here.
    pub reference_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub price: f64,
    pub qty: f64,
    pub commission: f64,
}

/// Gateway response. `success: false` carries the exchange's message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFill {
    pub success: bool,
    pub order_id: Option<String>,
    pub executed_qty: f64,
    pub avg_price: f64,
    #[serde(rename = "feeUSD")]
    pub fee_usd: f64,
    pub fills: Vec<Fill>,
    pub error: Option<String>,
}

impl OrderFill {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            executed_qty: 0.0,
            avg_price: 0.0,
            fee_usd: 0.0,
            fills: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn notional(&self) -> f64 {
        self.executed_qty * self.avg_price
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Market-order execution. `Err` is a transport failure; an exchange
/// rejection comes back as `Ok` with `success: false`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderFill>;
}

/// Deterministic paper exchange.
pub struct SimulatedGateway {
    fee_pct: f64,
    next_id: AtomicU64,
}

impl SimulatedGateway {
    pub fn new(fee_pct: f64) -> Self {
        Self {
            fee_pct,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ExchangeGateway for SimulatedGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderFill> {
        let price = request.reference_price;
        if !(price.is_finite() && price > 0.0) {
            return Ok(OrderFill::failed(format!("no usable reference price for {}", request.symbol)));
        }

        let qty = match request.size {
            OrderSize::Quote(usd) => usd / price,
            OrderSize::Base(qty) => qty,
        };
        if !(qty.is_finite() && qty > 0.0) {
            return Ok(OrderFill::failed(format!("invalid order size for {}", request.symbol)));
        }

        let fee = qty * price * self.fee_pct / 100.0;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(OrderFill {
            success: true,
            order_id: Some(format!("sim-{}-{}-{n}", request.side, request.symbol)),
            executed_qty: qty,
            avg_price: price,
            fee_usd: fee,
            fills: vec![Fill { price, qty, commission: fee }],
            error: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    mode: TradingMode,
    gateway: Arc<dyn ExchangeGateway>,
}

impl Executor {
    /// Build an executor for `config.mode`. Real mode needs `gateway`.
    pub fn new(config: &InvestConfig, gateway: Option<Arc<dyn ExchangeGateway>>) -> Result<Self, EngineError> {
        let gateway = match (config.mode, gateway) {
            (TradingMode::Simulated, _) => Arc::new(SimulatedGateway::new(config.fee_pct)) as Arc<dyn ExchangeGateway>,
            (TradingMode::Real, Some(g)) => g,
            (TradingMode::Real, None) => {
                return Err(EngineError::Config(format!(
                    "real mode on {} requires an exchange gateway",
                    config.exchange
                )))
            }
        };
        Ok(Self { mode: config.mode, gateway })
    }

    pub fn simulated(config: &InvestConfig) -> Self {
        Self {
            mode: TradingMode::Simulated,
            gateway: Arc::new(SimulatedGateway::new(config.fee_pct)),
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    /// Spend `usd` on `symbol`.
    pub async fn buy(&self, symbol: &str, usd: f64, reference_price: f64) -> Result<OrderFill, EngineError> {
        self.execute(OrderRequest {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            size: OrderSize::Quote(usd),
            reference_price,
        })
        .await
    }

    /// Sell `qty` units of `symbol`.
    pub async fn sell(&self, symbol: &str, qty: f64, reference_price: f64) -> Result<OrderFill, EngineError> {
        self.execute(OrderRequest {
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            size: OrderSize::Base(qty),
            reference_price,
        })
        .await
    }

    async fn execute(&self, request: OrderRequest) -> Result<OrderFill, EngineError> {
        let fill = match self.gateway.place_order(&request).await {
            Ok(fill) => fill,
            Err(e) => {
                warn!(symbol = %request.symbol, side = %request.side, error = %e, "Order transport failed");
                return Err(EngineError::OrderFailed {
                    symbol: request.symbol,
                    message: e.to_string(),
                });
            }
        };

        if !fill.success {
            let message = fill.error.unwrap_or_else(|| "order rejected".to_string());
            warn!(symbol = %request.symbol, side = %request.side, error = %message, "Order rejected");
            return Err(EngineError::OrderFailed {
                symbol: request.symbol,
                message,
            });
        }

        info!(
            mode = ?self.mode,
            symbol = %request.symbol,
            side = %request.side,
            qty = fill.executed_qty,
            price = fill.avg_price,
            fee = format!("${:.4}", fill.fee_usd),
            order_id = fill.order_id.as_deref().unwrap_or("-"),
            "Order filled"
        );
        Ok(fill)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
