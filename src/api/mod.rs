pub mod binance;
pub mod oracle;

pub use binance::BinanceFuturesClient;
pub use oracle::OracleClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::{Candle, Interval, OrderSide, OrderStatus};
use crate::Result;

/// Order type on the exchange boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_wire(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// Outbound order. `client_order_id` makes retries idempotent on the
/// exchange side.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub close_position: bool,
    pub client_order_id: String,
}

/// Exchange acknowledgement of a placed order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: i64,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub executed_qty: f64,
    pub avg_price: Option<f64>,
}

/// Exchange-reported position for the symbol.
#[derive(Debug, Clone, Copy)]
pub struct PositionReport {
    /// Signed quantity: positive long, negative short.
    pub position_amt: f64,
    pub entry_price: f64,
}

/// One row of the exchange's open-order report.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrderReport {
    #[serde(rename = "orderId")]
    pub order_id: i64,
    #[serde(rename = "clientOrderId")]
    pub client_order_id: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: String,
    #[serde(rename = "price", deserialize_with = "binance::de_f64_str")]
    pub price: f64,
    #[serde(rename = "stopPrice", default, deserialize_with = "binance::de_opt_f64_str")]
    pub stop_price: Option<f64>,
    #[serde(rename = "origQty", deserialize_with = "binance::de_f64_str")]
    pub orig_qty: f64,
    #[serde(rename = "reduceOnly", default)]
    pub reduce_only: bool,
    #[serde(rename = "closePosition", default)]
    pub close_position: bool,
}

/// Account balance snapshot used for sizing.
#[derive(Debug, Clone, Copy)]
pub struct AccountBalance {
    pub wallet_balance: f64,
    pub available_balance: f64,
    pub fetched_at: DateTime<Utc>,
}

/// Order-management capability of the exchange, the seam the order mirror is
/// tested through.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()>;
    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrderReport>>;
    async fn position_risk(&self, symbol: &str) -> Result<PositionReport>;
}

/// Historical-candle capability of the exchange, the seam the feed supervisor
/// syncs through.
#[async_trait]
pub trait MarketHistory: Send + Sync {
    /// Most recent `limit` candles, oldest first.
    async fn klines(&self, symbol: &str, interval: Interval, limit: usize) -> Result<Vec<Candle>>;

    /// Candles with `open_time > after`, oldest first.
    async fn klines_after(
        &self,
        symbol: &str,
        interval: Interval,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>>;
}
