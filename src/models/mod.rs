use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Candle interval tracked by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "5m")]
    FiveMin,
    #[serde(rename = "15m")]
    FifteenMin,
}

impl Interval {
    pub const ALL: [Interval; 2] = [Interval::FiveMin, Interval::FifteenMin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::FiveMin => "5m",
            Interval::FifteenMin => "15m",
        }
    }

    pub fn from_wire(s: &str) -> Option<Interval> {
        match s {
            "5m" => Some(Interval::FiveMin),
            "15m" => Some(Interval::FifteenMin),
            _ => None,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Interval::FiveMin => Duration::minutes(5),
            Interval::FifteenMin => Duration::minutes(15),
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OHLCV candlestick. Immutable once `is_closed`; keyed by
/// `(interval, open_time)` and ordered by `close_time` per interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl Candle {
    /// Unique key within one interval stream.
    pub fn key(&self) -> (Interval, i64) {
        (self.interval, self.open_time.timestamp_millis())
    }
}

/// Fill fragment from the exchange execution stream. Buffered until the next
/// oracle invocation, then cleared.
#[derive(Debug, Clone, Serialize)]
pub struct TradeDelta {
    pub order_id: i64,
    pub side: OrderSide,
    pub price: f64,
    pub qty: f64,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
    pub maker: bool,
}

/// Desired position direction issued by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

/// How the entry order should reach the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Market,
    Limit,
}

/// Entry specification inside a directive. Limit entries carry a price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntrySpec {
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl Default for EntrySpec {
    fn default() -> Self {
        Self {
            kind: EntryKind::Market,
            price: None,
        }
    }
}

/// One oracle-issued instruction. A new directive supersedes the previous one
/// atomically; the free-text rationale is ignored by the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub direction: Direction,
    #[serde(default)]
    pub entry: EntrySpec,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(rename = "leverage", default)]
    pub leverage_override: Option<u32>,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl Directive {
    pub fn flat() -> Self {
        Self {
            direction: Direction::Flat,
            entry: EntrySpec::default(),
            stop_loss: None,
            take_profit: None,
            leverage_override: None,
            rationale: None,
        }
    }
}

/// Side of an actual exchange order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Side of the held position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens/extends this position.
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces/closes this position.
    pub fn exit_order_side(&self) -> OrderSide {
        self.entry_order_side().opposite()
    }
}

/// Role an order plays in the mirrored trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderPurpose {
    Entry,
    StopLoss,
    TakeProfit,
    ReduceExit,
}

/// Order lifecycle. Transitions are monotonic:
/// Pending -> Open -> {Filled | Cancelled | Rejected}, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Open => 1,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Whether moving to `next` respects the monotonic lifecycle.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if *self == next || self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

/// Tracked exchange order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRef {
    pub exchange_order_id: i64,
    pub client_order_id: String,
    pub purpose: OrderPurpose,
    pub side: OrderSide,
    pub requested_price: Option<f64>,
    pub requested_qty: f64,
    pub status: OrderStatus,
}

/// Margin mode applied to the symbol at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginType {
    Isolated,
    Cross,
}

impl MarginType {
    pub fn as_wire(&self) -> &'static str {
        match self {
            MarginType::Isolated => "ISOLATED",
            MarginType::Cross => "CROSSED",
        }
    }

    pub fn from_config(s: &str) -> Option<MarginType> {
        match s.to_ascii_uppercase().as_str() {
            "ISOLATED" => Some(MarginType::Isolated),
            "CROSSED" | "CROSS" => Some(MarginType::Cross),
            _ => None,
        }
    }
}

/// The single authoritative position record, owned by the order mirror.
/// Everything here is a cache of the exchange's own report; the exchange is
/// ground truth.
#[derive(Debug, Clone, Serialize)]
pub struct MirroredPosition {
    pub symbol: String,
    pub side: Option<PositionSide>,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub margin_type: MarginType,
    pub open_orders: Vec<OrderRef>,
}

impl MirroredPosition {
    pub fn flat(symbol: &str, leverage: u32, margin_type: MarginType) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: None,
            size: 0.0,
            entry_price: 0.0,
            leverage,
            margin_type,
            open_orders: Vec::new(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.size.abs() < 1e-8
    }

    /// Direction the position currently expresses, for comparison against the
    /// latest directive.
    pub fn direction(&self) -> Direction {
        if self.is_flat() {
            Direction::Flat
        } else {
            match self.side {
                Some(PositionSide::Long) => Direction::Long,
                Some(PositionSide::Short) => Direction::Short,
                None => Direction::Flat,
            }
        }
    }

    pub fn order_by_purpose(&self, purpose: OrderPurpose) -> Option<&OrderRef> {
        self.open_orders
            .iter()
            .find(|o| o.purpose == purpose && !o.status.is_terminal())
    }

    /// Pending (unfilled) limit entry, if any.
    pub fn pending_entry(&self) -> Option<&OrderRef> {
        self.open_orders.iter().find(|o| {
            o.purpose == OrderPurpose::Entry
                && matches!(o.status, OrderStatus::Pending | OrderStatus::Open)
        })
    }
}

/// Price/quantity constraints of the traded symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
}

impl SymbolFilters {
    /// Floor `price` to the tick grid, rounded to 8 decimals.
    pub fn normalize_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        let steps = (price / self.tick_size).floor();
        round8(steps * self.tick_size)
    }

    /// Floor `qty` to the lot-size grid, rounded to 8 decimals.
    pub fn normalize_qty(&self, qty: f64) -> f64 {
        if self.step_size <= 0.0 {
            return qty;
        }
        let steps = (qty / self.step_size).floor();
        round8(steps * self.step_size)
    }
}

fn round8(v: f64) -> f64 {
    (v * 1e8).round() / 1e8
}
