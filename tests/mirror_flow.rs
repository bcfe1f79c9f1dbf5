//! End-to-end directive flow against an in-memory exchange: translate each
//! oracle directive against the mirrored position, apply the plan, and feed
//! execution reports back through reconciliation.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use perpbot::api::{
    ExchangeApi, OpenOrderReport, OrderAck, OrderRequest, OrderType, PositionReport,
};
use perpbot::error::BotError;
use perpbot::execution::{translate, AccountContext, ExecutionReport, OrderMirror, OrderUpdate};
use perpbot::models::{
    Direction, Directive, EntrySpec, MarginType, OrderPurpose, OrderStatus, SymbolFilters,
};
use perpbot::Result;

/// Minimal exchange double: market orders fill instantly at 50k, everything
/// else rests; every call is recorded in order.
struct ScriptedExchange {
    next_id: AtomicI64,
    log: Mutex<Vec<String>>,
    reject_entries: Mutex<bool>,
    position: Mutex<PositionReport>,
}

impl ScriptedExchange {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1),
            log: Mutex::new(Vec::new()),
            reject_entries: Mutex::new(false),
            position: Mutex::new(PositionReport {
                position_amt: 0.0,
                entry_price: 0.0,
            }),
        })
    }

    fn log_entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExchangeApi for ScriptedExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        if *self.reject_entries.lock().unwrap()
            && request.order_type == OrderType::Market
            && !request.reduce_only
        {
            return Err(BotError::ExchangeRejected {
                code: -2019,
                message: "Margin is insufficient.".into(),
            });
        }
        let order_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!(
            "place {} {} reduce_only={}",
            request.order_type.as_wire(),
            request.side.as_str(),
            request.reduce_only
        ));
        let filled = request.order_type == OrderType::Market;
        Ok(OrderAck {
            order_id,
            client_order_id: request.client_order_id.clone(),
            status: if filled {
                OrderStatus::Filled
            } else {
                OrderStatus::Open
            },
            executed_qty: if filled {
                request.quantity.unwrap_or(0.0)
            } else {
                0.0
            },
            avg_price: filled.then_some(50_000.0),
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: i64) -> Result<()> {
        self.log.lock().unwrap().push(format!("cancel {order_id}"));
        Ok(())
    }

    async fn open_orders(&self, _symbol: &str) -> Result<Vec<OpenOrderReport>> {
        Ok(Vec::new())
    }

    async fn position_risk(&self, _symbol: &str) -> Result<PositionReport> {
        Ok(*self.position.lock().unwrap())
    }
}

fn filters() -> SymbolFilters {
    SymbolFilters {
        tick_size: 0.1,
        step_size: 0.001,
        min_qty: 0.001,
        min_notional: 100.0,
    }
}

fn account() -> AccountContext {
    AccountContext {
        wallet_balance: 1000.0,
        balance_age: Duration::from_secs(1),
        mark_price: 50_000.0,
        filters: filters(),
        max_leverage: 20,
        margin_usage_pct: 0.10,
        leverage_override: None,
    }
}

fn directive(direction: Direction, sl: f64, tp: f64) -> Directive {
    Directive {
        direction,
        entry: EntrySpec::default(),
        stop_loss: Some(sl),
        take_profit: Some(tp),
        leverage_override: None,
        rationale: None,
    }
}

fn fill(order_id: i64, qty: f64, price: f64) -> ExecutionReport {
    ExecutionReport::OrderUpdate(OrderUpdate {
        order_id,
        client_order_id: String::new(),
        order_type: String::new(),
        status: OrderStatus::Filled,
        avg_price: Some(price),
        filled_qty: qty,
        reduce_only: false,
        delta: None,
    })
}

async fn apply_directive(mirror: &mut OrderMirror, d: &Directive) -> perpbot::execution::ApplyReport {
    let position = mirror.current_position();
    let plan = translate(d, &position, &account()).expect("translation should succeed");
    mirror.apply(plan).await.expect("apply should not error")
}

#[tokio::test]
async fn test_long_entry_then_stop_out() {
    let exchange = ScriptedExchange::new();
    let mut mirror = OrderMirror::new(
        exchange.clone(),
        "BTCUSDC",
        20,
        MarginType::Isolated,
        filters(),
    );

    // Oracle goes long: entry + SL + TP hit the exchange in order.
    let report = apply_directive(&mut mirror, &directive(Direction::Long, 49_000.0, 52_000.0)).await;
    assert!(report.is_success());
    assert_eq!(
        exchange.log_entries(),
        vec![
            "place MARKET BUY reduce_only=false",
            "place STOP_MARKET SELL reduce_only=false",
            "place TAKE_PROFIT_MARKET SELL reduce_only=true",
        ]
    );
    let position = mirror.current_position();
    assert_eq!(position.direction(), Direction::Long);
    assert_eq!(position.size, 0.04);

    // The stop fills; the mirror cancels the TP sibling and goes flat.
    let sl_id = position
        .order_by_purpose(OrderPurpose::StopLoss)
        .unwrap()
        .exchange_order_id;
    let tp_id = position
        .order_by_purpose(OrderPurpose::TakeProfit)
        .unwrap()
        .exchange_order_id;
    mirror.reconcile(fill(sl_id, 0.04, 49_000.0)).await.unwrap();

    assert!(mirror.current_position().is_flat());
    let log = exchange.log_entries();
    assert_eq!(log.last().unwrap(), &format!("cancel {tp_id}"));
    assert_eq!(
        log.iter().filter(|l| l.starts_with("cancel")).count(),
        1,
        "exactly one sibling cancel"
    );
}

#[tokio::test]
async fn test_direction_flip_closes_before_new_entry() {
    let exchange = ScriptedExchange::new();
    let mut mirror = OrderMirror::new(
        exchange.clone(),
        "BTCUSDC",
        20,
        MarginType::Isolated,
        filters(),
    );

    apply_directive(&mut mirror, &directive(Direction::Long, 49_000.0, 52_000.0)).await;
    let before_flip = exchange.log_entries().len();

    let report =
        apply_directive(&mut mirror, &directive(Direction::Short, 50_600.0, 48_000.0)).await;
    assert!(report.is_success());

    let log = exchange.log_entries()[before_flip..].to_vec();
    // cancel SL, cancel TP, reduce-only close, then the new short bracket.
    assert!(log[0].starts_with("cancel"));
    assert!(log[1].starts_with("cancel"));
    assert_eq!(log[2], "place MARKET SELL reduce_only=true");
    assert_eq!(log[3], "place MARKET SELL reduce_only=false");
    assert_eq!(log[4], "place STOP_MARKET BUY reduce_only=false");
    assert_eq!(log[5], "place TAKE_PROFIT_MARKET BUY reduce_only=true");

    let position = mirror.current_position();
    assert_eq!(position.direction(), Direction::Short);
}

#[tokio::test]
async fn test_flat_directive_closes_position() {
    let exchange = ScriptedExchange::new();
    let mut mirror = OrderMirror::new(
        exchange.clone(),
        "BTCUSDC",
        20,
        MarginType::Isolated,
        filters(),
    );

    apply_directive(&mut mirror, &directive(Direction::Long, 49_000.0, 52_000.0)).await;
    let report = apply_directive(&mut mirror, &Directive::flat()).await;
    assert!(report.is_success());
    assert!(mirror.current_position().is_flat());

    // Repeating flat is a no-op: translation yields an empty plan.
    let calls_before = exchange.log_entries().len();
    let report = apply_directive(&mut mirror, &Directive::flat()).await;
    assert!(report.is_success());
    assert!(report.completed.is_empty());
    assert_eq!(exchange.log_entries().len(), calls_before);
}

#[tokio::test]
async fn test_rejected_entry_surfaces_partial_failure() {
    let exchange = ScriptedExchange::new();
    let mut mirror = OrderMirror::new(
        exchange.clone(),
        "BTCUSDC",
        20,
        MarginType::Isolated,
        filters(),
    );

    apply_directive(&mut mirror, &directive(Direction::Long, 49_000.0, 52_000.0)).await;

    // Only new entries are rejected; the reduce-only close still works.
    *exchange.reject_entries.lock().unwrap() = true;
    let report =
        apply_directive(&mut mirror, &directive(Direction::Short, 50_600.0, 48_000.0)).await;

    assert!(!report.is_success());
    // cancel SL + cancel TP + reduce-only close completed before the
    // rejected entry; SL/TP placement was skipped.
    assert_eq!(report.completed.len(), 3);
    let failure = report.failure.unwrap();
    assert_eq!(failure.skipped, 2);
    assert!(failure.error.contains("insufficient"));

    let position = mirror.current_position();
    assert!(position.is_flat());
    assert!(position.order_by_purpose(OrderPurpose::StopLoss).is_none());
    assert!(position.order_by_purpose(OrderPurpose::TakeProfit).is_none());
}

#[tokio::test]
async fn test_amend_updates_protection_without_reentry() {
    let exchange = ScriptedExchange::new();
    let mut mirror = OrderMirror::new(
        exchange.clone(),
        "BTCUSDC",
        20,
        MarginType::Isolated,
        filters(),
    );

    apply_directive(&mut mirror, &directive(Direction::Long, 49_000.0, 52_000.0)).await;
    let before = exchange.log_entries().len();

    // Same direction, tighter stop: cancel+replace the SL only.
    let report = apply_directive(&mut mirror, &directive(Direction::Long, 49_500.0, 52_000.0)).await;
    assert!(report.is_success());

    let log = exchange.log_entries()[before..].to_vec();
    assert_eq!(log.len(), 2);
    assert!(log[0].starts_with("cancel"));
    assert_eq!(log[1], "place STOP_MARKET SELL reduce_only=false");

    let position = mirror.current_position();
    assert_eq!(position.direction(), Direction::Long);
    assert_eq!(
        position
            .order_by_purpose(OrderPurpose::StopLoss)
            .unwrap()
            .requested_price,
        Some(49_500.0)
    );
}
