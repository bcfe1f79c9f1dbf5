use std::sync::Arc;
use uuid::Uuid;

use crate::api::{ExchangeApi, OpenOrderReport, OrderRequest, OrderType};
use crate::error::BotError;
use crate::execution::plan::{ApplyFailure, ApplyReport, OrderPlan, PlanStep, StepOutcome};
use crate::execution::reports::{ExecutionReport, OrderUpdate};
use crate::models::{
    EntryKind, MarginType, MirroredPosition, OrderPurpose, OrderRef, OrderSide, OrderStatus,
    PositionSide, SymbolFilters,
};
use crate::Result;

/// Binance answers cancels for already-gone orders with this code.
const UNKNOWN_ORDER: i64 = -2011;

/// The authoritative trade state machine.
///
/// Owns the single `MirroredPosition` record; `apply` and `reconcile` are the
/// only mutation paths and the caller serializes them (the engine holds the
/// mirror behind one `tokio::sync::Mutex`). The local record is a cache: on
/// any sign of divergence `force_resync` re-reads the exchange and overwrites
/// it.
pub struct OrderMirror {
    exchange: Arc<dyn ExchangeApi>,
    position: MirroredPosition,
    filters: SymbolFilters,
    /// Protective legs held back until a pending limit entry fills.
    pending_protection: Vec<PlanStep>,
}

impl OrderMirror {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        symbol: &str,
        leverage: u32,
        margin_type: MarginType,
        filters: SymbolFilters,
    ) -> Self {
        Self {
            exchange,
            position: MirroredPosition::flat(symbol, leverage, margin_type),
            filters,
            pending_protection: Vec::new(),
        }
    }

    /// Read-only snapshot for the next translation.
    pub fn current_position(&self) -> MirroredPosition {
        self.position.clone()
    }

    /// Executes the plan steps in order, aborting on the first exchange error
    /// and reporting completed/skipped steps. Applied steps are never rolled
    /// back. Reduce-only closes get one immediate retry; nothing else does,
    /// the next directive is the recovery path.
    pub async fn apply(&mut self, plan: OrderPlan) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        if plan.is_empty() {
            return Ok(report);
        }

        self.position
            .open_orders
            .retain(|o| !o.status.is_terminal());
        let total = plan.len();

        for (idx, step) in plan.steps.into_iter().enumerate() {
            if self.should_defer(&step) {
                self.pending_protection.push(step.clone());
                report.deferred.push(step);
                continue;
            }

            let mut result = self.execute_step(&step).await;
            if result.is_err() && matches!(step, PlanStep::ClosePosition { .. }) {
                tracing::warn!(%step, "reduce-only close failed, retrying once");
                result = self.execute_step(&step).await;
            }

            match result {
                Ok(order_id) => {
                    tracing::info!(%step, order_id = ?order_id, "plan step applied");
                    report.completed.push(StepOutcome { step, order_id });
                }
                Err(e) => {
                    let skipped = total - idx - 1;
                    tracing::error!(%step, error = %e, skipped, "plan step failed, aborting");
                    report.failure = Some(ApplyFailure {
                        step,
                        error: e.to_string(),
                        skipped,
                    });
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Protective legs wait for their entry while the position is flat and an
    /// entry order is still working.
    fn should_defer(&self, step: &PlanStep) -> bool {
        matches!(
            step,
            PlanStep::PlaceStopLoss { .. } | PlanStep::PlaceTakeProfit { .. }
        ) && self.position.is_flat()
            && self.position.pending_entry().is_some()
    }

    async fn execute_step(&mut self, step: &PlanStep) -> Result<Option<i64>> {
        match step {
            PlanStep::CancelOrder { purpose, order_id } => {
                match self
                    .exchange
                    .cancel_order(&self.position.symbol, *order_id)
                    .await
                {
                    Ok(()) => {}
                    Err(BotError::ExchangeRejected { code, .. }) if code == UNKNOWN_ORDER => {
                        tracing::debug!(order_id, ?purpose, "order already gone on cancel");
                    }
                    Err(e) => return Err(e),
                }
                self.mark_order(*order_id, OrderStatus::Cancelled);
                if *purpose == OrderPurpose::Entry {
                    self.pending_protection.clear();
                }
                Ok(Some(*order_id))
            }

            PlanStep::ClosePosition { side, qty } => {
                let ack = self
                    .exchange
                    .place_order(&OrderRequest {
                        symbol: self.position.symbol.clone(),
                        side: *side,
                        order_type: OrderType::Market,
                        quantity: Some(*qty),
                        price: None,
                        stop_price: None,
                        reduce_only: true,
                        close_position: false,
                        client_order_id: new_client_order_id(),
                    })
                    .await?;
                self.position.side = None;
                self.position.size = 0.0;
                self.position.entry_price = 0.0;
                Ok(Some(ack.order_id))
            }

            PlanStep::PlaceEntry {
                side,
                kind,
                qty,
                price,
            } => {
                let ack = self
                    .exchange
                    .place_order(&OrderRequest {
                        symbol: self.position.symbol.clone(),
                        side: *side,
                        order_type: match kind {
                            EntryKind::Market => OrderType::Market,
                            EntryKind::Limit => OrderType::Limit,
                        },
                        quantity: Some(*qty),
                        price: *price,
                        stop_price: None,
                        reduce_only: false,
                        close_position: false,
                        client_order_id: new_client_order_id(),
                    })
                    .await?;

                self.position.open_orders.push(OrderRef {
                    exchange_order_id: ack.order_id,
                    client_order_id: ack.client_order_id.clone(),
                    purpose: OrderPurpose::Entry,
                    side: *side,
                    requested_price: price.or(ack.avg_price),
                    requested_qty: *qty,
                    status: ack.status,
                });

                if ack.status == OrderStatus::Filled {
                    self.open_position(
                        *side,
                        if ack.executed_qty > 0.0 {
                            ack.executed_qty
                        } else {
                            *qty
                        },
                        ack.avg_price.or(*price).unwrap_or_default(),
                    );
                }
                Ok(Some(ack.order_id))
            }

            PlanStep::PlaceStopLoss { side, price } => {
                let ack = self
                    .exchange
                    .place_order(&OrderRequest {
                        symbol: self.position.symbol.clone(),
                        side: *side,
                        order_type: OrderType::StopMarket,
                        quantity: None,
                        price: None,
                        stop_price: Some(*price),
                        reduce_only: false,
                        close_position: true,
                        client_order_id: new_client_order_id(),
                    })
                    .await?;
                self.position.open_orders.push(OrderRef {
                    exchange_order_id: ack.order_id,
                    client_order_id: ack.client_order_id.clone(),
                    purpose: OrderPurpose::StopLoss,
                    side: *side,
                    requested_price: Some(*price),
                    requested_qty: 0.0,
                    status: ack.status,
                });
                Ok(Some(ack.order_id))
            }

            PlanStep::PlaceTakeProfit { side, price, qty } => {
                let ack = self
                    .exchange
                    .place_order(&OrderRequest {
                        symbol: self.position.symbol.clone(),
                        side: *side,
                        order_type: OrderType::TakeProfitMarket,
                        quantity: Some(*qty),
                        price: None,
                        stop_price: Some(*price),
                        reduce_only: true,
                        close_position: false,
                        client_order_id: new_client_order_id(),
                    })
                    .await?;
                self.position.open_orders.push(OrderRef {
                    exchange_order_id: ack.order_id,
                    client_order_id: ack.client_order_id.clone(),
                    purpose: OrderPurpose::TakeProfit,
                    side: *side,
                    requested_price: Some(*price),
                    requested_qty: *qty,
                    status: ack.status,
                });
                Ok(Some(ack.order_id))
            }
        }
    }

    /// Consumes one asynchronous execution report. Status transitions are
    /// monotonic; a backward or duplicate update is ignored, except that a
    /// fill reported for an already-terminal protective leg means both OCO
    /// legs raced: first fill wins and the conflict forces a resync.
    pub async fn reconcile(&mut self, report: ExecutionReport) -> Result<()> {
        match report {
            ExecutionReport::OrderUpdate(update) => self.reconcile_order(update).await,
            ExecutionReport::AccountPosition {
                position_amt,
                entry_price,
            } => self.check_drift(position_amt, entry_price).await,
        }
    }

    async fn reconcile_order(&mut self, update: OrderUpdate) -> Result<()> {
        let Some(idx) = self.position.open_orders.iter().position(|o| {
            o.exchange_order_id == update.order_id
                || (!update.client_order_id.is_empty()
                    && o.client_order_id == update.client_order_id)
        }) else {
            tracing::debug!(
                order_id = update.order_id,
                status = ?update.status,
                "update for untracked order ignored"
            );
            return Ok(());
        };

        let current = self.position.open_orders[idx].status;
        let purpose = self.position.open_orders[idx].purpose;

        if !current.can_transition_to(update.status) {
            if update.status == OrderStatus::Filled
                && current != OrderStatus::Filled
                && matches!(purpose, OrderPurpose::StopLoss | OrderPurpose::TakeProfit)
            {
                // The leg we thought was cancelled filled anyway: OCO race
                // lost. The exchange knows the truth; re-read it.
                tracing::warn!(
                    order_id = update.order_id,
                    ?purpose,
                    "fill for terminal protective order, forcing resync"
                );
                return self.force_resync().await;
            }
            tracing::debug!(
                order_id = update.order_id,
                from = ?current,
                to = ?update.status,
                "ignoring non-monotonic order update"
            );
            return Ok(());
        }

        self.position.open_orders[idx].status = update.status;
        let side = self.position.open_orders[idx].side;
        let requested_qty = self.position.open_orders[idx].requested_qty;
        let requested_price = self.position.open_orders[idx].requested_price;

        match (purpose, update.status) {
            (OrderPurpose::Entry, OrderStatus::Filled) => {
                let qty = if update.filled_qty > 0.0 {
                    update.filled_qty
                } else {
                    requested_qty
                };
                let price = update
                    .avg_price
                    .or(requested_price)
                    .unwrap_or(self.position.entry_price);
                self.open_position(side, qty, price);
                tracing::info!(qty, price, "entry filled, position open");
                self.flush_pending_protection().await;
            }
            (OrderPurpose::StopLoss | OrderPurpose::TakeProfit, OrderStatus::Filled) => {
                self.position.side = None;
                self.position.size = 0.0;
                self.position.entry_price = 0.0;
                tracing::info!(?purpose, "protective order filled, position closed");
                self.cancel_sibling(purpose).await;
            }
            (OrderPurpose::ReduceExit, OrderStatus::Filled) => {
                self.position.side = None;
                self.position.size = 0.0;
                self.position.entry_price = 0.0;
            }
            (OrderPurpose::Entry, OrderStatus::Rejected) => {
                tracing::warn!(order_id = update.order_id, "entry order rejected");
                self.pending_protection.clear();
            }
            (OrderPurpose::Entry, OrderStatus::Cancelled) => {
                self.pending_protection.clear();
            }
            _ => {}
        }

        // Terminal refs stay tracked until the next apply() so a late fill
        // for a leg we believed cancelled is recognized as an OCO conflict.
        Ok(())
    }

    /// Issues exactly one cancel for the surviving OCO leg.
    async fn cancel_sibling(&mut self, filled: OrderPurpose) {
        let sibling_purpose = match filled {
            OrderPurpose::StopLoss => OrderPurpose::TakeProfit,
            OrderPurpose::TakeProfit => OrderPurpose::StopLoss,
            _ => return,
        };
        let Some(sibling) = self
            .position
            .open_orders
            .iter()
            .find(|o| o.purpose == sibling_purpose && !o.status.is_terminal())
        else {
            return;
        };
        let order_id = sibling.exchange_order_id;

        match self
            .exchange
            .cancel_order(&self.position.symbol, order_id)
            .await
        {
            Ok(())
            | Err(BotError::ExchangeRejected {
                code: UNKNOWN_ORDER,
                ..
            }) => {
                self.mark_order(order_id, OrderStatus::Cancelled);
                tracing::info!(order_id, ?sibling_purpose, "cancelled sibling leg");
            }
            Err(e) => {
                tracing::error!(order_id, error = %e, "sibling cancel failed");
            }
        }
    }

    async fn check_drift(&mut self, reported_amt: f64, reported_entry: f64) -> Result<()> {
        let local_signed = match self.position.side {
            Some(PositionSide::Long) => self.position.size,
            Some(PositionSide::Short) => -self.position.size,
            None => 0.0,
        };
        let tolerance = self.filters.step_size.max(1e-9);
        if (reported_amt - local_signed).abs() > tolerance {
            tracing::warn!(
                local = local_signed,
                reported = reported_amt,
                "position drift beyond tolerance, forcing resync"
            );
            return self.force_resync().await;
        }
        if !self.position.is_flat() && reported_entry > 0.0 {
            self.position.entry_price = reported_entry;
        }
        Ok(())
    }

    /// Overwrites the local record from the exchange's position and
    /// open-order reports.
    pub async fn force_resync(&mut self) -> Result<()> {
        let symbol = self.position.symbol.clone();
        let reported = self.exchange.position_risk(&symbol).await?;
        let orders = self.exchange.open_orders(&symbol).await?;

        if reported.position_amt.abs() < 1e-8 {
            self.position.side = None;
            self.position.size = 0.0;
            self.position.entry_price = 0.0;
        } else {
            self.position.side = Some(if reported.position_amt > 0.0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            });
            self.position.size = reported.position_amt.abs();
            self.position.entry_price = reported.entry_price;
        }

        self.position.open_orders = orders.iter().map(classify_open_order).collect();
        if self.position.pending_entry().is_none() {
            self.pending_protection.clear();
        }
        if !self.position.is_flat() {
            self.flush_pending_protection().await;
        }

        tracing::info!(
            size = self.position.size,
            side = ?self.position.side,
            open_orders = self.position.open_orders.len(),
            "local state resynced from exchange"
        );
        Ok(())
    }

    /// Places protection that waited for an entry fill. Failures are logged
    /// and left for the next directive or resync; the position stands either
    /// way.
    async fn flush_pending_protection(&mut self) {
        let steps = std::mem::take(&mut self.pending_protection);
        for step in steps {
            match self.execute_step(&step).await {
                Ok(order_id) => {
                    tracing::info!(%step, order_id = ?order_id, "deferred protection placed");
                }
                Err(e) => {
                    tracing::error!(%step, error = %e, "deferred protection failed");
                }
            }
        }
    }

    fn open_position(&mut self, entry_side: OrderSide, qty: f64, price: f64) {
        self.position.side = Some(match entry_side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        });
        self.position.size = qty;
        self.position.entry_price = price;
    }

    fn mark_order(&mut self, order_id: i64, status: OrderStatus) {
        if let Some(order) = self
            .position
            .open_orders
            .iter_mut()
            .find(|o| o.exchange_order_id == order_id)
        {
            if order.status.can_transition_to(status) {
                order.status = status;
            }
        }
    }
}

fn classify_open_order(order: &OpenOrderReport) -> OrderRef {
    let purpose = match order.order_type.as_str() {
        "STOP_MARKET" | "STOP" => OrderPurpose::StopLoss,
        "TAKE_PROFIT_MARKET" | "TAKE_PROFIT" => OrderPurpose::TakeProfit,
        _ if order.reduce_only || order.close_position => OrderPurpose::ReduceExit,
        _ => OrderPurpose::Entry,
    };
    OrderRef {
        exchange_order_id: order.order_id,
        client_order_id: order.client_order_id.clone(),
        purpose,
        side: order.side,
        requested_price: order
            .stop_price
            .filter(|p| *p > 0.0)
            .or(Some(order.price).filter(|p| *p > 0.0)),
        requested_qty: order.orig_qty,
        status: OrderStatus::Open,
    }
}

/// Binance caps client order ids at 36 chars; a bare simple uuid fits.
fn new_client_order_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::OrderAck;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    /// In-memory exchange double: scripts rejections per order type, records
    /// every call, and acks market orders as immediate fills.
    struct FakeExchange {
        next_id: AtomicI64,
        placed: Mutex<Vec<OrderRequest>>,
        cancelled: Mutex<Vec<i64>>,
        reject_types: Mutex<HashSet<&'static str>>,
        cancel_error: Mutex<Option<i64>>,
        position: Mutex<PositionReport>,
        open: Mutex<Vec<OpenOrderReport>>,
        resyncs: AtomicI64,
    }

    use crate::api::PositionReport;

    impl FakeExchange {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next_id: AtomicI64::new(100),
                placed: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                reject_types: Mutex::new(HashSet::new()),
                cancel_error: Mutex::new(None),
                position: Mutex::new(PositionReport {
                    position_amt: 0.0,
                    entry_price: 0.0,
                }),
                open: Mutex::new(Vec::new()),
                resyncs: AtomicI64::new(0),
            })
        }

        fn reject(&self, order_type: &'static str) {
            self.reject_types.lock().unwrap().insert(order_type);
        }

        fn placed_types(&self) -> Vec<String> {
            self.placed
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.order_type.as_wire().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl ExchangeApi for FakeExchange {
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
            if self
                .reject_types
                .lock()
                .unwrap()
                .contains(request.order_type.as_wire())
            {
                return Err(BotError::ExchangeRejected {
                    code: -2019,
                    message: "Margin is insufficient.".into(),
                });
            }
            self.placed.lock().unwrap().push(request.clone());
            let order_id = self.next_id.fetch_add(1, Ordering::SeqCst);
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
            if let Some(code) = *self.cancel_error.lock().unwrap() {
                return Err(BotError::ExchangeRejected {
                    code,
                    message: "cancel failed".into(),
                });
            }
            self.cancelled.lock().unwrap().push(order_id);
            Ok(())
        }

        async fn open_orders(&self, _symbol: &str) -> Result<Vec<OpenOrderReport>> {
            self.resyncs.fetch_add(1, Ordering::SeqCst);
            Ok(self.open.lock().unwrap().clone())
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

    fn mirror_with(exchange: Arc<FakeExchange>) -> OrderMirror {
        OrderMirror::new(exchange, "BTCUSDC", 20, MarginType::Isolated, filters())
    }

    fn entry_plan() -> OrderPlan {
        OrderPlan {
            steps: vec![
                PlanStep::PlaceEntry {
                    side: OrderSide::Buy,
                    kind: EntryKind::Market,
                    qty: 0.04,
                    price: None,
                },
                PlanStep::PlaceStopLoss {
                    side: OrderSide::Sell,
                    price: 49_000.0,
                },
                PlanStep::PlaceTakeProfit {
                    side: OrderSide::Sell,
                    price: 52_000.0,
                    qty: 0.04,
                },
            ],
        }
    }

    fn fill_update(order_id: i64, qty: f64, price: f64) -> ExecutionReport {
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

    #[tokio::test]
    async fn test_market_entry_plan_opens_position_with_protection() {
        let exchange = FakeExchange::new();
        let mut mirror = mirror_with(exchange.clone());

        let report = mirror.apply(entry_plan()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.completed.len(), 3);
        assert!(report.deferred.is_empty());
        assert_eq!(
            exchange.placed_types(),
            vec!["MARKET", "STOP_MARKET", "TAKE_PROFIT_MARKET"]
        );

        let pos = mirror.current_position();
        assert_eq!(pos.direction(), crate::models::Direction::Long);
        assert_eq!(pos.size, 0.04);
        assert_eq!(pos.entry_price, 50_000.0);
        assert!(pos.order_by_purpose(OrderPurpose::StopLoss).is_some());
        assert!(pos.order_by_purpose(OrderPurpose::TakeProfit).is_some());
    }

    #[tokio::test]
    async fn test_partial_failure_aborts_and_reports() {
        let exchange = FakeExchange::new();
        exchange.reject("MARKET");
        let mut mirror = mirror_with(exchange.clone());

        // Seed a long with standing protection.
        let plan = OrderPlan {
            steps: vec![
                PlanStep::CancelOrder {
                    purpose: OrderPurpose::StopLoss,
                    order_id: 11,
                },
                PlanStep::CancelOrder {
                    purpose: OrderPurpose::TakeProfit,
                    order_id: 12,
                },
                PlanStep::PlaceEntry {
                    side: OrderSide::Sell,
                    kind: EntryKind::Market,
                    qty: 0.04,
                    price: None,
                },
                PlanStep::PlaceStopLoss {
                    side: OrderSide::Buy,
                    price: 50_600.0,
                },
                PlanStep::PlaceTakeProfit {
                    side: OrderSide::Buy,
                    price: 48_000.0,
                    qty: 0.04,
                },
            ],
        };

        let report = mirror.apply(plan).await.unwrap();
        assert!(!report.is_success());
        // The two cancels completed before the rejected entry.
        assert_eq!(report.completed.len(), 2);
        assert_eq!(exchange.cancelled.lock().unwrap().as_slice(), &[11, 12]);

        let failure = report.failure.unwrap();
        assert!(matches!(failure.step, PlanStep::PlaceEntry { .. }));
        assert_eq!(failure.skipped, 2);
        assert!(failure.error.contains("insufficient"));

        // Position flat, no standing orders, nothing retried.
        let pos = mirror.current_position();
        assert!(pos.is_flat());
        assert!(pos.order_by_purpose(OrderPurpose::StopLoss).is_none());
        assert_eq!(exchange.placed.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_reduce_only_close_retried_once() {
        let exchange = FakeExchange::new();
        exchange.reject("MARKET");
        let mut mirror = mirror_with(exchange.clone());
        mirror.position.side = Some(PositionSide::Long);
        mirror.position.size = 0.04;

        let plan = OrderPlan {
            steps: vec![PlanStep::ClosePosition {
                side: OrderSide::Sell,
                qty: 0.04,
            }],
        };
        let report = mirror.apply(plan).await.unwrap();
        assert!(!report.is_success());

        // One retry, then surfaced: the fake rejects before recording, so
        // both attempts show up only as the scripted rejection.
        let failure = report.failure.unwrap();
        assert!(matches!(failure.step, PlanStep::ClosePosition { .. }));
        assert_eq!(failure.skipped, 0);
    }

    #[tokio::test]
    async fn test_sl_fill_cancels_tp_exactly_once() {
        let exchange = FakeExchange::new();
        let mut mirror = mirror_with(exchange.clone());
        mirror.apply(entry_plan()).await.unwrap();

        let sl_id = mirror
            .current_position()
            .order_by_purpose(OrderPurpose::StopLoss)
            .unwrap()
            .exchange_order_id;
        let tp_id = mirror
            .current_position()
            .order_by_purpose(OrderPurpose::TakeProfit)
            .unwrap()
            .exchange_order_id;

        mirror.reconcile(fill_update(sl_id, 0.04, 49_000.0)).await.unwrap();

        assert!(mirror.current_position().is_flat());
        assert_eq!(exchange.cancelled.lock().unwrap().as_slice(), &[tp_id]);

        // A duplicate SL fill must not trigger a second cancel.
        mirror.reconcile(fill_update(sl_id, 0.04, 49_000.0)).await.unwrap();
        assert_eq!(exchange.cancelled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_oco_race_second_fill_forces_resync() {
        let exchange = FakeExchange::new();
        let mut mirror = mirror_with(exchange.clone());
        mirror.apply(entry_plan()).await.unwrap();

        let pos = mirror.current_position();
        let sl_id = pos.order_by_purpose(OrderPurpose::StopLoss).unwrap().exchange_order_id;
        let tp_id = pos.order_by_purpose(OrderPurpose::TakeProfit).unwrap().exchange_order_id;

        // First fill report wins and cancels the sibling locally.
        mirror.reconcile(fill_update(sl_id, 0.04, 49_000.0)).await.unwrap();
        assert_eq!(exchange.resyncs.load(Ordering::SeqCst), 0);

        // The sibling reports a fill anyway: conflict, resync.
        mirror.reconcile(fill_update(tp_id, 0.04, 52_000.0)).await.unwrap();
        assert_eq!(exchange.resyncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_limit_entry_defers_protection_until_fill() {
        let exchange = FakeExchange::new();
        let mut mirror = mirror_with(exchange.clone());

        let plan = OrderPlan {
            steps: vec![
                PlanStep::PlaceEntry {
                    side: OrderSide::Buy,
                    kind: EntryKind::Limit,
                    qty: 0.04,
                    price: Some(49_800.0),
                },
                PlanStep::PlaceStopLoss {
                    side: OrderSide::Sell,
                    price: 49_000.0,
                },
                PlanStep::PlaceTakeProfit {
                    side: OrderSide::Sell,
                    price: 52_000.0,
                    qty: 0.04,
                },
            ],
        };
        let report = mirror.apply(plan).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.deferred.len(), 2);
        assert_eq!(exchange.placed_types(), vec!["LIMIT"]);
        assert!(mirror.current_position().is_flat());

        // Entry fills asynchronously: protection goes out now.
        let entry_id = mirror.current_position().pending_entry().unwrap().exchange_order_id;
        mirror.reconcile(fill_update(entry_id, 0.04, 49_800.0)).await.unwrap();

        let pos = mirror.current_position();
        assert_eq!(pos.size, 0.04);
        assert_eq!(pos.entry_price, 49_800.0);
        assert_eq!(
            exchange.placed_types(),
            vec!["LIMIT", "STOP_MARKET", "TAKE_PROFIT_MARKET"]
        );
    }

    #[tokio::test]
    async fn test_backward_status_update_ignored() {
        let exchange = FakeExchange::new();
        let mut mirror = mirror_with(exchange.clone());
        mirror.apply(entry_plan()).await.unwrap();
        let entry_id = mirror.current_position().open_orders[0].exchange_order_id;

        // Entry already Filled; a late NEW update must not regress it.
        mirror
            .reconcile(ExecutionReport::OrderUpdate(OrderUpdate {
                order_id: entry_id,
                client_order_id: String::new(),
                order_type: String::new(),
                status: OrderStatus::Open,
                avg_price: None,
                filled_qty: 0.0,
                reduce_only: false,
                delta: None,
            }))
            .await
            .unwrap();

        assert_eq!(mirror.current_position().size, 0.04);
    }

    #[tokio::test]
    async fn test_drift_triggers_resync() {
        let exchange = FakeExchange::new();
        let mut mirror = mirror_with(exchange.clone());
        mirror.apply(entry_plan()).await.unwrap();

        // Exchange says short 0.08 while we hold long 0.04.
        *exchange.position.lock().unwrap() = PositionReport {
            position_amt: -0.08,
            entry_price: 50_500.0,
        };
        mirror
            .reconcile(ExecutionReport::AccountPosition {
                position_amt: -0.08,
                entry_price: 50_500.0,
            })
            .await
            .unwrap();

        assert_eq!(exchange.resyncs.load(Ordering::SeqCst), 1);
        let pos = mirror.current_position();
        assert_eq!(pos.side, Some(PositionSide::Short));
        assert_eq!(pos.size, 0.08);
        assert_eq!(pos.entry_price, 50_500.0);
    }

    #[tokio::test]
    async fn test_matching_account_report_is_quiet() {
        let exchange = FakeExchange::new();
        let mut mirror = mirror_with(exchange.clone());
        mirror.apply(entry_plan()).await.unwrap();

        mirror
            .reconcile(ExecutionReport::AccountPosition {
                position_amt: 0.04,
                entry_price: 50_000.0,
            })
            .await
            .unwrap();
        assert_eq!(exchange.resyncs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resync_rebuilds_open_orders() {
        let exchange = FakeExchange::new();
        *exchange.position.lock().unwrap() = PositionReport {
            position_amt: 0.04,
            entry_price: 50_000.0,
        };
        *exchange.open.lock().unwrap() = vec![OpenOrderReport {
            order_id: 77,
            client_order_id: "abc".into(),
            side: OrderSide::Sell,
            order_type: "STOP_MARKET".into(),
            price: 0.0,
            stop_price: Some(49_000.0),
            orig_qty: 0.0,
            reduce_only: false,
            close_position: true,
        }];

        let mut mirror = mirror_with(exchange.clone());
        mirror.force_resync().await.unwrap();

        let pos = mirror.current_position();
        assert_eq!(pos.side, Some(PositionSide::Long));
        let sl = pos.order_by_purpose(OrderPurpose::StopLoss).unwrap();
        assert_eq!(sl.exchange_order_id, 77);
        assert_eq!(sl.requested_price, Some(49_000.0));
    }

    #[tokio::test]
    async fn test_untracked_order_update_ignored() {
        let exchange = FakeExchange::new();
        let mut mirror = mirror_with(exchange.clone());
        mirror.reconcile(fill_update(999, 1.0, 1.0)).await.unwrap();
        assert!(mirror.current_position().is_flat());
        assert_eq!(exchange.resyncs.load(Ordering::SeqCst), 0);
    }
}
