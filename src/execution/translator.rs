use std::time::Duration;

use crate::error::BotError;
use crate::execution::plan::{OrderPlan, PlanStep};
use crate::models::{
    Direction, Directive, EntryKind, MirroredPosition, OrderPurpose, PositionSide, SymbolFilters,
};
use crate::Result;

/// Balance snapshots older than this cannot be used for sizing.
pub const MAX_BALANCE_AGE: Duration = Duration::from_secs(30);

/// Account-level inputs for sizing a new entry. Staleness is carried as an
/// age so `translate` stays a pure function of its arguments.
#[derive(Debug, Clone, Copy)]
pub struct AccountContext {
    pub wallet_balance: f64,
    pub balance_age: Duration,
    pub mark_price: f64,
    pub filters: SymbolFilters,
    pub max_leverage: u32,
    pub margin_usage_pct: f64,
    pub leverage_override: Option<u32>,
}

/// Computes the ordered order operations that move the live position from
/// `position` to what `directive` asks for. Pure: no side effects, no
/// mutation of inputs, deterministic for equal inputs.
///
/// Step order is always {cancel stale SL/TP -> reduce/close -> entry ->
/// stop-loss -> take-profit}.
pub fn translate(
    directive: &Directive,
    position: &MirroredPosition,
    account: &AccountContext,
) -> Result<OrderPlan> {
    match directive.direction {
        Direction::Flat => Ok(flatten_plan(position)),
        Direction::Long | Direction::Short => directional_plan(directive, position, account),
    }
}

/// Flat: cancel all working orders, then close any open size. The close
/// always precedes any future entry because it is the last step here.
fn flatten_plan(position: &MirroredPosition) -> OrderPlan {
    let mut steps = cancel_protection_steps(position);
    if let Some(entry) = position.pending_entry() {
        steps.push(PlanStep::CancelOrder {
            purpose: OrderPurpose::Entry,
            order_id: entry.exchange_order_id,
        });
    }
    if !position.is_flat() {
        if let Some(side) = position.side {
            steps.push(PlanStep::ClosePosition {
                side: side.exit_order_side(),
                qty: position.size,
            });
        }
    }
    OrderPlan { steps }
}

fn directional_plan(
    directive: &Directive,
    position: &MirroredPosition,
    account: &AccountContext,
) -> Result<OrderPlan> {
    let target = match directive.direction {
        Direction::Long => PositionSide::Long,
        Direction::Short => PositionSide::Short,
        Direction::Flat => unreachable!("handled by caller"),
    };

    let stop_loss = directive
        .stop_loss
        .ok_or_else(|| BotError::OracleContract("directive missing stop_loss".into()))?;
    let take_profit = directive
        .take_profit
        .ok_or_else(|| BotError::OracleContract("directive missing take_profit".into()))?;

    let entry_ref_price = match directive.entry.kind {
        EntryKind::Limit => directive
            .entry
            .price
            .ok_or_else(|| BotError::OracleContract("limit entry requires a price".into()))?,
        EntryKind::Market => account.mark_price,
    };
    validate_protection_sides(target, entry_ref_price, stop_loss, take_profit)?;

    let sl_price = account.filters.normalize_price(stop_loss);
    let tp_price = account.filters.normalize_price(take_profit);
    let exit_side = target.exit_order_side();

    // Same direction, position open: amend the protective legs only.
    if position.direction() == directive.direction {
        return Ok(amend_protection_plan(position, exit_side, sl_price, tp_price));
    }

    // Same direction, entry still pending on the book: move the entry order.
    if position.is_flat() {
        if let Some(pending) = position.pending_entry() {
            if pending.side == target.entry_order_side() {
                return Ok(amend_pending_entry_plan(
                    directive, account, pending, target, sl_price, tp_price,
                )?);
            }
        }
    }

    // Fresh entry or direction flip.
    let qty = sized_quantity(account, directive.leverage_override, entry_ref_price)?;
    let mut steps = cancel_protection_steps(position);
    if let Some(pending) = position.pending_entry() {
        steps.push(PlanStep::CancelOrder {
            purpose: OrderPurpose::Entry,
            order_id: pending.exchange_order_id,
        });
    }
    if !position.is_flat() {
        if let Some(side) = position.side {
            steps.push(PlanStep::ClosePosition {
                side: side.exit_order_side(),
                qty: position.size,
            });
        }
    }
    steps.push(PlanStep::PlaceEntry {
        side: target.entry_order_side(),
        kind: directive.entry.kind,
        qty,
        price: (directive.entry.kind == EntryKind::Limit)
            .then(|| account.filters.normalize_price(entry_ref_price)),
    });
    steps.push(PlanStep::PlaceStopLoss {
        side: exit_side,
        price: sl_price,
    });
    steps.push(PlanStep::PlaceTakeProfit {
        side: exit_side,
        price: tp_price,
        qty,
    });
    Ok(OrderPlan { steps })
}

/// Cancel+replace for SL/TP legs whose price moved; the entry is not
/// re-sent. Unchanged legs produce no steps, so a repeated directive yields
/// an empty plan.
fn amend_protection_plan(
    position: &MirroredPosition,
    exit_side: crate::models::OrderSide,
    sl_price: f64,
    tp_price: f64,
) -> OrderPlan {
    let mut cancels = Vec::new();
    let mut places = Vec::new();

    let existing_sl = position.order_by_purpose(OrderPurpose::StopLoss);
    if existing_sl.map(|o| o.requested_price) != Some(Some(sl_price)) {
        if let Some(sl) = existing_sl {
            cancels.push(PlanStep::CancelOrder {
                purpose: OrderPurpose::StopLoss,
                order_id: sl.exchange_order_id,
            });
        }
        places.push(PlanStep::PlaceStopLoss {
            side: exit_side,
            price: sl_price,
        });
    }

    let existing_tp = position.order_by_purpose(OrderPurpose::TakeProfit);
    if existing_tp.map(|o| o.requested_price) != Some(Some(tp_price)) {
        if let Some(tp) = existing_tp {
            cancels.push(PlanStep::CancelOrder {
                purpose: OrderPurpose::TakeProfit,
                order_id: tp.exchange_order_id,
            });
        }
        places.push(PlanStep::PlaceTakeProfit {
            side: exit_side,
            price: tp_price,
            qty: position.size,
        });
    }

    let mut steps = cancels;
    steps.extend(places);
    OrderPlan { steps }
}

/// Pending limit entry with the same direction: replace it when the price
/// moved, and restate the protective legs (they are deferred until the entry
/// fills).
fn amend_pending_entry_plan(
    directive: &Directive,
    account: &AccountContext,
    pending: &crate::models::OrderRef,
    target: PositionSide,
    sl_price: f64,
    tp_price: f64,
) -> Result<OrderPlan> {
    if directive.entry.kind != EntryKind::Limit {
        // A market directive while a limit entry is resting replaces it
        // outright.
        let qty = sized_quantity(account, directive.leverage_override, account.mark_price)?;
        return Ok(OrderPlan {
            steps: vec![
                PlanStep::CancelOrder {
                    purpose: OrderPurpose::Entry,
                    order_id: pending.exchange_order_id,
                },
                PlanStep::PlaceEntry {
                    side: target.entry_order_side(),
                    kind: EntryKind::Market,
                    qty,
                    price: None,
                },
                PlanStep::PlaceStopLoss {
                    side: target.exit_order_side(),
                    price: sl_price,
                },
                PlanStep::PlaceTakeProfit {
                    side: target.exit_order_side(),
                    price: tp_price,
                    qty,
                },
            ],
        });
    }

    let new_price = account
        .filters
        .normalize_price(directive.entry.price.unwrap_or_default());
    if pending.requested_price == Some(new_price) {
        return Ok(OrderPlan::default());
    }

    let exit_side = target.exit_order_side();
    Ok(OrderPlan {
        steps: vec![
            PlanStep::CancelOrder {
                purpose: OrderPurpose::Entry,
                order_id: pending.exchange_order_id,
            },
            PlanStep::PlaceEntry {
                side: target.entry_order_side(),
                kind: EntryKind::Limit,
                qty: pending.requested_qty,
                price: Some(new_price),
            },
            PlanStep::PlaceStopLoss {
                side: exit_side,
                price: sl_price,
            },
            PlanStep::PlaceTakeProfit {
                side: exit_side,
                price: tp_price,
                qty: pending.requested_qty,
            },
        ],
    })
}

fn cancel_protection_steps(position: &MirroredPosition) -> Vec<PlanStep> {
    let mut steps = Vec::new();
    for purpose in [OrderPurpose::StopLoss, OrderPurpose::TakeProfit] {
        if let Some(order) = position.order_by_purpose(purpose) {
            steps.push(PlanStep::CancelOrder {
                purpose,
                order_id: order.exchange_order_id,
            });
        }
    }
    steps
}

fn validate_protection_sides(
    target: PositionSide,
    entry_price: f64,
    stop_loss: f64,
    take_profit: f64,
) -> Result<()> {
    let valid = match target {
        PositionSide::Long => stop_loss < entry_price && take_profit > entry_price,
        PositionSide::Short => stop_loss > entry_price && take_profit < entry_price,
    };
    if !valid {
        return Err(BotError::DirectiveRejected(format!(
            "SL {stop_loss} / TP {take_profit} on wrong side of entry {entry_price} for {target:?}"
        )));
    }
    Ok(())
}

/// target notional = wallet_balance x margin_usage_pct x effective_leverage,
/// effective_leverage = min(requested, exchange max); quantity is the
/// notional at the entry reference price floored to the lot step.
fn sized_quantity(
    account: &AccountContext,
    directive_leverage: Option<u32>,
    reference_price: f64,
) -> Result<f64> {
    if account.balance_age > MAX_BALANCE_AGE {
        return Err(BotError::DirectiveRejected(format!(
            "wallet balance is stale ({}s old)",
            account.balance_age.as_secs()
        )));
    }
    if account.wallet_balance <= 0.0 {
        return Err(BotError::DirectiveRejected(
            "wallet balance unavailable or non-positive".into(),
        ));
    }
    if reference_price <= 0.0 {
        return Err(BotError::DirectiveRejected(
            "no valid reference price for sizing".into(),
        ));
    }

    let requested = directive_leverage
        .or(account.leverage_override)
        .unwrap_or(account.max_leverage);
    let effective_leverage = requested.min(account.max_leverage).max(1);

    let notional = account.wallet_balance * account.margin_usage_pct * effective_leverage as f64;
    if account.filters.min_notional > 0.0 && notional < account.filters.min_notional {
        return Err(BotError::DirectiveRejected(format!(
            "notional {notional:.2} below exchange minimum {}",
            account.filters.min_notional
        )));
    }

    let qty = account.filters.normalize_qty(notional / reference_price);
    if qty <= 0.0 || qty < account.filters.min_qty {
        return Err(BotError::DirectiveRejected(format!(
            "quantity {qty} rounds below the lot minimum"
        )));
    }
    Ok(qty)
}
