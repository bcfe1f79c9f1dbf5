use crate::models::{EntryKind, OrderPurpose, OrderSide};

/// One order operation against the exchange. Steps inside a plan execute in
/// the fixed order {cancel stale protection, reduce/close, entry, stop-loss,
/// take-profit}; the translator emits them pre-sorted.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    CancelOrder {
        purpose: OrderPurpose,
        order_id: i64,
    },
    /// Reduce-only market close of the full current size.
    ClosePosition {
        side: OrderSide,
        qty: f64,
    },
    PlaceEntry {
        side: OrderSide,
        kind: EntryKind,
        qty: f64,
        price: Option<f64>,
    },
    PlaceStopLoss {
        side: OrderSide,
        price: f64,
    },
    PlaceTakeProfit {
        side: OrderSide,
        price: f64,
        qty: f64,
    },
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStep::CancelOrder { purpose, order_id } => {
                write!(f, "cancel {purpose:?} #{order_id}")
            }
            PlanStep::ClosePosition { side, qty } => {
                write!(f, "close position {} {qty}", side.as_str())
            }
            PlanStep::PlaceEntry {
                side, kind, qty, ..
            } => write!(f, "entry {} {qty} ({kind:?})", side.as_str()),
            PlanStep::PlaceStopLoss { price, .. } => write!(f, "stop-loss @ {price}"),
            PlanStep::PlaceTakeProfit { price, qty, .. } => {
                write!(f, "take-profit {qty} @ {price}")
            }
        }
    }
}

/// Ordered diff between the live order set and the latest directive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderPlan {
    pub steps: Vec<PlanStep>,
}

impl OrderPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

/// A successfully executed step; placement steps carry the exchange order id.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: PlanStep,
    pub order_id: Option<i64>,
}

/// First failing step of a plan. Already-applied steps are never rolled
/// back; the exchange remains ground truth and the next reconciliation
/// re-diffs.
#[derive(Debug, Clone)]
pub struct ApplyFailure {
    pub step: PlanStep,
    pub error: String,
    pub skipped: usize,
}

/// Outcome of applying one plan.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub completed: Vec<StepOutcome>,
    /// Protection steps held back until a pending entry fills.
    pub deferred: Vec<PlanStep>,
    pub failure: Option<ApplyFailure>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}
