pub mod mirror;
pub mod plan;
pub mod reports;
pub mod translator;

pub use mirror::OrderMirror;
pub use plan::{ApplyFailure, ApplyReport, OrderPlan, PlanStep, StepOutcome};
pub use reports::{ExecutionReport, OrderUpdate, UserStreamSupervisor};
pub use translator::{translate, AccountContext};
