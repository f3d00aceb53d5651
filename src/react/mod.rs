//! 推理侧：Planner / Critic / 执行循环

pub mod critic;
pub mod loop_;
pub mod planner;

pub use critic::PlanCritic;
pub use loop_::{AgentLoop, InvocationOutcome, LoopStats, OutcomeKind};
pub use planner::{estimate_complexity, Complexity, Plan, PlanFailure, PlanStep, Planner};
