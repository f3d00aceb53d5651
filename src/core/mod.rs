//! 核心：错误分类与目标编排

pub mod error;
pub mod orchestrator;

pub use error::{Failure, FailureClass, HarnessError};
pub use orchestrator::{GoalOrchestrator, GoalReport, GoalStats, GoalStatus};
