//! 后台任务：持久化队列与单工作者执行

pub mod queue;
pub mod store;

pub use queue::{OrchestratorFactory, TaskQueueManager};
pub use store::{TaskRecord, TaskStatus, TaskStore};
