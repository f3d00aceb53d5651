//! 后台任务队列：单工作者，FIFO，顺序执行
//!
//! 每个任务都写工作区，所以任务之间绝不并行；工作者拿到任务先取
//! 工作区互斥锁，再用工厂造一个全新的编排器（全新上下文，任务间
//! 无共享状态）。submit 同步返回任务 id；每个任务有自己的行式日志。
//! 完成时向事件总线发 TaskCompleted 与终端响铃。

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{GoalOrchestrator, GoalStatus, HarnessError};
use crate::events::{EventBus, HarnessEvent};
use crate::tasks::store::{TaskRecord, TaskStatus, TaskStore};

/// 每个任务一个全新编排器（全新上下文存储）
pub type OrchestratorFactory = Arc<dyn Fn() -> GoalOrchestrator + Send + Sync>;

pub struct TaskQueueManager {
    store: Arc<TaskStore>,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    bus: EventBus,
    log_dir: PathBuf,
    stop: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TaskQueueManager {
    pub fn new(store: Arc<TaskStore>, log_dir: impl Into<PathBuf>, bus: EventBus) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store,
            tx,
            rx: Mutex::new(Some(rx)),
            bus,
            log_dir: log_dir.into(),
            stop: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// 启动后台工作者：先做崩溃恢复，再把库里残留的 queued 重新入队
    pub fn start(
        &self,
        factory: OrchestratorFactory,
        workspace_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Result<(), HarnessError> {
        let Some(mut rx) = self.rx.lock().expect("queue lock").take() else {
            return Ok(()); // 已启动
        };

        self.store.recover_stale_running()?;
        for id in self.store.queued_ids()? {
            let _ = self.tx.send(id);
        }

        let store = Arc::clone(&self.store);
        let bus = self.bus.clone();
        let stop = self.stop.clone();
        let handle = tokio::spawn(async move {
            loop {
                let id = tokio::select! {
                    _ = stop.cancelled() => break,
                    id = rx.recv() => match id {
                        Some(id) => id,
                        None => break,
                    },
                };
                let _guard = workspace_lock.lock().await;
                process_task(&store, &bus, &factory, &id).await;
            }
        });
        *self.worker.lock().expect("queue lock") = Some(handle);
        Ok(())
    }

    /// 提交目标，立即返回任务记录
    pub fn submit(&self, goal: &str) -> Result<TaskRecord, HarnessError> {
        std::fs::create_dir_all(&self.log_dir)
            .map_err(|e| HarnessError::Store(format!("create log dir: {}", e)))?;
        let log_path = self.log_dir.join(format!(
            "task_{}_{}.log",
            chrono::Utc::now().timestamp(),
            &uuid::Uuid::new_v4().simple().to_string()[..6]
        ));
        let id = self
            .store
            .create(goal, &log_path.to_string_lossy())?;
        self.bus.emit(HarnessEvent::TaskSubmitted { id: id.clone() });
        let _ = self.tx.send(id.clone());
        self.store
            .get(&id)?
            .ok_or_else(|| HarnessError::Store("task vanished after insert".into()))
    }

    pub fn list(&self, limit: usize) -> Result<Vec<TaskRecord>, HarnessError> {
        self.store.list(limit)
    }

    pub fn result(&self, id: &str) -> Result<Option<TaskRecord>, HarnessError> {
        self.store.get(id)
    }

    pub fn cancel(&self, id: &str) -> Result<bool, HarnessError> {
        self.store.mark_cancelled(id)
    }

    /// 停止工作者；当前任务跑完即退出，剩余 queued 留给下次启动
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handle = self.worker.lock().expect("queue lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn process_task(
    store: &TaskStore,
    bus: &EventBus,
    factory: &OrchestratorFactory,
    id: &str,
) {
    let task = match store.get(id) {
        Ok(Some(t)) => t,
        _ => return,
    };
    if task.status != TaskStatus::Queued {
        return;
    }
    match store.mark_running(id) {
        Ok(true) => {}
        _ => return,
    }
    tracing::info!(task = id, goal = %task.goal, "background task started");

    let mut log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&task.log_path)
        .ok();
    if let Some(f) = log.as_mut() {
        let _ = writeln!(
            f,
            "=== Task {}: {} ===\n=== Started: {} ===\n",
            id,
            task.goal,
            chrono::Utc::now().to_rfc3339()
        );
    }

    let mut orchestrator = factory();
    let report = orchestrator.run_goal(&task.goal).await;

    if let Some(f) = log.as_mut() {
        let _ = writeln!(f, "{}", report.summary);
        let _ = writeln!(f, "=== Finished: {} ===", chrono::Utc::now().to_rfc3339());
    }

    let status = match report.status {
        GoalStatus::Succeeded => {
            let _ = store.mark_succeeded(id, &report.summary);
            TaskStatus::Succeeded
        }
        GoalStatus::Failed => {
            let _ = store.mark_failed(id, &report.summary);
            TaskStatus::Failed
        }
    };
    tracing::info!(task = id, status = %status, "background task finished");
    bus.emit(HarnessEvent::TaskCompleted {
        id: id.to_string(),
        status: status.to_string(),
    });
    bus.emit(HarnessEvent::TerminalBell);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::llm::MockLlm;

    fn manager(dir: &std::path::Path) -> (TaskQueueManager, Arc<TaskStore>) {
        let store = Arc::new(TaskStore::open(dir.join("tasks.db")).unwrap());
        let bus = EventBus::new();
        let mgr = TaskQueueManager::new(Arc::clone(&store), dir.join("logs"), bus);
        (mgr, store)
    }

    fn factory(workspace: PathBuf) -> OrchestratorFactory {
        Arc::new(move || {
            let mut config = AppConfig::default();
            config.checkpoint.enabled = false;
            // MockLlm 对任何请求都回 "Done."：规划失败 -> 直接执行 -> 文本回答
            GoalOrchestrator::new(
                config,
                workspace.clone(),
                Arc::new(MockLlm::new()),
                EventBus::new(),
                CancellationToken::new(),
            )
        })
    }

    #[tokio::test]
    async fn test_submit_returns_id_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, _store) = manager(dir.path());
        let task = mgr.submit("do a thing").unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.id.len(), 8);
        assert!(task.log_path.contains("task_"));
    }

    #[tokio::test]
    async fn test_worker_processes_fifo_and_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let (mgr, store) = manager(dir.path());

        let a = mgr.submit("first goal").unwrap();
        let b = mgr.submit("second goal").unwrap();
        mgr.start(
            factory(ws.path().to_path_buf()),
            Arc::new(tokio::sync::Mutex::new(())),
        )
        .unwrap();

        // 轮询等待两个任务都到终态
        for _ in 0..100 {
            let done = [&a.id, &b.id].iter().all(|id| {
                store
                    .get(id)
                    .unwrap()
                    .map(|t| t.status.is_terminal())
                    .unwrap_or(false)
            });
            if done {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        mgr.shutdown().await;

        let ta = store.get(&a.id).unwrap().unwrap();
        let tb = store.get(&b.id).unwrap().unwrap();
        assert_eq!(ta.status, TaskStatus::Succeeded, "{:?}", ta.result_text);
        assert_eq!(tb.status, TaskStatus::Succeeded);
        // FIFO：第一个任务先开始
        assert!(ta.started_at.unwrap() <= tb.started_at.unwrap());
        // 日志文件存在且有内容
        let log = std::fs::read_to_string(&ta.log_path).unwrap();
        assert!(log.contains("first goal"));
        assert!(log.contains("Finished"));
    }

    #[tokio::test]
    async fn test_running_never_exceeds_one() {
        let dir = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let (mgr, store) = manager(dir.path());
        for i in 0..4 {
            mgr.submit(&format!("goal {}", i)).unwrap();
        }
        mgr.start(
            factory(ws.path().to_path_buf()),
            Arc::new(tokio::sync::Mutex::new(())),
        )
        .unwrap();

        for _ in 0..100 {
            assert!(store.running_count().unwrap() <= 1);
            let all_done = store
                .list(10)
                .unwrap()
                .iter()
                .all(|t| t.status.is_terminal());
            if all_done {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_requeues_pending() {
        let dir = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();

        // 第一个进程：提交但不启动工作者
        let id = {
            let (mgr, _store) = manager(dir.path());
            mgr.submit("survives restart").unwrap().id
        };

        // 第二个进程：启动时接上遗留任务
        let (mgr, store) = manager(dir.path());
        mgr.start(
            factory(ws.path().to_path_buf()),
            Arc::new(tokio::sync::Mutex::new(())),
        )
        .unwrap();
        for _ in 0..100 {
            if store
                .get(&id)
                .unwrap()
                .map(|t| t.status.is_terminal())
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        mgr.shutdown().await;
        assert_eq!(store.get(&id).unwrap().unwrap().status, TaskStatus::Succeeded);
    }
}
