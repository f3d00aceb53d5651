//! 任务持久化：单文件嵌入式关系库
//!
//! WAL 日志模式，单写多读。状态机只进不退（queued -> running ->
//! 终态），UPDATE 都带状态前置条件；进程崩溃留下的 running 在下次
//! 启动时统一改写为 failed。

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::core::HarnessError;

/// 任务状态（终态：succeeded / failed / cancelled）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条任务记录
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub goal: String,
    pub status: TaskStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub log_path: String,
    pub result_text: Option<String>,
}

pub struct TaskStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl TaskStore {
    /// 打开（或创建）任务库；父目录一并创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HarnessError::Store(format!("create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(&path)
            .map_err(|e| HarnessError::Store(format!("open {}: {}", path.display(), e)))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err)?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(store_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                goal TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued'
                    CHECK (status IN ('queued','running','succeeded','failed','cancelled')),
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                log_path TEXT NOT NULL,
                result TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at);",
        )
        .map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 新建任务，返回短 hex id
    pub fn create(&self, goal: &str, log_path: &str) -> Result<String, HarnessError> {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let now = chrono::Utc::now().timestamp();
        self.conn
            .lock()
            .expect("store lock")
            .execute(
                "INSERT INTO tasks (id, goal, status, created_at, log_path) VALUES (?1, ?2, 'queued', ?3, ?4)",
                params![id, goal, now, log_path],
            )
            .map_err(store_err)?;
        Ok(id)
    }

    /// queued -> running；其它状态不动（只进不退）
    pub fn mark_running(&self, id: &str) -> Result<bool, HarnessError> {
        let n = self
            .conn
            .lock()
            .expect("store lock")
            .execute(
                "UPDATE tasks SET status = 'running', started_at = ?1 WHERE id = ?2 AND status = 'queued'",
                params![chrono::Utc::now().timestamp(), id],
            )
            .map_err(store_err)?;
        Ok(n == 1)
    }

    pub fn mark_succeeded(&self, id: &str, result: &str) -> Result<(), HarnessError> {
        self.finish(id, TaskStatus::Succeeded, Some(result))
    }

    pub fn mark_failed(&self, id: &str, error: &str) -> Result<(), HarnessError> {
        self.finish(id, TaskStatus::Failed, Some(error))
    }

    /// 未开跑的任务可以取消；running 不可逆转
    pub fn mark_cancelled(&self, id: &str) -> Result<bool, HarnessError> {
        let n = self
            .conn
            .lock()
            .expect("store lock")
            .execute(
                "UPDATE tasks SET status = 'cancelled', finished_at = ?1 WHERE id = ?2 AND status = 'queued'",
                params![chrono::Utc::now().timestamp(), id],
            )
            .map_err(store_err)?;
        Ok(n == 1)
    }

    fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<&str>,
    ) -> Result<(), HarnessError> {
        self.conn
            .lock()
            .expect("store lock")
            .execute(
                "UPDATE tasks SET status = ?1, finished_at = ?2, result = ?3 WHERE id = ?4 AND status = 'running'",
                params![
                    status.as_str(),
                    chrono::Utc::now().timestamp(),
                    result,
                    id
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    /// 崩溃恢复：上次进程留下的 running 全部改写为 failed
    pub fn recover_stale_running(&self) -> Result<usize, HarnessError> {
        let n = self
            .conn
            .lock()
            .expect("store lock")
            .execute(
                "UPDATE tasks SET status = 'failed', finished_at = ?1, result = 'Process crashed during execution' WHERE status = 'running'",
                params![chrono::Utc::now().timestamp()],
            )
            .map_err(store_err)?;
        if n > 0 {
            tracing::warn!(count = n, "recovered stale running tasks as failed");
        }
        Ok(n)
    }

    pub fn get(&self, id: &str) -> Result<Option<TaskRecord>, HarnessError> {
        self.conn
            .lock()
            .expect("store lock")
            .query_row(
                "SELECT id, goal, status, created_at, started_at, finished_at, log_path, result
                 FROM tasks WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()
            .map_err(store_err)
    }

    pub fn list(&self, limit: usize) -> Result<Vec<TaskRecord>, HarnessError> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn
            .prepare(
                "SELECT id, goal, status, created_at, started_at, finished_at, log_path, result
                 FROM tasks ORDER BY created_at DESC, id LIMIT ?1",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_record)
            .map_err(store_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
    }

    /// queued 任务 id，FIFO 序
    pub fn queued_ids(&self) -> Result<Vec<String>, HarnessError> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn
            .prepare("SELECT id FROM tasks WHERE status = 'queued' ORDER BY created_at, rowid")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
    }

    /// 当前 running 数（任何时刻应 <= 1）
    pub fn running_count(&self) -> Result<usize, HarnessError> {
        self.conn
            .lock()
            .expect("store lock")
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = 'running'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(store_err)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status_str: String = row.get(2)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        goal: row.get(1)?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
        created_at: row.get(3)?,
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
        log_path: row.get(6)?,
        result_text: row.get(7)?,
    })
}

fn store_err(e: rusqlite::Error) -> HarnessError {
    HarnessError::Store(e.to_string())
}
