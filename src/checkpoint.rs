//! 检查点管理器：目标执行的事务层
//!
//! 生命周期：进入（必要时 git init + 首提交，失败则降级禁用）、暂存
//! 未提交改动、切到 harness/goal-<epoch> 工作分支、期间快照（每 10 次
//! 写入 / 计划步边界 / 显式里程碑，工作区无变化时跳过）、失败回滚
//! reset --hard、成功 squash-merge 回原分支并删工作分支、恢复暂存。
//! 用户分支只在成功合并时被修改。

use std::path::PathBuf;

use crate::core::HarnessError;
use crate::events::{EventBus, HarnessEvent};
use crate::tools::git_tools::git;

/// 目标内的一个轻量快照
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub commit_hash: String,
    pub description: String,
}

pub struct CheckpointManager {
    root: PathBuf,
    bus: EventBus,
    enabled: bool,
    snapshot_every_writes: u32,
    active: bool,
    original_branch: Option<String>,
    work_branch: Option<String>,
    stashed: bool,
    snapshots: Vec<Snapshot>,
    writes_since_snapshot: u32,
    taken_total: u32,
}

impl CheckpointManager {
    pub fn new(
        root: impl Into<PathBuf>,
        enabled: bool,
        snapshot_every_writes: u32,
        bus: EventBus,
    ) -> Self {
        Self {
            root: root.into(),
            bus,
            enabled,
            snapshot_every_writes: snapshot_every_writes.max(1),
            active: false,
            original_branch: None,
            work_branch: None,
            stashed: false,
            snapshots: Vec::new(),
            writes_since_snapshot: 0,
            taken_total: 0,
        }
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// 本目标内累计创建过的快照数（回滚不回退该计数）
    pub fn taken_total(&self) -> u32 {
        self.taken_total
    }

    pub fn work_branch(&self) -> Option<&str> {
        self.work_branch.as_deref()
    }

    /// 进入检查点会话。不是仓库时自动 git init + 初始提交；
    /// 初始化失败降级为不设检查点（记日志，继续执行）。
    pub async fn enter(&mut self) -> Result<String, HarnessError> {
        if !self.enabled {
            return Ok("checkpointing disabled".to_string());
        }
        if self.active {
            return Ok("already active".to_string());
        }

        if !self.root.join(".git").is_dir() {
            if let Err(msg) = self.auto_init().await {
                tracing::warn!(error = %msg, "git init failed, continuing without checkpoints");
                self.enabled = false;
                return Ok(format!("checkpointing unavailable: {}", msg));
            }
        }

        let head = self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        self.original_branch = Some(if head.ok {
            head.stdout.trim().to_string()
        } else {
            "main".to_string()
        });

        // 暂存用户未提交的改动
        let status = self.run(&["status", "--porcelain"]).await?;
        if !status.stdout.trim().is_empty() {
            let stash = self
                .run(&["stash", "push", "-m", "open-harness: pre-goal checkpoint"])
                .await?;
            if stash.ok && !stash.stdout.contains("No local changes") {
                self.stashed = true;
            }
        }

        let epoch = chrono::Utc::now().timestamp();
        let mut branch_name = format!("harness/goal-{}", epoch);
        let created = self.run(&["checkout", "-b", &branch_name]).await?;
        if !created.ok {
            branch_name = format!("harness/goal-{}-retry", epoch);
            let retry = self.run(&["checkout", "-b", &branch_name]).await?;
            if !retry.ok {
                self.restore_stash().await;
                return Err(HarnessError::Workspace(format!(
                    "cannot create work branch: {}",
                    retry.stderr.trim()
                )));
            }
        }
        self.work_branch = Some(branch_name.clone());
        self.active = true;
        self.snapshots.clear();
        self.writes_since_snapshot = 0;
        self.taken_total = 0;

        let mut parts = Vec::new();
        if self.stashed {
            parts.push("stashed uncommitted changes".to_string());
        }
        parts.push(format!("branch: {}", branch_name));
        Ok(parts.join(", "))
    }

    /// 每次 write_file/edit_file 成功后调用；到阈值自动快照
    pub async fn on_write(&mut self) -> Result<(), HarnessError> {
        if !self.active {
            return Ok(());
        }
        self.writes_since_snapshot += 1;
        if self.writes_since_snapshot >= self.snapshot_every_writes {
            self.snapshot("periodic write snapshot").await?;
        }
        Ok(())
    }

    /// 创建快照；工作区无变化时跳过（不推进快照指针）
    pub async fn snapshot(&mut self, description: &str) -> Result<Option<Snapshot>, HarnessError> {
        if !self.active {
            return Ok(None);
        }
        let status = self.run(&["status", "--porcelain"]).await?;
        if status.stdout.trim().is_empty() {
            return Ok(None);
        }

        let add = self.run(&["add", "-A"]).await?;
        if !add.ok {
            return Err(HarnessError::Workspace(add.combined()));
        }
        let message = format!("harness-snapshot: {}", description);
        let commit = self.run(&["commit", "-m", &message]).await?;
        if !commit.ok {
            return Err(HarnessError::Workspace(commit.combined()));
        }
        let rev = self.run(&["rev-parse", "--short", "HEAD"]).await?;
        let snap = Snapshot {
            commit_hash: rev.stdout.trim().to_string(),
            description: description.to_string(),
        };
        tracing::info!(commit = %snap.commit_hash, description, "checkpoint taken");
        self.bus.emit(HarnessEvent::CheckpointTaken {
            description: description.to_string(),
            commit: snap.commit_hash.clone(),
        });
        self.snapshots.push(snap.clone());
        self.writes_since_snapshot = 0;
        self.taken_total += 1;
        Ok(Some(snap))
    }

    /// 回滚到指定快照；None 表示回滚掉目标内全部改动
    pub async fn rollback(&mut self, to: Option<&Snapshot>) -> Result<String, HarnessError> {
        if !self.active {
            return Ok("no active checkpoint".to_string());
        }
        let outcome = match to {
            Some(snap) => {
                let reset = self
                    .run(&["reset", "--hard", &snap.commit_hash])
                    .await?;
                if !reset.ok {
                    return Err(HarnessError::Workspace(reset.combined()));
                }
                if let Some(idx) = self
                    .snapshots
                    .iter()
                    .position(|s| s.commit_hash == snap.commit_hash)
                {
                    self.snapshots.truncate(idx + 1);
                }
                format!("rolled back to {} ({})", snap.commit_hash, snap.description)
            }
            None => {
                let reset = if let Some(first) = self.snapshots.first() {
                    self.run(&["reset", "--hard", &format!("{}~1", first.commit_hash)])
                        .await?
                } else {
                    self.run(&["reset", "--hard", "HEAD"]).await?
                };
                if !reset.ok {
                    return Err(HarnessError::Workspace(reset.combined()));
                }
                self.snapshots.clear();
                "rolled back all goal changes".to_string()
            }
        };
        tracing::info!(%outcome, "checkpoint rollback");
        self.bus.emit(HarnessEvent::CheckpointRolledBack {
            target: outcome.clone(),
        });
        self.writes_since_snapshot = 0;
        Ok(outcome)
    }

    /// 最后一个快照（回滚目标）
    pub fn last_snapshot(&self) -> Option<Snapshot> {
        self.snapshots.last().cloned()
    }

    /// 结束会话。keep_changes 时把工作分支 squash-merge 回原分支；
    /// 否则丢弃工作分支。两种路径最后都恢复暂存并删除工作分支。
    pub async fn finish(&mut self, keep_changes: bool) -> Result<String, HarnessError> {
        if !self.active {
            return Ok("no active checkpoint".to_string());
        }
        self.active = false;
        let original = self
            .original_branch
            .clone()
            .unwrap_or_else(|| "main".to_string());
        let work = self.work_branch.clone();
        let mut parts: Vec<String> = Vec::new();

        // 工作分支上未提交的尾巴先收进一个快照（直接执行路径可能从未触发过步快照）
        let mut committed_tail = false;
        if keep_changes {
            let status = self.run(&["status", "--porcelain"]).await?;
            if !status.stdout.trim().is_empty() {
                let add = self.run(&["add", "-A"]).await?;
                let commit = self
                    .run(&["commit", "-m", "harness-snapshot: uncommitted changes at finish"])
                    .await?;
                committed_tail = add.ok && commit.ok;
            }
        }

        if keep_changes && (!self.snapshots.is_empty() || committed_tail) {
            let checkout = self.run(&["checkout", &original]).await?;
            if !checkout.ok {
                let force = self.run(&["checkout", "-f", &original]).await?;
                if !force.ok {
                    parts.push(format!("checkout failed: {}", force.stderr.trim()));
                    self.restore_stash_into(&mut parts).await;
                    self.snapshots.clear();
                    self.work_branch = None;
                    return Ok(parts.join(", "));
                }
            }

            if let Some(work) = &work {
                let merge = self.run(&["merge", "--squash", work]).await?;
                if merge.ok {
                    let count = self.snapshots.len() + usize::from(committed_tail);
                    parts.push(format!("merged {} snapshots", count));
                } else {
                    let _ = self.run(&["merge", "--abort"]).await;
                    parts.push(format!(
                        "merge conflict (aborted): {}",
                        merge.stderr.trim().chars().take(100).collect::<String>()
                    ));
                }
                let _ = self.run(&["branch", "-D", work]).await;
            }
        } else if let Some(work) = &work {
            // 丢弃：强制切回原分支，删除工作分支
            let _ = self.run(&["checkout", "-f", &original]).await;
            let _ = self.run(&["branch", "-D", work]).await;
            parts.push("discarded goal changes".to_string());
        }

        self.restore_stash_into(&mut parts).await;
        self.snapshots.clear();
        self.work_branch = None;
        if parts.is_empty() {
            parts.push("clean finish".to_string());
        }
        Ok(parts.join(", "))
    }

    /// 目标开始以来的 diff 概要
    pub async fn diff_stat(&self) -> String {
        if !self.active || self.snapshots.is_empty() {
            return String::new();
        }
        let range = format!("HEAD~{}", self.snapshots.len());
        match self.run(&["diff", "--stat", &range, "HEAD"]).await {
            Ok(out) if out.ok => out.stdout.trim().to_string(),
            _ => String::new(),
        }
    }

    /// 工作区中仍存在的文件（回滚后修剪结构化摘要用）
    pub fn file_exists(&self, rel: &str) -> bool {
        self.root.join(rel).exists()
    }

    async fn auto_init(&mut self) -> Result<(), String> {
        let gitignore = self.root.join(".gitignore");
        if !gitignore.exists() {
            let _ = std::fs::write(
                &gitignore,
                "# Auto-generated by Open Harness\ntarget/\nnode_modules/\n__pycache__/\n*.pyc\n.venv/\ndist/\nbuild/\n",
            );
        }
        let init = self.run(&["init"]).await.map_err(|e| e.to_string())?;
        if !init.ok {
            return Err(init.combined());
        }
        // 没有可用身份时补一个仓库局部身份，否则初始提交会失败
        let identity = self.run(&["config", "user.email"]).await;
        if !matches!(identity, Ok(ref out) if out.ok && !out.stdout.trim().is_empty()) {
            let _ = self.run(&["config", "user.email", "harness@localhost"]).await;
            let _ = self.run(&["config", "user.name", "Open Harness"]).await;
        }
        let _ = self.run(&["add", "-A"]).await;
        let commit = self
            .run(&["commit", "-m", "Initial commit (auto-created by Open Harness)"])
            .await
            .map_err(|e| e.to_string())?;
        if !commit.ok {
            // 没有基线提交，检查点无法安全工作；移除半初始化状态
            let _ = std::fs::remove_dir_all(self.root.join(".git"));
            return Err(format!("initial commit failed: {}", commit.combined()));
        }
        Ok(())
    }

    async fn restore_stash(&mut self) {
        let mut parts = Vec::new();
        self.restore_stash_into(&mut parts).await;
    }

    async fn restore_stash_into(&mut self, parts: &mut Vec<String>) {
        if self.stashed {
            match self.run(&["stash", "pop"]).await {
                Ok(pop) if pop.ok => parts.push("restored stashed changes".to_string()),
                Ok(pop) => parts.push(format!("stash pop failed: {}", pop.stderr.trim())),
                Err(e) => parts.push(format!("stash pop failed: {}", e)),
            }
            self.stashed = false;
        }
    }

    async fn run(&self, args: &[&str]) -> Result<crate::tools::git_tools::GitOutput, HarnessError> {
        git(&self.root, args)
            .await
            .map_err(HarnessError::Workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager(dir: &Path) -> CheckpointManager {
        let mut m = CheckpointManager::new(dir, true, 10, EventBus::new());
        // 身份配置，避免 commit 失败
        let _ = git(dir, &["init"]).await.unwrap();
        let _ = git(dir, &["config", "user.email", "h@test"]).await.unwrap();
        let _ = git(dir, &["config", "user.name", "harness"]).await.unwrap();
        std::fs::write(dir.join("base.txt"), "base\n").unwrap();
        let _ = git(dir, &["add", "-A"]).await.unwrap();
        let _ = git(dir, &["commit", "-m", "base"]).await.unwrap();
        let msg = m.enter().await.unwrap();
        assert!(msg.contains("harness/goal-"), "{}", msg);
        m
    }

    #[tokio::test]
    async fn test_enter_creates_work_branch() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        assert!(m.active());
        let head = git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap();
        assert!(head.stdout.starts_with("harness/goal-"));
    }

    #[tokio::test]
    async fn test_snapshot_skipped_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path()).await;
        let snap = m.snapshot("noop step").await.unwrap();
        assert!(snap.is_none());
        assert!(m.snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_and_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path()).await;

        std::fs::write(dir.path().join("a.txt"), "A\n").unwrap();
        let s1 = m.snapshot("create a").await.unwrap().expect("snapshot");
        std::fs::write(dir.path().join("b.txt"), "B\n").unwrap();
        let _s2 = m.snapshot("create b").await.unwrap().expect("snapshot");

        // 回滚到 s1：b.txt 消失，a.txt 保留
        m.rollback(Some(&s1)).await.unwrap();
        assert!(dir.path().join("a.txt").exists());
        assert!(!dir.path().join("b.txt").exists());
        assert_eq!(m.snapshots().len(), 1);
    }

    #[tokio::test]
    async fn test_write_counter_triggers_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = CheckpointManager::new(dir.path(), true, 2, EventBus::new());
        let _ = git(dir.path(), &["init"]).await.unwrap();
        let _ = git(dir.path(), &["config", "user.email", "h@test"]).await.unwrap();
        let _ = git(dir.path(), &["config", "user.name", "harness"]).await.unwrap();
        std::fs::write(dir.path().join("base.txt"), "base\n").unwrap();
        let _ = git(dir.path(), &["add", "-A"]).await.unwrap();
        let _ = git(dir.path(), &["commit", "-m", "base"]).await.unwrap();
        m.enter().await.unwrap();

        std::fs::write(dir.path().join("x.txt"), "1\n").unwrap();
        m.on_write().await.unwrap();
        assert!(m.snapshots().is_empty());
        std::fs::write(dir.path().join("y.txt"), "2\n").unwrap();
        m.on_write().await.unwrap();
        assert_eq!(m.snapshots().len(), 1);
    }

    #[tokio::test]
    async fn test_finish_squash_merges_to_original() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path()).await;
        std::fs::write(dir.path().join("new.txt"), "new\n").unwrap();
        m.snapshot("add new file").await.unwrap();

        let msg = m.finish(true).await.unwrap();
        assert!(msg.contains("merged"), "{}", msg);

        let head = git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap();
        assert!(!head.stdout.starts_with("harness/goal-"));
        assert!(dir.path().join("new.txt").exists());
        // 工作分支已删除
        let branches = git(dir.path(), &["branch", "--list"]).await.unwrap();
        assert!(!branches.stdout.contains("harness/goal-"));
    }

    #[tokio::test]
    async fn test_hard_failure_leaves_original_branch_clean() {
        let dir = tempfile::tempdir().unwrap();
        let before = {
            let mut m = manager(dir.path()).await;
            std::fs::write(dir.path().join("junk.txt"), "junk\n").unwrap();
            m.snapshot("junk").await.unwrap();
            let head = git(dir.path(), &["rev-parse", "HEAD"]).await.unwrap();
            m.rollback(None).await.unwrap();
            m.finish(false).await.unwrap();
            head
        };
        let _ = before;
        // 原分支回到目标开始前的状态
        assert!(!dir.path().join("junk.txt").exists());
        let status = git(dir.path(), &["status", "--porcelain"]).await.unwrap();
        assert!(status.stdout.trim().is_empty(), "{}", status.stdout);
    }

    #[tokio::test]
    async fn test_earlier_snapshot_survives_later_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path()).await;

        // 成功的步：提交为快照
        std::fs::write(dir.path().join("kept.txt"), "keep me\n").unwrap();
        let s1 = m.snapshot("step 1: create kept").await.unwrap().expect("snapshot");

        // 后续步写了一半就失败：回滚到最后一个好快照，再带着已提交内容收尾
        std::fs::write(dir.path().join("doomed.txt"), "half done\n").unwrap();
        m.rollback(Some(&s1)).await.unwrap();
        assert!(!dir.path().join("doomed.txt").exists());
        assert_eq!(m.snapshots().len(), 1);

        let msg = m.finish(true).await.unwrap();
        assert!(msg.contains("merged"), "{}", msg);

        // 成功步的提交并回了原分支，失败步的残留没有跟过来
        let head = git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap();
        assert!(!head.stdout.starts_with("harness/goal-"));
        assert!(dir.path().join("kept.txt").exists());
        assert!(!dir.path().join("doomed.txt").exists());
        let branches = git(dir.path(), &["branch", "--list"]).await.unwrap();
        assert!(!branches.stdout.contains("harness/goal-"));
    }

    #[tokio::test]
    async fn test_stash_restored_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        // 基础仓库 + 未提交改动
        let _ = git(dir.path(), &["init"]).await.unwrap();
        let _ = git(dir.path(), &["config", "user.email", "h@test"]).await.unwrap();
        let _ = git(dir.path(), &["config", "user.name", "harness"]).await.unwrap();
        std::fs::write(dir.path().join("base.txt"), "base\n").unwrap();
        let _ = git(dir.path(), &["add", "-A"]).await.unwrap();
        let _ = git(dir.path(), &["commit", "-m", "base"]).await.unwrap();
        std::fs::write(dir.path().join("base.txt"), "user edit\n").unwrap();

        let mut m = CheckpointManager::new(dir.path(), true, 10, EventBus::new());
        let msg = m.enter().await.unwrap();
        assert!(msg.contains("stashed"), "{}", msg);

        let finish = m.finish(false).await.unwrap();
        assert!(finish.contains("restored stashed"), "{}", finish);
        let content = std::fs::read_to_string(dir.path().join("base.txt")).unwrap();
        assert_eq!(content, "user edit\n");
    }

    #[tokio::test]
    async fn test_auto_init_when_not_a_repo() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("existing.txt"), "x\n").unwrap();
        let mut m = CheckpointManager::new(dir.path(), true, 10, EventBus::new());
        let msg = m.enter().await.unwrap();
        assert!(m.active(), "{}", msg);
        assert!(dir.path().join(".git").is_dir());
    }
}
