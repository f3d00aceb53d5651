//! git 工具：git_status / git_diff / git_commit / git_branch / git_log
//!
//! 都是对仓库根目录 git 子进程的薄封装；检查点管理器复用这里的 git 助手。

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::registry::{ArgSpec, ArgType, SideEffect, Tool, ToolDescriptor};

/// 单条 git 命令的超时
const GIT_TIMEOUT: Duration = Duration::from_secs(15);

/// git 子进程结果
#[derive(Debug)]
pub struct GitOutput {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn combined(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.trim_end().to_string()
        } else if self.stdout.trim().is_empty() {
            self.stderr.trim_end().to_string()
        } else {
            format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end())
        }
    }
}

/// 在 root 下执行一条 git 命令
pub async fn git(root: &Path, args: &[&str]) -> Result<GitOutput, String> {
    let output = tokio::time::timeout(
        GIT_TIMEOUT,
        Command::new("git").args(args).current_dir(root).output(),
    )
    .await
    .map_err(|_| format!("git {} timed out", args.join(" ")))?
    .map_err(|e| format!("git spawn failed: {}", e))?;

    Ok(GitOutput {
        ok: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

// ---------------------------------------------------------------------------
// git_status
// ---------------------------------------------------------------------------

pub struct GitStatusTool {
    root: PathBuf,
    descriptor: ToolDescriptor,
}

impl GitStatusTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            descriptor: ToolDescriptor {
                name: "git_status",
                description: "Show the current branch and working tree status.",
                args: vec![],
                output_limit: 2048,
                side_effect: SideEffect::Read,
            },
        }
    }
}

#[async_trait]
impl Tool for GitStatusTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _args: &Value) -> Result<String, String> {
        let branch = git(&self.root, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let status = git(&self.root, &["status", "--porcelain"]).await?;
        if !status.ok {
            return Err(status.combined());
        }
        let tree = if status.stdout.trim().is_empty() {
            "clean".to_string()
        } else {
            status.stdout.trim_end().to_string()
        };
        Ok(format!("branch: {}\n{}", branch.stdout.trim(), tree))
    }
}

// ---------------------------------------------------------------------------
// git_diff
// ---------------------------------------------------------------------------

pub struct GitDiffTool {
    root: PathBuf,
    descriptor: ToolDescriptor,
}

impl GitDiffTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            descriptor: ToolDescriptor {
                name: "git_diff",
                description: "Show unstaged changes, or staged changes with staged=true.",
                args: vec![ArgSpec::optional(
                    "staged",
                    ArgType::Boolean,
                    "diff the index instead of the working tree",
                )],
                output_limit: 2048,
                side_effect: SideEffect::Read,
            },
        }
    }
}

#[async_trait]
impl Tool for GitDiffTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &Value) -> Result<String, String> {
        let staged = args.get("staged").and_then(Value::as_bool).unwrap_or(false);
        let out = if staged {
            git(&self.root, &["diff", "--cached"]).await?
        } else {
            git(&self.root, &["diff"]).await?
        };
        if !out.ok {
            return Err(out.combined());
        }
        Ok(if out.stdout.trim().is_empty() {
            "(no changes)".to_string()
        } else {
            out.stdout
        })
    }
}

// ---------------------------------------------------------------------------
// git_commit
// ---------------------------------------------------------------------------

pub struct GitCommitTool {
    root: PathBuf,
    descriptor: ToolDescriptor,
}

impl GitCommitTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            descriptor: ToolDescriptor {
                name: "git_commit",
                description: "Stage and commit changes. Stages everything unless `paths` is given (space-separated).",
                args: vec![
                    ArgSpec::required("message", ArgType::String, "commit message"),
                    ArgSpec::optional("paths", ArgType::String, "paths to stage, space-separated"),
                ],
                output_limit: 2048,
                side_effect: SideEffect::Git,
            },
        }
    }
}

#[async_trait]
impl Tool for GitCommitTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &Value) -> Result<String, String> {
        let message = args.get("message").and_then(Value::as_str).unwrap_or("");
        let paths = args.get("paths").and_then(Value::as_str).unwrap_or("");

        if paths.is_empty() {
            let add = git(&self.root, &["add", "-A"]).await?;
            if !add.ok {
                return Err(add.combined());
            }
        } else {
            let mut add_args = vec!["add", "--"];
            add_args.extend(paths.split_whitespace());
            let add = git(&self.root, &add_args).await?;
            if !add.ok {
                return Err(add.combined());
            }
        }

        let commit = git(&self.root, &["commit", "-m", message]).await?;
        if !commit.ok {
            return Err(commit.combined());
        }
        Ok(commit.combined())
    }
}

// ---------------------------------------------------------------------------
// git_branch
// ---------------------------------------------------------------------------

pub struct GitBranchTool {
    root: PathBuf,
    descriptor: ToolDescriptor,
}

impl GitBranchTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            descriptor: ToolDescriptor {
                name: "git_branch",
                description: "List branches, or manage one: action is list (default), create, switch, or delete.",
                args: vec![
                    ArgSpec::optional("name", ArgType::String, "branch name"),
                    ArgSpec::optional("action", ArgType::String, "list | create | switch | delete"),
                ],
                output_limit: 2048,
                side_effect: SideEffect::Git,
            },
        }
    }
}

#[async_trait]
impl Tool for GitBranchTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &Value) -> Result<String, String> {
        let name = args.get("name").and_then(Value::as_str).unwrap_or("");
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or(if name.is_empty() { "list" } else { "create" });

        let out = match action {
            "list" => git(&self.root, &["branch", "--list"]).await?,
            "create" if !name.is_empty() => git(&self.root, &["checkout", "-b", name]).await?,
            "switch" if !name.is_empty() => git(&self.root, &["checkout", name]).await?,
            "delete" if !name.is_empty() => git(&self.root, &["branch", "-D", name]).await?,
            _ => return Err(format!("invalid action '{}' (name required?)", action)),
        };
        if !out.ok {
            return Err(out.combined());
        }
        Ok(if out.combined().is_empty() {
            format!("{} ok", action)
        } else {
            out.combined()
        })
    }
}

// ---------------------------------------------------------------------------
// git_log
// ---------------------------------------------------------------------------

pub struct GitLogTool {
    root: PathBuf,
    descriptor: ToolDescriptor,
}

impl GitLogTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            descriptor: ToolDescriptor {
                name: "git_log",
                description: "Show recent commits, one line each.",
                args: vec![ArgSpec::optional(
                    "count",
                    ArgType::Integer,
                    "number of commits (default 10)",
                )],
                output_limit: 2048,
                side_effect: SideEffect::Read,
            },
        }
    }
}

#[async_trait]
impl Tool for GitLogTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &Value) -> Result<String, String> {
        let count = args.get("count").and_then(Value::as_u64).unwrap_or(10);
        let count_arg = format!("-{}", count.clamp(1, 100));
        let out = git(&self.root, &["log", "--oneline", &count_arg]).await?;
        if !out.ok {
            return Err(out.combined());
        }
        Ok(if out.stdout.trim().is_empty() {
            "(no commits)".to_string()
        } else {
            out.stdout
        })
    }
}
