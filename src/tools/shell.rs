//! shell 工具：经 OS shell 执行单条命令
//!
//! 危险模式与预算由策略引擎把关，这里负责执行本身：超时（默认 30s，
//! 参数可覆盖）、非零退出码返回 ok=false 并合并 stdout+stderr、
//! 超时先 SIGTERM 再等 2s SIGKILL。

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::tools::registry::{ArgSpec, ArgType, SideEffect, Tool, ToolDescriptor};

/// 超时后给子进程的体面退出窗口
const GRACE_PERIOD: Duration = Duration::from_secs(2);

pub struct ShellTool {
    root: PathBuf,
    default_timeout: Duration,
    descriptor: ToolDescriptor,
}

impl ShellTool {
    pub fn new(root: impl Into<PathBuf>, default_timeout_secs: u64) -> Self {
        Self {
            root: root.into(),
            default_timeout: Duration::from_secs(default_timeout_secs),
            descriptor: ToolDescriptor {
                name: "shell",
                description: "Run a single shell command in the project root. Returns combined stdout and stderr.",
                args: vec![
                    ArgSpec::required("command", ArgType::String, "the command to run"),
                    ArgSpec::optional("timeout", ArgType::Integer, "timeout in seconds"),
                ],
                output_limit: 3072,
                side_effect: SideEffect::Shell,
            },
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &Value) -> Result<String, String> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        let timeout = args
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        tracing::info!(command, "shell execute");
        run_shell(command, &self.root, timeout).await
    }
}

/// 执行命令并收集合并输出；run_tests 也复用这条路径
pub(crate) async fn run_shell(
    command: &str,
    cwd: &std::path::Path,
    timeout: Duration,
) -> Result<String, String> {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        c
    };
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| format!("spawn failed: {}", e))?;
    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");

    // 与 wait 并发地排空管道，避免输出撑满缓冲导致死锁
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.map_err(|e| format!("wait failed: {}", e))?,
        Err(_) => {
            terminate(&mut child).await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(format!("command timed out after {}s", timeout.as_secs()));
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).to_string();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string();

    let combined = match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (false, false) => format!("{}\n[stderr]\n{}", stdout.trim_end(), stderr.trim_end()),
        (false, true) => stdout.trim_end().to_string(),
        (true, false) => stderr.trim_end().to_string(),
        (true, true) => String::new(),
    };

    if status.success() {
        Ok(if combined.is_empty() {
            "(no output)".to_string()
        } else {
            combined
        })
    } else {
        Err(format!(
            "exit code {}\n{}",
            status.code().unwrap_or(-1),
            combined
        ))
    }
}

/// 先 SIGTERM，等体面退出窗口，仍活着再 SIGKILL
pub(crate) async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await;
            if tokio::time::timeout(GRACE_PERIOD, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool() -> (tempfile::TempDir, ShellTool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = ShellTool::new(dir.path(), 5);
        (dir, tool)
    }

    #[tokio::test]
    async fn test_simple_command() {
        let (_dir, tool) = tool();
        let out = tool
            .execute(&json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error_with_output() {
        let (_dir, tool) = tool();
        let err = tool
            .execute(&json!({"command": "echo oops >&2; exit 3"}))
            .await
            .expect_err("non-zero exit");
        assert!(err.contains("exit code 3"));
        assert!(err.contains("oops"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let (_dir, tool) = tool();
        let start = std::time::Instant::now();
        let err = tool
            .execute(&json!({"command": "sleep 30", "timeout": 1}))
            .await
            .expect_err("must time out");
        assert!(err.contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_runs_in_workspace_root() {
        let (dir, tool) = tool();
        tool.execute(&json!({"command": "touch marker.txt"}))
            .await
            .unwrap();
        assert!(dir.path().join("marker.txt").exists());
    }
}
