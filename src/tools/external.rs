//! 外部智能体工具：claude_code / codex / gemini_cli
//!
//! 每个外部智能体是独立安装的命令行 coder。启动时探测 PATH，只注册
//! 真实存在的；调用是一次性子进程（prompt 作为参数传入），捕获 stdout，
//! 10 分钟硬超时。输出命中限流词表时记录冷却并按固定顺序换下一个智能体
//! 重试同一调用；三个都在冷却中则返回单个限流失败。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::ToolsSection;
use crate::events::{EventBus, HarnessEvent};
use crate::tools::rate_limit::{is_rate_limit_message, AgentRateLimiter, FALLBACK_ORDER};
use crate::tools::registry::{ArgSpec, ArgType, SideEffect, Tool, ToolDescriptor};
use crate::tools::shell::terminate;

/// 外部智能体种类与各自的命令行形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    ClaudeCode,
    Codex,
    GeminiCli,
}

impl ExternalKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExternalKind::ClaudeCode => "claude_code",
            ExternalKind::Codex => "codex",
            ExternalKind::GeminiCli => "gemini_cli",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "claude_code" => Some(ExternalKind::ClaudeCode),
            "codex" => Some(ExternalKind::Codex),
            "gemini_cli" => Some(ExternalKind::GeminiCli),
            _ => None,
        }
    }

    fn default_command(&self) -> &'static str {
        match self {
            ExternalKind::ClaudeCode => "claude",
            ExternalKind::Codex => "codex",
            ExternalKind::GeminiCli => "gemini",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            ExternalKind::ClaudeCode => {
                "Delegate a coding task to the Claude Code CLI agent. Good for complex reasoning and refactoring."
            }
            ExternalKind::Codex => {
                "Delegate a coding task to the Codex CLI agent. Good for code generation and debugging."
            }
            ExternalKind::GeminiCli => {
                "Delegate a task to the Gemini CLI agent."
            }
        }
    }

    /// 组装一次性调用的 argv（prompt 以参数传入）
    fn argv(&self, command: &str, prompt: &str) -> Vec<String> {
        match self {
            ExternalKind::ClaudeCode => vec![
                command.to_string(),
                "-p".into(),
                prompt.to_string(),
                "--allowedTools".into(),
                "Bash".into(),
                "Read".into(),
                "Write".into(),
                "Edit".into(),
                "Glob".into(),
                "Grep".into(),
            ],
            ExternalKind::Codex => vec![
                command.to_string(),
                "exec".into(),
                "--full-auto".into(),
                prompt.to_string(),
            ],
            ExternalKind::GeminiCli => vec![
                command.to_string(),
                "-p".into(),
                prompt.to_string(),
                "-y".into(),
            ],
        }
    }
}

struct AgentSpec {
    kind: ExternalKind,
    command: String,
}

/// 外部智能体调度器：持有冷却表，按环形顺序回退
pub struct ExternalDispatcher {
    agents: HashMap<String, AgentSpec>,
    limiter: tokio::sync::Mutex<AgentRateLimiter>,
    timeout: Duration,
    workspace: PathBuf,
    bus: EventBus,
}

impl ExternalDispatcher {
    /// 探测 PATH，只保留真实可执行的智能体
    pub fn probe(cfg: &ToolsSection, workspace: impl Into<PathBuf>, bus: EventBus) -> Self {
        let mut agents = HashMap::new();
        let candidates = [
            (ExternalKind::ClaudeCode, cfg.claude_command.as_deref()),
            (ExternalKind::Codex, cfg.codex_command.as_deref()),
            (ExternalKind::GeminiCli, cfg.gemini_command.as_deref()),
        ];
        for (kind, override_cmd) in candidates {
            let command = override_cmd.unwrap_or(kind.default_command()).to_string();
            if in_path(&command) {
                tracing::info!(agent = kind.name(), command, "external agent available");
                agents.insert(kind.name().to_string(), AgentSpec { kind, command });
            } else {
                tracing::debug!(agent = kind.name(), command, "external agent not found");
            }
        }
        Self {
            agents,
            limiter: tokio::sync::Mutex::new(AgentRateLimiter::new()),
            timeout: Duration::from_secs(cfg.external_timeout_secs),
            workspace: workspace.into(),
            bus,
        }
    }

    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// 从 preferred 出发执行一次调用，必要时环形回退
    pub async fn dispatch(&self, preferred: &str, prompt: &str) -> Result<String, String> {
        let registered = self.registered();
        if registered.is_empty() {
            return Err("no external agents installed".to_string());
        }

        let mut current = preferred.to_string();
        loop {
            let agent = {
                let mut limiter = self.limiter.lock().await;
                match limiter.next_available(&current, &registered) {
                    Some(a) => a,
                    None => {
                        let hint = limiter
                            .earliest_recovery()
                            .map(|d| format!(" (earliest retry in {}s)", d.as_secs()))
                            .unwrap_or_default();
                        return Err(format!("all external agents are rate-limited{}", hint));
                    }
                }
            };
            if agent != current {
                tracing::info!(from = %current, to = %agent, "falling back to another external agent");
            }
            let spec = self.agents.get(&agent).expect("registered agent");

            let (success, output) = run_agent(
                spec.kind.argv(&spec.command, prompt),
                &self.workspace,
                self.timeout,
            )
            .await?;

            if is_rate_limit_message(&output) {
                let cooldown = {
                    let mut limiter = self.limiter.lock().await;
                    limiter.record(&agent, &output)
                };
                self.bus.emit(HarnessEvent::AgentCooldown {
                    agent: agent.clone(),
                    cooldown_secs: cooldown.as_secs(),
                });
                // 从刚失败的下一位继续环形查找
                current = next_in_cycle(&agent);
                continue;
            }

            return if success {
                Ok(output)
            } else {
                Err(output)
            };
        }
    }
}

fn next_in_cycle(agent: &str) -> String {
    let idx = FALLBACK_ORDER
        .iter()
        .position(|n| *n == agent)
        .unwrap_or(0);
    FALLBACK_ORDER[(idx + 1) % FALLBACK_ORDER.len()].to_string()
}

/// 一次性子进程执行；返回 (是否成功, 合并输出)
async fn run_agent(
    argv: Vec<String>,
    cwd: &Path,
    timeout: Duration,
) -> Result<(bool, String), String> {
    let (program, rest) = argv.split_first().expect("argv non-empty");
    let mut cmd = Command::new(program);
    cmd.args(rest)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to start {}: {}", program, e))?;
    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");

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
            return Err(format!(
                "external agent timed out after {}s",
                timeout.as_secs()
            ));
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).to_string();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string();

    let mut output = stdout.trim_end().to_string();
    if !stderr.trim().is_empty() {
        if output.is_empty() {
            output = stderr.trim_end().to_string();
        } else {
            output.push_str(&format!("\n[stderr]\n{}", stderr.trim_end()));
        }
    }
    if !status.success() && !output.contains("exit code") {
        output = format!("exit code {}\n{}", status.code().unwrap_or(-1), output);
    }
    Ok((status.success(), output))
}

/// PATH 扫描；可执行存在即视为可用
fn in_path(command: &str) -> bool {
    if command.contains('/') {
        return Path::new(command).exists();
    }
    let Ok(path) = std::env::var("PATH") else {
        return false;
    };
    path.split(':').any(|dir| {
        let candidate = Path::new(dir).join(command);
        candidate.is_file()
    })
}

/// 注册表里的单个外部智能体工具；实际执行都走共享的调度器
pub struct ExternalAgentTool {
    dispatcher: Arc<ExternalDispatcher>,
    descriptor: ToolDescriptor,
}

impl ExternalAgentTool {
    pub fn new(kind: ExternalKind, dispatcher: Arc<ExternalDispatcher>) -> Self {
        Self {
            dispatcher,
            descriptor: ToolDescriptor {
                name: kind.name(),
                description: kind.description(),
                args: vec![ArgSpec::required(
                    "prompt",
                    ArgType::String,
                    "the task to delegate",
                )],
                output_limit: 2048,
                side_effect: SideEffect::NetworkExternal,
            },
        }
    }
}

#[async_trait]
impl Tool for ExternalAgentTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &Value) -> Result<String, String> {
        let prompt = args.get("prompt").and_then(Value::as_str).unwrap_or("");
        self.dispatcher.dispatch(self.descriptor.name, prompt).await
    }
}
