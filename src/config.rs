//! 应用配置：YAML 文件 + 环境变量加载
//!
//! 查找顺序：--config 指定路径 > ./open_harness.yaml > ~/.open_harness/open_harness.yaml
//! > 旧名 ./config.yaml > 内置默认值；最后用环境变量 `OH__*` 覆盖
//! （双下划线表示嵌套，如 `OH__LLM__BASE_URL=http://...`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::HarnessError;

/// 应用配置根（对应 open_harness.yaml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub policy: PolicySection,
    pub context: ContextSection,
    pub tasks: TasksSection,
    pub checkpoint: CheckpointSection,
}

/// [llm] 段：端点、分层模型表与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// OpenAI 兼容端点（/v1/chat/completions 的前缀）
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API Key；未设置时读环境变量 OPENAI_API_KEY
    pub api_key: Option<String>,
    /// 分层模型表：small / medium / large 到具体模型名
    #[serde(default)]
    pub tiers: TierTable,
    /// 默认分层
    #[serde(default = "default_tier_name")]
    pub default_tier: String,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// 是否流式输出 token
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// 补偿管线最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// LLM 被限流时愿意原地等待的上限（秒）；超过则直接失败
    #[serde(default = "default_rate_limit_wait")]
    pub max_rate_limit_wait_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_tier_name() -> String {
    "small".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.3
}

fn default_stream() -> bool {
    true
}

fn default_max_retries() -> usize {
    3
}

fn default_rate_limit_wait() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            tiers: TierTable::default(),
            default_tier: default_tier_name(),
            request_timeout_secs: default_request_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            stream: default_stream(),
            max_retries: default_max_retries(),
            max_rate_limit_wait_secs: default_rate_limit_wait(),
        }
    }
}

/// 分层模型表；模型名由部署方决定，这里只给本地常见默认
#[derive(Debug, Clone, Deserialize)]
pub struct TierTable {
    #[serde(default = "default_small_model")]
    pub small: String,
    #[serde(default = "default_medium_model")]
    pub medium: String,
    #[serde(default = "default_large_model")]
    pub large: String,
}

fn default_small_model() -> String {
    "qwen2.5-coder:7b".to_string()
}

fn default_medium_model() -> String {
    "qwen2.5-coder:14b".to_string()
}

fn default_large_model() -> String {
    "qwen2.5-coder:32b".to_string()
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            small: default_small_model(),
            medium: default_medium_model(),
            large: default_large_model(),
        }
    }
}

/// [tools] 段：工具超时与外部智能体命令
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// shell 工具超时（秒），可被调用参数覆盖
    #[serde(default = "default_shell_timeout")]
    pub shell_timeout_secs: u64,
    /// run_tests 外层上限（秒）
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    /// 外部智能体（claude_code / codex / gemini_cli）硬超时（秒）
    #[serde(default = "default_external_timeout")]
    pub external_timeout_secs: u64,
    /// 外部智能体可执行名覆盖（默认 claude / codex / gemini）
    pub claude_command: Option<String>,
    pub codex_command: Option<String>,
    pub gemini_command: Option<String>,
}

fn default_shell_timeout() -> u64 {
    30
}

fn default_test_timeout() -> u64 {
    600
}

fn default_external_timeout() -> u64 {
    600
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            shell_timeout_secs: default_shell_timeout(),
            test_timeout_secs: default_test_timeout(),
            external_timeout_secs: default_external_timeout(),
            claude_command: None,
            codex_command: None,
            gemini_command: None,
        }
    }
}

/// [policy] 段：预设名与补充白名单
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySection {
    /// safe / balanced / full
    #[serde(default = "default_preset")]
    pub preset: String,
    /// 项目根之外额外允许写入的 glob
    #[serde(default)]
    pub writable_paths: Vec<String>,
    /// 按名禁用的工具
    #[serde(default)]
    pub disabled_tools: Vec<String>,
}

fn default_preset() -> String {
    "balanced".to_string()
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            preset: default_preset(),
            writable_paths: Vec::new(),
            disabled_tools: Vec::new(),
        }
    }
}

/// [context] 段：上下文预算
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    /// 模型窗口（token）；build_messages 使用其 75%
    #[serde(default = "default_model_window")]
    pub model_max_tokens: usize,
    /// 注入 system 层的记忆条数上限
    #[serde(default = "default_memory_slice")]
    pub memory_slice: usize,
}

fn default_model_window() -> usize {
    16384
}

fn default_memory_slice() -> usize {
    8
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            model_max_tokens: default_model_window(),
            memory_slice: default_memory_slice(),
        }
    }
}

/// [tasks] 段：后台任务存储位置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TasksSection {
    /// 任务库路径，默认 ~/.open_harness/tasks.db
    pub db_path: Option<PathBuf>,
    /// 任务日志目录，默认 ~/.open_harness/logs
    pub log_dir: Option<PathBuf>,
}

impl TasksSection {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| harness_home().join("tasks.db"))
    }

    pub fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| harness_home().join("logs"))
    }
}

/// [checkpoint] 段
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    /// 每 N 次 write_file/edit_file 自动快照
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every_writes: u32,
}

fn default_checkpoint_enabled() -> bool {
    true
}

fn default_snapshot_every() -> u32 {
    10
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            enabled: default_checkpoint_enabled(),
            snapshot_every_writes: default_snapshot_every(),
        }
    }
}

/// ~/.open_harness 目录（记忆库、任务库、日志共用）
pub fn harness_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".open_harness")
}

/// 按优先级加载配置，环境变量 OH__* 可覆盖
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, HarnessError> {
    let mut builder = config::Config::builder();

    // 由低到高叠加：旧名 config.yaml、用户目录、当前目录、显式 --config
    let legacy = PathBuf::from("config.yaml");
    if legacy.exists() {
        builder = builder.add_source(config::File::from(legacy).required(false));
    }
    let home_cfg = harness_home().join("open_harness.yaml");
    if home_cfg.exists() {
        builder = builder.add_source(config::File::from(home_cfg).required(false));
    }
    let local = PathBuf::from("open_harness.yaml");
    if local.exists() {
        builder = builder.add_source(config::File::from(local).required(false));
    }
    if let Some(path) = config_path {
        if !path.exists() {
            return Err(HarnessError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("OH")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder
        .build()
        .map_err(|e| HarnessError::Config(e.to_string()))?;
    c.try_deserialize()
        .map_err(|e| HarnessError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.default_tier, "small");
        assert_eq!(cfg.llm.request_timeout_secs, 120);
        assert_eq!(cfg.tools.shell_timeout_secs, 30);
        assert_eq!(cfg.policy.preset, "balanced");
        assert_eq!(cfg.checkpoint.snapshot_every_writes, 10);
    }

    #[test]
    fn test_resolved_task_paths() {
        let tasks = TasksSection::default();
        assert!(tasks.resolved_db_path().ends_with("tasks.db"));
        assert!(tasks.resolved_log_dir().ends_with("logs"));
    }
}
