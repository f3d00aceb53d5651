//! 错误类型与失败分类
//!
//! HarnessError 覆盖目标级错误（配置、工作区、上下文溢出、补偿耗尽等）；
//! FailureClass 是单轮失败的封闭分类，供补偿管线按类别选择修复策略。

use thiserror::Error;

/// 单轮失败的封闭分类：每个失败轮恰好落入其中一类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// JSON 语法错误（可无 LLM 重试地修复）
    MalformedJson,
    /// 工具名不在注册表中（可尝试模糊匹配）
    WrongToolName,
    /// 缺少必填参数
    MissingArgs,
    /// 完全空回复（直接升级模型）
    EmptyResponse,
    /// JSON 被散文包裹（解析器宽松模式处理）
    ProseWrapped,
    /// 工具执行返回非 ok
    ToolExecution,
    /// 策略引擎拒绝
    PolicyViolation,
    /// 网络 / HTTP 层错误
    Transport,
    Timeout,
    RateLimited,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::MalformedJson => "malformed_json",
            FailureClass::WrongToolName => "wrong_tool_name",
            FailureClass::MissingArgs => "missing_args",
            FailureClass::EmptyResponse => "empty_response",
            FailureClass::ProseWrapped => "prose_wrapped",
            FailureClass::ToolExecution => "tool_execution",
            FailureClass::PolicyViolation => "policy_violation",
            FailureClass::Transport => "transport",
            FailureClass::Timeout => "timeout",
            FailureClass::RateLimited => "rate_limited",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分类结果：类别 + 自由文本细节
#[derive(Debug, Clone)]
pub struct Failure {
    pub class: FailureClass,
    pub detail: String,
}

impl Failure {
    pub fn new(class: FailureClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.detail)
    }
}

/// 目标执行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum HarnessError {
    /// 启动期配置错误（致命）
    #[error("Config error: {0}")]
    Config(String),

    /// 工作区 / 版本库错误（尽力降级：禁用检查点后继续）
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// system + plan 层本身超出预算，无法构建上下文
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    /// 消息序列违反配对不变量（assistant 的 tool_calls 未完成即追加新消息）
    #[error("Context invariant violated: {0}")]
    ContextInvariant(String),

    /// 补偿管线耗尽全部策略后仍失败，终止当前计划步
    #[error("Compensation exhausted ({class}): {detail}")]
    CompensationExhausted {
        class: FailureClass,
        detail: String,
    },

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("LLM request timed out: {0}")]
    Timeout(String),

    /// 上游限流；cooldown_secs 为建议等待时长
    #[error("Rate limited (cooldown {cooldown_secs}s): {detail}")]
    RateLimited { cooldown_secs: u64, detail: String },

    /// 后台任务在上次进程崩溃时处于 running，启动时改写为 failed
    #[error("Task crashed: {0}")]
    TaskCrashed(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Task store error: {0}")]
    Store(String),
}

impl HarnessError {
    /// 映射到失败分类（仅传输层三类与补偿耗尽有对应；其余不属于单轮失败）
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            HarnessError::Transport(_) => Some(FailureClass::Transport),
            HarnessError::Timeout(_) => Some(FailureClass::Timeout),
            HarnessError::RateLimited { .. } => Some(FailureClass::RateLimited),
            HarnessError::CompensationExhausted { class, .. } => Some(*class),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_class_display() {
        assert_eq!(FailureClass::MalformedJson.to_string(), "malformed_json");
        assert_eq!(FailureClass::RateLimited.to_string(), "rate_limited");
    }

    #[test]
    fn test_error_failure_class_mapping() {
        let err = HarnessError::Timeout("120s elapsed".into());
        assert_eq!(err.failure_class(), Some(FailureClass::Timeout));

        let err = HarnessError::Config("missing tier".into());
        assert_eq!(err.failure_class(), None);
    }
}
