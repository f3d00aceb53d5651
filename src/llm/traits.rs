//! LLM 客户端抽象
//!
//! 所有后端（HTTP OpenAI 兼容 / Mock）实现 LlmClient。客户端只认分层
//! （small / medium / large），具体模型名由 ModelRouter 查表解析。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{Message, ToolCall};
use crate::core::HarnessError;

/// 模型分层：能力与成本递增
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Small,
    Medium,
    Large,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Small => "small",
            ModelTier::Medium => "medium",
            ModelTier::Large => "large",
        }
    }

    /// 升一级；已是 large 返回 None
    pub fn escalate(&self) -> Option<ModelTier> {
        match self {
            ModelTier::Small => Some(ModelTier::Medium),
            ModelTier::Medium => Some(ModelTier::Large),
            ModelTier::Large => None,
        }
    }
}

impl std::str::FromStr for ModelTier {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "small" => Ok(ModelTier::Small),
            "medium" => Ok(ModelTier::Medium),
            "large" => Ok(ModelTier::Large),
            other => Err(HarnessError::Config(format!("unknown model tier: {other}"))),
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token 用量（单次回复）
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// 一次完成请求的输入
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tier: ModelTier,
    pub stream: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop: Option<Vec<String>>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>, tier: ModelTier) -> Self {
        Self {
            messages,
            tier,
            stream: false,
            max_tokens: 4096,
            temperature: 0.3,
            stop: None,
        }
    }
}

/// 统一的 LLM 回复：流式与非流式都归一到这个形状
#[derive(Debug, Clone, Default)]
pub struct LmResponse {
    /// 去除 <think> 块后的正文
    pub assistant_text: String,
    /// <think>...</think> 的内容（弱模型的推理轨迹，不进入上下文）
    pub thinking: String,
    /// 传输层原生返回的工具调用（优先级最高，直接信任）
    pub tool_calls: Vec<ToolCall>,
    /// 流式分片拼接的原始文本
    pub raw_chunks: String,
    pub finish_reason: String,
    pub usage: Usage,
}

impl LmResponse {
    pub fn is_empty(&self) -> bool {
        self.assistant_text.trim().is_empty() && self.tool_calls.is_empty()
    }
}

/// 传输层错误；其余失败类别由解析与分类器产生
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// HTTP 429 或命中限流词表；cooldown 为解析出的建议等待时长
    #[error("rate limited: {detail}")]
    RateLimited { cooldown: Duration, detail: String },

    #[error("cancelled")]
    Cancelled,
}

impl From<LlmError> for HarnessError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Transport(msg) => HarnessError::Transport(msg),
            LlmError::Timeout(msg) => HarnessError::Timeout(msg),
            LlmError::RateLimited { cooldown, detail } => HarnessError::RateLimited {
                cooldown_secs: cooldown.as_secs(),
                detail,
            },
            LlmError::Cancelled => HarnessError::Cancelled,
        }
    }
}

/// LLM 客户端 trait：单次完成（流式与否由请求决定，流式时实现方
/// 负责边收边发 LmTokenChunk 事件，最终仍归一为完整回复）
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<LmResponse, LlmError>;
}
