//! 测试用 Mock 客户端：按脚本顺序弹出预设回复

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{ChatRequest, LlmClient, LlmError, LmResponse, ModelTier};

type Scripted = Result<LmResponse, LlmError>;

#[derive(Default)]
pub struct MockLlm {
    script: Mutex<VecDeque<Scripted>>,
    /// 每次请求使用的 tier 记录（断言升级行为用）
    pub tiers_seen: Mutex<Vec<ModelTier>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push_response(LmResponse {
            assistant_text: text.into(),
            finish_reason: "stop".into(),
            ..Default::default()
        });
    }

    pub fn push_response(&self, resp: LmResponse) {
        self.script.lock().expect("mock lock").push_back(Ok(resp));
    }

    pub fn push_error(&self, err: LlmError) {
        self.script.lock().expect("mock lock").push_back(Err(err));
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().expect("mock lock").len()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn chat(&self, request: &ChatRequest) -> Result<LmResponse, LlmError> {
        self.tiers_seen
            .lock()
            .expect("mock lock")
            .push(request.tier);
        self.script
            .lock()
            .expect("mock lock")
            .pop_front()
            .unwrap_or_else(|| {
                Ok(LmResponse {
                    assistant_text: "Done.".into(),
                    finish_reason: "stop".into(),
                    ..Default::default()
                })
            })
    }
}
