//! 推理/执行循环
//!
//! 单次迭代：组装上下文 -> 经补偿管线调 LLM -> 无调用即回答收尾；
//! 有调用则按声明顺序严格串行执行（绝不并行，保持检查点与预算模型
//! 线性），每个结果写回上下文与结构化摘要。升级过的分层在目标内保持。
//! 取消令牌在每次 LLM 尝试前与每个工具调用前检查。

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointManager;
use crate::context::{ContextStore, ToolResult};
use crate::core::{FailureClass, HarnessError};
use crate::events::EventBus;
use crate::llm::{ChatRequest, CompensationPipeline, LlmClient, ModelTier, ResponseParser};
use crate::tools::{ExecOutcome, SideEffect, ToolExecutor, ToolRegistry};

/// 一次受限调用的结果
#[derive(Debug)]
pub struct InvocationOutcome {
    pub kind: OutcomeKind,
    pub steps_used: u32,
}

#[derive(Debug)]
pub enum OutcomeKind {
    /// 模型给出了最终文本回答
    Answer(String),
    /// 用尽每步预算仍未收敛
    Exhausted,
}

/// 循环累计的统计（目标结束后并入总结）
#[derive(Debug, Default, Clone)]
pub struct LoopStats {
    pub tool_calls: u32,
    pub tool_failures: u32,
    pub compensations: HashMap<FailureClass, u32>,
}

pub struct AgentLoop {
    client: Arc<dyn LlmClient>,
    parser: ResponseParser,
    registry: Arc<ToolRegistry>,
    executor: ToolExecutor,
    pipeline: CompensationPipeline,
    bus: EventBus,
    cancel: CancellationToken,
    tier: ModelTier,
    stream: bool,
    max_tokens: u32,
    temperature: f32,
    /// build_messages 的预算：模型窗口的 75%
    context_budget: usize,
    stats: LoopStats,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        executor: ToolExecutor,
        pipeline: CompensationPipeline,
        bus: EventBus,
        cancel: CancellationToken,
        tier: ModelTier,
        stream: bool,
        max_tokens: u32,
        temperature: f32,
        model_max_tokens: usize,
    ) -> Self {
        let parser = ResponseParser::new(&registry.names());
        Self {
            client,
            parser,
            registry,
            executor,
            pipeline,
            bus,
            cancel,
            tier,
            stream,
            max_tokens,
            temperature,
            context_budget: model_max_tokens * 3 / 4,
            stats: LoopStats::default(),
        }
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn current_tier(&self) -> ModelTier {
        self.tier
    }

    /// 在 step_budget 步内执行一条指令
    pub async fn run_invocation(
        &mut self,
        context: &mut ContextStore,
        checkpoint: &mut CheckpointManager,
        instruction: &str,
        step_budget: u32,
    ) -> Result<InvocationOutcome, HarnessError> {
        context.append_user(instruction)?;

        for step in 0..step_budget {
            if self.cancel.is_cancelled() {
                return Err(HarnessError::Cancelled);
            }

            let messages = context.build_messages(self.context_budget)?;
            let mut request = ChatRequest::new(messages, self.tier);
            request.stream = self.stream;
            request.max_tokens = self.max_tokens;
            request.temperature = self.temperature;

            let outcome = self
                .pipeline
                .run_turn(
                    self.client.as_ref(),
                    &self.parser,
                    &self.registry,
                    request,
                    &self.bus,
                    &self.cancel,
                )
                .await?;

            // 升级过的分层在目标内保持
            self.tier = outcome.final_request.tier;
            for record in &outcome.records {
                *self.stats.compensations.entry(record.class).or_insert(0) += 1;
            }

            if outcome.calls.is_empty() {
                let answer = outcome.narrative;
                context.append_assistant(answer.as_str())?;
                return Ok(InvocationOutcome {
                    kind: OutcomeKind::Answer(answer),
                    steps_used: step + 1,
                });
            }

            context.append_assistant_with_calls(outcome.narrative.clone(), outcome.calls.clone())?;

            for call in &outcome.calls {
                if self.cancel.is_cancelled() {
                    // 合成取消结果补全配对，保持不变量后再退出
                    let result = ToolResult {
                        call_id: call.id.clone(),
                        ok: false,
                        payload: "cancelled before execution".to_string(),
                        elapsed_ms: 0,
                        truncation_note: None,
                    };
                    context.append_tool_result(&result, &call.name, false)?;
                    continue;
                }

                let is_write = self.executor.side_effect(&call.name) == Some(SideEffect::Write);
                let result = match self.executor.execute(call).await {
                    ExecOutcome::Done(result) => result,
                    ExecOutcome::MissingArgs { missing } => ToolResult {
                        call_id: call.id.clone(),
                        ok: false,
                        payload: format!("missing required args: {}", missing.join(", ")),
                        elapsed_ms: 0,
                        truncation_note: None,
                    },
                };

                self.stats.tool_calls += 1;
                if !result.ok {
                    self.stats.tool_failures += 1;
                }
                context
                    .summary
                    .on_tool_completed(&call.name, &call.arguments, result.ok, &result.payload);
                context.append_tool_result(&result, &call.name, is_write)?;

                if is_write && result.ok {
                    checkpoint.on_write().await?;
                }
            }

            if self.cancel.is_cancelled() {
                return Err(HarnessError::Cancelled);
            }
        }

        Ok(InvocationOutcome {
            kind: OutcomeKind::Exhausted,
            steps_used: step_budget,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Role, SystemLayer};
    use crate::events::EventBus;
    use crate::llm::MockLlm;
    use crate::policy::{PolicyEngine, PolicyPreset, PolicySpec};
    use crate::tools::test_support::test_registry_at;
    use std::sync::Mutex;

    struct Rig {
        dir: tempfile::TempDir,
        mock: Arc<MockLlm>,
        agent: AgentLoop,
        context: ContextStore,
        checkpoint: CheckpointManager,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().expect("tempdir");
        let mock = Arc::new(MockLlm::new());
        let registry = Arc::new(test_registry_at(dir.path()));
        let policy = Arc::new(Mutex::new(PolicyEngine::new(
            PolicySpec::from_preset(PolicyPreset::Safe),
            dir.path(),
        )));
        let bus = EventBus::new();
        let executor = ToolExecutor::new(Arc::clone(&registry), policy, bus.clone());
        let pipeline = CompensationPipeline::new(3, std::time::Duration::from_secs(1));
        let agent = AgentLoop::new(
            mock.clone(),
            registry,
            executor,
            pipeline,
            bus.clone(),
            CancellationToken::new(),
            ModelTier::Small,
            false,
            2048,
            0.3,
            16384,
        );
        let mut system = SystemLayer::default();
        system.role_prompt = "You are an autonomous coding agent.".into();
        let context = ContextStore::new(system);
        let checkpoint = CheckpointManager::new(dir.path(), false, 10, bus);
        Rig {
            dir,
            mock,
            agent,
            context,
            checkpoint,
        }
    }

    #[tokio::test]
    async fn test_plain_answer_ends_invocation() {
        let mut r = rig();
        r.mock.push_text("The project looks healthy.");
        let outcome = r
            .agent
            .run_invocation(&mut r.context, &mut r.checkpoint, "inspect the project", 8)
            .await
            .unwrap();
        match outcome.kind {
            OutcomeKind::Answer(text) => assert!(text.contains("healthy")),
            other => panic!("expected Answer, got {:?}", other),
        }
        assert_eq!(outcome.steps_used, 1);
    }

    #[tokio::test]
    async fn test_tool_call_then_answer() {
        let mut r = rig();
        std::fs::write(r.dir.path().join("notes.txt"), "remember the milk").unwrap();
        r.mock
            .push_text(r#"{"tool": "read_file", "args": {"path": "notes.txt"}}"#);
        r.mock.push_text("The note says to remember the milk.");

        let outcome = r
            .agent
            .run_invocation(&mut r.context, &mut r.checkpoint, "what do my notes say?", 8)
            .await
            .unwrap();

        assert!(matches!(outcome.kind, OutcomeKind::Answer(_)));
        assert_eq!(r.agent.stats().tool_calls, 1);
        assert_eq!(outcome.steps_used, 2);
    }

    #[tokio::test]
    async fn test_pairing_invariant_holds_end_to_end() {
        let mut r = rig();
        std::fs::write(r.dir.path().join("a.txt"), "x").unwrap();
        r.mock
            .push_text(r#"{"tool": "read_file", "args": {"path": "a.txt"}}"#);
        r.mock
            .push_text(r#"{"tool": "write_file", "args": {"path": "b.txt", "content": "y"}}"#);
        r.mock.push_text("done");

        r.agent
            .run_invocation(&mut r.context, &mut r.checkpoint, "copy stuff", 8)
            .await
            .unwrap();

        let msgs = r.context.build_messages(100_000).unwrap();
        let mut i = 0;
        while i < msgs.len() {
            if msgs[i].role == Role::Assistant && !msgs[i].tool_calls.is_empty() {
                let n = msgs[i].tool_calls.len();
                for k in 0..n {
                    assert_eq!(msgs[i + 1 + k].role, Role::Tool, "pair broken at {}", i);
                }
                i += n + 1;
            } else {
                i += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_step_budget_exhaustion() {
        let mut r = rig();
        std::fs::write(r.dir.path().join("a.txt"), "x").unwrap();
        for _ in 0..3 {
            r.mock
                .push_text(r#"{"tool": "read_file", "args": {"path": "a.txt"}}"#);
        }
        let outcome = r
            .agent
            .run_invocation(&mut r.context, &mut r.checkpoint, "loop forever", 3)
            .await
            .unwrap();
        assert!(matches!(outcome.kind, OutcomeKind::Exhausted));
        assert_eq!(outcome.steps_used, 3);
    }

    #[tokio::test]
    async fn test_policy_violation_fed_back_as_tool_error() {
        let mut r = rig();
        r.mock
            .push_text(r#"{"tool": "read_file", "args": {"path": "/etc/passwd"}}"#);
        r.mock.push_text("Understood, I cannot read that file.");

        let outcome = r
            .agent
            .run_invocation(&mut r.context, &mut r.checkpoint, "read /etc/passwd", 8)
            .await
            .unwrap();

        assert!(matches!(outcome.kind, OutcomeKind::Answer(_)));
        // 违规不是终局失败，而是以工具错误写回上下文
        let msgs = r.context.build_messages(100_000).unwrap();
        let violation_fed_back = msgs
            .iter()
            .any(|m| m.role == Role::Tool && m.content.contains("denied"));
        assert!(violation_fed_back);
        assert_eq!(r.agent.stats().tool_failures, 1);
    }

    #[tokio::test]
    async fn test_summary_tracks_writes() {
        let mut r = rig();
        r.mock
            .push_text(r#"{"tool": "write_file", "args": {"path": "created.txt", "content": "hi"}}"#);
        r.mock.push_text("created the file");

        r.agent
            .run_invocation(&mut r.context, &mut r.checkpoint, "create a file", 8)
            .await
            .unwrap();

        assert!(r.context.summary.files_modified.contains("created.txt"));
    }

    #[tokio::test]
    async fn test_cancellation_before_llm() {
        let mut r = rig();
        r.agent.cancel.cancel();
        let err = r
            .agent
            .run_invocation(&mut r.context, &mut r.checkpoint, "anything", 8)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, HarnessError::Cancelled));
    }
}
