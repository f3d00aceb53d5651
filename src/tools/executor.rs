//! 工具执行器：校验 -> 策略 -> 执行 -> 输出整形
//!
//! 参数校验先于策略（校验失败是 missing_args，交给补偿管线；不算执行
//! 失败）。策略违规以 ok=false 的工具结果回给模型并计入事件流。每次
//! 调用输出一行 JSON 审计日志。

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::context::{ToolCall, ToolResult};
use crate::events::{EventBus, HarnessEvent};
use crate::policy::PolicyEngine;
use crate::tools::output::shape_output;
use crate::tools::registry::{SideEffect, ToolRegistry};

/// 一次执行的结果：缺参走补偿，其余都是可回给模型的工具结果
#[derive(Debug)]
pub enum ExecOutcome {
    MissingArgs { missing: Vec<String> },
    Done(ToolResult),
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    policy: Arc<Mutex<PolicyEngine>>,
    bus: EventBus,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, policy: Arc<Mutex<PolicyEngine>>, bus: EventBus) -> Self {
        Self {
            registry,
            policy,
            bus,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn side_effect(&self, name: &str) -> Option<SideEffect> {
        self.registry.descriptor(name).map(|d| d.side_effect)
    }

    /// 执行单个调用（调用方保证按声明顺序串行调用）
    pub async fn execute(&self, call: &ToolCall) -> ExecOutcome {
        let start = Instant::now();
        let Some(tool) = self.registry.get(&call.name) else {
            return ExecOutcome::Done(ToolResult {
                call_id: call.id.clone(),
                ok: false,
                payload: format!("unknown tool: {}", call.name),
                elapsed_ms: 0,
                truncation_note: None,
            });
        };
        let descriptor = tool.descriptor().clone();

        if let Err(missing) = self.registry.validate_args(&call.name, &call.arguments) {
            return ExecOutcome::MissingArgs { missing };
        }

        // 策略检查；违规转为工具错误回给模型
        let violation = {
            let policy = self.policy.lock().expect("policy lock");
            policy.check(&call.name, descriptor.side_effect, &call.arguments)
        };
        if let Some(v) = violation {
            tracing::warn!(tool = %call.name, rule = v.rule, "policy violation");
            self.bus.emit(HarnessEvent::PolicyViolation {
                tool: call.name.clone(),
                rule: v.rule.to_string(),
            });
            self.audit(&call.name, false, "policy", start.elapsed().as_millis() as u64, &call.arguments);
            return ExecOutcome::Done(ToolResult {
                call_id: call.id.clone(),
                ok: false,
                payload: v.message,
                elapsed_ms: start.elapsed().as_millis() as u64,
                truncation_note: None,
            });
        }

        self.bus.emit(HarnessEvent::ToolStarted {
            tool: call.name.clone(),
            args_preview: args_preview(&call.arguments),
        });

        let result = tool.execute(&call.arguments).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        // 预算按成功与否都计数（尝试即消耗）
        {
            let mut policy = self.policy.lock().expect("policy lock");
            policy.record(&call.name, descriptor.side_effect);
        }

        let (ok, raw_payload) = match result {
            Ok(out) => (true, out),
            Err(err) => (false, err),
        };
        let shaped = shape_output(&raw_payload, descriptor.output_limit);

        self.bus.emit(HarnessEvent::ToolCompleted {
            tool: call.name.clone(),
            ok,
            elapsed_ms,
        });
        self.audit(
            &call.name,
            ok,
            if ok { "ok" } else { "error" },
            elapsed_ms,
            &call.arguments,
        );

        ExecOutcome::Done(ToolResult {
            call_id: call.id.clone(),
            ok,
            payload: shaped.text,
            elapsed_ms,
            truncation_note: shaped.truncation_note,
        })
    }

    fn audit(&self, tool: &str, ok: bool, outcome: &str, duration_ms: u64, args: &serde_json::Value) {
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview(args),
        });
        tracing::info!(audit = %audit, "tool");
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyPreset, PolicySpec};
    use crate::tools::test_support::test_registry_at;
    use serde_json::json;

    fn executor(dir: &std::path::Path) -> ToolExecutor {
        let registry = Arc::new(test_registry_at(dir));
        let policy = Arc::new(Mutex::new(PolicyEngine::new(
            PolicySpec::from_preset(PolicyPreset::Safe),
            dir,
        )));
        ToolExecutor::new(registry, policy, EventBus::new())
    }

    #[tokio::test]
    async fn test_missing_args_detected_before_policy() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let call = ToolCall::new("edit_file", json!({"path": "/etc/passwd"}));
        // path 指向拒绝路径，但缺参先于策略被发现
        match exec.execute(&call).await {
            ExecOutcome::MissingArgs { missing } => {
                assert!(missing.contains(&"find".to_string()));
            }
            other => panic!("expected MissingArgs, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_policy_violation_is_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let call = ToolCall::new("read_file", json!({"path": "/etc/passwd"}));
        match exec.execute(&call).await {
            ExecOutcome::Done(result) => {
                assert!(!result.ok);
                assert!(result.payload.contains("denied"));
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_successful_tool_counts_budget() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("f.txt"), "content")
            .await
            .unwrap();
        let exec = executor(dir.path());
        let call = ToolCall::new("read_file", json!({"path": "f.txt"}));
        match exec.execute(&call).await {
            ExecOutcome::Done(result) => {
                assert!(result.ok);
                assert!(result.payload.contains("content"));
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shell_budget_blocks_31st_call() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        for _ in 0..30 {
            let call = ToolCall::new("shell", json!({"command": "true"}));
            match exec.execute(&call).await {
                ExecOutcome::Done(r) => assert!(r.ok, "{}", r.payload),
                other => panic!("unexpected: {:?}", other),
            }
        }
        let call = ToolCall::new("shell", json!({"command": "true"}));
        match exec.execute(&call).await {
            ExecOutcome::Done(r) => {
                assert!(!r.ok);
                assert!(r.payload.contains("shell budget exceeded"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        // 计数停在上限
        assert_eq!(
            exec.policy.lock().unwrap().budget().shell_commands,
            30
        );
    }

    #[tokio::test]
    async fn test_output_truncated_to_tool_limit() {
        let dir = tempfile::tempdir().unwrap();
        let big = "x".repeat(20_000);
        tokio::fs::write(dir.path().join("big.txt"), &big)
            .await
            .unwrap();
        let exec = executor(dir.path());
        let call = ToolCall::new("read_file", json!({"path": "big.txt"}));
        match exec.execute(&call).await {
            ExecOutcome::Done(r) => {
                assert!(r.ok);
                assert!(r.truncation_note.is_some());
                assert!(r.payload.len() < 9000);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
