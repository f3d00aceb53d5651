//! 上下文分层：System / Plan / History / Working
//!
//! System 与 Plan 每轮重新生成、从不裁剪；History 是 L0 消息对序列，
//! 压力下逐对压成 L1 单行，再聚合成 L2 计数；Working 是最近 W 轮全保真窗口。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::context::{estimate_tokens, Message};

/// System 层：项目事实、工具说明、策略摘要、记忆切片。每轮重新生成。
#[derive(Debug, Clone, Default)]
pub struct SystemLayer {
    pub role_prompt: String,
    pub tools_description: String,
    pub project_facts: String,
    pub policy_summary: String,
    /// 来自记忆库的有界切片；预算紧张时这一节最先被裁掉
    pub memories: Vec<String>,
}

impl SystemLayer {
    /// 渲染为单条 system 消息内容；summary_section 为结构化摘要渲染结果
    pub fn render(&self, summary_section: &str, include_memories: bool) -> String {
        let mut parts = vec![self.role_prompt.clone()];
        if !self.tools_description.is_empty() {
            parts.push(format!("## Available tools\n\n{}", self.tools_description));
        }
        if !self.project_facts.is_empty() {
            parts.push(format!("## Project\n\n{}", self.project_facts));
        }
        if !self.policy_summary.is_empty() {
            parts.push(format!("## Policy\n\n{}", self.policy_summary));
        }
        if !summary_section.is_empty() {
            parts.push(summary_section.to_string());
        }
        if include_memories && !self.memories.is_empty() {
            let mut block = String::from("## Memory\n");
            for m in &self.memories {
                block.push_str(&format!("- {}\n", m));
            }
            parts.push(block);
        }
        parts.join("\n\n")
    }
}

/// Plan 层：当前计划步 + 后续两步，每轮重新生成
#[derive(Debug, Clone, Default)]
pub struct PlanLayer {
    pub steps: Vec<PlanStepView>,
    pub current: usize,
}

/// 展示用的计划步（标题 + 指令）
#[derive(Debug, Clone)]
pub struct PlanStepView {
    pub title: String,
    pub instruction: String,
}

/// 当前步之后额外展示的步数
const PLAN_LOOKAHEAD: usize = 2;

impl PlanLayer {
    pub fn render(&self) -> Option<String> {
        if self.steps.is_empty() || self.current >= self.steps.len() {
            return None;
        }
        let visible = &self.steps[self.current..(self.current + PLAN_LOOKAHEAD + 1).min(self.steps.len())];
        let mut lines = vec![format!(
            "## Current plan (step {}/{})",
            self.current + 1,
            self.steps.len()
        )];
        for (i, step) in visible.iter().enumerate() {
            let marker = if i == 0 { "->" } else { "  " };
            lines.push(format!(
                "{} {}. {}: {}",
                marker,
                self.current + i + 1,
                step.title,
                step.instruction
            ));
        }
        Some(lines.join("\n"))
    }

    pub fn clear(&mut self) {
        self.steps.clear();
        self.current = 0;
    }
}

/// 一个完成的消息对：带 tool_calls 的 assistant 消息与按序匹配的 tool 回复
#[derive(Debug, Clone)]
pub struct Turn {
    pub assistant: Message,
    pub tools: Vec<Message>,
    pub writes: u32,
    pub failures: u32,
    /// 配对完成时预先计算的 L1 单行摘要（保证 L1 幂等）
    l1: String,
}

impl Turn {
    pub fn new(assistant: Message, tools: Vec<Message>, writes: u32, failures: u32) -> Self {
        let l1 = render_l1(&assistant, &tools);
        Self {
            assistant,
            tools,
            writes,
            failures,
            l1,
        }
    }

    pub fn l1_line(&self) -> &str {
        &self.l1
    }

    pub fn token_estimate(&self) -> usize {
        self.assistant.token_estimate
            + self.tools.iter().map(|m| m.token_estimate).sum::<usize>()
    }
}

/// L1 摘要：每个调用一行 `tool=X args_hash=Y ok=true|false`
fn render_l1(assistant: &Message, tools: &[Message]) -> String {
    let mut lines = Vec::with_capacity(assistant.tool_calls.len());
    for (i, call) in assistant.tool_calls.iter().enumerate() {
        let ok = tools
            .get(i)
            .map(|m| !m.content.starts_with("Error") && !m.content.starts_with("[Tool Error"))
            .unwrap_or(false);
        lines.push(format!(
            "tool={} args_hash={:08x} ok={}",
            call.name,
            args_hash(&call.arguments),
            ok
        ));
    }
    lines.join("\n")
}

fn args_hash(args: &serde_json::Value) -> u32 {
    let mut hasher = DefaultHasher::new();
    args.to_string().hash(&mut hasher);
    hasher.finish() as u32
}

/// 历史条目：普通消息或一个完成的消息对
#[derive(Debug, Clone)]
pub enum HistoryItem {
    Plain(Message),
    Pair(Turn),
}

impl HistoryItem {
    pub fn token_estimate(&self) -> usize {
        match self {
            HistoryItem::Plain(m) => m.token_estimate,
            HistoryItem::Pair(t) => t.token_estimate(),
        }
    }
}

/// 压缩阶段的条目表示
#[derive(Debug, Clone)]
pub enum Compressed<'a> {
    L0(&'a HistoryItem),
    L1(&'a Turn),
    L2 {
        count: u32,
        writes: u32,
        failures: u32,
    },
}

impl Compressed<'_> {
    pub fn token_estimate(&self) -> usize {
        match self {
            Compressed::L0(item) => item.token_estimate(),
            Compressed::L1(turn) => estimate_tokens(turn.l1_line()),
            Compressed::L2 { .. } => 8,
        }
    }

    pub fn render(&self) -> Vec<Message> {
        match self {
            Compressed::L0(HistoryItem::Plain(m)) => vec![(*m).clone()],
            Compressed::L0(HistoryItem::Pair(t)) => {
                let mut msgs = vec![t.assistant.clone()];
                msgs.extend(t.tools.iter().cloned());
                msgs
            }
            Compressed::L1(t) => vec![Message::user(t.l1_line().to_string())],
            Compressed::L2 {
                count,
                writes,
                failures,
            } => vec![Message::user(format!(
                "{} tool calls ({} writes, {} failures)",
                count, writes, failures
            ))],
        }
    }
}

/// 连续 L1 达到该长度时聚合为 L2
pub const L2_RUN_THRESHOLD: usize = 4;

/// 对条目序列应用 L2 聚合：连续 >= L2_RUN_THRESHOLD 的 L1 合并为计数
pub fn coalesce_l2(entries: Vec<Compressed<'_>>) -> Vec<Compressed<'_>> {
    let mut result: Vec<Compressed<'_>> = Vec::with_capacity(entries.len());
    let mut run: Vec<&Turn> = Vec::new();

    fn flush<'a>(run: &mut Vec<&'a Turn>, out: &mut Vec<Compressed<'a>>) {
        if run.len() >= L2_RUN_THRESHOLD {
            let count = run.iter().map(|t| t.assistant.tool_calls.len() as u32).sum();
            let writes = run.iter().map(|t| t.writes).sum();
            let failures = run.iter().map(|t| t.failures).sum();
            out.push(Compressed::L2 {
                count,
                writes,
                failures,
            });
        } else {
            out.extend(run.iter().map(|t| Compressed::L1(*t)));
        }
        run.clear();
    }

    for entry in entries {
        match entry {
            Compressed::L1(t) => run.push(t),
            other => {
                flush(&mut run, &mut result);
                result.push(other);
            }
        }
    }
    flush(&mut run, &mut result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ToolCall;
    use serde_json::json;

    fn pair(name: &str, ok: bool) -> Turn {
        let call = ToolCall {
            id: "c1".into(),
            name: name.into(),
            arguments: json!({"path": "a.rs"}),
        };
        let assistant = Message::assistant_with_calls(String::new(), vec![call]);
        let reply = if ok {
            Message::tool("c1", name, "done")
        } else {
            Message::tool("c1", name, "Error: boom")
        };
        Turn::new(assistant, vec![reply], 0, if ok { 0 } else { 1 })
    }

    #[test]
    fn test_l1_line_format() {
        let t = pair("read_file", true);
        let line = t.l1_line();
        assert!(line.starts_with("tool=read_file args_hash="));
        assert!(line.ends_with("ok=true"));
    }

    #[test]
    fn test_l1_reflects_failure() {
        let t = pair("shell", false);
        assert!(t.l1_line().ends_with("ok=false"));
    }

    #[test]
    fn test_l1_is_precomputed_and_stable() {
        let t = pair("read_file", true);
        let first = t.l1_line().to_string();
        assert_eq!(t.l1_line(), first);
    }

    #[test]
    fn test_l2_coalesce_runs() {
        let turns: Vec<Turn> = (0..5).map(|_| pair("shell", true)).collect();
        let entries: Vec<Compressed<'_>> = turns.iter().map(Compressed::L1).collect();
        let coalesced = coalesce_l2(entries);
        assert_eq!(coalesced.len(), 1);
        match &coalesced[0] {
            Compressed::L2 { count, .. } => assert_eq!(*count, 5),
            other => panic!("expected L2, got {:?}", other),
        }
    }

    #[test]
    fn test_l2_short_runs_stay_l1() {
        let turns: Vec<Turn> = (0..3).map(|_| pair("shell", true)).collect();
        let entries: Vec<Compressed<'_>> = turns.iter().map(Compressed::L1).collect();
        let coalesced = coalesce_l2(entries);
        assert_eq!(coalesced.len(), 3);
        assert!(matches!(coalesced[0], Compressed::L1(_)));
    }

    #[test]
    fn test_plan_layer_lookahead() {
        let plan = PlanLayer {
            steps: (1..=5)
                .map(|i| PlanStepView {
                    title: format!("step {}", i),
                    instruction: format!("do thing {}", i),
                })
                .collect(),
            current: 1,
        };
        let rendered = plan.render().unwrap();
        assert!(rendered.contains("step 2/5"));
        assert!(rendered.contains("step 2"));
        assert!(rendered.contains("step 4"));
        assert!(!rendered.contains("step 5:"));
    }
}
