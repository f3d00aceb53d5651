//! 分层上下文存储与两级压缩
//!
//! 对外契约：`build_messages(budget_tokens)` 产出满足配对不变量且估算
//! token 不超预算的扁平消息序列。System / Plan 层每轮重建；History 在
//! 压力下先逐对 L1 压缩，再把连续 L1 聚合为 L2 计数，仍超则从最旧开始
//! 淘汰；Working 窗口保留最近 W 轮全保真（W = max(2, budget/8192)）。

pub mod estimator;
pub mod layers;
pub mod summary;

pub use estimator::estimate_tokens;
pub use layers::{HistoryItem, PlanLayer, PlanStepView, SystemLayer, Turn};
pub use summary::{StructuredSummary, TestResult};

use serde::{Deserialize, Serialize};

use crate::core::HarnessError;
use layers::{coalesce_l2, Compressed};

/// 消息角色（OpenAI 兼容四角色）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 从助手回复中解析出的工具调用；id 将调用与后续 tool 回复绑定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            name: name.into(),
            arguments,
        }
    }

    /// 参数对象视图；非对象参数按空对象处理
    pub fn args_object(&self) -> serde_json::Map<String, serde_json::Value> {
        self.arguments
            .as_object()
            .cloned()
            .unwrap_or_default()
    }
}

/// 工具执行结果；payload 已按工具上限做过头尾截断
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub ok: bool,
    pub payload: String,
    pub elapsed_ms: u64,
    pub truncation_note: Option<String>,
}

/// 不可变消息记录；追加后不再修改
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    pub timestamp: i64,
    pub token_estimate: usize,
}

impl Message {
    fn build(role: Role, content: String) -> Self {
        let token_estimate = estimate_tokens(&content);
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            token_estimate,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::build(Role::System, content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::build(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::build(Role::Assistant, content.into())
    }

    pub fn assistant_with_calls(content: String, calls: Vec<ToolCall>) -> Self {
        let mut m = Self::build(Role::Assistant, content);
        // 调用本身也占上下文
        m.token_estimate += calls
            .iter()
            .map(|c| estimate_tokens(&c.arguments.to_string()) + 4)
            .sum::<usize>();
        m.tool_calls = calls;
        m
    }

    pub fn tool(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        let mut m = Self::build(Role::Tool, content.into());
        m.tool_call_id = Some(call_id.into());
        m.name = Some(name.into());
        m
    }
}

/// 配对中的 assistant 消息：等待全部 tool 回复到齐
#[derive(Debug)]
struct PendingPair {
    assistant: Message,
    tools: Vec<Message>,
    writes: u32,
    failures: u32,
}

/// 分层上下文存储
pub struct ContextStore {
    pub system: SystemLayer,
    pub plan: PlanLayer,
    pub summary: StructuredSummary,
    history: Vec<HistoryItem>,
    pending: Option<PendingPair>,
}

impl ContextStore {
    pub fn new(system: SystemLayer) -> Self {
        Self {
            system,
            plan: PlanLayer::default(),
            summary: StructuredSummary::new(),
            history: Vec::new(),
            pending: None,
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// 追加普通 user 消息
    pub fn append_user(&mut self, content: impl Into<String>) -> Result<(), HarnessError> {
        self.ensure_no_pending("user message")?;
        self.history.push(HistoryItem::Plain(Message::user(content)));
        Ok(())
    }

    /// 追加无工具调用的 assistant 消息
    pub fn append_assistant(&mut self, content: impl Into<String>) -> Result<(), HarnessError> {
        self.ensure_no_pending("assistant message")?;
        self.history
            .push(HistoryItem::Plain(Message::assistant(content)));
        Ok(())
    }

    /// 追加带工具调用的 assistant 消息，开启一个待完成配对
    pub fn append_assistant_with_calls(
        &mut self,
        content: String,
        calls: Vec<ToolCall>,
    ) -> Result<(), HarnessError> {
        self.ensure_no_pending("assistant with tool calls")?;
        if calls.is_empty() {
            return self.append_assistant(content);
        }
        self.pending = Some(PendingPair {
            assistant: Message::assistant_with_calls(content, calls),
            tools: Vec::new(),
            writes: 0,
            failures: 0,
        });
        Ok(())
    }

    /// 追加一条工具回复。必须与待完成配对中下一个调用的 id 匹配；
    /// 全部回复到齐后配对落入历史。is_write 表示该工具属于写类副作用。
    pub fn append_tool_result(
        &mut self,
        result: &ToolResult,
        tool_name: &str,
        is_write: bool,
    ) -> Result<(), HarnessError> {
        let pending = self.pending.as_mut().ok_or_else(|| {
            HarnessError::ContextInvariant("tool result without pending assistant".into())
        })?;
        let expected = pending
            .assistant
            .tool_calls
            .get(pending.tools.len())
            .ok_or_else(|| {
                HarnessError::ContextInvariant("more tool results than declared calls".into())
            })?;
        if expected.id != result.call_id {
            return Err(HarnessError::ContextInvariant(format!(
                "tool result out of order: expected call {}, got {}",
                expected.id, result.call_id
            )));
        }

        let mut content = if result.ok {
            result.payload.clone()
        } else {
            format!("[Tool Error] {}", result.payload)
        };
        if let Some(note) = &result.truncation_note {
            content.push('\n');
            content.push_str(note);
        }
        pending
            .tools
            .push(Message::tool(result.call_id.clone(), tool_name, content));
        if is_write && result.ok {
            pending.writes += 1;
        }
        if !result.ok {
            pending.failures += 1;
        }

        if pending.tools.len() == pending.assistant.tool_calls.len() {
            let done = self.pending.take().expect("pending checked above");
            self.history.push(HistoryItem::Pair(Turn::new(
                done.assistant,
                done.tools,
                done.writes,
                done.failures,
            )));
        }
        Ok(())
    }

    fn ensure_no_pending(&self, what: &str) -> Result<(), HarnessError> {
        if self.pending.is_some() {
            return Err(HarnessError::ContextInvariant(format!(
                "cannot append {} while tool calls are unanswered",
                what
            )));
        }
        Ok(())
    }

    /// 组装最终消息序列，估算 token 不超过 budget_tokens。
    ///
    /// 顺序：system、plan、压缩后的历史、working 窗口。system + plan 超出
    /// 预算时先裁掉记忆小节；仅这两层仍超出则返回 ContextOverflow。
    pub fn build_messages(&self, budget_tokens: usize) -> Result<Vec<Message>, HarnessError> {
        let summary_section = self.summary.render();

        let mut system_msg = Message::system(self.system.render(&summary_section, true));
        let plan_msg = self.plan.render().map(Message::system);
        let plan_tokens = plan_msg.as_ref().map(|m| m.token_estimate).unwrap_or(0);

        if system_msg.token_estimate + plan_tokens > budget_tokens {
            system_msg = Message::system(self.system.render(&summary_section, false));
            if system_msg.token_estimate + plan_tokens > budget_tokens {
                return Err(HarnessError::ContextOverflow(format!(
                    "system+plan layers need {} tokens, budget is {}",
                    system_msg.token_estimate + plan_tokens,
                    budget_tokens
                )));
            }
        }

        let fixed_tokens = system_msg.token_estimate + plan_tokens;
        let working_window = (budget_tokens / 8192).max(2);
        let split = self.history.len().saturating_sub(working_window);
        let (older, working) = self.history.split_at(split);

        // 历史压缩：L0 -> L1（仅消息对，最旧优先）-> L2 聚合 -> 淘汰最旧
        let mut entries: Vec<Compressed<'_>> = older.iter().map(Compressed::L0).collect();
        let mut protected: Vec<Compressed<'_>> = working.iter().map(Compressed::L0).collect();

        let over = |entries: &[Compressed<'_>], protected: &[Compressed<'_>]| {
            let total: usize = fixed_tokens
                + entries.iter().map(|e| e.token_estimate()).sum::<usize>()
                + protected.iter().map(|e| e.token_estimate()).sum::<usize>();
            total > budget_tokens
        };

        fn pair_at<'a>(slot: &Compressed<'a>) -> Option<&'a Turn> {
            match slot {
                Compressed::L0(HistoryItem::Pair(turn)) => Some(turn),
                _ => None,
            }
        }

        if over(&entries, &protected) {
            for i in 0..entries.len() {
                if let Some(turn) = pair_at(&entries[i]) {
                    entries[i] = Compressed::L1(turn);
                    if !over(&entries, &protected) {
                        break;
                    }
                }
            }
        }
        if over(&entries, &protected) {
            entries = coalesce_l2(entries);
        }
        while over(&entries, &protected) && !entries.is_empty() {
            entries.remove(0);
        }
        // 极端预算下 working 窗口也参与压缩与淘汰，保证不超预算
        if over(&entries, &protected) {
            for i in 0..protected.len() {
                if let Some(turn) = pair_at(&protected[i]) {
                    protected[i] = Compressed::L1(turn);
                    if !over(&entries, &protected) {
                        break;
                    }
                }
            }
        }
        while over(&entries, &protected) && !protected.is_empty() {
            protected.remove(0);
        }

        let mut out = Vec::new();
        out.push(system_msg);
        if let Some(p) = plan_msg {
            out.push(p);
        }
        for entry in entries.iter().chain(protected.iter()) {
            out.extend(entry.render());
        }
        Ok(out)
    }
}

/// 从记忆库读取有界切片（外部协作者拥有 schema；读不到就返回空）
pub fn load_memory_slice(db_path: &std::path::Path, limit: usize) -> Vec<String> {
    if !db_path.exists() {
        return Vec::new();
    }
    let conn = match rusqlite::Connection::open_with_flags(
        db_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    ) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!("memory store open failed: {}", e);
            return Vec::new();
        }
    };
    let mut stmt = match conn.prepare("SELECT content FROM memories ORDER BY rowid DESC LIMIT ?1") {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!("memory store query failed: {}", e);
            return Vec::new();
        }
    };
    let rows = stmt.query_map([limit as i64], |row| row.get::<_, String>(0));
    match rows {
        Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
        Err(_) => Vec::new(),
    }
}
