//! Planner 与 Replanner：目标到计划
//!
//! 先用规则估计复杂度（低/中/高决定步数上限、每步预算与重规划次数），
//! 再让 LLM 产出 JSON 计划。弱模型的计划经常缺字段：缺成功判据的补
//! 通用判据，解析沿用回复解析器的 JSON 修复。步失败后 Replanner 带着
//! 已完成步与失败原因重新规划剩余工作。

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::llm::{repair_json, ChatRequest, LlmClient, ModelTier};

/// 规划调用的输出上限
const PLANNING_MAX_TOKENS: u32 = 2048;

/// 复杂度：步数 3/5/8，每步预算 8/12/15，重规划次数 0/1/2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn max_plan_steps(&self) -> usize {
        match self {
            Complexity::Low => 3,
            Complexity::Medium => 5,
            Complexity::High => 8,
        }
    }

    pub fn step_budget(&self) -> u32 {
        match self {
            Complexity::Low => 8,
            Complexity::Medium => 12,
            Complexity::High => 15,
        }
    }

    pub fn replan_allowance(&self) -> u32 {
        match self {
            Complexity::Low => 0,
            Complexity::Medium => 1,
            Complexity::High => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }
}

/// 规则估计复杂度：长度、重构类动词、疑似文件名数量、测试关键词
pub fn estimate_complexity(goal: &str) -> Complexity {
    let lower = goal.to_lowercase();
    let mut score = 0usize;

    if goal.len() > 200 {
        score += 2;
    } else if goal.len() > 80 {
        score += 1;
    }

    const HEAVY_VERBS: &[&str] = &[
        "refactor", "rewrite", "migrate", "redesign", "overhaul", "implement", "restructure",
    ];
    if HEAVY_VERBS.iter().any(|v| lower.contains(v)) {
        score += 2;
    }

    const TEST_WORDS: &[&str] = &["test", "tests", "failing", "coverage", "ci"];
    if TEST_WORDS.iter().any(|w| lower.split_whitespace().any(|t| t.trim_matches(|c: char| !c.is_alphanumeric()) == *w)) {
        score += 1;
    }

    // 疑似文件名：带扩展名或路径分隔符的 token
    let file_like = goal
        .split_whitespace()
        .filter(|t| t.contains('/') || t.rsplit('.').next().map(|e| e.len() <= 4 && e.chars().all(|c| c.is_alphanumeric()) && t.contains('.')).unwrap_or(false))
        .count();
    if file_like >= 2 {
        score += 1;
    }

    if lower.contains(" and ") || goal.matches('.').count() > 2 {
        score += 1;
    }

    match score {
        0..=1 => Complexity::Low,
        2..=3 => Complexity::Medium,
        _ => Complexity::High,
    }
}

/// 单个计划步
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub title: String,
    pub instruction: String,
    pub success_criteria: Vec<String>,
    pub step_budget: u32,
}

impl PlanStep {
    /// 渲染成该步的执行指令
    pub fn to_prompt(&self) -> String {
        let criteria = if self.success_criteria.is_empty() {
            "  - Step completes without errors".to_string()
        } else {
            self.success_criteria
                .iter()
                .map(|c| format!("  - {}", c))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "## Step: {}\n\n{}\n\nSuccess criteria:\n{}\n\nFocus ONLY on this step. Do not work on other steps.",
            self.title, self.instruction, criteria
        )
    }
}

/// 结构化计划
#[derive(Debug, Clone)]
pub struct Plan {
    pub goal: String,
    pub complexity: Complexity,
    pub steps: Vec<PlanStep>,
    pub assumptions: Vec<String>,
}

impl Plan {
    pub fn summary(&self) -> String {
        let mut parts = vec![format!(
            "Plan ({} steps, {} complexity):",
            self.steps.len(),
            self.complexity.as_str()
        )];
        for (i, s) in self.steps.iter().enumerate() {
            parts.push(format!("  {}. {}", i + 1, s.title));
        }
        parts.join("\n")
    }
}

/// 规划失败（上层决定是否降级为直接执行）
#[derive(Debug)]
pub struct PlanFailure {
    pub reason: String,
}

const PLAN_SYSTEM_PROMPT: &str = r#"You are a planning assistant. Given a goal, break it into a small number of concrete steps.

RULES:
- Maximum {max_steps} steps. Fewer is better.
- Each step must be independently verifiable.
- Steps should be ordered by dependency.
- Be specific and actionable, never vague.

Respond with ONLY a JSON object in this exact format (no markdown, no extra text):
{
  "steps": [
    {
      "title": "Short title",
      "instruction": "Detailed instruction for what to do",
      "success_criteria": ["How to verify this step succeeded"]
    }
  ],
  "assumptions": ["Any assumptions about the project"]
}"#;

const REPLAN_PROMPT: &str = r#"The original goal was: {goal}

Completed steps:
{completed}

Step "{failed_title}" FAILED: {failure_reason}

Create a revised plan for the REMAINING work only. The completed steps are already done.
Respond with ONLY a JSON object in the same format as before."#;

/// LLM 计划 JSON 的反序列化形状
#[derive(Deserialize)]
struct RawPlan {
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    assumptions: Vec<String>,
}

#[derive(Deserialize)]
struct RawStep {
    #[serde(default)]
    title: String,
    #[serde(default)]
    instruction: String,
    #[serde(default)]
    success_criteria: Value,
}

pub struct Planner {
    client: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// 生成计划；失败返回 PlanFailure 交由上层降级
    pub async fn create_plan(
        &self,
        goal: &str,
        project_facts: &str,
        tier: ModelTier,
    ) -> Result<Plan, PlanFailure> {
        let complexity = estimate_complexity(goal);
        let system = PLAN_SYSTEM_PROMPT.replace(
            "{max_steps}",
            &complexity.max_plan_steps().to_string(),
        );
        let mut user = format!("GOAL: {}", goal);
        if !project_facts.is_empty() {
            user.push_str(&format!("\n\nCONTEXT:\n{}", project_facts));
        }
        self.ask(goal, complexity, &system, &user, tier).await
    }

    /// 步失败后重新规划剩余工作
    pub async fn replan(
        &self,
        goal: &str,
        complexity: Complexity,
        completed: &[PlanStep],
        failed: &PlanStep,
        failure_reason: &str,
        tier: ModelTier,
    ) -> Result<Plan, PlanFailure> {
        let completed_text = if completed.is_empty() {
            "  (none)".to_string()
        } else {
            completed
                .iter()
                .enumerate()
                .map(|(i, s)| format!("  {}. {} (DONE)", i + 1, s.title))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let system = PLAN_SYSTEM_PROMPT.replace(
            "{max_steps}",
            &complexity.max_plan_steps().to_string(),
        );
        let user = REPLAN_PROMPT
            .replace("{goal}", goal)
            .replace("{completed}", &completed_text)
            .replace("{failed_title}", &failed.title)
            .replace("{failure_reason}", failure_reason);
        self.ask(goal, complexity, &system, &user, tier).await
    }

    async fn ask(
        &self,
        goal: &str,
        complexity: Complexity,
        system: &str,
        user: &str,
        tier: ModelTier,
    ) -> Result<Plan, PlanFailure> {
        let mut request = ChatRequest::new(
            vec![
                crate::context::Message::system(system),
                crate::context::Message::user(user),
            ],
            tier,
        );
        request.max_tokens = PLANNING_MAX_TOKENS;
        request.temperature = 0.2;

        let response = self.client.chat(&request).await.map_err(|e| PlanFailure {
            reason: format!("planner LLM error: {}", e),
        })?;
        if response.assistant_text.trim().is_empty() {
            return Err(PlanFailure {
                reason: "empty response from planner".to_string(),
            });
        }
        parse_plan(goal, complexity, &response.assistant_text)
    }
}

/// 把（可能很脏的）LLM 输出解析成 Plan
pub fn parse_plan(goal: &str, complexity: Complexity, raw: &str) -> Result<Plan, PlanFailure> {
    let json_str = extract_json_block(raw).ok_or_else(|| PlanFailure {
        reason: format!("no JSON object in planner output: {}", head(raw)),
    })?;
    let value = repair_json(&json_str).map_err(|e| PlanFailure {
        reason: format!("invalid plan JSON: {}", e),
    })?;
    let parsed: RawPlan = serde_json::from_value(value).map_err(|e| PlanFailure {
        reason: format!("plan shape mismatch: {}", e),
    })?;
    if parsed.steps.is_empty() {
        return Err(PlanFailure {
            reason: "plan has no steps".to_string(),
        });
    }

    let steps: Vec<PlanStep> = parsed
        .steps
        .into_iter()
        .take(complexity.max_plan_steps())
        .enumerate()
        .map(|(i, s)| {
            let title = if s.title.trim().is_empty() {
                format!("Step {}", i + 1)
            } else {
                s.title.trim().to_string()
            };
            let instruction = if s.instruction.trim().is_empty() {
                title.clone()
            } else {
                s.instruction.trim().to_string()
            };
            let mut criteria = criteria_list(s.success_criteria);
            if criteria.is_empty() {
                criteria.push(
                    "Tool invocation for this step completes without a terminal failure"
                        .to_string(),
                );
            }
            PlanStep {
                title,
                instruction,
                success_criteria: criteria,
                step_budget: complexity.step_budget(),
            }
        })
        .collect();

    Ok(Plan {
        goal: goal.to_string(),
        complexity,
        steps,
        assumptions: parsed.assumptions,
    })
}

fn criteria_list(value: Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => vec![s],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .filter(|s| !s.trim().is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// 从输出中找出最外层 JSON 对象（整段 / 围栏块 / 第一个大括号对）
fn extract_json_block(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return Some(trimmed.to_string());
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start..];
        let inner = rest
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_start();
        if let Some(end) = inner.find("```") {
            return Some(inner[..end].trim().to_string());
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| trimmed[start..=end].to_string())
}

fn head(text: &str) -> String {
    text.chars().take(200).collect()
}
