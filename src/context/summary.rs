//! 结构化摘要：跨压缩保留的关键事实
//!
//! 每次工具完成后更新 {修改过的文件, 最近一次测试结果, 近期错误}，
//! 渲染进 system 层。历史消息被压缩或淘汰后，模型仍能看到这些事实，
//! 避免重新发现式的工具调用。

use std::collections::BTreeSet;
use std::collections::VecDeque;

use serde_json::Value;

/// 近期错误保留条数
const MAX_RECENT_ERRORS: usize = 5;
/// 测试输出头部保留字符数
const TEST_OUTPUT_HEAD_CHARS: usize = 400;

/// 最近一次 run_tests 的结果
#[derive(Debug, Clone, Default)]
pub struct TestResult {
    pub passed: u32,
    pub failed: u32,
    pub output_head: String,
}

#[derive(Debug, Clone, Default)]
pub struct StructuredSummary {
    pub files_modified: BTreeSet<String>,
    pub last_test_result: Option<TestResult>,
    pub recent_errors: VecDeque<String>,
}

impl StructuredSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// 工具完成后调用；按工具名更新对应字段
    pub fn on_tool_completed(&mut self, tool: &str, args: &Value, ok: bool, payload: &str) {
        match tool {
            "write_file" | "edit_file" => {
                if ok {
                    if let Some(path) = args.get("path").and_then(Value::as_str) {
                        self.files_modified.insert(path.to_string());
                    }
                }
            }
            "run_tests" => {
                let (passed, failed) = parse_test_counts(payload);
                self.last_test_result = Some(TestResult {
                    passed,
                    failed,
                    output_head: payload.chars().take(TEST_OUTPUT_HEAD_CHARS).collect(),
                });
            }
            _ => {}
        }
        if !ok {
            self.push_error(format!("{}: {}", tool, first_line(payload)));
        }
    }

    fn push_error(&mut self, err: String) {
        self.recent_errors.push_back(err);
        while self.recent_errors.len() > MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
    }

    /// 回滚后修剪：丢弃回滚后已不存在的文件记录；测试结果描述的状态已失效，
    /// 一并清空。近期错误保留（它们解释了为什么回滚）。
    pub fn prune_after_rollback<F>(&mut self, still_exists: F)
    where
        F: Fn(&str) -> bool,
    {
        self.files_modified.retain(|p| still_exists(p));
        self.last_test_result = None;
    }

    /// 渲染为 system 层的一个小节；无内容时返回空串
    pub fn render(&self) -> String {
        if self.files_modified.is_empty()
            && self.last_test_result.is_none()
            && self.recent_errors.is_empty()
        {
            return String::new();
        }
        let mut out = String::from("## Session facts\n");
        if !self.files_modified.is_empty() {
            out.push_str("Files modified: ");
            out.push_str(
                &self
                    .files_modified
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            out.push('\n');
        }
        if let Some(t) = &self.last_test_result {
            out.push_str(&format!(
                "Last test run: {} passed, {} failed\n",
                t.passed, t.failed
            ));
            if t.failed > 0 && !t.output_head.is_empty() {
                out.push_str(&format!("Test output (head): {}\n", t.output_head));
            }
        }
        if !self.recent_errors.is_empty() {
            out.push_str("Recent errors:\n");
            for e in &self.recent_errors {
                out.push_str(&format!("  - {}\n", e));
            }
        }
        out
    }
}

/// 从测试输出里松散提取通过/失败数（cargo、pytest、jest 的常见格式）
fn parse_test_counts(output: &str) -> (u32, u32) {
    let mut passed = 0u32;
    let mut failed = 0u32;
    for (count, keyword) in scan_counts(output) {
        match keyword.as_str() {
            "passed" | "passing" | "ok" => passed = passed.max(count),
            "failed" | "failing" => failed = failed.max(count),
            _ => {}
        }
    }
    (passed, failed)
}

fn scan_counts(output: &str) -> Vec<(u32, String)> {
    let mut result = Vec::new();
    let mut last_number: Option<u32> = None;
    for token in output.split(|c: char| c.is_whitespace() || c == ';' || c == ',') {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric());
        if token.is_empty() {
            continue;
        }
        if let Ok(n) = token.parse::<u32>() {
            last_number = Some(n);
        } else if let Some(n) = last_number.take() {
            result.push((n, token.to_lowercase()));
        }
    }
    result
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
