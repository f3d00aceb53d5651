//! run_tests 工具：探测项目的测试命令并执行
//!
//! 按项目文件探测 runner（Cargo.toml -> cargo test、package.json ->
//! npm test、pytest 配置 -> python -m pytest）。沿用 shell 的执行语义，
//! 外层上限默认 10 分钟。

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::registry::{ArgSpec, ArgType, SideEffect, Tool, ToolDescriptor};
use crate::tools::shell::run_shell;

pub struct RunTestsTool {
    root: PathBuf,
    timeout: Duration,
    descriptor: ToolDescriptor,
}

impl RunTestsTool {
    pub fn new(root: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            root: root.into(),
            timeout: Duration::from_secs(timeout_secs),
            descriptor: ToolDescriptor {
                name: "run_tests",
                description: "Run the project's test suite with its native test runner. Optional `target` narrows to one test or module.",
                args: vec![ArgSpec::optional(
                    "target",
                    ArgType::String,
                    "test name / file / module to narrow to",
                )],
                output_limit: 4096,
                side_effect: SideEffect::Shell,
            },
        }
    }
}

#[async_trait]
impl Tool for RunTestsTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &Value) -> Result<String, String> {
        let target = args.get("target").and_then(Value::as_str).unwrap_or("");
        let command = detect_test_command(&self.root, target)
            .ok_or_else(|| "no test runner detected (no Cargo.toml, package.json or pytest config)".to_string())?;
        tracing::info!(command, "run_tests");
        run_shell(&command, &self.root, self.timeout).await
    }
}

/// 探测测试命令；探测不到返回 None
fn detect_test_command(root: &Path, target: &str) -> Option<String> {
    if root.join("Cargo.toml").exists() {
        return Some(if target.is_empty() {
            "cargo test".to_string()
        } else {
            format!("cargo test {}", target)
        });
    }
    if root.join("package.json").exists() {
        return Some(if target.is_empty() {
            "npm test --silent".to_string()
        } else {
            format!("npm test --silent -- {}", target)
        });
    }
    let pytest_markers = ["pytest.ini", "pyproject.toml", "setup.py", "tests"];
    if pytest_markers.iter().any(|m| root.join(m).exists()) {
        return Some(if target.is_empty() {
            "python -m pytest -q".to_string()
        } else {
            format!("python -m pytest -q {}", target)
        });
    }
    None
}
