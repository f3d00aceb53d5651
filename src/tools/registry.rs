//! 工具注册表
//!
//! 所有工具实现 Tool trait（描述符 + 异步执行），由 ToolRegistry 按名
//! 注册与查找。描述符声明参数 schema、输出字节上限与副作用类别，
//! 参数校验先于策略检查（校验失败归为 missing_args 而非执行失败）。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// 副作用类别；策略引擎按类别记预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    Read,
    Write,
    Shell,
    Git,
    NetworkExternal,
}

/// 参数类型（弱模型经常搞错类型，校验只看必填是否到位，类型尽量宽容）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    String,
    Integer,
    Boolean,
}

impl ArgType {
    fn as_str(&self) -> &'static str {
        match self {
            ArgType::String => "string",
            ArgType::Integer => "integer",
            ArgType::Boolean => "boolean",
        }
    }
}

/// 单个参数声明
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub ty: ArgType,
    pub required: bool,
    pub brief: &'static str,
}

impl ArgSpec {
    pub fn required(name: &'static str, ty: ArgType, brief: &'static str) -> Self {
        Self {
            name,
            ty,
            required: true,
            brief,
        }
    }

    pub fn optional(name: &'static str, ty: ArgType, brief: &'static str) -> Self {
        Self {
            name,
            ty,
            required: false,
            brief,
        }
    }
}

/// 工具描述符：名字、说明、参数表、输出上限、副作用类别
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub args: Vec<ArgSpec>,
    pub output_limit: usize,
    pub side_effect: SideEffect,
}

impl ToolDescriptor {
    /// 参数简表，注入 prompt 与 missing_args 纠正消息
    pub fn schema_brief(&self) -> String {
        if self.args.is_empty() {
            return "  (no arguments)".to_string();
        }
        self.args
            .iter()
            .map(|a| {
                format!(
                    "  {} ({}{}): {}",
                    a.name,
                    a.ty.as_str(),
                    if a.required { ", required" } else { "" },
                    a.brief
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 工具 trait：描述符 + 异步执行。execute 返回 Err 表示执行失败，
/// 内容会以工具错误的形式回给模型。
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn execute(&self, args: &Value) -> Result<String, String>;
}

/// 按名存储 Arc<dyn Tool>；BTreeMap 保证遍历顺序稳定
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.descriptor().name.to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name.to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.get(name).map(|t| t.descriptor().clone())
    }

    pub fn schema_brief(&self, name: &str) -> Option<String> {
        self.tools.get(name).map(|t| t.descriptor().schema_brief())
    }

    /// 校验必填参数是否齐全；缺失返回缺失参数名列表
    pub fn validate_args(&self, name: &str, args: &Value) -> Result<(), Vec<String>> {
        let Some(tool) = self.tools.get(name) else {
            return Err(vec!["<unknown tool>".to_string()]);
        };
        let empty = serde_json::Map::new();
        let obj = args.as_object().unwrap_or(&empty);
        let missing: Vec<String> = tool
            .descriptor()
            .args
            .iter()
            .filter(|a| a.required)
            .filter(|a| match obj.get(a.name) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            })
            .map(|a| a.name.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }

    /// 生成 prompt 里的 Available tools 段落
    pub fn prompt_description(&self) -> String {
        self.tools
            .values()
            .map(|t| {
                let d = t.descriptor();
                format!("### {}\n{}\n{}", d.name, d.description, d.schema_brief())
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Dummy(ToolDescriptor);

    #[async_trait]
    impl Tool for Dummy {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.0
        }

        async fn execute(&self, _args: &Value) -> Result<String, String> {
            Ok("ok".into())
        }
    }

    fn dummy() -> Dummy {
        Dummy(ToolDescriptor {
            name: "edit_file",
            description: "Edit a file",
            args: vec![
                ArgSpec::required("path", ArgType::String, "file path"),
                ArgSpec::required("find", ArgType::String, "text to find"),
                ArgSpec::required("replace", ArgType::String, "replacement"),
            ],
            output_limit: 2048,
            side_effect: SideEffect::Write,
        })
    }

    #[test]
    fn test_validate_args_missing() {
        let mut reg = ToolRegistry::new();
        reg.register(dummy());
        let err = reg
            .validate_args("edit_file", &json!({"path": "a.py"}))
            .expect_err("find/replace missing");
        assert_eq!(err, vec!["find".to_string(), "replace".to_string()]);
    }

    #[test]
    fn test_validate_args_empty_string_counts_missing() {
        let mut reg = ToolRegistry::new();
        reg.register(dummy());
        assert!(reg
            .validate_args("edit_file", &json!({"path": "", "find": "x", "replace": "y"}))
            .is_err());
    }

    #[test]
    fn test_validate_args_ok() {
        let mut reg = ToolRegistry::new();
        reg.register(dummy());
        assert!(reg
            .validate_args(
                "edit_file",
                &json!({"path": "a.py", "find": "x", "replace": "y"})
            )
            .is_ok());
    }

    #[test]
    fn test_schema_brief_lists_args() {
        let d = dummy();
        let brief = d.descriptor().schema_brief();
        assert!(brief.contains("path (string, required)"));
        assert!(brief.contains("replace"));
    }
}
