//! 工具箱：内置工具集、注册表与执行器

pub mod executor;
pub mod external;
pub mod file_ops;
pub mod git_tools;
pub mod output;
pub mod rate_limit;
pub mod registry;
pub mod shell;
pub mod testing;

pub use executor::{ExecOutcome, ToolExecutor};
pub use external::{ExternalAgentTool, ExternalDispatcher, ExternalKind};
pub use file_ops::{EditFileTool, ListDirTool, ReadFileTool, SearchFilesTool, WriteFileTool};
pub use git_tools::{GitBranchTool, GitCommitTool, GitDiffTool, GitLogTool, GitStatusTool};
pub use output::shape_output;
pub use registry::{ArgSpec, ArgType, SideEffect, Tool, ToolDescriptor, ToolRegistry};
pub use shell::ShellTool;
pub use testing::RunTestsTool;

use std::path::Path;
use std::sync::Arc;

use crate::config::ToolsSection;
use crate::events::EventBus;

/// 组装完整的内置工具集（外部智能体按探测结果注册）
pub fn builtin_registry(
    workspace: &Path,
    cfg: &ToolsSection,
    bus: EventBus,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool::new(workspace));
    registry.register(WriteFileTool::new(workspace));
    registry.register(EditFileTool::new(workspace));
    registry.register(ListDirTool::new(workspace));
    registry.register(SearchFilesTool::new(workspace));
    registry.register(ShellTool::new(workspace, cfg.shell_timeout_secs));
    registry.register(GitStatusTool::new(workspace));
    registry.register(GitDiffTool::new(workspace));
    registry.register(GitCommitTool::new(workspace));
    registry.register(GitBranchTool::new(workspace));
    registry.register(GitLogTool::new(workspace));
    registry.register(RunTestsTool::new(workspace, cfg.test_timeout_secs));

    let dispatcher = Arc::new(ExternalDispatcher::probe(cfg, workspace, bus));
    for name in dispatcher.registered() {
        if let Some(kind) = ExternalKind::from_name(&name) {
            registry.register(ExternalAgentTool::new(kind, Arc::clone(&dispatcher)));
        }
    }
    registry
}

#[cfg(test)]
pub mod test_support {
    //! 测试共用的注册表构造

    use super::*;

    /// 根在指定目录的真实工具集（不含外部智能体）
    pub fn test_registry_at(workspace: &Path) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(ReadFileTool::new(workspace));
        registry.register(WriteFileTool::new(workspace));
        registry.register(EditFileTool::new(workspace));
        registry.register(ListDirTool::new(workspace));
        registry.register(SearchFilesTool::new(workspace));
        registry.register(ShellTool::new(workspace, 10));
        registry.register(GitStatusTool::new(workspace));
        registry.register(GitDiffTool::new(workspace));
        registry.register(GitCommitTool::new(workspace));
        registry.register(GitBranchTool::new(workspace));
        registry.register(GitLogTool::new(workspace));
        registry.register(RunTestsTool::new(workspace, 60));
        registry
    }

    /// 只做参数校验、不实际执行时用
    pub fn test_registry() -> ToolRegistry {
        test_registry_at(&std::env::temp_dir())
    }
}
