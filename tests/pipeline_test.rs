//! 端到端：脚本化 LLM 驱动完整的目标生命周期
//!
//! 覆盖：规划 -> 按步执行 -> 快照 -> squash 合并；坏计划降级直接执行；
//! 补偿耗尽后的硬失败与检查点纯度（工作区回到目标开始前的状态）。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use open_harness::config::AppConfig;
use open_harness::core::{GoalOrchestrator, GoalStatus};
use open_harness::events::{EventBus, HarnessEvent};
use open_harness::llm::{LmResponse, MockLlm};
use open_harness::tools::git_tools::git;

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.llm.stream = false;
    config.checkpoint.enabled = true;
    config
}

fn orchestrator(
    workspace: &std::path::Path,
    mock: Arc<MockLlm>,
    bus: EventBus,
) -> GoalOrchestrator {
    GoalOrchestrator::new(
        test_config(),
        workspace,
        mock,
        bus,
        CancellationToken::new(),
    )
}

const PLAN_JSON: &str = r#"{
  "steps": [
    {"title": "Create the file", "instruction": "Write the greeting file using write_file", "success_criteria": ["greeting.txt exists"]},
    {"title": "Verify content", "instruction": "Read the file back to check the greeting", "success_criteria": ["content matches"]}
  ],
  "assumptions": ["workspace is writable"]
}"#;

#[tokio::test]
async fn test_planned_goal_commits_to_original_branch() {
    let ws = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockLlm::new());
    // 规划 -> 步 1（写文件 + 收尾回答）-> 步 2（读文件 + 收尾回答）
    mock.push_text(PLAN_JSON);
    mock.push_text(r#"{"tool": "write_file", "args": {"path": "greeting.txt", "content": "hello"}}"#);
    mock.push_text("File created.");
    mock.push_text(r#"{"tool": "read_file", "args": {"path": "greeting.txt"}}"#);
    mock.push_text("Verified: the greeting says hello.");

    let bus = EventBus::new();
    let mut rx = bus.subscribe();
    let report = orchestrator(ws.path(), mock, bus).run_goal("create a greeting file").await;

    assert_eq!(report.status, GoalStatus::Succeeded, "{}", report.summary);
    assert_eq!(report.stats.tool_calls, 2);
    assert!(report.stats.checkpoints >= 1);
    assert!(report.summary.contains("greeting.txt"));

    // 工作分支已合并删除，文件落在原分支上
    assert!(ws.path().join("greeting.txt").exists());
    let head = git(ws.path(), &["rev-parse", "--abbrev-ref", "HEAD"])
        .await
        .unwrap();
    assert!(!head.stdout.starts_with("harness/goal-"), "{}", head.stdout);
    let branches = git(ws.path(), &["branch", "--list"]).await.unwrap();
    assert!(!branches.stdout.contains("harness/goal-"));

    // 事件流里能看到完整生命周期
    let mut saw_started = false;
    let mut saw_step = false;
    let mut saw_completed = false;
    while let Some(ev) = rx.try_recv() {
        match ev {
            HarnessEvent::GoalStarted { .. } => saw_started = true,
            HarnessEvent::PlanStepCompleted { .. } => saw_step = true,
            HarnessEvent::GoalCompleted { .. } => saw_completed = true,
            _ => {}
        }
    }
    assert!(saw_started && saw_step && saw_completed);
}

#[tokio::test]
async fn test_unparseable_plan_falls_back_to_direct_execution() {
    let ws = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockLlm::new());
    mock.push_text("I would rather not produce JSON today.");
    mock.push_text("Nothing to change, the project is fine.");

    let report = orchestrator(ws.path(), mock, EventBus::new())
        .run_goal("check the project")
        .await;

    assert_eq!(report.status, GoalStatus::Succeeded, "{}", report.summary);
    assert!(report.summary.contains("project is fine"));
}

#[tokio::test]
async fn test_compensation_exhaustion_fails_goal_and_restores_workspace() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("existing.txt"), "untouched\n").unwrap();

    let mock = Arc::new(MockLlm::new());
    // 计划 1 步；该步连续空回复直到策略耗尽；随后的直接执行降级同样耗尽
    mock.push_text(r#"{"steps": [{"title": "Do the work", "instruction": "Edit the project files as needed", "success_criteria": []}]}"#);
    for _ in 0..8 {
        mock.push_response(LmResponse::default());
    }

    let report = orchestrator(ws.path(), mock, EventBus::new())
        .run_goal("do something impossible")
        .await;

    assert_eq!(report.status, GoalStatus::Failed);
    assert!(report.summary.contains("Goal FAILED"));

    // 检查点纯度：原分支工作区等于目标开始前的状态
    assert!(ws.path().join("existing.txt").exists());
    let status = git(ws.path(), &["status", "--porcelain"]).await.unwrap();
    assert!(status.stdout.trim().is_empty(), "{}", status.stdout);
    let branches = git(ws.path(), &["branch", "--list"]).await.unwrap();
    assert!(!branches.stdout.contains("harness/goal-"));
}

#[tokio::test]
async fn test_successful_step_commits_survive_later_hard_failure() {
    let ws = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockLlm::new());
    // 两步计划：第一步成功并落快照，第二步连续空回复直到策略耗尽，
    // 随后的直接执行降级同样耗尽
    mock.push_text(r#"{
      "steps": [
        {"title": "Create keeper", "instruction": "Write the keeper file using write_file", "success_criteria": ["kept.txt exists"]},
        {"title": "Polish notes", "instruction": "Update the remaining notes afterwards", "success_criteria": []}
      ]
    }"#);
    mock.push_text(r#"{"tool": "write_file", "args": {"path": "kept.txt", "content": "keep me"}}"#);
    mock.push_text("Step one is done.");
    for _ in 0..6 {
        mock.push_response(LmResponse::default());
    }

    let report = orchestrator(ws.path(), mock, EventBus::new())
        .run_goal("tidy up the notes")
        .await;

    assert_eq!(report.status, GoalStatus::Failed, "{}", report.summary);
    assert!(report.summary.contains("Goal FAILED"));
    assert!(report.stats.checkpoints >= 1);
    assert!(report.stats.rollbacks >= 1);

    // 成功步的快照仍并回原分支，工作分支已删除
    assert!(ws.path().join("kept.txt").exists());
    let head = git(ws.path(), &["rev-parse", "--abbrev-ref", "HEAD"])
        .await
        .unwrap();
    assert!(!head.stdout.starts_with("harness/goal-"), "{}", head.stdout);
    let branches = git(ws.path(), &["branch", "--list"]).await.unwrap();
    assert!(!branches.stdout.contains("harness/goal-"));
}

#[tokio::test]
async fn test_malformed_tool_call_repaired_within_goal() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("a.py"), "x = 1\n").unwrap();

    let mock = Arc::new(MockLlm::new());
    mock.push_text("no plan, just prose");
    // 尾逗号 + 单引号 + 裸键的调用应被解析修复，不消耗重试
    mock.push_text("edit_file({'path': 'a.py', 'find': 'x', 'replace': 'y',})");
    mock.push_text("Renamed the variable.");

    let report = orchestrator(ws.path(), mock, EventBus::new())
        .run_goal("rename x to y in a.py")
        .await;

    assert_eq!(report.status, GoalStatus::Succeeded, "{}", report.summary);
    let content = std::fs::read_to_string(ws.path().join("a.py")).unwrap();
    assert!(content.contains("y = 1"));
    assert!(report.stats.files_modified.contains(&"a.py".to_string()));
}
