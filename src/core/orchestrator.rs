//! 目标编排器：计划 -> 逐步执行 -> 失败回滚重规划 -> 收尾
//!
//! run_goal 驱动完整生命周期：进入检查点、规划并经 Critic 校验、
//! 按步 scope 执行循环、步失败回滚后在重规划配额内重试，配额耗尽或
//! 计划被拒时降级为直接执行（上下文保留）。结束时成功 squash 合并；
//! 硬失败时至少一步成功则回滚到最后一个已提交快照并把它并回原分支，
//! 一步都没成功则回滚全部、丢弃工作分支。
//! 目标级失败从不 panic，统一进入失败总结。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointManager;
use crate::config::{harness_home, AppConfig};
use crate::context::{load_memory_slice, ContextStore, PlanStepView, SystemLayer};
use crate::core::{FailureClass, HarnessError};
use crate::events::{EventBus, HarnessEvent};
use crate::llm::{CompensationPipeline, LlmClient, ModelTier};
use crate::policy::{PolicyEngine, PolicyPreset, PolicySpec};
use crate::react::{
    estimate_complexity, AgentLoop, Complexity, OutcomeKind, Plan, PlanCritic, PlanStep, Planner,
};
use crate::tools::{builtin_registry, ToolExecutor, ToolRegistry};

const BASE_SYSTEM_PROMPT: &str = "You are an autonomous coding agent working in a local project. \
Use the available tools to inspect and change the project. \
To call a tool, respond with ONLY a JSON object: {\"tool\": \"tool_name\", \"args\": {...}}. \
When the task is complete, answer in plain text.";

/// 目标结束状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalStatus {
    Succeeded,
    Failed,
}

/// 目标级统计，渲染进结束总结
#[derive(Debug, Clone, Default)]
pub struct GoalStats {
    pub tool_calls: u32,
    pub tool_failures: u32,
    pub compensations: HashMap<FailureClass, u32>,
    pub checkpoints: u32,
    pub rollbacks: u32,
    pub replans: u32,
    pub files_modified: Vec<String>,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub elapsed_secs: u64,
    pub final_tier: String,
}

#[derive(Debug, Clone)]
pub struct GoalReport {
    pub status: GoalStatus,
    pub summary: String,
    pub stats: GoalStats,
}

/// 每个目标独占工作区（进程内用互斥保证前台与后台任务串行）
pub struct GoalOrchestrator {
    config: AppConfig,
    workspace: PathBuf,
    client: Arc<dyn LlmClient>,
    bus: EventBus,
    cancel: CancellationToken,
}

impl GoalOrchestrator {
    pub fn new(
        config: AppConfig,
        workspace: impl Into<PathBuf>,
        client: Arc<dyn LlmClient>,
        bus: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            workspace: workspace.into(),
            client,
            bus,
            cancel,
        }
    }

    /// 执行一个目标到结束；任何失败都收敛为带总结的报告
    pub async fn run_goal(&mut self, goal: &str) -> GoalReport {
        let started = Instant::now();
        self.bus.emit(HarnessEvent::GoalStarted {
            goal: goal.to_string(),
        });

        let preset: PolicyPreset = self
            .config
            .policy
            .preset
            .parse()
            .unwrap_or(PolicyPreset::Balanced);
        let mut spec = PolicySpec::from_preset(preset);
        spec.writable_paths
            .extend(self.config.policy.writable_paths.iter().cloned());
        spec.disabled_tools
            .extend(self.config.policy.disabled_tools.iter().cloned());
        let policy = Arc::new(Mutex::new(PolicyEngine::new(spec, &self.workspace)));
        policy.lock().expect("policy lock").begin_goal();

        let registry: Arc<ToolRegistry> = Arc::new(builtin_registry(
            &self.workspace,
            &self.config.tools,
            self.bus.clone(),
        ));
        let executor = ToolExecutor::new(Arc::clone(&registry), Arc::clone(&policy), self.bus.clone());
        let pipeline = CompensationPipeline::new(
            self.config.llm.max_retries,
            std::time::Duration::from_secs(self.config.llm.max_rate_limit_wait_secs),
        );
        let tier: ModelTier = self
            .config
            .llm
            .default_tier
            .parse()
            .unwrap_or(ModelTier::Small);

        let mut agent = AgentLoop::new(
            Arc::clone(&self.client),
            Arc::clone(&registry),
            executor,
            pipeline,
            self.bus.clone(),
            self.cancel.clone(),
            tier,
            self.config.llm.stream,
            self.config.llm.max_tokens,
            self.config.llm.temperature,
            self.config.context.model_max_tokens,
        );

        let system = SystemLayer {
            role_prompt: BASE_SYSTEM_PROMPT.to_string(),
            tools_description: registry.prompt_description(),
            project_facts: gather_project_facts(&self.workspace),
            policy_summary: policy.lock().expect("policy lock").summary(),
            memories: load_memory_slice(
                &harness_home().join("memory.db"),
                self.config.context.memory_slice,
            ),
        };
        let mut context = ContextStore::new(system);

        let mut checkpoint = CheckpointManager::new(
            &self.workspace,
            self.config.checkpoint.enabled,
            self.config.checkpoint.snapshot_every_writes,
            self.bus.clone(),
        );
        match checkpoint.enter().await {
            Ok(msg) => tracing::info!(%msg, "checkpoint session entered"),
            Err(e) => tracing::warn!(error = %e, "checkpointing degraded"),
        }

        let complexity = estimate_complexity(goal);
        let planner = Planner::new(Arc::clone(&self.client));
        let critic = PlanCritic::new(registry.names());

        let plan = match planner
            .create_plan(goal, &gather_project_facts(&self.workspace), tier)
            .await
        {
            Ok(p) => {
                let issues = critic.validate(&p);
                if issues.is_empty() {
                    tracing::info!("\n{}", p.summary());
                    Some(p)
                } else {
                    tracing::warn!(issues = ?issues, "plan rejected, falling back to direct execution");
                    None
                }
            }
            Err(f) => {
                tracing::warn!(reason = %f.reason, "planning failed, falling back to direct execution");
                None
            }
        };

        let mut rollbacks = 0u32;
        let mut replans = 0u32;
        let mut hard_failure: Option<String> = None;
        let mut any_step_succeeded = false;
        let mut final_answer = String::new();

        match plan {
            None => {
                self.run_direct(
                    &mut agent,
                    &mut context,
                    &mut checkpoint,
                    goal,
                    complexity,
                    &mut final_answer,
                    &mut any_step_succeeded,
                    &mut hard_failure,
                )
                .await;
            }
            Some(plan) => {
                self.run_planned(
                    &mut agent,
                    &mut context,
                    &mut checkpoint,
                    &planner,
                    &critic,
                    goal,
                    plan,
                    &mut rollbacks,
                    &mut replans,
                    &mut final_answer,
                    &mut any_step_succeeded,
                    &mut hard_failure,
                )
                .await;
            }
        }
        context.plan.clear();

        // 统计与收尾
        let diff = checkpoint.diff_stat().await;
        let loop_stats = agent.stats().clone();
        let mut stats = GoalStats {
            tool_calls: loop_stats.tool_calls,
            tool_failures: loop_stats.tool_failures,
            compensations: loop_stats.compensations,
            checkpoints: checkpoint.taken_total(),
            rollbacks,
            replans,
            files_modified: context.summary.files_modified.iter().cloned().collect(),
            tests_passed: context
                .summary
                .last_test_result
                .as_ref()
                .map(|t| t.passed)
                .unwrap_or(0),
            tests_failed: context
                .summary
                .last_test_result
                .as_ref()
                .map(|t| t.failed)
                .unwrap_or(0),
            elapsed_secs: started.elapsed().as_secs(),
            final_tier: agent.current_tier().to_string(),
        };

        let (status, summary) = match hard_failure {
            None => {
                match checkpoint.finish(true).await {
                    Ok(msg) => tracing::info!(%msg, "checkpoint finished"),
                    Err(e) => tracing::warn!(error = %e, "checkpoint finish failed"),
                }
                let summary = render_summary(goal, &final_answer, &stats, &diff, None);
                self.bus.emit(HarnessEvent::GoalCompleted {
                    summary: summary.clone(),
                });
                (GoalStatus::Succeeded, summary)
            }
            Some(reason) => {
                // 硬失败：回滚目标必须在回滚前确定。有成功步时回滚到最后一个
                // 已提交快照（保住成功步的提交，随后并回原分支）；一步都没成功
                // 则回滚全部并丢弃工作分支。rollback(None) 会清空快照列表，
                // 所以合并与否不能看回滚后的状态。
                let merge_target = if any_step_succeeded {
                    checkpoint.last_snapshot()
                } else {
                    None
                };
                let keep_committed = merge_target.is_some();
                if let Err(e) = checkpoint.rollback(merge_target.as_ref()).await {
                    tracing::warn!(error = %e, "rollback after hard failure failed");
                } else {
                    stats.rollbacks += 1;
                }
                match checkpoint.finish(keep_committed).await {
                    Ok(msg) => tracing::info!(%msg, "checkpoint finished after failure"),
                    Err(e) => tracing::warn!(error = %e, "checkpoint finish failed"),
                }
                let summary = render_summary(goal, &final_answer, &stats, &diff, Some(&reason));
                self.bus.emit(HarnessEvent::GoalFailed {
                    reason: reason.clone(),
                });
                (GoalStatus::Failed, summary)
            }
        };

        GoalReport {
            status,
            summary,
            stats,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_direct(
        &self,
        agent: &mut AgentLoop,
        context: &mut ContextStore,
        checkpoint: &mut CheckpointManager,
        goal: &str,
        complexity: Complexity,
        final_answer: &mut String,
        any_step_succeeded: &mut bool,
        hard_failure: &mut Option<String>,
    ) {
        match agent
            .run_invocation(context, checkpoint, goal, complexity.step_budget())
            .await
        {
            Ok(outcome) => match outcome.kind {
                OutcomeKind::Answer(answer) => {
                    *final_answer = answer;
                    *any_step_succeeded = true;
                }
                OutcomeKind::Exhausted => {
                    *hard_failure =
                        Some("agent-step budget exhausted without an answer".to_string());
                }
            },
            Err(e) => *hard_failure = Some(e.to_string()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_planned(
        &self,
        agent: &mut AgentLoop,
        context: &mut ContextStore,
        checkpoint: &mut CheckpointManager,
        planner: &Planner,
        critic: &PlanCritic,
        goal: &str,
        plan: Plan,
        rollbacks: &mut u32,
        replans: &mut u32,
        final_answer: &mut String,
        any_step_succeeded: &mut bool,
        hard_failure: &mut Option<String>,
    ) {
        let complexity = plan.complexity;
        let mut steps = plan.steps;
        let mut completed: Vec<PlanStep> = Vec::new();
        let mut replans_left = complexity.replan_allowance();
        let mut idx = 0usize;

        while idx < steps.len() {
            if self.cancel.is_cancelled() {
                *hard_failure = Some("cancelled".to_string());
                return;
            }

            context.plan.steps = steps
                .iter()
                .map(|s| PlanStepView {
                    title: s.title.clone(),
                    instruction: s.instruction.clone(),
                })
                .collect();
            context.plan.current = idx;

            let step = steps[idx].clone();
            self.bus.emit(HarnessEvent::PlanStepStarted {
                index: idx,
                title: step.title.clone(),
            });

            let result = agent
                .run_invocation(context, checkpoint, &step.to_prompt(), step.step_budget)
                .await;

            let failure_reason = match result {
                Ok(outcome) => match outcome.kind {
                    OutcomeKind::Answer(answer) => {
                        self.bus.emit(HarnessEvent::PlanStepCompleted {
                            index: idx,
                            title: step.title.clone(),
                        });
                        let _ = checkpoint
                            .snapshot(&format!("step {}: {}", idx + 1, step.title))
                            .await;
                        *final_answer = answer;
                        *any_step_succeeded = true;
                        completed.push(step);
                        idx += 1;
                        continue;
                    }
                    OutcomeKind::Exhausted => {
                        format!("step budget ({}) exhausted", step.step_budget)
                    }
                },
                Err(HarnessError::Cancelled) => {
                    *hard_failure = Some("cancelled".to_string());
                    return;
                }
                Err(e) => e.to_string(),
            };

            self.bus.emit(HarnessEvent::PlanStepFailed {
                index: idx,
                title: step.title.clone(),
                reason: failure_reason.clone(),
            });

            // 回滚到最近一个快照；没有快照时回滚全部
            let target = checkpoint.last_snapshot();
            match checkpoint.rollback(target.as_ref()).await {
                Ok(_) => *rollbacks += 1,
                Err(e) => tracing::warn!(error = %e, "step rollback failed"),
            }
            context
                .summary
                .prune_after_rollback(|p| checkpoint.file_exists(p));

            if replans_left > 0 {
                replans_left -= 1;
                *replans += 1;
                match planner
                    .replan(
                        goal,
                        complexity,
                        &completed,
                        &step,
                        &failure_reason,
                        agent.current_tier(),
                    )
                    .await
                {
                    Ok(new_plan) if critic.validate(&new_plan).is_empty() => {
                        tracing::info!("replanned:\n{}", new_plan.summary());
                        steps = new_plan.steps;
                        idx = 0;
                        continue;
                    }
                    Ok(_) | Err(_) => {
                        tracing::warn!("replan unusable, falling back to direct execution");
                    }
                }
            }

            // 重规划配额耗尽（或重规划失败）：降级为直接执行，上下文保留
            self.run_direct(
                agent,
                context,
                checkpoint,
                goal,
                complexity,
                final_answer,
                any_step_succeeded,
                hard_failure,
            )
            .await;
            return;
        }
    }
}

/// 项目事实：根目录顶层条目一览（外部的项目类型探测不在这里）
fn gather_project_facts(workspace: &std::path::Path) -> String {
    let mut entries: Vec<String> = Vec::new();
    if let Ok(read) = std::fs::read_dir(workspace) {
        for entry in read.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') && name != ".gitignore" {
                continue;
            }
            let suffix = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                "/"
            } else {
                ""
            };
            entries.push(format!("{}{}", name, suffix));
        }
    }
    entries.sort();
    if entries.is_empty() {
        format!("Project root: {} (empty)", workspace.display())
    } else {
        format!(
            "Project root: {}\nTop-level entries: {}",
            workspace.display(),
            entries.join(", ")
        )
    }
}

/// 结束总结：工具调用数、按类别的补偿次数、检查点/回滚、改动文件、
/// 测试通过/失败、耗时
fn render_summary(
    goal: &str,
    answer: &str,
    stats: &GoalStats,
    diff: &str,
    failure: Option<&str>,
) -> String {
    let mut out = String::new();
    match failure {
        None => out.push_str(&format!("Goal completed: {}\n", goal)),
        Some(reason) => out.push_str(&format!("Goal FAILED: {}\n  reason: {}\n", goal, reason)),
    }
    if !answer.is_empty() {
        out.push_str(&format!("\n{}\n", answer.trim()));
    }
    out.push_str(&format!(
        "\ntool calls: {} ({} failed)\n",
        stats.tool_calls, stats.tool_failures
    ));
    if !stats.compensations.is_empty() {
        let mut classes: Vec<_> = stats.compensations.iter().collect();
        classes.sort_by_key(|(c, _)| c.as_str());
        let rendered: Vec<String> = classes
            .iter()
            .map(|(c, n)| format!("{} x{}", c.as_str(), n))
            .collect();
        out.push_str(&format!("compensations: {}\n", rendered.join(", ")));
    }
    out.push_str(&format!(
        "checkpoints: {} taken, {} rollbacks, {} replans\n",
        stats.checkpoints, stats.rollbacks, stats.replans
    ));
    if !stats.files_modified.is_empty() {
        out.push_str(&format!(
            "files modified: {}\n",
            stats.files_modified.join(", ")
        ));
    }
    if stats.tests_passed > 0 || stats.tests_failed > 0 {
        out.push_str(&format!(
            "tests: {} passed, {} failed\n",
            stats.tests_passed, stats.tests_failed
        ));
    }
    if !diff.is_empty() {
        out.push_str(&format!("diff:\n{}\n", diff));
    }
    out.push_str(&format!(
        "elapsed: {}s, final tier: {}\n",
        stats.elapsed_secs, stats.final_tier
    ));
    out
}
