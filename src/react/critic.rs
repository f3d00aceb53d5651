//! PlanCritic：规则校验计划，不调用 LLM
//!
//! 拒绝空计划、无动词的步、重复标题（弱模型复制粘贴型幻觉）、以及
//! 引用了未注册工具的成功判据。被拒后由编排器降级为直接执行。

use regex::Regex;

use crate::react::planner::Plan;

/// 指令中应出现的可执行动词
const ACTIONABLE_VERBS: &[&str] = &[
    "read", "write", "edit", "create", "add", "fix", "run", "update", "remove", "delete",
    "implement", "change", "check", "search", "move", "rename", "test", "install", "verify",
    "inspect", "refactor", "replace", "commit", "build", "list", "open", "modify", "make",
];

pub struct PlanCritic {
    tool_names: Vec<String>,
    call_like: Regex,
}

impl PlanCritic {
    pub fn new(tool_names: Vec<String>) -> Self {
        Self {
            tool_names,
            call_like: Regex::new(r"\b([a-z_][a-z0-9_]{2,})\s*\(").expect("static regex"),
        }
    }

    /// 返回问题列表；空列表表示计划可接受
    pub fn validate(&self, plan: &Plan) -> Vec<String> {
        let mut issues = Vec::new();

        if plan.steps.is_empty() {
            issues.push("plan has no steps".to_string());
            return issues;
        }
        if plan.steps.len() > plan.complexity.max_plan_steps() {
            issues.push(format!(
                "too many steps ({} > {})",
                plan.steps.len(),
                plan.complexity.max_plan_steps()
            ));
        }

        for (i, step) in plan.steps.iter().enumerate() {
            let label = format!("step {}", i + 1);
            if step.title.trim().is_empty() {
                issues.push(format!("{} has an empty title", label));
            }
            if step.instruction.trim().len() < 10 {
                issues.push(format!(
                    "{} instruction too vague: '{}'",
                    label, step.instruction
                ));
            }
            let lower = step.instruction.to_lowercase();
            if !ACTIONABLE_VERBS.iter().any(|v| lower.contains(v)) {
                issues.push(format!("{} has no actionable verb", label));
            }
            // 判据里出现形如 tool_name(...) 的引用时，必须是注册过的工具
            for criterion in &step.success_criteria {
                for cap in self.call_like.captures_iter(criterion) {
                    let name = cap.get(1).expect("group 1").as_str();
                    let known = self.tool_names.iter().any(|t| t == name);
                    let looks_like_tool = name.contains('_');
                    if looks_like_tool && !known {
                        issues.push(format!(
                            "{} success criterion references unknown tool '{}'",
                            label, name
                        ));
                    }
                }
            }
        }

        // 重复标题：多半是复制粘贴式幻觉
        let mut titles: Vec<String> = plan
            .steps
            .iter()
            .map(|s| s.title.to_lowercase().trim().to_string())
            .collect();
        titles.sort();
        titles.dedup();
        if titles.len() < plan.steps.len() {
            issues.push("plan contains duplicate step titles".to_string());
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::planner::{Complexity, PlanStep};

    fn critic() -> PlanCritic {
        PlanCritic::new(vec!["read_file".into(), "run_tests".into(), "shell".into()])
    }

    fn plan_with(steps: Vec<PlanStep>) -> Plan {
        Plan {
            goal: "goal".into(),
            complexity: Complexity::Medium,
            steps,
            assumptions: vec![],
        }
    }

    fn step(title: &str, instruction: &str) -> PlanStep {
        PlanStep {
            title: title.into(),
            instruction: instruction.into(),
            success_criteria: vec![],
            step_budget: 12,
        }
    }

    #[test]
    fn test_good_plan_passes() {
        let plan = plan_with(vec![
            step("Inspect failure", "Run the tests and read the error output"),
            step("Fix the bug", "Edit the parser to handle empty input"),
        ]);
        assert!(critic().validate(&plan).is_empty());
    }

    #[test]
    fn test_empty_plan_rejected() {
        let plan = plan_with(vec![]);
        let issues = critic().validate(&plan);
        assert_eq!(issues, vec!["plan has no steps".to_string()]);
    }

    #[test]
    fn test_vague_step_rejected() {
        let plan = plan_with(vec![step("Think", "hmm")]);
        let issues = critic().validate(&plan);
        assert!(issues.iter().any(|i| i.contains("too vague")));
    }

    #[test]
    fn test_no_verb_rejected() {
        let plan = plan_with(vec![step("Philosophy", "general considerations about architecture")]);
        let issues = critic().validate(&plan);
        assert!(issues.iter().any(|i| i.contains("no actionable verb")));
    }

    #[test]
    fn test_duplicate_titles_rejected() {
        let plan = plan_with(vec![
            step("Fix it", "Edit the file to fix the issue"),
            step("Fix it", "Edit the file to fix the issue again"),
        ]);
        let issues = critic().validate(&plan);
        assert!(issues.iter().any(|i| i.contains("duplicate")));
    }

    #[test]
    fn test_unknown_tool_in_criteria_rejected() {
        let mut s = step("Verify", "Run the checks to verify the change");
        s.success_criteria = vec!["deploy_to_prod(env) succeeds".into()];
        let plan = plan_with(vec![s]);
        let issues = critic().validate(&plan);
        assert!(issues.iter().any(|i| i.contains("unknown tool 'deploy_to_prod'")));
    }

    #[test]
    fn test_known_tool_in_criteria_ok() {
        let mut s = step("Verify", "Run the checks to verify the change");
        s.success_criteria = vec!["run_tests() reports 0 failures".into()];
        let plan = plan_with(vec![s]);
        assert!(critic().validate(&plan).is_empty());
    }
}
