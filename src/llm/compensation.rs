//! 补偿管线：把弱模型的坏轮次修成可用轮次
//!
//! 包装一次 LLM 轮：分类失败后先做最便宜的修复（能不重新调模型就不调），
//! 修不动再按 refine_prompt -> add_examples -> escalate_model 的顺序消耗
//! 重试策略，每个策略是幂等的请求调整器、整个尝试链内至多用一次。
//! 三个策略耗尽仍失败即产出终局失败，结束当前计划步。

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::context::ToolCall;
use crate::core::{Failure, FailureClass, HarnessError};
use crate::events::{EventBus, HarnessEvent};
use crate::llm::parser::ResponseParser;
use crate::llm::{ChatRequest, LlmClient, LmResponse};
use crate::tools::ToolRegistry;

/// 一次补偿动作的记录（目标结束后汇总进统计）
#[derive(Debug, Clone)]
pub struct CompensationRecord {
    pub class: FailureClass,
    pub strategy: String,
}

/// 管线成功的产物：可用回复 + 提取出的调用 + 剩余叙述
#[derive(Debug)]
pub struct TurnOutcome {
    pub response: LmResponse,
    pub calls: Vec<ToolCall>,
    pub narrative: String,
    pub records: Vec<CompensationRecord>,
    /// 本轮最终使用的分层（升级过则为升级后的值，目标内保持）
    pub final_request: ChatRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    RefinePrompt,
    AddExamples,
    EscalateModel,
}

impl Strategy {
    fn name(&self) -> &'static str {
        match self {
            Strategy::RefinePrompt => "refine_prompt",
            Strategy::AddExamples => "add_examples",
            Strategy::EscalateModel => "escalate_model",
        }
    }
}

#[derive(Default)]
struct ConsumedSet {
    refine: bool,
    examples: bool,
    escalate: bool,
}

impl ConsumedSet {
    fn is_consumed(&self, s: Strategy) -> bool {
        match s {
            Strategy::RefinePrompt => self.refine,
            Strategy::AddExamples => self.examples,
            Strategy::EscalateModel => self.escalate,
        }
    }

    fn consume(&mut self, s: Strategy) {
        match s {
            Strategy::RefinePrompt => self.refine = true,
            Strategy::AddExamples => self.examples = true,
            Strategy::EscalateModel => self.escalate = true,
        }
    }
}

/// 评估结果：调用列表 + 可能的失败
struct Evaluated {
    calls: Vec<ToolCall>,
    narrative: String,
    failure: Option<Failure>,
}

pub struct CompensationPipeline {
    pub max_retries: usize,
    /// LLM 被限流时愿意原地等待的上限；超过直接失败
    pub max_rate_limit_wait: Duration,
}

impl CompensationPipeline {
    pub fn new(max_retries: usize, max_rate_limit_wait: Duration) -> Self {
        Self {
            max_retries,
            max_rate_limit_wait,
        }
    }

    /// 执行一次带补偿的 LLM 轮
    pub async fn run_turn(
        &self,
        client: &dyn LlmClient,
        parser: &ResponseParser,
        registry: &ToolRegistry,
        mut request: ChatRequest,
        bus: &EventBus,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, HarnessError> {
        let mut records: Vec<CompensationRecord> = Vec::new();
        let mut consumed = ConsumedSet::default();
        let mut retries = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(HarnessError::Cancelled);
            }

            let response = match client.chat(&request).await {
                Ok(r) => r,
                Err(crate::llm::LlmError::RateLimited { cooldown, detail }) => {
                    if cooldown <= self.max_rate_limit_wait && retries < self.max_retries {
                        tracing::warn!(
                            cooldown_secs = cooldown.as_secs(),
                            "LLM rate-limited, waiting out the cooldown"
                        );
                        records.push(CompensationRecord {
                            class: FailureClass::RateLimited,
                            strategy: "wait_cooldown".into(),
                        });
                        bus.emit(HarnessEvent::Compensation {
                            class: FailureClass::RateLimited,
                            strategy: "wait_cooldown".into(),
                        });
                        retries += 1;
                        tokio::select! {
                            _ = tokio::time::sleep(cooldown) => {}
                            _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                        }
                        continue;
                    }
                    return Err(HarnessError::RateLimited {
                        cooldown_secs: cooldown.as_secs(),
                        detail,
                    });
                }
                Err(e) => return Err(e.into()),
            };

            let mut evaluated = evaluate(&response, parser, registry);

            // 最便宜的修复：未知工具名先试模糊匹配，不经过 LLM
            if matches!(
                evaluated.failure,
                Some(Failure {
                    class: FailureClass::WrongToolName,
                    ..
                })
            ) {
                if let Some(fixed) = auto_fuzzy_fix(&evaluated.calls, parser, registry) {
                    records.push(CompensationRecord {
                        class: FailureClass::WrongToolName,
                        strategy: "auto_fuzzy".into(),
                    });
                    bus.emit(HarnessEvent::Compensation {
                        class: FailureClass::WrongToolName,
                        strategy: "auto_fuzzy".into(),
                    });
                    evaluated = Evaluated {
                        failure: validate_calls(&fixed, registry),
                        calls: fixed,
                        narrative: evaluated.narrative,
                    };
                }
            }

            let Some(failure) = evaluated.failure else {
                return Ok(TurnOutcome {
                    response,
                    calls: evaluated.calls,
                    narrative: evaluated.narrative,
                    records,
                    final_request: request,
                });
            };

            if retries >= self.max_retries {
                return Err(HarnessError::CompensationExhausted {
                    class: failure.class,
                    detail: failure.detail,
                });
            }

            let Some(strategy) = pick_strategy(failure.class, &consumed) else {
                return Err(HarnessError::CompensationExhausted {
                    class: failure.class,
                    detail: failure.detail,
                });
            };

            tracing::info!(
                class = failure.class.as_str(),
                strategy = strategy.name(),
                retry = retries + 1,
                "compensating failed turn"
            );
            records.push(CompensationRecord {
                class: failure.class,
                strategy: strategy.name().into(),
            });
            bus.emit(HarnessEvent::Compensation {
                class: failure.class,
                strategy: strategy.name().into(),
            });

            request = match strategy {
                Strategy::RefinePrompt => {
                    consumed.consume(strategy);
                    refine_prompt(&request, &response, &failure, parser, registry)
                }
                Strategy::AddExamples => {
                    consumed.consume(strategy);
                    add_examples(&request, &response, &failure)
                }
                Strategy::EscalateModel => {
                    consumed.consume(strategy);
                    match escalate_model(&request) {
                        Some(next) => next,
                        None => {
                            return Err(HarnessError::CompensationExhausted {
                                class: failure.class,
                                detail: format!(
                                    "{} (already at largest tier)",
                                    failure.detail
                                ),
                            })
                        }
                    }
                }
            };
            retries += 1;
        }
    }
}

/// 分类一次轮结果；规则自上而下，首个命中生效
fn evaluate(response: &LmResponse, parser: &ResponseParser, registry: &ToolRegistry) -> Evaluated {
    // 优先级 1：传输层原生调用，直接信任（仍需校验名字与参数）
    if !response.tool_calls.is_empty() {
        let calls = response.tool_calls.clone();
        let failure = validate_calls(&calls, registry);
        return Evaluated {
            calls,
            narrative: response.assistant_text.clone(),
            failure,
        };
    }

    if response.is_empty() {
        return Evaluated {
            calls: Vec::new(),
            narrative: String::new(),
            failure: Some(Failure::new(
                FailureClass::EmptyResponse,
                "no assistant text and no tool calls",
            )),
        };
    }

    let report = parser.parse(&response.assistant_text);
    if report.calls.is_empty() {
        if !report.malformed.is_empty() {
            return Evaluated {
                calls: Vec::new(),
                narrative: report.narrative,
                failure: Some(Failure::new(
                    FailureClass::MalformedJson,
                    format!("JSON repair failed on: {}", head(&report.malformed[0])),
                )),
            };
        }
        if looks_like_wrapped_call(&response.assistant_text) {
            return Evaluated {
                calls: Vec::new(),
                narrative: report.narrative,
                failure: Some(Failure::new(
                    FailureClass::ProseWrapped,
                    "response mentions a tool call but no extractor matched",
                )),
            };
        }
        // 干净的文本回答
        return Evaluated {
            calls: Vec::new(),
            narrative: report.narrative,
            failure: None,
        };
    }

    let failure = validate_calls(&report.calls, registry);
    Evaluated {
        calls: report.calls,
        narrative: report.narrative,
        failure,
    }
}

/// 校验调用：未知名 -> wrong_tool_name，缺必填参数 -> missing_args
fn validate_calls(calls: &[ToolCall], registry: &ToolRegistry) -> Option<Failure> {
    for call in calls {
        if !registry.contains(&call.name) {
            return Some(Failure::new(
                FailureClass::WrongToolName,
                format!("unknown tool: {}", call.name),
            ));
        }
        if let Err(missing) = registry.validate_args(&call.name, &call.arguments) {
            return Some(Failure::new(
                FailureClass::MissingArgs,
                format!("{}: missing required args: {}", call.name, missing.join(", ")),
            ));
        }
    }
    None
}

/// 全部未知名都能模糊解析且改名后参数仍有效时，返回改名后的调用列表
fn auto_fuzzy_fix(
    calls: &[ToolCall],
    parser: &ResponseParser,
    registry: &ToolRegistry,
) -> Option<Vec<ToolCall>> {
    let mut fixed = calls.to_vec();
    for call in fixed.iter_mut() {
        if registry.contains(&call.name) {
            continue;
        }
        let matched = parser.fuzzy_match(&call.name)?;
        if registry.validate_args(matched, &call.arguments).is_err() {
            return None;
        }
        tracing::info!(from = %call.name, to = matched, "fuzzy-matched tool name");
        call.name = matched.to_string();
    }
    Some(fixed)
}

fn looks_like_wrapped_call(text: &str) -> bool {
    // 形如 {"tool" ... 的痕迹存在但没有任何提取器命中
    text.contains("\"tool\"") && text.contains('{')
}

fn pick_strategy(class: FailureClass, consumed: &ConsumedSet) -> Option<Strategy> {
    use Strategy::*;
    let order: &[Strategy] = match class {
        // 空回复不值得换提示词，直接升级
        FailureClass::EmptyResponse => &[EscalateModel],
        // 缺参数：注入 schema 重试，不行就升级
        FailureClass::MissingArgs => &[RefinePrompt, EscalateModel, AddExamples],
        _ => &[RefinePrompt, AddExamples, EscalateModel],
    };
    order.iter().copied().find(|s| !consumed.is_consumed(*s))
}

/// 策略一：把失败原文与纠正指令追加进对话
fn refine_prompt(
    request: &ChatRequest,
    response: &LmResponse,
    failure: &Failure,
    parser: &ResponseParser,
    registry: &ToolRegistry,
) -> ChatRequest {
    let mut extra = String::new();
    match failure.class {
        FailureClass::WrongToolName => {
            if let Some(wrong) = failure.detail.strip_prefix("unknown tool: ") {
                if let Some(suggestion) = parser.fuzzy_match(wrong) {
                    extra.push_str(&format!(" Did you mean '{}'?", suggestion));
                }
            }
            extra.push_str(&format!(
                "\nRegistered tools: {}",
                parser.tool_names().join(", ")
            ));
        }
        FailureClass::MissingArgs => {
            if let Some(name) = failure.detail.split(':').next() {
                if let Some(brief) = registry.schema_brief(name) {
                    extra.push_str(&format!("\nArgument schema for {}:\n{}", name, brief));
                }
            }
        }
        _ => {}
    }
    let correction = format!(
        "Your previous response could not be processed. Error: {}{}\n\n\
         Please try again. To use a tool, respond with ONLY:\n\
         {{\"tool\": \"tool_name\", \"args\": {{\"param\": \"value\"}}}}\n\
         To answer normally, just write text.",
        failure.detail, extra
    );
    let mut next = request.clone();
    next.messages
        .push(crate::context::Message::assistant(&*response.assistant_text));
    next.messages.push(crate::context::Message::user(correction));
    next
}

/// 策略二：追加具体的工具调用示例
fn add_examples(request: &ChatRequest, response: &LmResponse, failure: &Failure) -> ChatRequest {
    let example = format!(
        "Error: {}\n\nExamples of correct tool usage:\n\
         {{\"tool\": \"shell\", \"args\": {{\"command\": \"ls -la\"}}}}\n\
         {{\"tool\": \"read_file\", \"args\": {{\"path\": \"src/main.rs\"}}}}\n\
         Normal response (no tool): just write text.\nTry again.",
        failure.detail
    );
    let mut next = request.clone();
    next.messages
        .push(crate::context::Message::assistant(&*response.assistant_text));
    next.messages.push(crate::context::Message::user(example));
    next
}

/// 策略三：升一级模型；已在最大层返回 None
fn escalate_model(request: &ChatRequest) -> Option<ChatRequest> {
    let next_tier = request.tier.escalate()?;
    let mut next = request.clone();
    next.tier = next_tier;
    Some(next)
}

fn head(text: &str) -> String {
    text.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Message;
    use crate::llm::mock::MockLlm;
    use crate::llm::ModelTier;
    use crate::tools::test_support::test_registry;

    fn pipeline() -> CompensationPipeline {
        CompensationPipeline::new(3, Duration::from_secs(1))
    }

    fn request() -> ChatRequest {
        ChatRequest::new(vec![Message::user("fix it")], ModelTier::Small)
    }

    fn parser_for(registry: &ToolRegistry) -> ResponseParser {
        ResponseParser::new(&registry.names())
    }

    #[tokio::test]
    async fn test_malformed_json_repaired_without_retry() {
        let registry = test_registry();
        let parser = parser_for(&registry);
        let mock = MockLlm::new();
        // 尾逗号 + 单引号：解析器一次修复，不应消耗任何 LLM 重试
        mock.push_text("edit_file({'path': 'a.py', 'find': 'x', 'replace': 'y',})");

        let outcome = pipeline()
            .run_turn(
                &mock,
                &parser,
                &registry,
                request(),
                &EventBus::new(),
                &CancellationToken::new(),
            )
            .await
            .expect("turn should succeed");

        assert_eq!(outcome.calls.len(), 1);
        assert_eq!(outcome.calls[0].name, "edit_file");
        assert_eq!(outcome.calls[0].arguments["path"], "a.py");
        assert!(outcome.records.is_empty(), "no compensation expected");
        assert_eq!(mock.remaining(), 0);
    }

    #[tokio::test]
    async fn test_wrong_tool_name_fuzzy_accepted() {
        let registry = test_registry();
        let parser = parser_for(&registry);
        let mock = MockLlm::new();
        mock.push_text(r#"{"tool": "read_files", "args": {"path": "src/x.py"}}"#);

        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let outcome = pipeline()
            .run_turn(
                &mock,
                &parser,
                &registry,
                request(),
                &bus,
                &CancellationToken::new(),
            )
            .await
            .expect("fuzzy match should rescue the turn");

        assert_eq!(outcome.calls[0].name, "read_file");
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].strategy, "auto_fuzzy");
        match rx.try_recv() {
            Some(HarnessEvent::Compensation { class, strategy }) => {
                assert_eq!(class, FailureClass::WrongToolName);
                assert_eq!(strategy, "auto_fuzzy");
            }
            other => panic!("expected Compensation event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_response_escalates_tier() {
        let registry = test_registry();
        let parser = parser_for(&registry);
        let mock = MockLlm::new();
        mock.push_response(LmResponse::default()); // 空回复
        mock.push_text("All done, nothing to change.");

        let outcome = pipeline()
            .run_turn(
                &mock,
                &parser,
                &registry,
                request(),
                &EventBus::new(),
                &CancellationToken::new(),
            )
            .await
            .expect("second attempt succeeds");

        let tiers = mock.tiers_seen.lock().unwrap().clone();
        assert_eq!(tiers, vec![ModelTier::Small, ModelTier::Medium]);
        assert_eq!(outcome.final_request.tier, ModelTier::Medium);
        assert_eq!(outcome.records[0].strategy, "escalate_model");
    }

    #[tokio::test]
    async fn test_empty_at_largest_tier_is_terminal() {
        let registry = test_registry();
        let parser = parser_for(&registry);
        let mock = MockLlm::new();
        mock.push_response(LmResponse::default());

        let mut req = request();
        req.tier = ModelTier::Large;
        let err = pipeline()
            .run_turn(
                &mock,
                &parser,
                &registry,
                req,
                &EventBus::new(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("cannot escalate past large");
        match err {
            HarnessError::CompensationExhausted { class, .. } => {
                assert_eq!(class, FailureClass::EmptyResponse)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_args_refined_with_schema() {
        let registry = test_registry();
        let parser = parser_for(&registry);
        let mock = MockLlm::new();
        mock.push_text(r#"{"tool": "edit_file", "args": {"path": "a.py"}}"#);
        mock.push_text(
            r#"{"tool": "edit_file", "args": {"path": "a.py", "find": "x", "replace": "y"}}"#,
        );

        let outcome = pipeline()
            .run_turn(
                &mock,
                &parser,
                &registry,
                request(),
                &EventBus::new(),
                &CancellationToken::new(),
            )
            .await
            .expect("refined attempt succeeds");

        assert_eq!(outcome.records[0].class, FailureClass::MissingArgs);
        assert_eq!(outcome.records[0].strategy, "refine_prompt");
        // 纠正消息里应带上参数 schema
        let refined = &outcome.final_request.messages;
        let correction = &refined[refined.len() - 1].content;
        assert!(correction.contains("find"), "schema injected: {correction}");
    }

    #[tokio::test]
    async fn test_strategies_exhaust_to_terminal_failure() {
        let registry = test_registry();
        let parser = parser_for(&registry);
        let mock = MockLlm::new();
        for _ in 0..4 {
            mock.push_text(r#"I would use {"tool": "#); // 永远是坏 JSON
        }

        let err = pipeline()
            .run_turn(
                &mock,
                &parser,
                &registry,
                request(),
                &EventBus::new(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("must exhaust");
        assert!(matches!(err, HarnessError::CompensationExhausted { .. }));
    }

    #[tokio::test]
    async fn test_short_rate_limit_waited_out() {
        let registry = test_registry();
        let parser = parser_for(&registry);
        let mock = MockLlm::new();
        mock.push_error(crate::llm::LlmError::RateLimited {
            cooldown: Duration::from_millis(20),
            detail: "429".into(),
        });
        mock.push_text("Done.");

        let outcome = pipeline()
            .run_turn(
                &mock,
                &parser,
                &registry,
                request(),
                &EventBus::new(),
                &CancellationToken::new(),
            )
            .await
            .expect("waits out short cooldown");
        assert_eq!(outcome.records[0].strategy, "wait_cooldown");
    }

    #[tokio::test]
    async fn test_long_rate_limit_is_terminal() {
        let registry = test_registry();
        let parser = parser_for(&registry);
        let mock = MockLlm::new();
        mock.push_error(crate::llm::LlmError::RateLimited {
            cooldown: Duration::from_secs(900),
            detail: "try again in 15 minutes".into(),
        });

        let err = pipeline()
            .run_turn(
                &mock,
                &parser,
                &registry,
                request(),
                &EventBus::new(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("long cooldown fails fast");
        assert!(matches!(err, HarnessError::RateLimited { .. }));
    }

    #[test]
    fn test_adjusters_are_pure() {
        let registry = test_registry();
        let parser = parser_for(&registry);
        let req = request();
        let resp = LmResponse {
            assistant_text: "bad".into(),
            ..Default::default()
        };
        let failure = Failure::new(FailureClass::MalformedJson, "boom");
        let before = req.messages.len();
        let a = refine_prompt(&req, &resp, &failure, &parser, &registry);
        let b = refine_prompt(&req, &resp, &failure, &parser, &registry);
        assert_eq!(req.messages.len(), before, "input request untouched");
        assert_eq!(a.messages.len(), b.messages.len());
        assert_eq!(
            a.messages.last().unwrap().content,
            b.messages.last().unwrap().content
        );
    }

    #[test]
    fn test_every_failure_gets_exactly_one_class() {
        let registry = test_registry();
        let parser = parser_for(&registry);
        // 各种坏轮都恰好落入一类
        let cases: Vec<(LmResponse, FailureClass)> = vec![
            (LmResponse::default(), FailureClass::EmptyResponse),
            (
                LmResponse {
                    assistant_text: r#"{"tool": "no_such_tool", "args": {}}"#.into(),
                    ..Default::default()
                },
                FailureClass::WrongToolName,
            ),
            (
                LmResponse {
                    assistant_text: r#"{"tool": "edit_file", "args": {"path": "a"}}"#.into(),
                    ..Default::default()
                },
                FailureClass::MissingArgs,
            ),
            (
                LmResponse {
                    assistant_text: r#"{"tool": "shell", "args": {{{"#.into(),
                    ..Default::default()
                },
                FailureClass::MalformedJson,
            ),
        ];
        for (resp, want) in cases {
            let evaluated = evaluate(&resp, &parser, &registry);
            let got = evaluated.failure.expect("must classify").class;
            assert_eq!(got, want);
        }
    }
}
