//! OpenAI 兼容 HTTP 客户端
//!
//! 支持流式（SSE `data: ` 行，`data: [DONE]` 结束）与非流式两种路径，
//! 都归一为 LmResponse。传输层失败按 transport / timeout / rate_limited
//! 分类：429 或上游消息命中限流词表时解析冷却时长；5xx 与超时做指数退避
//! 重试（100ms x 2^k，上限 4s，共 3 次）；其余 4xx 立即失败。

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::context::{Message, Role, ToolCall};
use crate::events::{EventBus, HarnessEvent};
use crate::llm::parser::extract_thinking;
use crate::llm::router::ModelRouter;
use crate::llm::{ChatRequest, LlmClient, LlmError, LmResponse, Usage};
use crate::tools::rate_limit::{is_rate_limit_message, parse_retry_after};

/// 传输层重试次数与退避参数
const TRANSPORT_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 4000;

pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    router: ModelRouter,
    bus: EventBus,
    cancel: CancellationToken,
}

impl HttpLlmClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        router: ModelRouter,
        request_timeout: Duration,
        bus: EventBus,
        cancel: CancellationToken,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-local".to_string());
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            router,
            bus,
            cancel,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn payload(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(message_to_json).collect();
        let mut payload = json!({
            "model": self.router.resolve(request.tier),
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": request.stream,
        });
        if let Some(stop) = &request.stop {
            payload["stop"] = json!(stop);
        }
        payload
    }

    async fn send(&self, payload: &Value) -> Result<reqwest::Response, LlmError> {
        let mut last_err = String::new();
        for attempt in 0..TRANSPORT_RETRIES {
            if self.cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            let sent = self
                .http
                .post(self.endpoint())
                .bearer_auth(&self.api_key)
                .json(payload);
            let resp = tokio::select! {
                r = sent.send() => r,
                _ = self.cancel.cancelled() => return Err(LlmError::Cancelled),
            };
            match resp {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 429 {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(LlmError::RateLimited {
                            cooldown: parse_retry_after(&body),
                            detail: format!("HTTP 429: {}", head(&body)),
                        });
                    }
                    if status.is_server_error() {
                        last_err = format!("HTTP {}", status);
                        tracing::warn!(
                            attempt = attempt + 1,
                            status = %status,
                            "LLM server error, retrying"
                        );
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    if status.is_client_error() {
                        let body = resp.text().await.unwrap_or_default();
                        // 上游把限流放在错误正文里的情况
                        if is_rate_limit_message(&body) {
                            return Err(LlmError::RateLimited {
                                cooldown: parse_retry_after(&body),
                                detail: head(&body),
                            });
                        }
                        return Err(LlmError::Transport(format!(
                            "HTTP {}: {}",
                            status,
                            head(&body)
                        )));
                    }
                    return Ok(resp);
                }
                Err(e) if e.is_timeout() => {
                    last_err = e.to_string();
                    tracing::warn!(attempt = attempt + 1, "LLM request timeout, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => {
                    last_err = e.to_string();
                    tracing::warn!(attempt = attempt + 1, error = %e, "LLM transport error, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
        if last_err.contains("timed out") || last_err.contains("timeout") {
            Err(LlmError::Timeout(last_err))
        } else {
            Err(LlmError::Transport(format!(
                "exhausted {} attempts: {}",
                TRANSPORT_RETRIES, last_err
            )))
        }
    }

    async fn chat_once(&self, request: &ChatRequest) -> Result<LmResponse, LlmError> {
        let resp = self.send(&self.payload(request)).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::Transport(format!("malformed envelope: {e}")))?;

        if let Some(err) = body.get("error") {
            let msg = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown upstream error");
            if is_rate_limit_message(msg) {
                return Err(LlmError::RateLimited {
                    cooldown: parse_retry_after(msg),
                    detail: msg.to_string(),
                });
            }
            return Err(LlmError::Transport(msg.to_string()));
        }

        let choice = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .ok_or_else(|| LlmError::Transport("empty choices in envelope".into()))?;
        let message = choice.get("message").cloned().unwrap_or_default();
        let raw_content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let (thinking, assistant_text) = extract_thinking(&raw_content);

        Ok(LmResponse {
            assistant_text,
            thinking,
            tool_calls: native_tool_calls(message.get("tool_calls")),
            raw_chunks: raw_content,
            finish_reason: choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            usage: body
                .get("usage")
                .and_then(|u| serde_json::from_value(u.clone()).ok())
                .unwrap_or_default(),
        })
    }

    async fn chat_streaming(&self, request: &ChatRequest) -> Result<LmResponse, LlmError> {
        let resp = self.send(&self.payload(request)).await?;
        let mut stream = resp.bytes_stream();

        let mut pending = String::new();
        let mut content = String::new();
        let mut finish_reason = String::new();
        let mut usage = Usage::default();
        let mut accumulator = NativeCallAccumulator::default();

        loop {
            let chunk = tokio::select! {
                c = stream.next() => c,
                _ = self.cancel.cancelled() => return Err(LlmError::Cancelled),
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk.map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(e.to_string())
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;
            pending.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = pending.find('\n') {
                let line = pending[..pos].trim_end_matches('\r').to_string();
                pending.drain(..=pos);
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                if let Some(u) = event.get("usage") {
                    if let Ok(parsed) = serde_json::from_value::<Usage>(u.clone()) {
                        usage = parsed;
                    }
                }
                let Some(choice) = event
                    .get("choices")
                    .and_then(Value::as_array)
                    .and_then(|c| c.first())
                else {
                    continue;
                };
                if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                    finish_reason = reason.to_string();
                }
                let Some(delta) = choice.get("delta") else {
                    continue;
                };
                if let Some(text) = delta.get("content").and_then(Value::as_str) {
                    if !text.is_empty() {
                        content.push_str(text);
                        self.bus.emit(HarnessEvent::LmTokenChunk {
                            text: text.to_string(),
                        });
                    }
                }
                accumulator.feed(delta.get("tool_calls"));
            }
        }

        let (thinking, assistant_text) = extract_thinking(&content);
        Ok(LmResponse {
            assistant_text,
            thinking,
            tool_calls: accumulator.finalize(),
            raw_chunks: content,
            finish_reason,
            usage,
        })
    }
}

#[async_trait::async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(&self, request: &ChatRequest) -> Result<LmResponse, LlmError> {
        if request.stream {
            self.chat_streaming(request).await
        } else {
            self.chat_once(request).await
        }
    }
}

/// 流式原生工具调用累积器：各 index 的 name 只出现一次，
/// arguments 以片段形式到达需要拼接
#[derive(Default)]
struct NativeCallAccumulator {
    calls: std::collections::BTreeMap<u64, (String, String)>,
}

impl NativeCallAccumulator {
    fn feed(&mut self, delta_calls: Option<&Value>) {
        let Some(list) = delta_calls.and_then(Value::as_array) else {
            return;
        };
        for tc in list {
            let idx = tc.get("index").and_then(Value::as_u64).unwrap_or(0);
            let entry = self.calls.entry(idx).or_default();
            let func = tc.get("function").cloned().unwrap_or_default();
            if let Some(name) = func.get("name").and_then(Value::as_str) {
                if !name.is_empty() {
                    entry.0 = name.to_string();
                }
            }
            if let Some(args) = func.get("arguments").and_then(Value::as_str) {
                entry.1.push_str(args);
            }
        }
    }

    fn finalize(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, raw_args)| {
                let args = if raw_args.is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&raw_args).unwrap_or(json!({}))
                };
                ToolCall::new(name, args)
            })
            .collect()
    }
}

fn native_tool_calls(value: Option<&Value>) -> Vec<ToolCall> {
    let Some(list) = value.and_then(Value::as_array) else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|tc| {
            let func = tc.get("function")?;
            let name = func.get("name").and_then(Value::as_str)?;
            let args = match func.get("arguments") {
                Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(json!({})),
                Some(v) => v.clone(),
                None => json!({}),
            };
            let mut call = ToolCall::new(name, args);
            if let Some(id) = tc.get("id").and_then(Value::as_str) {
                call.id = id.to_string();
            }
            Some(call)
        })
        .collect()
}

fn message_to_json(m: &Message) -> Value {
    let mut obj = json!({
        "role": m.role.as_str(),
        "content": m.content,
    });
    if m.role == Role::Tool {
        if let Some(id) = &m.tool_call_id {
            obj["tool_call_id"] = json!(id);
        }
        if let Some(name) = &m.name {
            obj["name"] = json!(name);
        }
    }
    if !m.tool_calls.is_empty() {
        obj["tool_calls"] = json!(m
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": {
                        "name": c.name,
                        "arguments": c.arguments.to_string(),
                    }
                })
            })
            .collect::<Vec<_>>());
    }
    obj
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis((BACKOFF_BASE_MS << attempt).min(BACKOFF_CAP_MS))
}

fn head(text: &str) -> String {
    text.chars().take(200).collect()
}
