//! 限流检测与外部智能体冷却路由
//!
//! 词表匹配合并的 stdout+stderr（只扫前 2000 字符，限流提示都在开头），
//! 解析 "try again in N minutes" 类提示得到冷却时长；AgentRateLimiter
//! 记录各外部智能体的冷却截止时间并按固定顺序环形回退。

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;

/// 解析不出重试提示时的默认冷却（15 分钟）
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(15 * 60);

/// 只扫描输出开头这么多字符
const SCAN_LIMIT: usize = 2000;

/// 外部智能体的固定回退顺序（环形，跳过冷却中的）
pub const FALLBACK_ORDER: [&str; 3] = ["claude_code", "codex", "gemini_cli"];

fn lexicon() -> &'static Vec<Regex> {
    static LEXICON: OnceLock<Vec<Regex>> = OnceLock::new();
    LEXICON.get_or_init(|| {
        [
            r"(?i)rate.?limit",
            r"(?i)quota",
            r"(?i)too many requests",
            r"(?i)\b429\b",
            r"(?i)usage.?limit",
            r"(?i)try again (in|after)",
            r"(?i)throttl",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
    })
}

fn retry_after_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(?:retry|try\s+again|wait|available|resets?)[\s:]+(?:(?:in|after)\s+)?(\d+)\s*(second|minute|hour|sec|min|hr|s\b|m\b|h\b)",
        )
        .expect("static regex")
    })
}

/// 输出是否命中限流词表
pub fn is_rate_limit_message(output: &str) -> bool {
    let head: String = output.chars().take(SCAN_LIMIT).collect();
    lexicon().iter().any(|re| re.is_match(&head))
}

/// 从输出中解析建议冷却时长；解析不出返回默认 15 分钟
pub fn parse_retry_after(output: &str) -> Duration {
    let head: String = output.chars().take(SCAN_LIMIT).collect();
    let Some(cap) = retry_after_pattern().captures(&head) else {
        return DEFAULT_COOLDOWN;
    };
    let value: u64 = cap
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    if value == 0 {
        return DEFAULT_COOLDOWN;
    }
    let unit = cap.get(2).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
    if unit.starts_with('h') {
        Duration::from_secs(value * 3600)
    } else if unit.starts_with('m') {
        Duration::from_secs(value * 60)
    } else {
        Duration::from_secs(value)
    }
}

/// 外部智能体冷却表
#[derive(Debug, Default)]
pub struct AgentRateLimiter {
    cooldowns: HashMap<String, Instant>,
}

impl AgentRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_available(&mut self, agent: &str) -> bool {
        match self.cooldowns.get(agent) {
            Some(until) if Instant::now() < *until => false,
            Some(_) => {
                self.cooldowns.remove(agent);
                true
            }
            None => true,
        }
    }

    /// 记录限流；返回冷却时长
    pub fn record(&mut self, agent: &str, output: &str) -> Duration {
        let cooldown = parse_retry_after(output);
        self.cooldowns
            .insert(agent.to_string(), Instant::now() + cooldown);
        tracing::warn!(agent, cooldown_secs = cooldown.as_secs(), "agent rate-limited");
        cooldown
    }

    /// 从 preferred 开始按环形顺序找下一个可用且已注册的智能体。
    /// registered 为启动探测后实际存在的智能体名集合。
    pub fn next_available(&mut self, preferred: &str, registered: &[String]) -> Option<String> {
        let start = FALLBACK_ORDER
            .iter()
            .position(|n| *n == preferred)
            .unwrap_or(0);
        for offset in 0..FALLBACK_ORDER.len() {
            let name = FALLBACK_ORDER[(start + offset) % FALLBACK_ORDER.len()];
            if registered.iter().any(|r| r == name) && self.is_available(name) {
                return Some(name.to_string());
            }
        }
        None
    }

    /// 最近的冷却到期还有多久（全部冷却时的失败提示用）
    pub fn earliest_recovery(&self) -> Option<Duration> {
        let now = Instant::now();
        self.cooldowns
            .values()
            .map(|until| until.saturating_duration_since(now))
            .min()
    }
}
