//! 回复解析器：从嘈杂的助手文本中提取工具调用
//!
//! schema 优先：注册过的工具名编译成一个备选正则，用来定位候选调用点。
//! 接受的形态按优先级：传输层原生字段（调用方直接信任，不经过本模块）、
//! ```json 围栏块、散文中的 `name({...})` / `name args={...}` 行、
//! `<tool_call>...</tool_call>` 跨度、裸 `{"tool": ...}` 对象。每个候选
//! 先走一遍 JSON 修复（尾逗号、单引号、裸键、Python 字面量、括号配平）。

use regex::Regex;
use serde_json::Value;

use crate::context::ToolCall;

/// 模糊匹配允许的最大编辑距离
const FUZZY_MAX_DISTANCE: usize = 2;

/// 一次解析的结果
#[derive(Debug, Default)]
pub struct ParseReport {
    /// 提取出的调用（名字可能未注册，由分类器判定）
    pub calls: Vec<ToolCall>,
    /// 看起来像调用但修复后仍解析失败的原文片段
    pub malformed: Vec<String>,
    /// 去除调用片段后的剩余叙述
    pub narrative: String,
}

pub struct ResponseParser {
    names: Vec<String>,
    /// `{"tool": "<已注册名>"` 的快速定位正则
    known_pattern: Option<Regex>,
    /// `name({...})` 与 `name args={...}` 形态
    call_pattern: Option<Regex>,
    fenced: Regex,
    tagged: Regex,
    bare_tool: Regex,
    bare_alt: Regex,
}

impl ResponseParser {
    pub fn new(tool_names: &[String]) -> Self {
        let names: Vec<String> = tool_names.to_vec();
        let (known_pattern, call_pattern) = if names.is_empty() {
            (None, None)
        } else {
            let alt = names
                .iter()
                .map(|n| regex::escape(n))
                .collect::<Vec<_>>()
                .join("|");
            (
                Regex::new(&format!(r#"\{{\s*"tool"\s*:\s*"({alt})""#)).ok(),
                Regex::new(&format!(r"(?m)\b({alt})\s*(?:\(|args\s*=\s*)")).ok(),
            )
        };
        Self {
            names,
            known_pattern,
            call_pattern,
            fenced: Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("static regex"),
            tagged: Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").expect("static regex"),
            bare_tool: Regex::new(r#"\{\s*"tool"\s*:"#).expect("static regex"),
            bare_alt: Regex::new(r#"\{\s*"tool_call"\s*:"#).expect("static regex"),
        }
    }

    /// 解析助手文本。按优先级尝试各形态，第一个产出调用的形态生效。
    pub fn parse(&self, text: &str) -> ParseReport {
        let mut report = ParseReport::default();
        let mut consumed: Vec<(usize, usize)> = Vec::new();

        // 形态 1：```json 围栏块
        for cap in self.fenced.captures_iter(text) {
            let whole = cap.get(0).expect("group 0");
            let inner = cap.get(1).expect("group 1").as_str().trim();
            if !inner.starts_with('{') && !inner.starts_with('[') {
                continue;
            }
            match repair_json(inner) {
                Ok(value) => {
                    let found = calls_from_value(&value);
                    if !found.is_empty() {
                        report.calls.extend(found);
                        consumed.push((whole.start(), whole.end()));
                    }
                }
                Err(_) => report.malformed.push(inner.to_string()),
            }
        }

        // 形态 2：散文中的 name({...}) / name args={...}
        if report.calls.is_empty() {
            if let Some(re) = &self.call_pattern {
                for cap in re.captures_iter(text) {
                    let whole = cap.get(0).expect("group 0");
                    let name = cap.get(1).expect("group 1").as_str();
                    let brace = match text[whole.end()..].find('{') {
                        Some(off) => whole.end() + off,
                        None => continue,
                    };
                    // 括号与调用名之间只容忍少量空白
                    if text[whole.end()..brace].trim().len() > 1 {
                        continue;
                    }
                    let Some(span) = extract_balanced(text, brace) else {
                        report.malformed.push(text[whole.start()..].chars().take(120).collect());
                        continue;
                    };
                    match repair_json(span) {
                        Ok(args) => {
                            report.calls.push(ToolCall::new(name, normalize_args(args)));
                            consumed.push((whole.start(), brace + span.len()));
                        }
                        Err(_) => report.malformed.push(span.to_string()),
                    }
                }
            }
        }

        // 形态 3：<tool_call> 标签跨度
        if report.calls.is_empty() {
            for cap in self.tagged.captures_iter(text) {
                let whole = cap.get(0).expect("group 0");
                let inner = cap.get(1).expect("group 1").as_str().trim();
                match repair_json(inner) {
                    Ok(value) => {
                        let found = calls_from_value(&value);
                        if !found.is_empty() {
                            report.calls.extend(found);
                            consumed.push((whole.start(), whole.end()));
                        }
                    }
                    Err(_) => report.malformed.push(inner.to_string()),
                }
            }
        }

        // 形态 4：裸 {"tool": ...}（schema 优先正则短路，退化为通用形态）
        if report.calls.is_empty() {
            let starts: Vec<usize> = self
                .known_pattern
                .iter()
                .flat_map(|re| re.find_iter(text).map(|m| m.start()))
                .chain(self.bare_tool.find_iter(text).map(|m| m.start()))
                .chain(self.bare_alt.find_iter(text).map(|m| m.start()))
                .collect();
            let mut seen = std::collections::HashSet::new();
            for start in starts {
                if !seen.insert(start) {
                    continue;
                }
                let Some(span) = extract_balanced(text, start) else {
                    // 括号不配平也交给修复器试一次
                    match repair_json(&text[start..]) {
                        Ok(value) => {
                            report.calls.extend(calls_from_value(&value));
                            consumed.push((start, text.len()));
                        }
                        Err(_) => report
                            .malformed
                            .push(text[start..].chars().take(200).collect()),
                    }
                    continue;
                };
                match repair_json(span) {
                    Ok(value) => {
                        let found = calls_from_value(&value);
                        if !found.is_empty() {
                            report.calls.extend(found);
                            consumed.push((start, start + span.len()));
                        }
                    }
                    Err(_) => report.malformed.push(span.to_string()),
                }
            }
        }

        // 形态 5：整段文本就是一个 JSON 对象
        if report.calls.is_empty() && report.malformed.is_empty() {
            let trimmed = text.trim();
            if trimmed.starts_with('{') {
                match repair_json(trimmed) {
                    Ok(value) => {
                        let found = calls_from_value(&value);
                        if !found.is_empty() {
                            report.calls.extend(found);
                            consumed.push((0, text.len()));
                        }
                    }
                    Err(_) => report.malformed.push(trimmed.chars().take(200).collect()),
                }
            }
        }

        report.narrative = strip_ranges(text, &mut consumed);
        report
    }

    /// 对未注册名做模糊匹配：大小写不敏感，编辑距离 <= 2，取距离最小者
    pub fn fuzzy_match(&self, wrong: &str) -> Option<&str> {
        let wrong = wrong.to_lowercase().replace(['-', ' '], "_");
        let mut best: Option<(usize, &str)> = None;
        for name in &self.names {
            if let Some(d) = edit_distance_capped(&wrong, &name.to_lowercase(), FUZZY_MAX_DISTANCE)
            {
                match best {
                    Some((bd, bn)) if (d, name.as_str()) >= (bd, bn) => {}
                    _ => best = Some((d, name)),
                }
            }
        }
        best.map(|(_, n)| n)
    }

    pub fn tool_names(&self) -> &[String] {
        &self.names
    }
}

/// 从修复后的 JSON 值提取调用；接受对象或对象数组，
/// 键名容忍 tool/name 与 arguments/args 两套写法，以及 {"tool_call": {...}} 包装
fn calls_from_value(value: &Value) -> Vec<ToolCall> {
    match value {
        Value::Array(items) => items.iter().flat_map(calls_from_value).collect(),
        Value::Object(map) => {
            if let Some(inner) = map.get("tool_call") {
                return calls_from_value(inner);
            }
            let name = map
                .get("tool")
                .or_else(|| map.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if name.is_empty() {
                return Vec::new();
            }
            let args = map
                .get("arguments")
                .or_else(|| map.get("args"))
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            vec![ToolCall::new(name, normalize_args(args))]
        }
        _ => Vec::new(),
    }
}

/// 参数归一：字符串先尝试按 JSON 再解析一层，失败则包成 {"prompt": s}
fn normalize_args(args: Value) -> Value {
    match args {
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(v @ Value::Object(_)) => v,
            _ => serde_json::json!({ "prompt": s }),
        },
        Value::Object(_) => args,
        other => serde_json::json!({ "value": other }),
    }
}

/// 从 start（必须是 '{'）提取配平的 JSON 对象，正确处理字符串与转义
fn extract_balanced(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    if start >= bytes.len() || bytes[start] != b'{' {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escape {
            escape = false;
            continue;
        }
        match b {
            b'\\' => escape = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// JSON 修复：宽容尾逗号、单引号字符串、裸键、True/False/None、
/// 外层括号不配平。返回解析值或最后一次解码错误文本。
pub fn repair_json(raw: &str) -> Result<Value, String> {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return Ok(v);
    }

    let mut cleaned = raw.trim().to_string();
    for prefix in ["```json", "```"] {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest.to_string();
            break;
        }
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest.to_string();
    }
    let cleaned = cleaned.trim();
    if let Ok(v) = serde_json::from_str::<Value>(cleaned) {
        return Ok(v);
    }

    let repaired = textual_repair(cleaned);
    let repaired = balance_braces(&repaired);
    serde_json::from_str::<Value>(&repaired).map_err(|e| e.to_string())
}

/// 逐字符改写：单引号字符串转双引号、裸键加引号、Python 字面量替换、
/// 去尾逗号。只在字符串外做替换。
fn textual_repair(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut i = 0;
    let mut in_double = false;

    while i < chars.len() {
        let c = chars[i];
        if in_double {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_double = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_double = true;
                out.push(c);
                i += 1;
            }
            '\'' => {
                // 单引号字符串整体转成双引号，内部双引号转义
                out.push('"');
                i += 1;
                while i < chars.len() {
                    let s = chars[i];
                    if s == '\\' && i + 1 < chars.len() {
                        out.push(s);
                        out.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    if s == '\'' {
                        i += 1;
                        break;
                    }
                    if s == '"' {
                        out.push('\\');
                    }
                    out.push(s);
                    i += 1;
                }
                out.push('"');
            }
            ',' => {
                // 尾逗号：后面紧跟 } 或 ] 则丢弃
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                    i += 1;
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                match word.as_str() {
                    "True" => out.push_str("true"),
                    "False" => out.push_str("false"),
                    "None" => out.push_str("null"),
                    "true" | "false" | "null" => out.push_str(&word),
                    _ if j < chars.len() && chars[j] == ':' => {
                        // 裸键
                        out.push('"');
                        out.push_str(&word);
                        out.push('"');
                    }
                    _ => out.push_str(&word),
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// 外层括号配平：缺少的右括号补齐，多余的右括号截断
fn balance_braces(input: &str) -> String {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    let mut cut = input.len();
    for (i, c) in input.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    cut = i + 1;
                }
                if depth < 0 {
                    // 多余的右括号：在配平点截断
                    return input[..cut].to_string();
                }
            }
            _ => {}
        }
    }
    let mut out = input.trim_end().to_string();
    for _ in 0..depth.max(0) {
        out.push('}');
    }
    out
}

/// 去掉已提取片段，得到剩余叙述
fn strip_ranges(text: &str, ranges: &mut Vec<(usize, usize)>) -> String {
    ranges.sort_by_key(|r| r.0);
    let mut out = String::new();
    let mut pos = 0;
    for &(start, end) in ranges.iter() {
        if start > pos {
            out.push_str(&text[pos..start]);
        }
        pos = pos.max(end);
    }
    if pos < text.len() {
        out.push_str(&text[pos..]);
    }
    out.trim().to_string()
}

/// 带上限的编辑距离；超过 cap 返回 None
fn edit_distance_capped(a: &str, b: &str, cap: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > cap {
        return None;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
            row_min = row_min.min(curr[j + 1]);
        }
        if row_min > cap {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    (prev[b.len()] <= cap).then_some(prev[b.len()])
}

/// 提取 <think>...</think> 块，返回 (thinking, 去除后的正文)
pub fn extract_thinking(text: &str) -> (String, String) {
    let re = Regex::new(r"(?s)<think>(.*?)</think>").expect("static regex");
    let mut thinking = Vec::new();
    for cap in re.captures_iter(text) {
        thinking.push(cap.get(1).expect("group 1").as_str().trim().to_string());
    }
    let cleaned = re.replace_all(text, "").trim().to_string();
    (thinking.join("\n"), cleaned)
}
