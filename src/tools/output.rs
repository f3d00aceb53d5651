//! 工具输出整形：头尾截断与二进制安全转义
//!
//! 超出工具字节上限时保留头部约 60%、尾部约 40%，中间放一行省略标记。

/// 头部份额（其余给尾部）
const HEAD_SHARE_NUM: usize = 3;
const HEAD_SHARE_DEN: usize = 5;

/// 整形结果：正文 + 可选的截断说明
pub struct Shaped {
    pub text: String,
    pub truncation_note: Option<String>,
}

/// 按字节上限整形输出；在字符边界上切割
pub fn shape_output(raw: &str, limit: usize) -> Shaped {
    let sanitized = sanitize(raw);
    if sanitized.len() <= limit {
        return Shaped {
            text: sanitized,
            truncation_note: None,
        };
    }

    let head_budget = limit * HEAD_SHARE_NUM / HEAD_SHARE_DEN;
    let tail_budget = limit - head_budget;
    let elided = sanitized.len() - limit;

    let head_end = floor_char_boundary(&sanitized, head_budget);
    let tail_start = ceil_char_boundary(&sanitized, sanitized.len() - tail_budget);

    let marker = format!("[... {} bytes elided ...]", elided);
    let text = format!(
        "{}\n{}\n{}",
        &sanitized[..head_end],
        marker,
        &sanitized[tail_start..]
    );
    Shaped {
        text,
        truncation_note: Some(marker),
    }
}

/// 二进制安全：替换 NUL 与除 \n \t \r 外的控制字符
fn sanitize(raw: &str) -> String {
    if raw
        .chars()
        .all(|c| !c.is_control() || c == '\n' || c == '\t' || c == '\r')
    {
        return raw.to_string();
    }
    raw.chars()
        .map(|c| {
            if c.is_control() && c != '\n' && c != '\t' && c != '\r' {
                '\u{FFFD}'
            } else {
                c
            }
        })
        .collect()
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
