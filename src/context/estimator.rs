//! Token 估算：按字符数近似
//!
//! 英文为主的文本约 3.3 字符/token，CJK 为主约 2.0 字符/token，
//! 通过 CJK 区块字符占比选择系数。估算偏保守（向上取整），
//! 供上下文预算判断使用，不要求精确。

/// CJK 占比超过该阈值时按 CJK 系数估算
const CJK_RATIO_THRESHOLD: f64 = 0.3;

const CHARS_PER_TOKEN_LATIN: f64 = 3.3;
const CHARS_PER_TOKEN_CJK: f64 = 2.0;

/// 判断字符是否落在 CJK（中日韩）区块
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // Extension A
        '\u{F900}'..='\u{FAFF}' |   // Compatibility Ideographs
        '\u{3000}'..='\u{303F}' |   // CJK Symbols and Punctuation
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}' |   // Katakana
        '\u{AC00}'..='\u{D7AF}'     // Hangul Syllables
    )
}

/// 估算文本 token 数；空文本为 0，非空至少为 1
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let mut total = 0usize;
    let mut cjk = 0usize;
    for c in text.chars() {
        total += 1;
        if is_cjk(c) {
            cjk += 1;
        }
    }
    let ratio = cjk as f64 / total as f64;
    let per_token = if ratio > CJK_RATIO_THRESHOLD {
        CHARS_PER_TOKEN_CJK
    } else {
        CHARS_PER_TOKEN_LATIN
    };
    ((total as f64) / per_token).ceil().max(1.0) as usize
}
