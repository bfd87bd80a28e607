/// assistant 回复开始处的标记（跳过特殊 token 之后）
pub const ROLE_MARKER: &str = "assistant\n\n";

/// 取第一个标记之后的内容；没有标记就返回整段，都去掉首尾空白
pub fn extract_reply(decoded: &str) -> &str {
    match decoded.find(ROLE_MARKER) {
        Some(pos) => decoded[pos + ROLE_MARKER.len()..].trim(),
        None => decoded.trim(),
    }
}
