/// Cuts `text` to at most `max_chars` characters, noting how much was dropped.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n…[truncated {} chars]", total - max_chars)
}
