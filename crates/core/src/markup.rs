//! Escaping helpers for chat message markup (Telegram MarkdownV2 / HTML).

/// Characters that must be backslash-escaped in MarkdownV2 text.
const MARKDOWN_V2_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

/// Escape plain text for MarkdownV2.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_V2_SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape text placed inside a MarkdownV2 `code` or ```pre``` span.
/// Only backtick and backslash are special there.
pub fn escape_markdown_v2_code(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '`' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Truncate to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_escapes_specials() {
        assert_eq!(escape_markdown_v2("3.5"), r"3\.5");
        assert_eq!(escape_markdown_v2("a_b (c)!"), r"a\_b \(c\)\!");
    }

    #[test]
    fn markdown_code_escapes_only_backtick_and_backslash() {
        assert_eq!(escape_markdown_v2_code("lora_v1.safetensors"), "lora_v1.safetensors");
        assert_eq!(escape_markdown_v2_code(r"a`b\c"), r"a\`b\\c");
    }

    #[test]
    fn html_escape() {
        assert_eq!(escape_html("<b>&</b>"), "&lt;b&gt;&amp;&lt;/b&gt;");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("short", 50), "short");
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
        assert_eq!(truncate_chars("ééééé", 2), "éé...");
    }
}
