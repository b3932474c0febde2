use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("token"));

/// `{{code}}`
pub fn placeholder_token(code: &str) -> String {
    format!("{{{{{}}}}}", code.trim())
}

/// Field codes of every `{{ code }}` token still present in `text`, sorted and deduplicated.
pub fn scan_tokens(text: &str) -> BTreeSet<String> {
    TOKEN_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Lowercase with all whitespace removed; used to compare style labels.
pub fn normalize_label(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Escape display text for insertion into raw XML (text nodes or attribute values).
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
