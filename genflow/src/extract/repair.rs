//! Light syntactic repairs for almost-JSON spans.

use regex::{Captures, Regex};
use std::sync::OnceLock;

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn unquoted_key_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"([{,]\s*)([A-Za-z_][A-Za-z0-9_\-]*)(\s*:)")
}

fn trailing_comma_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r",(\s*[}\]])")
}

fn python_literal_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"\b(True|False|None)\b")
}

/// Applies every repair to a bracket span.
///
/// Order matters: quotes are normalized first so later passes can tell
/// string contents from structure.
pub(crate) fn repair(span: &str) -> String {
    let text = normalize_typographic_quotes(span);
    let text = convert_single_quotes(&text);
    let text = escape_control_chars_in_strings(&text);
    map_outside_strings(&text, |segment| {
        let segment = quote_unquoted_keys(segment);
        let segment = strip_trailing_commas(&segment);
        replace_python_literals(&segment)
    })
}

/// Replaces curly quotes with ASCII ones.
///
/// Only applied when the span has no ASCII double quotes, since curly quotes
/// inside a well-quoted string are content.
fn normalize_typographic_quotes(text: &str) -> String {
    if text.contains('"') {
        return text.to_string();
    }
    text.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum QuoteState {
    Outside,
    Double,
    Single,
}

/// True if a single quote followed by `rest` ends a string rather than being
/// an apostrophe inside it.
pub(super) fn closes_single(rest: impl IntoIterator<Item = char>) -> bool {
    rest.into_iter()
        .find(|c| !c.is_whitespace())
        .map_or(true, |c| matches!(c, ',' | ':' | '}' | ']'))
}

fn convert_single_quotes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut state = QuoteState::Outside;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match state {
            QuoteState::Outside => match c {
                '"' => {
                    state = QuoteState::Double;
                    out.push(c);
                }
                '\'' => {
                    state = QuoteState::Single;
                    out.push('"');
                }
                _ => out.push(c),
            },
            QuoteState::Double => {
                out.push(c);
                if c == '\\' {
                    if let Some(&next) = chars.get(i + 1) {
                        out.push(next);
                        i += 1;
                    }
                } else if c == '"' {
                    state = QuoteState::Outside;
                }
            }
            QuoteState::Single => match c {
                '\\' => match chars.get(i + 1) {
                    Some('\'') => {
                        out.push('\'');
                        i += 1;
                    }
                    Some(&next) => {
                        out.push('\\');
                        out.push(next);
                        i += 1;
                    }
                    None => out.push('\\'),
                },
                '"' => out.push_str("\\\""),
                '\'' if closes_single(chars[i + 1..].iter().copied()) => {
                    out.push('"');
                    state = QuoteState::Outside;
                }
                _ => out.push(c),
            },
        }
        i += 1;
    }
    out
}

/// Escapes raw newlines and tabs inside strings, healing strings that a
/// model broke across lines.
fn escape_control_chars_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = false;
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => {}
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// Applies `f` to every run of text outside double-quoted strings.
fn map_outside_strings<F>(text: &str, f: F) -> String
where
    F: Fn(&str) -> String,
{
    let mut out = String::with_capacity(text.len());
    let mut segment = String::new();
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '"' {
            segment.push(c);
            continue;
        }
        out.push_str(&f(&segment));
        segment.clear();
        out.push('"');
        let mut escaped = false;
        for inner in chars.by_ref() {
            out.push(inner);
            if escaped {
                escaped = false;
            } else if inner == '\\' {
                escaped = true;
            } else if inner == '"' {
                break;
            }
        }
    }
    out.push_str(&f(&segment));
    out
}

fn quote_unquoted_keys(segment: &str) -> String {
    match unquoted_key_regex() {
        Some(re) => re.replace_all(segment, "${1}\"${2}\"${3}").into_owned(),
        None => segment.to_string(),
    }
}

fn strip_trailing_commas(segment: &str) -> String {
    match trailing_comma_regex() {
        Some(re) => re.replace_all(segment, "${1}").into_owned(),
        None => segment.to_string(),
    }
}

fn replace_python_literals(segment: &str) -> String {
    match python_literal_regex() {
        Some(re) => re
            .replace_all(segment, |caps: &Captures<'_>| match &caps[1] {
                "True" => "true",
                "False" => "false",
                _ => "null",
            })
            .into_owned(),
        None => segment.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn parse(text: &str) -> Value {
        serde_json::from_str(&repair(text)).unwrap()
    }

    #[test]
    fn test_trailing_commas() {
        assert_eq!(parse(r#"{"a": [1, 2,], "b": 3,}"#), json!({"a": [1, 2], "b": 3}));
    }

    #[test]
    fn test_unquoted_keys() {
        assert_eq!(parse(r#"{name: "x", count: 2}"#), json!({"name": "x", "count": 2}));
    }

    #[test]
    fn test_single_quotes_with_apostrophe() {
        assert_eq!(
            parse("{'title': 'it's sunny', 'tags': ['a', 'b']}"),
            json!({"title": "it's sunny", "tags": ["a", "b"]})
        );
    }

    #[test]
    fn test_single_quoted_string_with_double_quote_inside() {
        assert_eq!(parse(r#"{'quote': 'say "hi"'}"#), json!({"quote": "say \"hi\""}));
    }

    #[test]
    fn test_string_broken_across_lines() {
        assert_eq!(
            parse("{\"caption\": \"first line\nsecond line\"}"),
            json!({"caption": "first line\nsecond line"})
        );
    }

    #[test]
    fn test_typographic_quotes() {
        assert_eq!(parse("{\u{201C}a\u{201D}: \u{201C}b\u{201D}}"), json!({"a": "b"}));
    }

    #[test]
    fn test_python_literals_outside_strings_only() {
        assert_eq!(
            parse(r#"{"ok": True, "missing": None, "text": "True story"}"#),
            json!({"ok": true, "missing": null, "text": "True story"})
        );
    }

    #[test]
    fn test_strings_are_left_alone() {
        let text = r#"{"url": "http://x.test/a,}", "k": 1}"#;
        assert_eq!(repair(text), text);
    }
}
