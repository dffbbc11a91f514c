//! Candidate generators, one per extraction strategy.

use super::repair::{closes_single, repair};
use super::ExtractionStrategy;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Opening brackets that may fail to yield a value before a strategy gives up.
const MAX_FAILED_STARTS: usize = 32;

fn fence_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+\-]*)(.*?)```").ok())
        .as_ref()
}

fn lead_in_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:(?:sure|certainly|okay|ok|absolutely|of course)[!,.]?\s*)?(?:here(?:'s|\s+is|\s+are)[^:\n]*:|(?:the\s+)?(?:json|output|result|response)[^:\n{\[]*:)\s*",
        )
        .ok()
    })
    .as_ref()
}

/// Produces candidate values for one strategy, best first.
pub(super) fn candidates(strategy: ExtractionStrategy, raw: &str) -> Vec<Value> {
    match strategy {
        ExtractionStrategy::FencedBlock => fenced_blocks(raw),
        ExtractionStrategy::Preprocessed => preprocessed(raw).into_iter().collect(),
        ExtractionStrategy::TrailingTolerant => leading_values(raw),
        ExtractionStrategy::BracketRepair => bracket_spans(raw),
    }
}

/// Parses the contents of fenced blocks, json-labelled blocks first.
fn fenced_blocks(raw: &str) -> Vec<Value> {
    let Some(re) = fence_regex() else {
        return Vec::new();
    };
    let mut blocks: Vec<(bool, &str)> = re
        .captures_iter(raw)
        .filter_map(|caps| {
            let label = caps.get(1).map_or("", |m| m.as_str());
            let body = caps.get(2)?.as_str();
            Some((label.eq_ignore_ascii_case("json"), body.trim()))
        })
        .collect();
    blocks.sort_by_key(|(is_json, _)| !is_json);

    blocks
        .into_iter()
        .filter_map(|(_, body)| serde_json::from_str(body).ok())
        .collect()
}

fn starts_structured(line: &str) -> bool {
    line.starts_with('{') || line.starts_with('[')
}

fn ends_structured(line: &str) -> bool {
    line.ends_with('}') || line.ends_with(']')
}

/// Strips conversational lead-in and trailing commentary lines.
pub(super) fn preprocess(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(m) = lead_in_regex().and_then(|re| re.find(text)) {
        text = &text[m.end()..];
    }

    let lines: Vec<&str> = text.lines().collect();
    let start = lines
        .iter()
        .position(|l| starts_structured(l.trim_start()))
        .unwrap_or(0);
    let end = lines
        .iter()
        .rposition(|l| ends_structured(l.trim_end()))
        .map_or(lines.len(), |i| i + 1);

    if start >= end {
        return text.trim().to_string();
    }
    lines[start..end].join("\n").trim().to_string()
}

fn preprocessed(raw: &str) -> Option<Value> {
    serde_json::from_str(&preprocess(raw)).ok()
}

/// Tries `attempt` at each opening bracket, skipping past every value found.
///
/// Only starts that yield nothing count against `MAX_FAILED_STARTS`, so a
/// long bracketed preamble cannot hide the value after it.
fn scan_starts<F>(raw: &str, mut attempt: F) -> Vec<Value>
where
    F: FnMut(usize) -> Option<(Value, usize)>,
{
    let mut values = Vec::new();
    let mut failures = 0;
    let mut resume = 0;

    for (start, c) in raw.char_indices() {
        if start < resume || !(c == '{' || c == '[') {
            continue;
        }
        if let Some((value, end)) = attempt(start) {
            values.push(value);
            resume = end;
        } else {
            failures += 1;
            if failures >= MAX_FAILED_STARTS {
                break;
            }
        }
    }
    values
}

/// Parses each complete value, ignoring anything after it.
fn leading_values(raw: &str) -> Vec<Value> {
    scan_starts(raw, |start| {
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => Some((value, start + stream.byte_offset())),
            _ => None,
        }
    })
}

/// Finds the balanced bracket span beginning at `start`.
///
/// Brackets inside double- or single-quoted strings are ignored. A single
/// quote closes its string only where `repair` would treat it as closing.
pub(super) fn balanced_span(text: &str, start: usize) -> Option<&str> {
    let mut stack = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == open {
                let after = start + offset + c.len_utf8();
                if open == '"' || closes_single(text[after..].chars()) {
                    quote = None;
                }
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses balanced spans as-is or after repair.
fn bracket_spans(raw: &str) -> Vec<Value> {
    scan_starts(raw, |start| {
        let span = balanced_span(raw, start)?;
        serde_json::from_str(span)
            .or_else(|_| serde_json::from_str(&repair(span)))
            .ok()
            .map(|value| (value, start + span.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fenced_prefers_json_label() {
        let raw = "```text\n[1, 2]\n```\nand\n```json\n{\"a\": 1}\n```";
        assert_eq!(fenced_blocks(raw), vec![json!({"a": 1}), json!([1, 2])]);
    }

    #[test]
    fn test_fenced_unlabelled_inline() {
        assert_eq!(fenced_blocks("```{\"a\": 1}```"), vec![json!({"a": 1})]);
    }

    #[test]
    fn test_preprocess_strips_lead_in_and_commentary() {
        let raw = "Sure! Here is the JSON:\n{\"a\": 1}\nLet me know if you need changes.";
        assert_eq!(preprocess(raw), "{\"a\": 1}");
    }

    #[test]
    fn test_preprocess_leaves_plain_json() {
        assert_eq!(preprocess("  [1, 2]  "), "[1, 2]");
    }

    #[test]
    fn test_leading_values_ignore_trailing_text() {
        assert_eq!(leading_values("{\"a\": 1} done."), vec![json!({"a": 1})]);
        assert_eq!(leading_values("see {broken and {\"b\": 2} tail"), vec![json!({"b": 2})]);
        assert!(leading_values("nothing here").is_empty());
    }

    #[test]
    fn test_leading_values_skip_nested_values() {
        let values = leading_values("[1] then {\"a\": {\"b\": [2]}} end");
        assert_eq!(values, vec![json!([1]), json!({"a": {"b": [2]}})]);
    }

    #[test]
    fn test_balanced_span_ignores_brackets_in_strings() {
        let text = r#"x {"a": "}", "b": [1]} y"#;
        assert_eq!(balanced_span(text, 2), Some(r#"{"a": "}", "b": [1]}"#));
    }

    #[test]
    fn test_balanced_span_rejects_mismatch_and_unterminated() {
        assert_eq!(balanced_span("{ ]", 0), None);
        assert_eq!(balanced_span("{ \"a\": 1", 0), None);
    }

    #[test]
    fn test_bracket_spans_repairs() {
        let values = bracket_spans("result => {a: 1, b: [True,],}");
        assert_eq!(values.first(), Some(&json!({"a": 1, "b": [true]})));
    }

    #[test]
    fn test_balanced_span_tracks_single_quoted_strings() {
        let text = "{'note': 'use } here', 'n': 1} tail";
        assert_eq!(balanced_span(text, 0), Some("{'note': 'use } here', 'n': 1}"));

        let apostrophe = "{'a': 'it's ] fine'}";
        assert_eq!(balanced_span(apostrophe, 0), Some(apostrophe));
    }

    #[test]
    fn test_bracket_spans_repair_single_quoted_values() {
        assert_eq!(
            bracket_spans("{'note': 'use } here', 'n': 1}"),
            vec![json!({"note": "use } here", "n": 1})]
        );
        assert_eq!(
            bracket_spans("{'size': '5\" frame', 'n': 1}"),
            vec![json!({"size": "5\" frame", "n": 1})]
        );
    }

    #[test]
    fn test_long_bracketed_preamble_keeps_later_value() {
        let markers: String = (0..40).map(|i| format!("[{i}] ")).collect();
        let raw = format!("{markers}{{\"choice\": 2}} and that is my pick.");

        let leading = leading_values(&raw);
        assert_eq!(leading.len(), 41);
        assert_eq!(leading.last(), Some(&json!({"choice": 2})));
        assert_eq!(bracket_spans(&raw).last(), Some(&json!({"choice": 2})));
    }

    #[test]
    fn test_failed_starts_are_bounded() {
        let noise = "[x ".repeat(MAX_FAILED_STARTS);
        assert!(bracket_spans(&format!("{noise}{{\"a\": 1}}")).is_empty());
    }
}
