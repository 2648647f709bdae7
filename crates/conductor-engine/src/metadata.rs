//! Derived fields parsed from step output.
//!
//! After a step succeeds, its output is scanned for structured signals that
//! conditional edges can route on: the top-level fields of a JSON object
//! (bare or inside a markdown fence), a `sentiment score: <n>` figure, and a
//! standalone `PASS` / `FAIL` verdict.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Number, Value};

fn sentiment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bsentiment(?:[ _]score)?\s*[:=]\s*(-?\d+(?:\.\d+)?)")
            .expect("valid sentiment regex")
    })
}

fn verdict_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(PASSED|PASS|FAILED|FAIL)\b").expect("valid verdict regex"))
}

/// Extract metadata from a step's output. Empty if nothing was recognised.
pub fn extract(output: &str) -> Map<String, Value> {
    let mut metadata = Map::new();

    if let Some(Value::Object(fields)) = parse_json_block(output) {
        metadata.extend(fields);
    }

    if !metadata.contains_key("sentiment_score") {
        if let Some(score) = sentiment_re()
            .captures(output)
            .and_then(|c| c[1].parse::<f64>().ok())
            .and_then(Number::from_f64)
        {
            metadata.insert("sentiment_score".into(), Value::Number(score));
        }
    }

    if !metadata.contains_key("passed") {
        if let Some(verdict) = verdict_re().captures(output) {
            let passed = verdict[1].starts_with("PASS");
            metadata.insert("passed".into(), Value::Bool(passed));
        }
    }

    metadata
}

/// Parse JSON out of model-style output: the whole text, a fenced block, or
/// the outermost `{...}` span.
pub fn parse_json_block(output: &str) -> Option<Value> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let unfenced = strip_code_fences(trimmed);
    if unfenced != trimmed {
        if let Ok(value) = serde_json::from_str::<Value>(unfenced.trim()) {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end]).ok()
}

/// Strip markdown code fences from output.
fn strip_code_fences(s: &str) -> String {
    let Some(open) = s.find("```") else {
        return s.to_string();
    };
    let after_open = &s[open + 3..];
    // Skip the language tag line.
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].to_string(),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_object_fields() {
        let meta = extract(r#"{"ok": false, "score": 7, "items": [1, 2]}"#);
        assert_eq!(meta["ok"], json!(false));
        assert_eq!(meta["score"], json!(7));
        assert_eq!(meta["items"], json!([1, 2]));
    }

    #[test]
    fn test_fenced_json() {
        let output = "Here is the result:\n```json\n{\"approved\": true}\n```\nThanks.";
        let meta = extract(output);
        assert_eq!(meta["approved"], json!(true));
    }

    #[test]
    fn test_embedded_braces() {
        let meta = extract(r#"Verdict follows {"ok": true} end"#);
        assert_eq!(meta["ok"], json!(true));
    }

    #[test]
    fn test_sentiment_score() {
        let meta = extract("Overall tone is warm. Sentiment score: 0.82");
        assert_eq!(meta["sentiment_score"], json!(0.82));

        let meta = extract("sentiment=-0.5");
        assert_eq!(meta["sentiment_score"], json!(-0.5));
    }

    #[test]
    fn test_verdict_words() {
        assert_eq!(extract("Review result: PASS")["passed"], json!(true));
        assert_eq!(extract("Tests FAILED on step 3")["passed"], json!(false));
        // Lowercase prose is not a verdict.
        assert!(!extract("this might pass later").contains_key("passed"));
        // Substrings of other words are not verdicts.
        assert!(!extract("PASSWORD reset").contains_key("passed"));
    }

    #[test]
    fn test_json_wins_over_text_signals() {
        let meta = extract(r#"{"passed": true, "note": "previous run FAILED"}"#);
        assert_eq!(meta["passed"], json!(true));
    }

    #[test]
    fn test_plain_text_has_no_metadata() {
        assert!(extract("Just some prose.").is_empty());
        assert!(extract("").is_empty());
    }

    #[test]
    fn test_parse_json_block_scalars() {
        assert_eq!(parse_json_block("42"), Some(json!(42)));
        assert_eq!(parse_json_block("not json"), None);
    }
}
