//! Variable and alias substitution for instruction text.
//!
//! Placeholders are resolved in a single pass over the text:
//!
//! | Placeholder            | Resolves to                                      |
//! |------------------------|--------------------------------------------------|
//! | `{name}`               | run parameter `name`                             |
//! | `{step}`               | latest output of `step` (truncated when long)   |
//! | `{step.key}`           | a field of a JSON output, parameter or metadata |
//! | `{@latest:pattern}`    | output of the last executed loop member         |
//! | `{@first:pattern}`     | output of the loop's base step                  |
//! | `{@previous:pattern}`  | output of the member executed before the latest |
//!
//! A placeholder is any `{...}` whose content has no braces or quotes and
//! does not start or end with whitespace, so step ids such as `1st` work
//! and a typo such as `{ghost step}` is caught rather than sent verbatim.
//! Replacement text is never rescanned, so outputs that happen to contain
//! braces pass through untouched. Any placeholder that names nothing the
//! run knows about makes the step fail before its collaborator is called.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tracing::warn;

use conductor_core::config::EngineConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::template::Template;
use conductor_core::types::value_to_text;

use crate::condition::resolve_field;
use crate::graph::loops::{AliasKind, LoopPatterns};
use crate::state::RunState;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Any brace pair without nested braces or quotes whose content does
        // not start or end with whitespace. JSON objects (`{"key": ...}`)
        // and code blocks (`{ ... }`) never match.
        Regex::new(r#"\{([^{}"\s](?:[^{}"]*[^{}"\s])?)\}"#).expect("valid placeholder regex")
    })
}

/// Argument key used when neither the step nor the tool names one.
pub const DEFAULT_ARGUMENT: &str = "input";

/// Resolves placeholders against one run's state.
pub struct Substitution<'a> {
    template: &'a Template,
    patterns: &'a LoopPatterns,
    state: &'a RunState,
    max_output_chars: usize,
    suffix_chars: usize,
}

/// What a single placeholder resolved to.
enum Resolved<'s> {
    Text(Cow<'s, str>),
    /// A parameter or field value, kept typed for structured arguments.
    Value(Value),
    /// A known step (or alias of one) that has not produced output yet.
    Empty,
    Unknown,
}

impl<'a> Substitution<'a> {
    pub fn new(
        template: &'a Template,
        patterns: &'a LoopPatterns,
        state: &'a RunState,
        config: &EngineConfig,
    ) -> Self {
        Self {
            template,
            patterns,
            state,
            max_output_chars: config.max_output_chars,
            suffix_chars: config.truncation_suffix_chars,
        }
    }

    /// Substitute every placeholder in `text` for step `step_id`.
    pub fn resolve(&self, step_id: &str, text: &str) -> Result<String> {
        let mut unresolved: Option<String> = None;

        let resolved = placeholder_re().replace_all(text, |caps: &Captures| {
            let name = &caps[1];
            match self.lookup(step_id, name) {
                Resolved::Text(text) => text.into_owned(),
                Resolved::Value(value) => value_to_text(&value),
                Resolved::Empty => String::new(),
                Resolved::Unknown => {
                    unresolved.get_or_insert_with(|| name.to_string());
                    caps[0].to_string()
                }
            }
        });

        match unresolved {
            Some(placeholder) => Err(ConductorError::UnresolvedPlaceholder {
                step: step_id.to_string(),
                placeholder,
            }),
            None => Ok(resolved.into_owned()),
        }
    }

    /// Substitute placeholders inside a structured value.
    ///
    /// Strings are resolved recursively through arrays and objects. A string
    /// that consists of exactly one parameter placeholder keeps the
    /// parameter's JSON type (`"{count}"` with `count = 3` becomes `3`).
    pub fn resolve_value(&self, step_id: &str, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => {
                if let Some(caps) = placeholder_re().captures(s) {
                    if caps[0].len() == s.len() {
                        if let Resolved::Value(v) = self.lookup(step_id, &caps[1]) {
                            return Ok(v);
                        }
                    }
                }
                Ok(Value::String(self.resolve(step_id, s)?))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(step_id, item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.resolve_value(step_id, item)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn lookup(&self, step_id: &str, name: &str) -> Resolved<'a> {
        if let Some(alias) = name.strip_prefix('@') {
            return self.lookup_alias(step_id, alias);
        }
        if name.contains(':') {
            return Resolved::Unknown;
        }
        if let Some(value) = self.state.parameters.get(name) {
            return Resolved::Value(value.clone());
        }
        if let Some(output) = self.state.output(name) {
            return Resolved::Text(truncate_output(
                output,
                self.max_output_chars,
                self.suffix_chars,
            ));
        }
        if self.template.has_step(name) {
            warn!(step_id, placeholder = name, "Referenced step has no output yet, substituting empty text");
            return Resolved::Empty;
        }
        if name.contains('.') {
            if let Some(value) = resolve_field(self.state, name) {
                return Resolved::Value(value);
            }
        }
        Resolved::Unknown
    }

    fn lookup_alias(&self, step_id: &str, alias: &str) -> Resolved<'a> {
        let Some((kind, pattern)) = alias.split_once(':') else {
            return Resolved::Unknown;
        };
        let Ok(kind) = kind.parse::<AliasKind>() else {
            return Resolved::Unknown;
        };
        let executed = self
            .patterns
            .resolve_key(pattern)
            .map(|key| self.state.loop_history(key))
            .unwrap_or(&[]);
        let Some(target) = self.patterns.resolve_alias(kind, pattern, executed) else {
            return Resolved::Unknown;
        };

        match self.state.output(&target) {
            Some(output) => Resolved::Text(truncate_output(
                output,
                self.max_output_chars,
                self.suffix_chars,
            )),
            None => {
                warn!(step_id, alias, resolved = %target, "Alias target has no output yet, substituting empty text");
                Resolved::Empty
            }
        }
    }
}

/// Shorten an output longer than `max_chars`, keeping the head, the last
/// `suffix_chars` characters, and a marker with the number elided.
pub fn truncate_output(output: &str, max_chars: usize, suffix_chars: usize) -> Cow<'_, str> {
    let total = output.chars().count();
    if total <= max_chars {
        return Cow::Borrowed(output);
    }

    let suffix_chars = suffix_chars.min(max_chars);
    let prefix_chars = max_chars - suffix_chars;
    let elided = total - prefix_chars - suffix_chars;

    let prefix_end = output
        .char_indices()
        .nth(prefix_chars)
        .map(|(i, _)| i)
        .unwrap_or(output.len());
    let suffix_start = output
        .char_indices()
        .nth(total - suffix_chars)
        .map(|(i, _)| i)
        .unwrap_or(output.len());

    Cow::Owned(format!(
        "{}\n[... truncated {} characters ...]\n{}",
        &output[..prefix_end],
        elided,
        &output[suffix_start..]
    ))
}

/// Build tool-call arguments from a resolved instruction.
///
/// A JSON object instruction is passed through as-is. Anything else is
/// wrapped under `argument_name`, else the tool's required parameter, else
/// [`DEFAULT_ARGUMENT`].
pub fn tool_arguments(
    instruction: &str,
    argument_name: Option<&str>,
    required_parameter: Option<String>,
) -> Value {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(instruction.trim()) {
        return Value::Object(map);
    }
    let key = argument_name
        .map(str::to_string)
        .or(required_parameter)
        .unwrap_or_else(|| DEFAULT_ARGUMENT.to_string());
    let mut map = Map::new();
    map.insert(key, Value::String(instruction.to_string()));
    Value::Object(map)
}

/// Merge a function step's resolved named arguments with its resolved
/// instruction. Explicit arguments win over fields of a JSON instruction; a
/// plain-text instruction is passed as [`DEFAULT_ARGUMENT`].
pub fn function_arguments(mut arguments: Map<String, Value>, instruction: &str) -> Map<String, Value> {
    let instruction = instruction.trim();
    if instruction.is_empty() {
        return arguments;
    }
    match serde_json::from_str::<Value>(instruction) {
        Ok(Value::Object(fields)) => {
            for (key, value) in fields {
                arguments.entry(key).or_insert(value);
            }
        }
        _ => {
            arguments
                .entry(DEFAULT_ARGUMENT.to_string())
                .or_insert_with(|| Value::String(instruction.to_string()));
        }
    }
    arguments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StepOutcome, StepUpdate};
    use conductor_core::template::Step;
    use conductor_core::types::RunId;
    use serde_json::json;
    use std::collections::HashMap;

    fn template() -> Template {
        Template::new("subst")
            .with_step(Step::agent("research", "x"))
            .with_step(Step::agent("draft", "x"))
            .with_step(Step::agent("draft_revised", "x").depends_on(["draft"]))
            .with_step(Step::agent("unused", "x"))
    }

    fn complete(state: &mut RunState, patterns: &LoopPatterns, id: &str, output: &str) {
        state.merge(
            StepUpdate {
                step_id: id.into(),
                attempts: 1,
                log: vec![],
                outcome: StepOutcome::Completed {
                    output: output.into(),
                    metadata: Map::new(),
                },
            },
            patterns.pattern_of(id),
        );
    }

    fn state_with(params: &[(&str, Value)]) -> RunState {
        let params: HashMap<String, Value> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        RunState::new(RunId::new(), params)
    }

    #[test]
    fn test_params_and_outputs() {
        let template = template();
        let patterns = LoopPatterns::detect(&template);
        let mut state = state_with(&[("topic", json!("X"))]);
        complete(&mut state, &patterns, "research", "Y");

        let config = EngineConfig::default();
        let subst = Substitution::new(&template, &patterns, &state, &config);
        assert_eq!(
            subst.resolve("s", "Study {topic} using {research}").unwrap(),
            "Study X using Y"
        );
    }

    #[test]
    fn test_undefined_name_is_fatal() {
        let template = template();
        let patterns = LoopPatterns::detect(&template);
        let state = state_with(&[]);
        let config = EngineConfig::default();
        let subst = Substitution::new(&template, &patterns, &state, &config);

        let err = subst.resolve("s", "Use {nonexistent} now").unwrap_err();
        assert!(matches!(
            err,
            ConductorError::UnresolvedPlaceholder { ref step, ref placeholder }
                if step == "s" && placeholder == "nonexistent"
        ));
        assert!(!err.is_retryable());

        let err = subst.resolve("s", "{@sideways:draft}").unwrap_err();
        assert!(matches!(err, ConductorError::UnresolvedPlaceholder { .. }));
    }

    #[test]
    fn test_any_step_id_can_be_referenced() {
        let template = Template::new("odd")
            .with_step(Step::agent("1st", "a"))
            .with_step(Step::agent("step two", "b"));
        let patterns = LoopPatterns::detect(&template);
        let mut state = state_with(&[]);
        complete(&mut state, &patterns, "1st", "one");
        complete(&mut state, &patterns, "step two", "two");
        let config = EngineConfig::default();
        let subst = Substitution::new(&template, &patterns, &state, &config);

        assert_eq!(subst.resolve("s", "{1st} then {step two}").unwrap(), "one then two");
    }

    #[test]
    fn test_malformed_placeholder_is_fatal() {
        let template = template();
        let patterns = LoopPatterns::detect(&template);
        let mut state = state_with(&[]);
        complete(&mut state, &patterns, "research", "Y");
        let config = EngineConfig::default();
        let subst = Substitution::new(&template, &patterns, &state, &config);

        let err = subst.resolve("s", "use {research} and {ghost step}").unwrap_err();
        assert!(matches!(
            err,
            ConductorError::UnresolvedPlaceholder { ref placeholder, .. } if placeholder == "ghost step"
        ));
        let err = subst.resolve("s", "{research-2!}").unwrap_err();
        assert!(matches!(err, ConductorError::UnresolvedPlaceholder { .. }));
    }

    #[test]
    fn test_code_and_json_braces_are_not_placeholders() {
        let template = template();
        let patterns = LoopPatterns::detect(&template);
        let state = state_with(&[]);
        let config = EngineConfig::default();
        let subst = Substitution::new(&template, &patterns, &state, &config);

        for text in [
            r#"{"a": 1}"#,
            r#"{"nested": {"b": [1, 2]}}"#,
            "fn main() { run() }",
            "empty {} braces",
        ] {
            assert_eq!(subst.resolve("s", text).unwrap(), text);
        }
    }

    #[test]
    fn test_known_step_without_output_is_empty() {
        let template = template();
        let patterns = LoopPatterns::detect(&template);
        let state = state_with(&[]);
        let config = EngineConfig::default();
        let subst = Substitution::new(&template, &patterns, &state, &config);
        assert_eq!(subst.resolve("s", "[{unused}]").unwrap(), "[]");
    }

    #[test]
    fn test_json_braces_are_left_alone() {
        let template = template();
        let patterns = LoopPatterns::detect(&template);
        let state = state_with(&[("url", json!("https://example.com"))]);
        let config = EngineConfig::default();
        let subst = Substitution::new(&template, &patterns, &state, &config);
        assert_eq!(
            subst.resolve("s", r#"{"url": "{url}", "depth": 2}"#).unwrap(),
            r#"{"url": "https://example.com", "depth": 2}"#
        );
    }

    #[test]
    fn test_replacement_text_is_not_rescanned() {
        let template = template();
        let patterns = LoopPatterns::detect(&template);
        let mut state = state_with(&[]);
        complete(&mut state, &patterns, "research", "see {ghost}");
        let config = EngineConfig::default();
        let subst = Substitution::new(&template, &patterns, &state, &config);
        assert_eq!(subst.resolve("s", "{research}").unwrap(), "see {ghost}");
    }

    #[test]
    fn test_loop_aliases_follow_execution_order() {
        let template = template();
        let patterns = LoopPatterns::detect(&template);
        let config = EngineConfig::default();
        let mut state = state_with(&[]);

        complete(&mut state, &patterns, "draft", "v1");
        {
            let subst = Substitution::new(&template, &patterns, &state, &config);
            assert_eq!(subst.resolve("s", "{@latest:draft}").unwrap(), "v1");
            assert_eq!(subst.resolve("s", "{@previous:draft}").unwrap(), "v1");
        }

        complete(&mut state, &patterns, "draft_revised", "v2");
        let subst = Substitution::new(&template, &patterns, &state, &config);
        assert_eq!(subst.resolve("s", "{@latest:draft}").unwrap(), "v2");
        assert_eq!(subst.resolve("s", "{@previous:draft}").unwrap(), "v1");
        assert_eq!(subst.resolve("s", "{@first:draft_revised}").unwrap(), "v1");
    }

    #[test]
    fn test_dotted_field_lookup() {
        let template = template();
        let patterns = LoopPatterns::detect(&template);
        let mut state = state_with(&[("limits", json!({"max": 10}))]);
        complete(&mut state, &patterns, "research", r#"{"title": "Rust"}"#);
        let config = EngineConfig::default();
        let subst = Substitution::new(&template, &patterns, &state, &config);
        assert_eq!(
            subst.resolve("s", "{research.title} up to {limits.max}").unwrap(),
            "Rust up to 10"
        );
    }

    #[test]
    fn test_truncation_keeps_head_and_tail() {
        let output = format!("{}{}", "a".repeat(50), "b".repeat(50));
        let truncated = truncate_output(&output, 30, 10);
        assert!(truncated.starts_with(&"a".repeat(20)));
        assert!(truncated.ends_with(&"b".repeat(10)));
        assert!(truncated.contains("[... truncated 70 characters ...]"));

        assert!(matches!(truncate_output("short", 30, 10), Cow::Borrowed("short")));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let output = "é".repeat(40);
        let truncated = truncate_output(&output, 10, 3);
        assert!(truncated.starts_with(&"é".repeat(7)));
        assert!(truncated.ends_with(&"é".repeat(3)));
        assert!(truncated.contains("truncated 30 characters"));
    }

    #[test]
    fn test_long_outputs_truncated_on_substitution() {
        let template = template();
        let patterns = LoopPatterns::detect(&template);
        let mut state = state_with(&[]);
        complete(&mut state, &patterns, "research", &"z".repeat(500));
        let config = EngineConfig {
            max_output_chars: 100,
            truncation_suffix_chars: 20,
            ..Default::default()
        };
        let subst = Substitution::new(&template, &patterns, &state, &config);
        let text = subst.resolve("s", "{research}").unwrap();
        assert!(text.contains("[... truncated 400 characters ...]"));
    }

    #[test]
    fn test_resolve_value_keeps_parameter_types() {
        let template = template();
        let patterns = LoopPatterns::detect(&template);
        let state = state_with(&[("count", json!(3)), ("name", json!("ada"))]);
        let config = EngineConfig::default();
        let subst = Substitution::new(&template, &patterns, &state, &config);

        let value = subst
            .resolve_value("s", &json!({"n": "{count}", "greeting": "hi {name}", "list": ["{name}"]}))
            .unwrap();
        assert_eq!(value, json!({"n": 3, "greeting": "hi ada", "list": ["ada"]}));
    }

    #[test]
    fn test_tool_arguments() {
        assert_eq!(
            tool_arguments(r#"{"q": "rust"}"#, Some("query"), None),
            json!({"q": "rust"})
        );
        assert_eq!(
            tool_arguments("rust", Some("query"), Some("path".into())),
            json!({"query": "rust"})
        );
        assert_eq!(
            tool_arguments("rust", None, Some("path".into())),
            json!({"path": "rust"})
        );
        assert_eq!(tool_arguments("[1, 2]", None, None), json!({"input": "[1, 2]"}));
    }

    #[test]
    fn test_function_arguments_merge() {
        let mut explicit = Map::new();
        explicit.insert("a".into(), json!(1));

        let merged = function_arguments(explicit.clone(), r#"{"a": 99, "b": 2}"#);
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": 2}));

        let merged = function_arguments(explicit.clone(), "free text");
        assert_eq!(Value::Object(merged), json!({"a": 1, "input": "free text"}));

        let merged = function_arguments(explicit, "  ");
        assert_eq!(Value::Object(merged), json!({"a": 1}));
    }
}
