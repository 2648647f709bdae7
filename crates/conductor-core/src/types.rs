use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Record of one step attempt, appended to the run's execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub step_id: String,
    /// Step kind name (`agent`, `tool-call`, ...).
    pub kind: String,
    /// 1-based attempt number for this step within the run.
    pub attempt: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// The attempt finished after the run had already failed; its result
    /// was logged but not merged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub discarded: bool,
}

impl ExecutionLogEntry {
    pub fn success(
        step_id: impl Into<String>,
        kind: impl Into<String>,
        attempt: u32,
        output: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            kind: kind.into(),
            attempt,
            success: true,
            output: Some(output.into()),
            error: None,
            elapsed_ms,
            timestamp: Utc::now(),
            discarded: false,
        }
    }

    pub fn failure(
        step_id: impl Into<String>,
        kind: impl Into<String>,
        attempt: u32,
        error: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            kind: kind.into(),
            attempt,
            success: false,
            output: None,
            error: Some(error.into()),
            elapsed_ms,
            timestamp: Utc::now(),
            discarded: false,
        }
    }
}

/// Final report of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub template: String,
    pub success: bool,
    /// Output of the last step that completed.
    pub output: Option<String>,
    /// Latest output of every completed step.
    pub outputs: HashMap<String, String>,
    pub execution_log: Vec<ExecutionLogEntry>,
    /// Human-readable terminal error (failed runs only).
    pub error: Option<String>,
    /// Step that caused the terminal error, if any.
    pub failed_step: Option<String>,
    pub elapsed_ms: u64,
}

/// Role of a replayed conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A turn of conversation history rebuilt from prior step outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    /// Step whose output produced this turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub content: String,
}

impl ChatTurn {
    pub fn from_step(step_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            step_id: Some(step_id.into()),
            content: content.into(),
        }
    }
}

/// Everything a direct-model collaborator receives for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    pub instruction: String,
}

/// Run event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A run (or nested sub-workflow run) started.
    RunStarted {
        run_id: RunId,
        /// Run that invoked this one as a sub-workflow.
        parent: Option<RunId>,
        template: String,
        depth: usize,
    },
    /// A step attempt began.
    StepStarted {
        run_id: RunId,
        step_id: String,
        attempt: u32,
    },
    /// A step attempt finished (successfully or not).
    StepFinished {
        run_id: RunId,
        entry: ExecutionLogEntry,
    },
    /// A conditional edge picked its target.
    RouteTaken {
        run_id: RunId,
        from: String,
        to: String,
    },
    /// The run finished.
    RunFinished {
        run_id: RunId,
        success: bool,
        error: Option<String>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepFinished { run_id, .. }
            | RunEvent::RouteTaken { run_id, .. }
            | RunEvent::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Render a JSON value as instruction text: strings verbatim, everything
/// else in its JSON form.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
        assert_eq!(RunId::from_str("abc").to_string(), "abc");
    }

    #[test]
    fn test_log_entry_serialization_skips_empty_fields() {
        let entry = ExecutionLogEntry::success("fetch", "agent", 1, "ok", 12);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["step_id"], "fetch");
        assert_eq!(json["output"], "ok");
        assert!(json.get("error").is_none());
        assert!(json.get("discarded").is_none());

        let entry = ExecutionLogEntry::failure("fetch", "agent", 2, "boom", 3);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("output").is_none());
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&json!("plain")), "plain");
        assert_eq!(value_to_text(&json!(3)), "3");
        assert_eq!(value_to_text(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(value_to_text(&Value::Null), "");
    }
}
