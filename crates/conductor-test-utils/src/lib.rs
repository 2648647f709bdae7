//! Scripted collaborators and helpers shared by Conductor tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::debug;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::{
    AgentCollaborator, FunctionCollaborator, ModelCollaborator, ToolCollaborator,
};
use conductor_core::types::ModelRequest;

/// Install a test-friendly tracing subscriber. Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// Fail with a retryable collaborator error.
    Transient(String),
    /// Fail with a fatal collaborator error.
    Fatal(String),
    /// Sleep, then answer.
    Delayed(Duration, String),
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Reply::Text(s.into())
    }

    async fn resolve(self) -> Result<String> {
        match self {
            Reply::Text(s) => Ok(s),
            Reply::Transient(msg) => Err(ConductorError::Collaborator(msg)),
            Reply::Fatal(msg) => Err(ConductorError::CollaboratorFatal(msg)),
            Reply::Delayed(delay, s) => {
                tokio::time::sleep(delay).await;
                Ok(s)
            }
        }
    }
}

/// Agent that answers from per-key scripts.
///
/// A call matches the first script whose key equals the requested agent
/// profile or is a prefix of the instruction. Each call consumes the next
/// reply; the last reply repeats once the script runs out. Unmatched calls
/// echo the instruction.
#[derive(Default)]
pub struct ScriptedAgent {
    scripts: Mutex<Vec<(String, Vec<Reply>, usize)>>,
    calls: Mutex<Vec<AgentCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A recorded agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCall {
    pub agent: Option<String>,
    pub instruction: String,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, key: impl Into<String>, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .push((key.into(), replies, 0));
        self
    }

    /// Shorthand for a script of plain text replies.
    pub fn reply(self, key: impl Into<String>, texts: &[&str]) -> Self {
        let replies = texts.iter().map(|t| Reply::text(*t)).collect();
        self.on(key, replies)
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls whose instruction starts with `prefix`.
    pub fn calls_starting_with(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.instruction.starts_with(prefix))
            .count()
    }

    /// Highest number of calls that were running at the same time.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, agent: Option<&str>, instruction: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.iter_mut().find(|(key, _, _)| {
            agent == Some(key.as_str()) || instruction.starts_with(key.as_str())
        });
        match script {
            Some((_, replies, cursor)) if !replies.is_empty() => {
                let idx = (*cursor).min(replies.len() - 1);
                *cursor += 1;
                replies[idx].clone()
            }
            _ => Reply::Text(instruction.to_string()),
        }
    }
}

impl AgentCollaborator for ScriptedAgent {
    fn invoke(&self, agent: Option<&str>, instruction: String) -> BoxFuture<'_, Result<String>> {
        self.calls.lock().unwrap().push(AgentCall {
            agent: agent.map(str::to_string),
            instruction: instruction.clone(),
        });
        let reply = self.next_reply(agent, &instruction);
        debug!(agent = ?agent, reply = ?reply, "Scripted agent call");

        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let result = reply.resolve().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

/// Agent that sleeps before answering, for timeout tests.
pub struct SlowAgent {
    delay: Duration,
}

impl SlowAgent {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl AgentCollaborator for SlowAgent {
    fn invoke(&self, _agent: Option<&str>, instruction: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(instruction)
        })
    }
}

/// Tool collaborator that records every call.
#[derive(Default)]
pub struct RecordingTool {
    replies: HashMap<String, String>,
    required: HashMap<String, String>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl RecordingTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed reply for `tool`. Tools without one answer with their arguments.
    pub fn with_reply(mut self, tool: impl Into<String>, reply: impl Into<String>) -> Self {
        self.replies.insert(tool.into(), reply.into());
        self
    }

    /// Declare the required parameter of `tool`.
    pub fn with_required_parameter(
        mut self,
        tool: impl Into<String>,
        parameter: impl Into<String>,
    ) -> Self {
        self.required.insert(tool.into(), parameter.into());
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ToolCollaborator for RecordingTool {
    fn call(&self, tool: &str, arguments: Value) -> BoxFuture<'_, Result<String>> {
        self.calls
            .lock()
            .unwrap()
            .push((tool.to_string(), arguments.clone()));
        let reply = self
            .replies
            .get(tool)
            .cloned()
            .unwrap_or_else(|| arguments.to_string());
        Box::pin(async move { Ok(reply) })
    }

    fn required_parameter(&self, tool: &str) -> Option<String> {
        self.required.get(tool).cloned()
    }
}

/// Function library that echoes its call back as JSON, with `math::sum`
/// adding up its numeric arguments.
#[derive(Default)]
pub struct EchoFunctions {
    calls: Mutex<Vec<(String, String, Map<String, Value>)>>,
}

impl EchoFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, String, Map<String, Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl FunctionCollaborator for EchoFunctions {
    fn call(
        &self,
        library: &str,
        function: &str,
        arguments: Map<String, Value>,
    ) -> BoxFuture<'_, Result<Value>> {
        self.calls.lock().unwrap().push((
            library.to_string(),
            function.to_string(),
            arguments.clone(),
        ));
        let result = match (library, function) {
            ("math", "sum") => {
                let total: f64 = arguments.values().filter_map(Value::as_f64).sum();
                Ok(json!(total))
            }
            ("math", _) => Err(ConductorError::CollaboratorFatal(format!(
                "unknown function math::{function}"
            ))),
            _ => Ok(json!({
                "library": library,
                "function": function,
                "arguments": arguments,
            })),
        };
        Box::pin(async move { result })
    }
}

/// Model collaborator that records requests and answers with a fixed text
/// (or the instruction when none is set).
#[derive(Default)]
pub struct ScriptedModel {
    reply: Option<String>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ModelCollaborator for ScriptedModel {
    fn invoke(&self, request: ModelRequest) -> BoxFuture<'_, Result<String>> {
        let reply = self
            .reply
            .clone()
            .unwrap_or_else(|| request.instruction.clone());
        self.requests.lock().unwrap().push(request);
        Box::pin(async move { Ok(reply) })
    }
}

/// Template documents shared by tests.
pub mod fixtures {
    /// fetch -> check, routing to `done` when the check reports `ok`, and
    /// back to `fetch` through the `retry_fetch` alias otherwise.
    pub const FETCH_LOOP_JSON: &str = r#"{
  "name": "fetch-loop",
  "description": "Fetch until the check passes",
  "parameters": { "source": "https://example.com/feed" },
  "steps": [
    { "id": "fetch", "kind": "agent", "instruction": "fetch {source}" },
    { "id": "check", "kind": "agent", "instruction": "check {fetch}", "depends_on": ["fetch"] },
    { "id": "done", "kind": "agent", "instruction": "done with {fetch}", "depends_on": ["check"] }
  ],
  "conditional_edges": [
    {
      "from_step": "check",
      "conditions": [
        { "field": "check.ok", "operator": "==", "value": true, "target": "done" }
      ],
      "default": "retry_fetch"
    }
  ],
  "aliases": { "retry_fetch": "fetch" }
}"#;

    /// research fans out to two drafts that merge into a review.
    pub const DIAMOND_JSON: &str = r#"{
  "name": "diamond",
  "steps": [
    { "id": "research", "kind": "agent", "instruction": "research {topic}" },
    { "id": "outline", "kind": "agent", "instruction": "outline {research}", "depends_on": ["research"], "parallel_group": "drafts" },
    { "id": "examples", "kind": "agent", "instruction": "examples for {research}", "depends_on": ["research"], "parallel_group": "drafts" },
    { "id": "review", "kind": "agent", "instruction": "review {outline} {examples}", "depends_on": ["outline", "examples"] }
  ],
  "parameters": { "topic": "tokio" }
}"#;

    /// Refers to a step that does not exist.
    pub const BROKEN_JSON: &str = r#"{
  "name": "broken",
  "steps": [
    { "id": "a", "kind": "agent", "instruction": "x", "depends_on": ["ghost"] },
    { "id": "b", "kind": "tool-call", "instruction": "y" }
  ]
}"#;
}
