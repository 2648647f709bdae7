use std::collections::HashMap;

use serde_json::{Map, Value};

use conductor_core::types::{ExecutionLogEntry, RunId};

/// The terminal error of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunError {
    /// Step that caused the failure (`None` for failures before any step ran).
    pub step_id: Option<String>,
    pub message: String,
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step_id {
            Some(step) => write!(f, "step '{}' failed: {}", step, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Mutable state of one run.
///
/// Owned by the run coordinator. Steps only ever see a shared borrow; their
/// contributions come back as [`StepUpdate`]s and are folded in with
/// [`RunState::merge`] once the step has fully finished.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: RunId,
    /// Template defaults overlaid with caller-supplied values.
    pub parameters: HashMap<String, Value>,
    /// Completion order; a re-entered step appears once per completion.
    pub completed_steps: Vec<String>,
    /// Latest output per step.
    pub step_outputs: HashMap<String, String>,
    /// Fields derived from each step's latest output.
    pub metadata: HashMap<String, Map<String, Value>>,
    /// Attempts per step, successful or not.
    pub retry_counts: HashMap<String, u32>,
    /// Loop pattern key -> members in the order they completed.
    pub loop_context: HashMap<String, Vec<String>>,
    /// Write-once terminal error.
    pub error: Option<RunError>,
    pub execution_log: Vec<ExecutionLogEntry>,
}

impl RunState {
    pub fn new(run_id: RunId, parameters: HashMap<String, Value>) -> Self {
        Self {
            run_id,
            parameters,
            completed_steps: vec![],
            step_outputs: HashMap::new(),
            metadata: HashMap::new(),
            retry_counts: HashMap::new(),
            loop_context: HashMap::new(),
            error: None,
            execution_log: vec![],
        }
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.step_outputs.contains_key(step_id)
    }

    pub fn attempts(&self, step_id: &str) -> u32 {
        self.retry_counts.get(step_id).copied().unwrap_or(0)
    }

    pub fn output(&self, step_id: &str) -> Option<&str> {
        self.step_outputs.get(step_id).map(String::as_str)
    }

    /// Execution order of a loop pattern's members so far.
    pub fn loop_history(&self, pattern: &str) -> &[String] {
        self.loop_context
            .get(pattern)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Output of the most recently completed step.
    pub fn last_output(&self) -> Option<&str> {
        self.completed_steps
            .last()
            .and_then(|id| self.output(id))
    }

    /// Set the terminal error unless one is already recorded.
    ///
    /// Returns `false` if an earlier error was kept.
    pub fn fail(&mut self, step_id: Option<String>, message: impl Into<String>) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.error = Some(RunError {
            step_id,
            message: message.into(),
        });
        true
    }

    /// Fold a finished step's contributions into the run.
    ///
    /// Counters and logs are appended, outputs and metadata overwrite per
    /// key, the error is write-once. Once the run has failed, only the log
    /// entries are kept (marked discarded) so a late finisher can neither
    /// influence routing nor replace the first failure.
    pub fn merge(&mut self, update: StepUpdate, loop_pattern: Option<&str>) {
        if self.error.is_some() {
            self.execution_log
                .extend(update.log.into_iter().map(|mut entry| {
                    entry.discarded = true;
                    entry
                }));
            return;
        }

        *self.retry_counts.entry(update.step_id.clone()).or_insert(0) += update.attempts;
        self.execution_log.extend(update.log);

        match update.outcome {
            StepOutcome::Completed { output, metadata } => {
                self.step_outputs.insert(update.step_id.clone(), output);
                if metadata.is_empty() {
                    self.metadata.remove(&update.step_id);
                } else {
                    self.metadata.insert(update.step_id.clone(), metadata);
                }
                if let Some(pattern) = loop_pattern {
                    self.loop_context
                        .entry(pattern.to_string())
                        .or_default()
                        .push(update.step_id.clone());
                }
                self.completed_steps.push(update.step_id);
            }
            StepOutcome::Failed(message) => {
                self.fail(Some(update.step_id), message);
            }
            StepOutcome::Skipped => {}
        }
    }
}

/// How a dispatched step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed {
        output: String,
        metadata: Map<String, Value>,
    },
    /// Fatal failure; becomes the run's terminal error.
    Failed(String),
    /// Not executed because the run had already failed.
    Skipped,
}

/// Everything one dispatched step contributes to the run state.
#[derive(Debug, Clone)]
pub struct StepUpdate {
    pub step_id: String,
    /// Attempts made (including retried ones).
    pub attempts: u32,
    /// One entry per attempt.
    pub log: Vec<ExecutionLogEntry>,
    pub outcome: StepOutcome,
}

impl StepUpdate {
    pub fn skipped(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            attempts: 0,
            log: vec![],
            outcome: StepOutcome::Skipped,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, StepOutcome::Completed { .. })
    }
}
