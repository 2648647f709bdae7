//! Execution of a single step.
//!
//! The dispatcher resolves the step's instruction, hands it to the
//! collaborator for the step's kind, and retries retryable failures until
//! the step's budget runs out. It never touches the run state: everything
//! the step contributes comes back as a [`StepUpdate`] for the coordinator
//! to merge.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_core::config::EngineConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::template::{Step, StepKind};
use conductor_core::types::{value_to_text, ChatTurn, ExecutionLogEntry, ModelRequest, RunEvent};

use crate::engine::WorkflowEngine;
use crate::graph::CompiledWorkflow;
use crate::metadata;
use crate::state::{RunState, StepOutcome, StepUpdate};
use crate::substitution::{function_arguments, tool_arguments, Substitution};
use crate::subworkflow::{sub_parameters, InvocationContext};

/// History selector that replays every completed step.
const ALL_STEPS: &str = "*";

/// Runs steps of one workflow run.
pub struct StepDispatcher<'a> {
    engine: &'a WorkflowEngine,
    workflow: &'a CompiledWorkflow,
    context: &'a InvocationContext,
    /// Cancelled once the run records a fatal error.
    abort: &'a CancellationToken,
}

impl<'a> StepDispatcher<'a> {
    pub fn new(
        engine: &'a WorkflowEngine,
        workflow: &'a CompiledWorkflow,
        context: &'a InvocationContext,
        abort: &'a CancellationToken,
    ) -> Self {
        Self {
            engine,
            workflow,
            context,
            abort,
        }
    }

    /// Execute `step` against a snapshot of the run state.
    ///
    /// Retryable failures are re-attempted in place, after an exponential
    /// backoff, while the step's budget allows; `RunState::retry_counts` plus the attempts made here
    /// never exceed the budget. A fatal failure cancels the run's abort
    /// token so steps that have not started yet are skipped.
    pub async fn execute(&self, step: &Step, state: &RunState) -> StepUpdate {
        if state.error.is_some() || self.abort.is_cancelled() {
            debug!(step_id = %step.id, "Run already failed, skipping step");
            return StepUpdate::skipped(&step.id);
        }

        let config = self.engine.config();
        let budget = step.budget(config.max_retries);
        let prior = state.attempts(&step.id);
        let kind = step.kind.name();
        let mut update = StepUpdate::skipped(&step.id);

        loop {
            if self.abort.is_cancelled() {
                debug!(step_id = %step.id, "Run failed during retries, giving up");
                update.outcome = StepOutcome::Skipped;
                return update;
            }

            let made = prior + update.attempts;
            if made >= budget {
                let err = ConductorError::RetryBudgetExhausted {
                    step: step.id.clone(),
                    budget,
                };
                error!(step_id = %step.id, budget, "Retry budget exhausted");
                return self.fail(update, err);
            }

            let attempt = made + 1;
            self.engine.publish(RunEvent::StepStarted {
                run_id: state.run_id.clone(),
                step_id: step.id.clone(),
                attempt,
            });
            info!(step_id = %step.id, kind, attempt, "Executing step");

            let started = Instant::now();
            let result = self.attempt(step, state).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            update.attempts += 1;

            let entry = match &result {
                Ok(output) => ExecutionLogEntry::success(&step.id, kind, attempt, output, elapsed_ms),
                Err(e) => ExecutionLogEntry::failure(&step.id, kind, attempt, e.to_string(), elapsed_ms),
            };
            if self.engine.event_bus().has_subscribers() {
                self.engine.publish(RunEvent::StepFinished {
                    run_id: state.run_id.clone(),
                    entry: entry.clone(),
                });
            }
            update.log.push(entry);

            match result {
                Ok(output) => {
                    info!(step_id = %step.id, attempt, elapsed_ms, "Step completed");
                    let metadata = metadata::extract(&output);
                    if !metadata.is_empty() {
                        debug!(step_id = %step.id, fields = metadata.len(), "Extracted metadata");
                    }
                    update.outcome = StepOutcome::Completed { output, metadata };
                    return update;
                }
                Err(e) if e.is_retryable() => {
                    if prior + update.attempts >= budget {
                        warn!(step_id = %step.id, attempt, budget, error = %e, "Step failed with no attempts left");
                        continue;
                    }
                    let backoff = calculate_backoff(update.attempts - 1, config);
                    warn!(
                        step_id = %step.id,
                        attempt,
                        budget,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.abort.cancelled() => {
                            debug!(step_id = %step.id, "Run failed while waiting to retry, giving up");
                            update.outcome = StepOutcome::Skipped;
                            return update;
                        }
                    }
                }
                Err(e) => {
                    error!(step_id = %step.id, attempt, error = %e, "Step failed fatally");
                    return self.fail(update, e);
                }
            }
        }
    }

    fn fail(&self, mut update: StepUpdate, err: ConductorError) -> StepUpdate {
        self.abort.cancel();
        update.outcome = StepOutcome::Failed(err.to_string());
        update
    }

    /// One attempt: substitution, then the collaborator call under the
    /// step's timeout.
    async fn attempt(&self, step: &Step, state: &RunState) -> Result<String> {
        let config = self.engine.config();
        let subst = Substitution::new(
            self.workflow.template(),
            self.workflow.patterns(),
            state,
            config,
        );
        let instruction = subst.resolve(&step.id, &step.instruction)?;

        let timeout_secs = step.timeout_secs.unwrap_or(config.default_timeout_secs);
        match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.call(step, instruction, &subst, state),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConductorError::StepTimeout {
                step: step.id.clone(),
                timeout_secs,
            }),
        }
    }

    async fn call(
        &self,
        step: &Step,
        instruction: String,
        subst: &Substitution<'_>,
        state: &RunState,
    ) -> Result<String> {
        let collaborators = self.engine.collaborators();
        let missing = |kind: &str| ConductorError::MissingCollaborator {
            step: step.id.clone(),
            kind: kind.to_string(),
        };

        match &step.kind {
            StepKind::Agent { agent } => {
                let collaborator = collaborators.agent.as_ref().ok_or_else(|| missing("agent"))?;
                collaborator.invoke(agent.as_deref(), instruction).await
            }
            StepKind::ToolCall {
                tool,
                argument_name,
            } => {
                let tool = required(step, tool, "tool name")?;
                let collaborator = collaborators.tool.as_ref().ok_or_else(|| missing("tool"))?;
                let arguments = tool_arguments(
                    &instruction,
                    argument_name.as_deref(),
                    collaborator.required_parameter(tool),
                );
                debug!(step_id = %step.id, tool, %arguments, "Calling tool");
                collaborator.call(tool, arguments).await
            }
            StepKind::FunctionCall {
                library,
                function,
                arguments,
            } => {
                let library = required(step, library, "library")?;
                let function = required(step, function, "function")?;
                let collaborator = collaborators
                    .function
                    .as_ref()
                    .ok_or_else(|| missing("function"))?;
                let arguments = match subst.resolve_value(&step.id, &Value::Object(arguments.clone()))? {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                let arguments = function_arguments(arguments, &instruction);
                let result = collaborator.call(library, function, arguments).await?;
                Ok(value_to_text(&result))
            }
            StepKind::DirectModelCall {
                provider,
                model,
                settings,
                system_prompt,
                history_from,
            } => {
                let collaborator = collaborators.model.as_ref().ok_or_else(|| missing("model"))?;
                let system_prompt = system_prompt
                    .as_deref()
                    .map(|prompt| subst.resolve(&step.id, prompt))
                    .transpose()?;
                let request = ModelRequest {
                    provider: provider.clone(),
                    model: model.clone(),
                    settings: settings.clone(),
                    system_prompt,
                    history: conversation_history(history_from, state),
                    instruction,
                };
                collaborator.invoke(request).await
            }
            StepKind::SubWorkflow {
                workflow,
                parameters,
                max_depth,
                expose_outputs,
            } => {
                let name = required(step, workflow, "workflow name")?;
                let max_depth = max_depth.unwrap_or(self.engine.config().max_recursion_depth);
                let child = self.context.enter(name, max_depth)?;

                let mut overrides = HashMap::with_capacity(parameters.len());
                for (key, value) in parameters {
                    overrides.insert(key.clone(), subst.resolve_value(&step.id, value)?);
                }
                let params = sub_parameters(
                    &state.parameters,
                    expose_outputs.then_some(&state.step_outputs),
                    overrides,
                );

                info!(step_id = %step.id, workflow = name, depth = child.depth, "Invoking sub-workflow");
                let result = self
                    .engine
                    .run_nested(name, params, child, self.abort.child_token(), &state.run_id)
                    .await?;
                if result.success {
                    Ok(result.output.unwrap_or_default())
                } else {
                    Err(ConductorError::SubWorkflowFailed {
                        template: name.to_string(),
                        message: result.error.unwrap_or_else(|| "unknown error".into()),
                    })
                }
            }
        }
    }
}

/// Delay before retry number `retry` (0-based): exponential from
/// `initial_backoff_ms`, capped at `max_backoff_ms`.
fn calculate_backoff(retry: u32, config: &EngineConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(retry))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

fn required<'s>(step: &Step, value: &'s Option<String>, what: &str) -> Result<&'s str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConductorError::StepConfig {
            step: step.id.clone(),
            message: format!("missing {what}"),
        }),
    }
}

/// Rebuild conversation turns from completed steps, in completion order.
///
/// A step that completed several times contributes one turn, placed at its
/// latest completion and carrying its latest output.
pub fn conversation_history(history_from: &[String], state: &RunState) -> Vec<ChatTurn> {
    if history_from.is_empty() {
        return vec![];
    }
    let all = history_from.iter().any(|s| s == ALL_STEPS);

    let mut seen: HashSet<&str> = HashSet::new();
    let mut turns = Vec::new();
    for id in state.completed_steps.iter().rev() {
        if !(all || history_from.contains(id)) || !seen.insert(id.as_str()) {
            continue;
        }
        if let Some(output) = state.output(id) {
            turns.push(ChatTurn::from_step(id, output));
        }
    }
    turns.reverse();
    turns
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::types::RunId;

    fn completed(state: &mut RunState, id: &str, output: &str) {
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
            None,
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = EngineConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            ..Default::default()
        };
        let within = |d: Duration, base: u64| {
            let ms = d.as_millis() as u64;
            ms + 1 >= base * 8 / 10 && ms <= base * 12 / 10
        };
        assert!(within(calculate_backoff(0, &config), 100));
        assert!(within(calculate_backoff(1, &config), 200));
        assert!(within(calculate_backoff(3, &config), 800));
        assert!(within(calculate_backoff(10, &config), 1000));
        assert!(within(calculate_backoff(u32::MAX, &config), 1000));
    }

    #[test]
    fn test_history_selection_and_order() {
        let mut state = RunState::new(RunId::new(), HashMap::new());
        completed(&mut state, "plan", "p");
        completed(&mut state, "draft", "d1");
        completed(&mut state, "review", "r");
        completed(&mut state, "draft", "d2");

        let turns = conversation_history(&["draft".into(), "plan".into()], &state);
        let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["p", "d2"]);

        let all = conversation_history(&["*".into()], &state);
        let ids: Vec<_> = all.iter().filter_map(|t| t.step_id.as_deref()).collect();
        assert_eq!(ids, vec!["plan", "review", "draft"]);

        assert!(conversation_history(&[], &state).is_empty());
    }

    #[test]
    fn test_required_field() {
        let step = Step::agent("s", "x");
        assert_eq!(required(&step, &Some("lib".into()), "library").unwrap(), "lib");
        let err = required(&step, &Some("  ".into()), "library").unwrap_err();
        assert!(err.to_string().contains("missing library"));
        assert!(!err.is_retryable());
    }
}
