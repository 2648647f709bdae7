//! Run coordinator.
//!
//! [`WorkflowEngine`] drives a compiled workflow from its entry steps to
//! completion. Each scheduling round takes every triggered step whose
//! dependencies have all completed, runs that batch concurrently against a
//! snapshot of the run state, and merges the results once the whole batch
//! has finished. Successors are then triggered: directly, as a fan-out, or
//! through a conditional edge evaluated against the merged state. The loop
//! ends when nothing is triggered or the run records a fatal error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::{stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_core::config::EngineConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::event::EventBus;
use conductor_core::types::{RunEvent, RunId, RunResult};

use crate::collaborators::Collaborators;
use crate::condition;
use crate::dispatcher::StepDispatcher;
use crate::graph::{CompiledWorkflow, Successors};
use crate::registry::TemplateRegistry;
use crate::run_log::RunLogger;
use crate::state::{RunState, StepOutcome, StepUpdate};
use crate::subworkflow::InvocationContext;

/// Executes registered workflows.
///
/// The registry and collaborators are shared read-only by every run; each
/// run (including every nested sub-workflow run) owns its own state.
pub struct WorkflowEngine {
    registry: Arc<TemplateRegistry>,
    collaborators: Collaborators,
    config: EngineConfig,
    event_bus: Arc<EventBus>,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<TemplateRegistry>, collaborators: Collaborators) -> Self {
        Self {
            registry,
            collaborators,
            config: EngineConfig::default(),
            event_bus: Arc::new(EventBus::default()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish run events on a shared bus instead of a private one.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub(crate) fn publish(&self, event: RunEvent) {
        self.event_bus.publish(event);
    }

    /// Run the template registered as `template`.
    ///
    /// `parameters` override the template's defaults. Only an unknown
    /// template is an `Err`; every failure during the run is reported in
    /// the returned [`RunResult`] together with the execution log so far.
    pub async fn run(
        &self,
        template: &str,
        parameters: HashMap<String, Value>,
    ) -> Result<RunResult> {
        let workflow = self
            .registry
            .get(template)
            .ok_or_else(|| ConductorError::TemplateNotFound(template.to_string()))?;
        let run_id = RunId::new();

        let logger = self.spawn_run_logger(&run_id);
        let result = self
            .execute(
                &workflow,
                parameters,
                InvocationContext::root(template),
                CancellationToken::new(),
                run_id,
                None,
            )
            .await;

        if let Some((handle, cancel)) = logger {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Run logger task failed");
            }
        }
        Ok(result)
    }

    /// Run a sub-workflow with an already checked invocation context.
    ///
    /// Boxed so that runs can nest recursively.
    pub(crate) fn run_nested<'s>(
        &'s self,
        template: &'s str,
        parameters: HashMap<String, Value>,
        context: InvocationContext,
        abort: CancellationToken,
        parent: &'s RunId,
    ) -> BoxFuture<'s, Result<RunResult>> {
        Box::pin(async move {
            let workflow = self
                .registry
                .get(template)
                .ok_or_else(|| ConductorError::TemplateNotFound(template.to_string()))?;
            Ok(self
                .execute(
                    &workflow,
                    parameters,
                    context,
                    abort,
                    RunId::new(),
                    Some(parent.clone()),
                )
                .await)
        })
    }

    fn spawn_run_logger(
        &self,
        run_id: &RunId,
    ) -> Option<(tokio::task::JoinHandle<()>, CancellationToken)> {
        let log = self.config.log.as_ref().filter(|l| l.enabled)?;
        let cancel = CancellationToken::new();
        let logger = RunLogger::new(log.log_dir(), log.level);
        let handle = tokio::spawn(logger.run(
            self.event_bus.subscribe(),
            run_id.clone(),
            cancel.clone(),
        ));
        Some((handle, cancel))
    }

    async fn execute(
        &self,
        workflow: &CompiledWorkflow,
        parameters: HashMap<String, Value>,
        context: InvocationContext,
        abort: CancellationToken,
        run_id: RunId,
        parent: Option<RunId>,
    ) -> RunResult {
        let started = Instant::now();
        let template = workflow.template();

        let mut merged = template.parameters.clone();
        merged.extend(parameters);
        let mut state = RunState::new(run_id.clone(), merged);

        self.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
            parent,
            template: template.name.clone(),
            depth: context.depth,
        });
        info!(
            run_id = %run_id,
            template = %template.name,
            depth = context.depth,
            "Run started"
        );

        let dispatcher = StepDispatcher::new(self, workflow, &context, &abort);
        let mut pending: Vec<String> = workflow.entry_steps().to_vec();

        while !pending.is_empty() && state.error.is_none() {
            let (ready, waiting): (Vec<String>, Vec<String>) = pending
                .into_iter()
                .partition(|id| dependencies_met(workflow, &state, id));
            pending = waiting;
            if ready.is_empty() {
                let err = ConductorError::StepsNeverReady(
                    pending
                        .iter()
                        .map(|id| describe_stuck(workflow, &state, id))
                        .collect(),
                );
                error!(run_id = %run_id, error = %err, "Run stalled");
                state.fail(pending.first().cloned(), err.to_string());
                break;
            }

            debug!(run_id = %run_id, batch = ?ready, "Dispatching batch");
            let updates = self.run_batch(&dispatcher, workflow, &ready, &state).await;

            let mut completed = Vec::new();
            for update in updates {
                if state.error.is_none() && update.is_completed() {
                    completed.push(update.step_id.clone());
                }
                let pattern = workflow.patterns().pattern_of(&update.step_id);
                state.merge(update, pattern);
            }
            if state.error.is_some() {
                break;
            }

            for step_id in &completed {
                for next in self.next_steps(workflow, &state, step_id) {
                    if !pending.contains(&next) {
                        pending.push(next);
                    }
                }
            }
            pending.sort_by_key(|id| workflow.position(id));
        }

        self.finish(workflow, state, started)
    }

    /// Run one batch of ready steps concurrently and return their updates
    /// in merge order.
    async fn run_batch(
        &self,
        dispatcher: &StepDispatcher<'_>,
        workflow: &CompiledWorkflow,
        ready: &[String],
        state: &RunState,
    ) -> Vec<StepUpdate> {
        let finished = AtomicUsize::new(0);
        let finished = &finished;

        let tasks: Vec<_> = ready
            .iter()
            .filter_map(|id| workflow.step(id))
            .enumerate()
            .map(|(index, step)| async move {
                let update = dispatcher.execute(step, state).await;
                (index, finished.fetch_add(1, Ordering::SeqCst), update)
            })
            .collect();

        let results: Vec<(usize, usize, StepUpdate)> = stream::iter(tasks)
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;
        merge_order(results)
    }

    /// Steps to trigger after `step_id` completed.
    fn next_steps(&self, workflow: &CompiledWorkflow, state: &RunState, step_id: &str) -> Vec<String> {
        match workflow.successors(step_id) {
            Successors::Direct(next) => vec![next.clone()],
            Successors::FanOut(next) => next.clone(),
            Successors::Conditional(edge) => {
                let target = condition::route(edge, state);
                let step = workflow.template().resolve_target(target);
                debug!(
                    run_id = %state.run_id,
                    from = step_id,
                    route = target,
                    step_id = step,
                    "Route taken"
                );
                self.publish(RunEvent::RouteTaken {
                    run_id: state.run_id.clone(),
                    from: step_id.to_string(),
                    to: target.to_string(),
                });
                vec![step.to_string()]
            }
            Successors::Terminal => vec![],
        }
    }

    fn finish(&self, workflow: &CompiledWorkflow, state: RunState, started: Instant) -> RunResult {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (error, failed_step) = match &state.error {
            Some(e) => (Some(e.to_string()), e.step_id.clone()),
            None => (None, None),
        };
        let success = error.is_none();

        if success {
            info!(
                run_id = %state.run_id,
                template = %workflow.name(),
                steps = state.completed_steps.len(),
                elapsed_ms,
                "Run completed"
            );
        } else {
            error!(
                run_id = %state.run_id,
                template = %workflow.name(),
                error = error.as_deref().unwrap_or_default(),
                "Run failed"
            );
        }
        self.publish(RunEvent::RunFinished {
            run_id: state.run_id.clone(),
            success,
            error: error.clone(),
        });

        RunResult {
            run_id: state.run_id.clone(),
            template: workflow.name().to_string(),
            success,
            output: state.last_output().map(str::to_string),
            outputs: state.step_outputs,
            execution_log: state.execution_log,
            error,
            failed_step,
            elapsed_ms,
        }
    }
}

fn dependencies_met(workflow: &CompiledWorkflow, state: &RunState, step_id: &str) -> bool {
    workflow
        .step(step_id)
        .is_some_and(|step| step.depends_on.iter().all(|dep| state.is_completed(dep)))
}

/// `step (waiting on a, b)` listing the dependencies that have not completed.
fn describe_stuck(workflow: &CompiledWorkflow, state: &RunState, step_id: &str) -> String {
    let missing: Vec<&str> = workflow
        .step(step_id)
        .map(|step| {
            step.depends_on
                .iter()
                .filter(|dep| !state.is_completed(dep))
                .map(String::as_str)
                .collect()
        })
        .unwrap_or_default();
    format!("{step_id} (waiting on {})", missing.join(", "))
}

/// Order a batch's results for merging.
///
/// Entries are `(declared index, completion sequence, update)`. Without a
/// failure, updates merge in declared order. Otherwise the steps that
/// finished before the first failure merge first (declared order), then
/// that failure, then everything else, which the state discards.
fn merge_order(mut results: Vec<(usize, usize, StepUpdate)>) -> Vec<StepUpdate> {
    results.sort_by_key(|(index, _, _)| *index);
    let first_failure = results
        .iter()
        .filter(|(_, _, u)| matches!(u.outcome, StepOutcome::Failed(_)))
        .map(|(_, seq, _)| *seq)
        .min();

    let Some(cut) = first_failure else {
        return results.into_iter().map(|(_, _, u)| u).collect();
    };

    let (before, rest): (Vec<_>, Vec<_>) = results.into_iter().partition(|(_, seq, _)| *seq < cut);
    let (failure, after): (Vec<_>, Vec<_>) = rest.into_iter().partition(|(_, seq, _)| *seq == cut);
    before
        .into_iter()
        .chain(failure)
        .chain(after)
        .map(|(_, _, u)| u)
        .collect()
}
