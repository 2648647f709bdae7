use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use conductor_core::error::{ConductorError, Result};
use conductor_core::template::{ConditionalEdge, Step, Template};

use super::loops::LoopPatterns;
use super::validator::validate;

/// Where execution goes after a step completes.
#[derive(Debug, Clone, PartialEq)]
pub enum Successors {
    /// Exactly one dependent.
    Direct(String),
    /// Several unordered dependents, scheduled together.
    FanOut(Vec<String>),
    /// Routed at runtime; ordinary successors are suppressed.
    Conditional(ConditionalEdge),
    /// No dependents: wired to the run's terminal sink.
    Terminal,
}

/// A validated template ready for execution.
///
/// Immutable once built; every run of the template reads the same copy.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    template: Template,
    entry_steps: Vec<String>,
    successors: HashMap<String, Successors>,
    /// Declaration index per step id.
    order: HashMap<String, usize>,
    patterns: LoopPatterns,
}

/// Validate and compile a template.
///
/// A template with any validation finding is rejected with
/// [`ConductorError::InvalidTemplate`] and never compiled.
pub fn compile(template: Template) -> Result<CompiledWorkflow> {
    let errors = validate(&template);
    if !errors.is_empty() {
        return Err(ConductorError::InvalidTemplate {
            template: template.name.clone(),
            errors,
        });
    }

    let order: HashMap<String, usize> = template
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();

    let mut entry_steps: Vec<String> = template
        .steps
        .iter()
        .filter(|s| s.depends_on.is_empty())
        .map(|s| s.id.clone())
        .collect();
    if entry_steps.is_empty() {
        if let Some(first) = template.steps.first() {
            warn!(
                template = %template.name,
                step_id = %first.id,
                "No step without dependencies, falling back to the first declared step"
            );
            entry_steps.push(first.id.clone());
        }
    }

    let ancestors = ancestor_sets(&template);
    for (group, before, after) in ordered_group_members(&template, &ancestors) {
        warn!(
            template = %template.name,
            group,
            before,
            after,
            "Steps share a parallel group but are ordered by dependencies; dependencies win"
        );
    }
    let mut successors = HashMap::new();
    for step in &template.steps {
        let edge = match template.conditional_edge_from(&step.id) {
            Some(conditional) => Successors::Conditional(conditional.clone()),
            None => fan_out(step, &template, &ancestors),
        };
        debug!(template = %template.name, step_id = %step.id, successors = ?edge, "Wired step");
        successors.insert(step.id.clone(), edge);
    }

    Ok(CompiledWorkflow {
        patterns: LoopPatterns::detect(&template),
        template,
        entry_steps,
        successors,
        order,
    })
}

/// Ordinary successors of `step`: dependents that are not themselves
/// ordered after another dependent.
fn fan_out(
    step: &Step,
    template: &Template,
    ancestors: &HashMap<&str, HashSet<&str>>,
) -> Successors {
    let dependents: Vec<&str> = template
        .steps
        .iter()
        .filter(|s| s.depends_on.iter().any(|d| d == &step.id))
        .map(|s| s.id.as_str())
        .collect();

    let mut immediate: Vec<String> = Vec::new();
    for &dependent in &dependents {
        let ordered_after_sibling = dependents.iter().any(|&other| {
            other != dependent
                && ancestors
                    .get(dependent)
                    .is_some_and(|set| set.contains(other))
        });
        if !ordered_after_sibling && !immediate.iter().any(|d| d == dependent) {
            immediate.push(dependent.to_string());
        }
    }

    match immediate.len() {
        0 => Successors::Terminal,
        1 => Successors::Direct(immediate.remove(0)),
        _ => Successors::FanOut(immediate),
    }
}

/// Steps sharing a `parallel_group` label while one depends (directly or
/// transitively) on the other, as `(group, earlier, later)`.
///
/// The label only permits concurrency; scheduling follows `depends_on`.
fn ordered_group_members<'t>(
    template: &'t Template,
    ancestors: &HashMap<&'t str, HashSet<&'t str>>,
) -> Vec<(&'t str, &'t str, &'t str)> {
    let depends = |later: &str, earlier: &str| {
        ancestors
            .get(later)
            .is_some_and(|set| set.contains(earlier))
    };

    let mut found = Vec::new();
    for (i, a) in template.steps.iter().enumerate() {
        let Some(group) = a.parallel_group.as_deref() else {
            continue;
        };
        for b in template.steps[i + 1..]
            .iter()
            .filter(|b| b.parallel_group.as_deref() == Some(group))
        {
            if depends(&b.id, &a.id) {
                found.push((group, a.id.as_str(), b.id.as_str()));
            } else if depends(&a.id, &b.id) {
                found.push((group, b.id.as_str(), a.id.as_str()));
            }
        }
    }
    found
}

/// Transitive `depends_on` closure of every step. Assumes no cycles.
fn ancestor_sets(template: &Template) -> HashMap<&str, HashSet<&str>> {
    fn collect<'t>(
        id: &'t str,
        template: &'t Template,
        memo: &mut HashMap<&'t str, HashSet<&'t str>>,
    ) -> HashSet<&'t str> {
        if let Some(done) = memo.get(id) {
            return done.clone();
        }
        let mut set = HashSet::new();
        for step in template.steps.iter().filter(|s| s.id == id) {
            for dep in &step.depends_on {
                set.insert(dep.as_str());
                set.extend(collect(dep, template, memo));
            }
        }
        memo.insert(id, set.clone());
        set
    }

    let mut memo = HashMap::new();
    for step in &template.steps {
        collect(&step.id, template, &mut memo);
    }
    memo
}

impl CompiledWorkflow {
    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Steps that start the run, in declaration order.
    pub fn entry_steps(&self) -> &[String] {
        &self.entry_steps
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.template.step(id)
    }

    pub fn successors(&self, step_id: &str) -> &Successors {
        static TERMINAL: Successors = Successors::Terminal;
        self.successors.get(step_id).unwrap_or(&TERMINAL)
    }

    pub fn patterns(&self) -> &LoopPatterns {
        &self.patterns
    }

    /// Declaration index of a step; unknown ids sort last.
    pub fn position(&self, step_id: &str) -> usize {
        self.order.get(step_id).copied().unwrap_or(usize::MAX)
    }

    /// Static topological layering: entry steps first, then every step
    /// whose dependencies all sit in earlier layers. Used for diagnostics;
    /// the coordinator schedules from completions, not from these layers.
    pub fn execution_layers(&self) -> Vec<Vec<String>> {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut layers = Vec::new();
        let mut remaining: Vec<&Step> = self.template.steps.iter().collect();

        while !remaining.is_empty() {
            let layer: Vec<String> = remaining
                .iter()
                .filter(|s| s.depends_on.iter().all(|d| placed.contains(d.as_str())))
                .map(|s| s.id.clone())
                .collect();
            if layer.is_empty() {
                break;
            }
            placed.extend(
                remaining
                    .iter()
                    .filter(|s| layer.contains(&s.id))
                    .map(|s| s.id.as_str()),
            );
            remaining.retain(|s| !layer.contains(&s.id));
            layers.push(layer);
        }
        layers
    }
}
