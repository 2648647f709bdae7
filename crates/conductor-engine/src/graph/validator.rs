use std::collections::{HashMap, HashSet};

use conductor_core::error::ValidationError;
use conductor_core::template::{StepKind, Template};

/// Check a template for structural problems.
///
/// Runs every check and returns all findings (empty = valid), in this order:
/// duplicate ids, dangling references, missing kind configuration, cycles
/// in `depends_on`.
pub fn validate(template: &Template) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    check_duplicates(template, &mut errors);
    check_references(template, &mut errors);
    check_kind_fields(template, &mut errors);
    check_cycles(template, &mut errors);
    errors
}

fn check_duplicates(template: &Template, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for step in &template.steps {
        if !seen.insert(step.id.as_str()) && reported.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStep(step.id.clone()));
        }
    }
}

fn check_references(template: &Template, errors: &mut Vec<ValidationError>) {
    for step in &template.steps {
        for dep in &step.depends_on {
            if !template.has_step(dep) {
                errors.push(ValidationError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut aliases: Vec<_> = template.aliases.iter().collect();
    aliases.sort();
    for (alias, target) in aliases {
        if template.has_step(alias) {
            errors.push(ValidationError::AliasShadowsStep(alias.clone()));
        }
        if !template.has_step(target) {
            errors.push(ValidationError::UnknownAliasTarget {
                alias: alias.clone(),
                target: target.clone(),
            });
        }
    }

    let mut sources = HashSet::new();
    for edge in &template.conditional_edges {
        if !template.has_step(&edge.from_step) {
            errors.push(ValidationError::UnknownEdgeSource(edge.from_step.clone()));
        } else if !sources.insert(edge.from_step.as_str()) {
            errors.push(ValidationError::DuplicateConditionalEdge(
                edge.from_step.clone(),
            ));
        }

        for target in edge.targets() {
            let known = template.has_step(target) || template.aliases.contains_key(target);
            if !known {
                errors.push(ValidationError::UnknownEdgeTarget {
                    from: edge.from_step.clone(),
                    target: target.to_string(),
                });
            }
        }
    }
}

fn check_kind_fields(template: &Template, errors: &mut Vec<ValidationError>) {
    fn missing(name: &Option<String>) -> bool {
        name.as_deref().map_or(true, |n| n.trim().is_empty())
    }

    for step in &template.steps {
        match &step.kind {
            StepKind::ToolCall { tool, .. } if missing(tool) => {
                errors.push(ValidationError::MissingToolName(step.id.clone()));
            }
            StepKind::SubWorkflow { workflow, .. } if missing(workflow) => {
                errors.push(ValidationError::MissingWorkflowName(step.id.clone()));
            }
            StepKind::FunctionCall {
                library, function, ..
            } if missing(library) || missing(function) => {
                errors.push(ValidationError::MissingFunctionName(step.id.clone()));
            }
            _ => {}
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    InProgress,
    Done,
}

/// Depth-first search over `depends_on`; an edge back into the in-progress
/// set closes a cycle.
fn check_cycles(template: &Template, errors: &mut Vec<ValidationError>) {
    let mut deps: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &template.steps {
        deps.entry(step.id.as_str()).or_default().extend(
            step.depends_on
                .iter()
                .map(String::as_str)
                .filter(|d| template.has_step(d)),
        );
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();
    for step in &template.steps {
        visit(step.id.as_str(), &deps, &mut marks, &mut stack, errors);
    }
}

fn visit<'a>(
    id: &'a str,
    deps: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
    errors: &mut Vec<ValidationError>,
) {
    match marks.get(id) {
        Some(Mark::Done) => return,
        Some(Mark::InProgress) => {
            let start = stack.iter().position(|s| *s == id).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            errors.push(ValidationError::Cycle(cycle));
            return;
        }
        None => {}
    }

    marks.insert(id, Mark::InProgress);
    stack.push(id);
    if let Some(children) = deps.get(id) {
        for child in children {
            visit(child, deps, marks, stack, errors);
        }
    }
    stack.pop();
    marks.insert(id, Mark::Done);
}
