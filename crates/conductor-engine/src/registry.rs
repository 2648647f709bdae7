use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use conductor_core::error::{ConductorError, Result};
use conductor_core::template::Template;

use crate::graph::{compile, CompiledWorkflow};

/// Compiled workflows by template name.
///
/// Built once at startup and shared read-only with the engine. Only valid
/// templates get in: [`register`](Self::register) validates and compiles.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    workflows: HashMap<String, Arc<CompiledWorkflow>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, compile and register a template.
    pub fn register(&mut self, template: Template) -> Result<Arc<CompiledWorkflow>> {
        if self.workflows.contains_key(&template.name) {
            return Err(ConductorError::DuplicateTemplate(template.name));
        }
        let compiled = Arc::new(compile(template)?);
        info!(
            template = %compiled.name(),
            steps = compiled.template().steps.len(),
            "Registered template"
        );
        self.workflows
            .insert(compiled.name().to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Parse a JSON template document and register it. Returns its name.
    pub fn load_json_str(&mut self, json: &str) -> Result<String> {
        let template = Template::from_json_str(json)?;
        let compiled = self.register(template)?;
        Ok(compiled.name().to_string())
    }

    /// Register the template stored in a JSON file.
    pub fn load_file(&mut self, path: &Path) -> Result<String> {
        let content = std::fs::read_to_string(path)?;
        self.load_json_str(&content)
    }

    /// Register every `*.json` file in `dir`, in file name order.
    ///
    /// Stops at the first template that fails to parse or validate.
    pub fn load_dir(&mut self, dir: &Path) -> Result<Vec<String>> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut names = Vec::with_capacity(paths.len());
        for path in paths {
            debug!(path = %path.display(), "Loading template");
            names.push(self.load_file(&path)?);
        }
        Ok(names)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CompiledWorkflow>> {
        self.workflows.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Registered template names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}
