//! Pipeline templates and the read-only registry that serves them.
//!
//! Templates are loaded once (from a TOML file or the embedded built-ins)
//! and shared as `Arc<Template>` by every job created from them.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::state_machine::{Params, RetryPolicy};

const BUILTIN_TEMPLATES: &str = include_str!("../templates/builtin.toml");

/// One step of a pipeline template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub name: String,
    /// Name of the service binding invoked for this step.
    pub service: String,
    pub timeout_ms: u64,
    #[serde(default)]
    pub requires_external_call: bool,
    /// Config keys that must be present before a job is enqueued. Only
    /// enforced on steps that require an external call.
    #[serde(default)]
    pub required_params: Vec<String>,
    /// Earlier steps whose results are handed to this step.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub estimated_duration_ms: u64,
    #[serde(flatten)]
    pub retry: RetryPolicy,
}

impl StepDefinition {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Immutable, named sequence of steps with default configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_config: Params,
    pub steps: Vec<StepDefinition>,
    /// Sum of the step estimates, computed at load time.
    #[serde(default)]
    pub estimated_duration_ms: u64,
}

impl Template {
    fn finalize(mut self) -> Result<Self, EngineError> {
        let invalid = |reason: String| EngineError::InvalidTemplate {
            template_id: self.id.clone(),
            reason,
        };

        if self.steps.is_empty() {
            return Err(invalid("template has no steps".into()));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if step.timeout_ms == 0 {
                return Err(invalid(format!("step `{}` has a zero timeout", step.id)));
            }
            if let Some(input) = step.inputs.iter().find(|i| !seen.contains(i.as_str())) {
                return Err(invalid(format!(
                    "step `{}` takes input from `{input}`, which is not an earlier step",
                    step.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(invalid(format!("duplicate step id `{}`", step.id)));
            }
        }

        self.estimated_duration_ms = self.steps.iter().map(|s| s.estimated_duration_ms).sum();
        Ok(self)
    }

    /// Caller params win key-by-key over the template defaults.
    pub fn merge_params(&self, params: Params) -> Params {
        let mut merged = self.default_config.clone();
        merged.extend(params);
        merged
    }

    /// Checks the required keys of every external-call step against
    /// already merged params. `null` counts as absent.
    pub fn validate_params(&self, merged: &Params) -> Result<(), EngineError> {
        let missing: Vec<String> = self
            .steps
            .iter()
            .filter(|step| step.requires_external_call)
            .flat_map(|step| {
                step.required_params
                    .iter()
                    .filter(|key| merged.get(key.as_str()).is_none_or(|v| v.is_null()))
                    .map(move |key| format!("`{key}` (step `{}`)", step.id))
            })
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidParams(format!(
                "template `{}` is missing required params: {}",
                self.id,
                missing.join(", ")
            )))
        }
    }

    /// Distinct service bindings used by this template.
    pub fn bindings(&self) -> impl Iterator<Item = &str> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .map(|s| s.service.as_str())
            .filter(move |b| seen.insert(*b))
    }
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default, rename = "template")]
    templates: Vec<Template>,
}

/// Read-only lookup of templates by id.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Arc<Template>>,
}

impl TemplateRegistry {
    pub fn new(templates: Vec<Template>) -> Result<Self, EngineError> {
        let mut map = BTreeMap::new();
        for template in templates {
            let template = template.finalize()?;
            if map.contains_key(&template.id) {
                return Err(EngineError::InvalidTemplate {
                    template_id: template.id,
                    reason: "duplicate template id".into(),
                });
            }
            map.insert(template.id.clone(), Arc::new(template));
        }
        Ok(Self { templates: map })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let file: TemplateFile = toml::from_str(contents)?;
        Self::new(file.templates)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Templates shipped with the binary.
    pub fn builtin() -> Result<Self, EngineError> {
        Self::from_toml_str(BUILTIN_TEMPLATES)
    }

    pub fn get(&self, template_id: &str) -> Result<Arc<Template>, EngineError> {
        self.templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| EngineError::TemplateNotFound(template_id.to_string()))
    }

    pub fn list(&self) -> Vec<Arc<Template>> {
        self.templates.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
