//! Prompt collaborator interface.
//!
//! Rendering is pure from the core's perspective. The worker supplies a
//! variable map; on retries it includes `RETRY_CONTEXT`, which the service
//! substitutes under the `{{RETRY_CONTEXT}}` marker (empty when absent).

use crate::task::Task;
use anyhow::Result;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable key carrying the retry-context block.
pub const RETRY_CONTEXT_VAR: &str = "RETRY_CONTEXT";

pub type VarMap = HashMap<String, String>;

pub trait PromptService: Send + Sync {
    fn render_phase_prompt(&self, task: &Task, phase: &str, vars: &VarMap) -> Result<String>;
}

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([A-Z0-9_]+)\}\}").unwrap());

/// Substitute `{{NAME}}` placeholders from `vars`; unknown placeholders
/// render empty.
pub fn substitute(template: &str, vars: &VarMap) -> String {
    PLACEHOLDER_REGEX
        .replace_all(template, |caps: &regex::Captures<'_>| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Template-based prompt service with a per-phase template table and a
/// generic fallback.
pub struct TemplatePrompts {
    templates: HashMap<String, String>,
    fallback: String,
}

impl TemplatePrompts {
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
            fallback: default_fallback(),
        }
    }

    pub fn with_template(mut self, phase: &str, template: &str) -> Self {
        self.templates.insert(phase.to_string(), template.to_string());
        self
    }
}

impl Default for TemplatePrompts {
    fn default() -> Self {
        Self::new()
    }
}

fn default_fallback() -> String {
    r#"## TASK
{{TASK_TITLE}}

{{TASK_DESCRIPTION}}

## PHASE
You are working on the {{PHASE}} phase.

{{RETRY_CONTEXT}}

When the phase is fully complete and verified, output:
<phase_complete>true</phase_complete>"#
        .to_string()
}

impl PromptService for TemplatePrompts {
    fn render_phase_prompt(&self, task: &Task, phase: &str, vars: &VarMap) -> Result<String> {
        let template = self.templates.get(phase).unwrap_or(&self.fallback);

        let mut merged = vars.clone();
        merged.insert("TASK_ID".into(), task.id.clone());
        merged.insert("TASK_TITLE".into(), task.title.clone());
        merged.insert(
            "TASK_DESCRIPTION".into(),
            task.description.clone().unwrap_or_default(),
        );
        merged.insert("PHASE".into(), phase.to_string());

        Ok(substitute(template, &merged))
    }
}
