//! Plan ingestion: the shape the planner agent hands the orchestrator.

use serde::{Deserialize, Serialize};

/// One sub-task in a development plan, before it has been turned into a
/// [`crate::task::Task`]. Dependencies are resolved against other entries'
/// `id` or `target_file_path` by the dependency analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub id: String,
    pub title: String,
    pub target_file_path: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub language_hint: Option<String>,
    /// Source text, if available; used by the dependency analyzer's textual
    /// import scan when `dependencies` is not exhaustive.
    #[serde(default)]
    pub source: Option<String>,
}

impl PlanEntry {
    pub fn new(id: impl Into<String>, title: impl Into<String>, target_file_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            target_file_path: target_file_path.into(),
            dependencies: Vec::new(),
            language_hint: None,
            source: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_language(mut self, lang: impl Into<String>) -> Self {
        self.language_hint = Some(lang.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A full plan submitted to the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn new(entries: Vec<PlanEntry>) -> Self {
        Self { entries }
    }

    /// Reject plans with structurally invalid entries before any dependency
    /// analysis runs (the "contract" error class from the error taxonomy).
    pub fn validate(&self) -> crate::error::Result<()> {
        use std::collections::HashSet;
        let mut ids = HashSet::new();
        for entry in &self.entries {
            if entry.id.is_empty() {
                return Err(crate::error::PipelineError::MalformedPlan(
                    "plan entry has empty id".to_string(),
                ));
            }
            if entry.target_file_path.is_empty() {
                return Err(crate::error::PipelineError::MalformedPlan(format!(
                    "entry {} has empty target_file_path",
                    entry.id
                )));
            }
            if !ids.insert(entry.id.clone()) {
                return Err(crate::error::PipelineError::MalformedPlan(format!(
                    "duplicate plan entry id: {}",
                    entry.id
                )));
            }
        }
        Ok(())
    }
}
