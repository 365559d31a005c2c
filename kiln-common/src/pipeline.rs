// kiln-common/src/pipeline.rs
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::KilnError;
use crate::model::formula::Formula;
use crate::model::option::ResolvedOptions;

/// A sub-formula whose prefix is copied into the dependent's build tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graft {
    pub formula: String,
    /// Relative to the dependent's build path.
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub formula: Arc<Formula>,
    pub options: ResolvedOptions,
    /// Direct dependencies of this entry that are part of the plan.
    pub dependencies: Vec<String>,
    pub grafts: Vec<Graft>,
    /// True for the formula the user asked for.
    pub requested: bool,
}

impl PlanEntry {
    pub fn name(&self) -> &str {
        self.formula.name()
    }

    pub fn fingerprint(&self) -> String {
        self.options.fingerprint()
    }

    /// Fingerprint used in the prefix name; `None` for the default option set.
    pub fn variant(&self) -> Option<String> {
        (!self.formula.is_default_variant(&self.options)).then(|| self.fingerprint())
    }
}

/// Dependency-ordered list of formulae to build. No formula appears twice and
/// every entry comes after all of its dependencies.
#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    pub entries: Vec<PlanEntry>,
}

impl BuildPlan {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(PlanEntry::name).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name() == name)
    }

    pub fn entry(&self, name: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }

    pub fn root(&self) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.requested)
    }

    /// Entries that list `name` among their direct dependencies.
    pub fn dependents_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PlanEntry> {
        self.entries
            .iter()
            .filter(move |e| e.dependencies.iter().any(|d| d == name))
    }
}

/// Processing state of one plan entry.
#[derive(Debug, Clone)]
pub enum EntryState {
    Pending,
    Preparing,
    Building,
    Installing,
    Linked,
    Failed(Arc<KilnError>),
}

impl EntryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryState::Linked | EntryState::Failed(_))
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryState::Pending => f.write_str("pending"),
            EntryState::Preparing => f.write_str("preparing"),
            EntryState::Building => f.write_str("building"),
            EntryState::Installing => f.write_str("installing"),
            EntryState::Linked => f.write_str("linked"),
            EntryState::Failed(_) => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        total_jobs: usize,
    },
    PipelineFinished {
        duration_secs: f64,
        success_count: usize,
        fail_count: usize,
    },
    AlreadyInstalled {
        target_id: String,
        prefix: PathBuf,
    },
    FetchStarted {
        target_id: String,
        source: String,
    },
    BuildStarted {
        target_id: String,
    },
    StepStarted {
        target_id: String,
        step: String,
    },
    InstallStarted {
        target_id: String,
    },
    LinkStarted {
        target_id: String,
        suffix: String,
    },
    JobSuccess {
        target_id: String,
        prefix: PathBuf,
    },
    JobFailed {
        target_id: String,
        error: String,
    },
    Caveats {
        target_id: String,
        text: String,
    },
    LogWarn {
        message: String,
    },
}

impl PipelineEvent {
    pub fn job_failed(target_id: impl Into<String>, error: &KilnError) -> Self {
        PipelineEvent::JobFailed {
            target_id: target_id.into(),
            error: error.to_string(),
        }
    }
}
