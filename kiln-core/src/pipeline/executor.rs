// kiln-core/src/pipeline/executor.rs
//! Executes a [`BuildPlan`].
//!
//! Entries are started on a `JoinSet` once every dependency is `Linked`, at
//! most `config.jobs` at a time. A failed entry fails everything that depends
//! on it without attempting it; entries that already linked stay installed.
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::{InstallationRecord, RecordKey};
use kiln_common::model::procedure::{BuildContext, StepPhase};
use kiln_common::model::template::TemplateVars;
use kiln_common::pipeline::{BuildPlan, EntryState, PipelineEvent, PlanEntry};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::formula_vars;
use super::steps::run_steps;
use crate::build::{graft_into, materialize_source, stage_into_prefix, BuildEnvironment, BuildWorkspace};
use crate::install::{
    compute_suffix, stage_bindings, write_receipt, InstallReceipt, LinkRepository, LinkRequest,
};
use crate::process::StepRunner;

fn get_panic_message(e: Box<dyn std::any::Any + Send>) -> String {
    match e.downcast_ref::<&'static str>() {
        Some(s) => (*s).to_string(),
        None => match e.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "Unknown panic payload".to_string(),
        },
    }
}

/// Shared view of every entry's state, updated by the scheduler and the
/// running builds.
#[derive(Debug, Clone, Default)]
struct StateTable {
    inner: Arc<Mutex<HashMap<String, EntryState>>>,
}

impl StateTable {
    fn new(plan: &BuildPlan) -> Self {
        let map = plan
            .entries
            .iter()
            .map(|e| (e.name().to_string(), EntryState::Pending))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    fn set(&self, name: &str, state: EntryState) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = guard.get(name) {
            debug!("[{}] {} -> {}", name, previous, state);
        }
        guard.insert(name.to_string(), state);
    }

    fn get(&self, name: &str) -> EntryState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or(EntryState::Pending)
    }
}

/// Final state of every plan entry, in plan order.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub states: Vec<(String, EntryState)>,
    /// Private prefixes of the entries that ended `Linked`.
    pub prefixes: HashMap<String, PathBuf>,
}

impl ExecutionReport {
    pub fn state(&self, name: &str) -> Option<&EntryState> {
        self.states.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn success_count(&self) -> usize {
        self.states
            .iter()
            .filter(|(_, s)| matches!(s, EntryState::Linked))
            .count()
    }

    pub fn fail_count(&self) -> usize {
        self.states.len() - self.success_count()
    }

    pub fn is_success(&self) -> bool {
        self.fail_count() == 0
    }

    pub fn errors(&self) -> impl Iterator<Item = (&str, &Arc<KilnError>)> {
        self.states.iter().filter_map(|(n, s)| match s {
            EntryState::Failed(e) => Some((n.as_str(), e)),
            _ => None,
        })
    }

    /// The first error that is not a consequence of another entry failing.
    pub fn root_cause(&self) -> Option<&Arc<KilnError>> {
        self.errors()
            .map(|(_, e)| e)
            .find(|e| !matches!(e.as_ref(), KilnError::DependencyFailed { .. }))
    }
}

#[derive(Clone)]
pub struct BuildExecutor {
    config: Config,
    runner: Arc<dyn StepRunner>,
    linker: Arc<LinkRepository>,
    events: Option<broadcast::Sender<PipelineEvent>>,
    cancel: CancellationToken,
}

impl BuildExecutor {
    pub fn new(config: &Config, runner: Arc<dyn StepRunner>, linker: Arc<LinkRepository>) -> Self {
        Self {
            config: config.clone(),
            runner,
            linker,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn record_key(&self, entry: &PlanEntry) -> RecordKey {
        RecordKey {
            name: entry.name().to_string(),
            version: entry.formula.version_str_full(),
            fingerprint: entry.fingerprint(),
        }
    }

    fn prefix_for(&self, entry: &PlanEntry) -> PathBuf {
        self.config.formula_prefix(
            entry.name(),
            &entry.formula.version_str_full(),
            entry.variant().as_deref(),
        )
    }

    /// Existing record for this entry whose prefix is still on disk.
    fn already_installed(&self, entry: &PlanEntry) -> Result<Option<InstallationRecord>> {
        Ok(self
            .linker
            .registry()
            .find(&self.record_key(entry))?
            .filter(|record| record.prefix.is_dir()))
    }

    fn fail(&self, states: &StateTable, name: &str, err: KilnError) {
        self.emit(PipelineEvent::job_failed(name, &err));
        states.set(name, EntryState::Failed(Arc::new(err)));
    }

    /// Fail every pending entry that depends on `failed`, directly or through
    /// another dependent. None of them is attempted.
    fn propagate_failure(&self, plan: &BuildPlan, states: &StateTable, failed: &str) {
        let mut queue = vec![failed.to_string()];
        while let Some(current) = queue.pop() {
            for dependent in plan.dependents_of(&current) {
                let name = dependent.name();
                if !matches!(states.get(name), EntryState::Pending) {
                    continue;
                }
                warn!("[{}] Skipping; dependency '{}' failed", name, current);
                self.fail(
                    states,
                    name,
                    KilnError::DependencyFailed {
                        formula: name.to_string(),
                        dependency: current.clone(),
                    },
                );
                queue.push(name.to_string());
            }
        }
    }

    #[instrument(skip_all, fields(entries = plan.len()))]
    pub async fn execute(&self, plan: &BuildPlan) -> ExecutionReport {
        let started = Instant::now();
        self.emit(PipelineEvent::PipelineStarted {
            total_jobs: plan.len(),
        });
        let states = StateTable::new(plan);
        let mut prefixes: HashMap<String, PathBuf> = HashMap::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut join_set: JoinSet<(String, Result<InstallationRecord>)> = JoinSet::new();

        loop {
            self.schedule(plan, &states, &mut prefixes, &mut running, &mut join_set);
            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (name, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // Builds run inside their own task; this only fires if the
                    // wrapper itself was aborted.
                    error!("Build task failed to join: {}", e);
                    continue;
                }
            };
            running.remove(&name);
            match result {
                Ok(record) => {
                    info!("[{}] Linked from {}", name, record.prefix.display());
                    self.emit(PipelineEvent::JobSuccess {
                        target_id: name.clone(),
                        prefix: record.prefix.clone(),
                    });
                    prefixes.insert(name.clone(), record.prefix);
                    states.set(&name, EntryState::Linked);
                }
                Err(e) => {
                    error!("[{}] Build failed: {}", name, e);
                    self.fail(&states, &name, e);
                    self.propagate_failure(plan, &states, &name);
                }
            }
        }

        // Anything not yet settled could not be started.
        for entry in &plan.entries {
            if !states.get(entry.name()).is_terminal() {
                let err = if self.cancel.is_cancelled() {
                    KilnError::Cancelled {
                        formula: entry.name().to_string(),
                        step: "not started".to_string(),
                    }
                } else {
                    KilnError::Generic(format!("'{}' could not be scheduled", entry.name()))
                };
                self.fail(&states, entry.name(), err);
            }
        }

        let report = ExecutionReport {
            states: plan
                .entries
                .iter()
                .map(|e| (e.name().to_string(), states.get(e.name())))
                .collect(),
            prefixes,
        };
        self.emit(PipelineEvent::PipelineFinished {
            duration_secs: started.elapsed().as_secs_f64(),
            success_count: report.success_count(),
            fail_count: report.fail_count(),
        });
        report
    }

    /// One pass over the plan in order: mark recorded installations `Linked`
    /// and start ready entries while there is a free slot. Plan order
    /// guarantees that a dependency's new state is seen by its dependents in
    /// the same pass.
    fn schedule(
        &self,
        plan: &BuildPlan,
        states: &StateTable,
        prefixes: &mut HashMap<String, PathBuf>,
        running: &mut HashSet<String>,
        join_set: &mut JoinSet<(String, Result<InstallationRecord>)>,
    ) {
        if self.cancel.is_cancelled() {
            return;
        }
        for entry in &plan.entries {
            let name = entry.name();
            if running.contains(name) || !matches!(states.get(name), EntryState::Pending) {
                continue;
            }

            if !entry
                .dependencies
                .iter()
                .all(|d| matches!(states.get(d), EntryState::Linked))
            {
                continue;
            }

            match self.already_installed(entry) {
                Ok(Some(record)) => {
                    info!("[{}] Already installed at {}", name, record.prefix.display());
                    self.emit(PipelineEvent::AlreadyInstalled {
                        target_id: name.to_string(),
                        prefix: record.prefix.clone(),
                    });
                    prefixes.insert(name.to_string(), record.prefix);
                    states.set(name, EntryState::Linked);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    self.fail(states, name, e);
                    self.propagate_failure(plan, states, name);
                    continue;
                }
            }

            if running.len() >= self.config.jobs.max(1) {
                continue;
            }

            let dependency_prefixes: Vec<(String, PathBuf)> = entry
                .dependencies
                .iter()
                .filter_map(|d| prefixes.get(d).map(|p| (d.clone(), p.clone())))
                .collect();
            let this = self.clone();
            let entry = entry.clone();
            let task_states = states.clone();
            let task_name = name.to_string();
            running.insert(task_name.clone());
            debug!("[{}] Starting build", task_name);
            join_set.spawn(async move {
                let build = tokio::spawn(async move {
                    this.build_entry(&entry, &dependency_prefixes, &task_states)
                        .await
                });
                let result = match build.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(KilnError::Generic(format!(
                        "build task panicked: {}",
                        get_panic_message(e.into_panic())
                    ))),
                    Err(e) => Err(KilnError::Generic(format!("build task failed: {e}"))),
                };
                (task_name, result)
            });
        }
    }

    #[instrument(skip_all, fields(formula = %entry.name()))]
    async fn build_entry(
        &self,
        entry: &PlanEntry,
        dependency_prefixes: &[(String, PathBuf)],
        states: &StateTable,
    ) -> Result<InstallationRecord> {
        let name = entry.name();
        states.set(name, EntryState::Preparing);
        let prefix = self.prefix_for(entry);
        if prefix.exists() {
            warn!(
                "[{}] Removing leftover prefix {} that has no installation record",
                name,
                prefix.display()
            );
            fs::remove_dir_all(&prefix)?;
        }

        let workspace = BuildWorkspace::create(&self.config, name)?;
        let request = match self
            .install_into_prefix(entry, &prefix, workspace.buildpath(), dependency_prefixes, states)
            .await
        {
            Ok(request) => request,
            Err(e) => {
                if prefix.exists() {
                    if let Err(rm) = fs::remove_dir_all(&prefix) {
                        warn!("[{}] Failed to remove prefix {}: {}", name, prefix.display(), rm);
                    }
                }
                return Err(e);
            }
        };
        drop(workspace);

        self.emit(PipelineEvent::LinkStarted {
            target_id: name.to_string(),
            suffix: request.suffix.clone(),
        });
        let suffix = request.suffix.clone();
        // A link failure keeps the prefix so it can be relinked once the
        // conflict is resolved.
        let record = self.linker.link(request).await?;

        let mut template = TemplateVars::new(&entry.options);
        for (key, value) in formula_vars(&self.config, &entry.formula) {
            template.set(&key, value);
        }
        template
            .set("prefix", prefix.to_string_lossy())
            .set("suffix", suffix);
        match entry.formula.caveats_for(&entry.options, &template) {
            Ok(Some(text)) => self.emit(PipelineEvent::Caveats {
                target_id: name.to_string(),
                text,
            }),
            Ok(None) => {}
            Err(e) => {
                warn!("[{}] Could not render caveats: {}", name, e);
                self.emit(PipelineEvent::LogWarn {
                    message: format!("{name}: could not render caveats: {e}"),
                });
            }
        }
        Ok(record)
    }

    /// Steps 1-6 up to (not including) linking. On error the caller removes
    /// the prefix.
    async fn install_into_prefix(
        &self,
        entry: &PlanEntry,
        prefix: &Path,
        buildpath: &Path,
        dependency_prefixes: &[(String, PathBuf)],
        states: &StateTable,
    ) -> Result<LinkRequest> {
        let formula = &entry.formula;
        let name = formula.name();

        if let Some(source) = &formula.source {
            self.emit(PipelineEvent::FetchStarted {
                target_id: name.to_string(),
                source: source.locator(),
            });
        }
        materialize_source(formula, buildpath, &self.config).await?;

        for graft in &entry.grafts {
            let sub_prefix = dependency_prefixes
                .iter()
                .find(|(dep, _)| dep == &graft.formula)
                .map(|(_, p)| p)
                .ok_or_else(|| {
                    KilnError::InstallError(format!(
                        "{}: grafted formula '{}' has no installed prefix",
                        name, graft.formula
                    ))
                })?;
            graft_into(sub_prefix, buildpath, &graft.path)?;
        }

        let mut ctx = BuildContext {
            formula: name.to_string(),
            buildpath: buildpath.to_path_buf(),
            prefix: prefix.to_path_buf(),
            options: entry.options.clone(),
            env: Default::default(),
            vars: formula_vars(&self.config, formula),
        };
        let dep_paths: Vec<PathBuf> = dependency_prefixes.iter().map(|(_, p)| p.clone()).collect();
        let env = BuildEnvironment::new(
            formula,
            &entry.options,
            &dep_paths,
            &self.config,
            &ctx.template_vars(),
        )?;
        ctx.env = env.into_vars();
        let invocations = formula.install.invocations(&ctx)?;
        fs::create_dir_all(prefix)?;

        if formula.install.is_empty() {
            states.set(name, EntryState::Installing);
            self.emit(PipelineEvent::InstallStarted {
                target_id: name.to_string(),
            });
            stage_into_prefix(buildpath, prefix)?;
        } else {
            states.set(name, EntryState::Building);
            self.emit(PipelineEvent::BuildStarted {
                target_id: name.to_string(),
            });
            let mut installing = false;
            let events = self.events.clone();
            run_steps(
                name,
                &invocations,
                self.runner.as_ref(),
                &self.cancel,
                &self.config.formula_logs_dir(name),
                "",
                |invocation| {
                    if invocation.phase == StepPhase::Install && !installing {
                        installing = true;
                        states.set(name, EntryState::Installing);
                        if let Some(tx) = &events {
                            let _ = tx.send(PipelineEvent::InstallStarted {
                                target_id: name.to_string(),
                            });
                        }
                    }
                    if let Some(tx) = &events {
                        let _ = tx.send(PipelineEvent::StepStarted {
                            target_id: name.to_string(),
                            step: invocation.label.clone(),
                        });
                    }
                },
            )
            .await?;
            if !installing {
                states.set(name, EntryState::Installing);
            }
        }

        let suffix = compute_suffix(
            formula,
            prefix,
            &entry.options,
            self.runner.as_ref(),
            &self.cancel,
        )
        .await?;
        let bindings = stage_bindings(formula, &entry.options, buildpath, prefix, &suffix)?;
        let receipt = InstallReceipt {
            name: name.to_string(),
            version: formula.version_str_full(),
            fingerprint: entry.fingerprint(),
            options: entry.options.clone(),
            suffix,
            keg_only: formula.keg_only,
            link_bin: formula.link.bin,
            link_man: formula.link.man,
            bindings,
            installed_at: chrono::Utc::now(),
        };
        write_receipt(prefix, &receipt)?;
        Ok(LinkRequest::from_receipt(&receipt, prefix))
    }
}
