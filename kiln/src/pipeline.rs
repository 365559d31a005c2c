// kiln/src/pipeline.rs
// Glue between the CLI and the build executor: resolve, build, report.
use std::sync::Arc;

use kiln_common::config::Config;
use kiln_common::dependency::{DependencyResolver, ResolutionContext};
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::options::split_global_flags;
use kiln_common::pipeline::{BuildPlan, PipelineEvent};
use kiln_core::{BuildExecutor, LinkRepository, ProcessRunner};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct PipelineFlags {
    pub include_test: bool,
}

/// Resolve `target` with the user's option `flags`. Every resolution error
/// surfaces here, before any step runs.
pub fn resolve_plan(
    formulary: &Formulary,
    target: &str,
    flags: &[String],
    pipeline_flags: &PipelineFlags,
) -> Result<BuildPlan> {
    let (local, global) = split_global_flags(flags)?;
    DependencyResolver::new(ResolutionContext {
        formulary,
        include_test: pipeline_flags.include_test,
        global_flags: &global,
    })
    .resolve(target, &local)
}

#[instrument(skip(config, pipeline_flags, cancel))]
pub async fn run_pipeline(
    target: &str,
    flags: &[String],
    config: &Config,
    pipeline_flags: &PipelineFlags,
    cancel: CancellationToken,
) -> Result<()> {
    let formulary = Formulary::new(config);
    let plan = resolve_plan(&formulary, target, flags, pipeline_flags)?;
    debug!("Build plan for {}: {:?}", target, plan.names());

    let (event_tx, event_rx) = broadcast::channel::<PipelineEvent>(EVENT_CHANNEL_SIZE);
    let status_handle = tokio::spawn(crate::cli::status::handle_events(event_rx));

    let executor = BuildExecutor::new(
        config,
        Arc::new(ProcessRunner::default()),
        Arc::new(LinkRepository::new(config)),
    )
    .with_events(event_tx)
    .with_cancellation(cancel);

    let report = executor.execute(&plan).await;
    // Dropping the last sender closes the channel and lets the status task end.
    drop(executor);
    if let Err(e) = status_handle.await {
        error!("Status task failed: {}", e);
    }

    if report.is_success() {
        return Ok(());
    }
    match report.root_cause() {
        Some(e) => Err(e.as_ref().clone()),
        None => Err(KilnError::Generic(format!(
            "{} of {} formulae failed to install",
            report.fail_count(),
            report.states.len()
        ))),
    }
}
