// kiln/src/cli/status.rs
use std::collections::HashMap;
use std::time::Instant;

use colored::*;
use kiln_common::pipeline::PipelineEvent;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Fetching,
    Building,
    Installing,
    Linking,
    Success,
    Skipped,
    Failed,
}

impl JobStatus {
    fn display_state(&self) -> &'static str {
        match self {
            JobStatus::Fetching => "fetching",
            JobStatus::Building => "building",
            JobStatus::Installing => "installing",
            JobStatus::Linking => "linking",
            JobStatus::Success => "installed",
            JobStatus::Skipped => "already installed",
            JobStatus::Failed => "failed",
        }
    }

    fn colored_state(&self) -> ColoredString {
        match self {
            JobStatus::Fetching => self.display_state().yellow(),
            JobStatus::Building => self.display_state().blue(),
            JobStatus::Installing => self.display_state().magenta(),
            JobStatus::Linking => self.display_state().cyan(),
            JobStatus::Success => self.display_state().green().bold(),
            JobStatus::Skipped => self.display_state().dimmed(),
            JobStatus::Failed => self.display_state().red().bold(),
        }
    }
}

struct StatusDisplay {
    jobs: HashMap<String, (JobStatus, Instant)>,
    total_jobs: usize,
    start_time: Instant,
}

impl StatusDisplay {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            total_jobs: 0,
            start_time: Instant::now(),
        }
    }

    fn update(&mut self, target_id: &str, status: JobStatus, detail: Option<&str>) {
        let started = self
            .jobs
            .get(target_id)
            .map(|(_, t)| *t)
            .unwrap_or_else(Instant::now);
        self.jobs.insert(target_id.to_string(), (status, started));
        let detail = detail.map(|d| format!(" {}", d.dimmed())).unwrap_or_default();
        println!(
            "{} {} {}{}",
            "==>".bold().blue(),
            target_id.cyan().bold(),
            status.colored_state(),
            detail
        );
    }

    fn elapsed_for(&self, target_id: &str) -> String {
        match self.jobs.get(target_id) {
            Some((_, start)) => format!("{:.1}s", start.elapsed().as_secs_f64()),
            None => "–".to_string(),
        }
    }
}

/// Print pipeline progress until the executor reports it finished or the
/// channel closes.
pub async fn handle_events(mut event_rx: broadcast::Receiver<PipelineEvent>) {
    let mut display = StatusDisplay::new();
    let mut logs_buffer = Vec::new();

    loop {
        match event_rx.recv().await {
            Ok(event) => match event {
                PipelineEvent::PipelineStarted { total_jobs } => {
                    display.total_jobs = total_jobs;
                    println!(
                        "{} {} {}",
                        "==>".bold().blue(),
                        "Building".bold(),
                        format!("{total_jobs} formulae").bold()
                    );
                }
                PipelineEvent::AlreadyInstalled { target_id, prefix } => {
                    display.update(
                        &target_id,
                        JobStatus::Skipped,
                        Some(&prefix.display().to_string()),
                    );
                }
                PipelineEvent::FetchStarted { target_id, source } => {
                    display.update(&target_id, JobStatus::Fetching, Some(&source));
                }
                PipelineEvent::BuildStarted { target_id } => {
                    display.update(&target_id, JobStatus::Building, None);
                }
                PipelineEvent::StepStarted { target_id, step } => {
                    println!("    {} {}", target_id.dimmed(), step);
                }
                PipelineEvent::InstallStarted { target_id } => {
                    display.update(&target_id, JobStatus::Installing, None);
                }
                PipelineEvent::LinkStarted { target_id, suffix } => {
                    let detail = if suffix.is_empty() {
                        "(no suffix)".to_string()
                    } else {
                        format!("(suffix {suffix})")
                    };
                    display.update(&target_id, JobStatus::Linking, Some(&detail));
                }
                PipelineEvent::JobSuccess { target_id, prefix } => {
                    let elapsed = display.elapsed_for(&target_id);
                    display.update(
                        &target_id,
                        JobStatus::Success,
                        Some(&format!("{} in {}", prefix.display(), elapsed)),
                    );
                }
                PipelineEvent::JobFailed { target_id, error } => {
                    display.update(&target_id, JobStatus::Failed, None);
                    logs_buffer.push(format!(
                        "{} {}: {}",
                        "✗".red().bold(),
                        target_id.cyan(),
                        error.red()
                    ));
                }
                PipelineEvent::Caveats { target_id, text } => {
                    logs_buffer.push(format!(
                        "{} {}\n{}",
                        "==> Caveats for".bold().yellow(),
                        target_id.cyan(),
                        text
                    ));
                }
                PipelineEvent::LogWarn { message } => {
                    logs_buffer.push(message.yellow().to_string());
                }
                PipelineEvent::PipelineFinished {
                    duration_secs,
                    success_count,
                    fail_count,
                } => {
                    println!();
                    println!(
                        "{} in {:.2}s ({} succeeded, {} failed)",
                        "Pipeline finished".bold(),
                        duration_secs,
                        success_count,
                        fail_count
                    );
                    if !logs_buffer.is_empty() {
                        println!();
                        for log in &logs_buffer {
                            println!("{log}");
                        }
                    }
                    println!(
                        "\n{}: {}  {}: {}  {}: {}  {}: {:.2}s",
                        "Total jobs".bold(),
                        display.total_jobs,
                        "Completed".green().bold(),
                        success_count,
                        "Failed".red().bold(),
                        fail_count,
                        "Elapsed".bold(),
                        display.start_time.elapsed().as_secs_f64()
                    );
                    break;
                }
            },
            Err(broadcast::error::RecvError::Closed) => {
                break;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                // Ignore lag; these are progress lines only.
            }
        }
    }
}
