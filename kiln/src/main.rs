// kiln/src/main.rs
use std::fs;
use std::path::Path;
use std::process;

use clap::Parser;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result as KilnResult};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

mod cli;
mod pipeline;
use cli::CliArgs;

/// Daily `kiln.log` in `log_dir`. Lines are flushed when the guard drops.
fn file_log_writer(log_dir: &Path) -> (NonBlocking, WorkerGuard) {
    let file_appender = tracing_appender::rolling::daily(log_dir, "kiln.log");
    tracing_appender::non_blocking(file_appender)
}

/// Returns the appender guard in verbose mode; keep it alive until exit.
fn init_logging(config: &Config, verbose: u8) -> Option<WorkerGuard> {
    let level_filter = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let max_log_level = level_filter.into_level().unwrap_or(tracing::Level::INFO);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var("KILN_LOG")
        .from_env_lossy();

    let log_dir = config.logs_dir();
    if verbose == 0 {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .without_time()
            .try_init();
        return None;
    }

    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!(
            "{} Failed to create log directory {}: {}",
            "Error:".red().bold(),
            log_dir.display(),
            e
        );
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .without_time()
            .try_init();
        return None;
    }

    let (non_blocking_appender, guard) = file_log_writer(&log_dir);

    let stderr_writer = std::io::stderr.with_max_level(max_log_level);
    let file_writer = non_blocking_appender.with_max_level(max_log_level);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(stderr_writer.and(file_writer))
        .with_ansi(true)
        .without_time()
        .try_init();

    debug!(
        "Verbose logging enabled. Writing logs to: {}/kiln.log",
        log_dir.display()
    );
    Some(guard)
}

/// Cancel `token` on the first Ctrl-C so running steps are torn down and
/// nothing new is started.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, cancelling running builds");
                token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });
}

#[tokio::main]
async fn main() -> KilnResult<()> {
    let cli_args = CliArgs::parse();

    let config = Config::load()
        .map_err(|e| KilnError::Config(format!("Could not load config: {e}")))?;

    let log_guard = init_logging(&config, cli_args.verbose);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    if let Err(e) = cli_args.command.run(&config, cancel).await {
        error!("Command failed: {:#}", e);
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        // process::exit skips destructors; flush the log file first.
        drop(log_guard);
        process::exit(1);
    }

    debug!("Command completed successfully.");
    Ok(())
}
