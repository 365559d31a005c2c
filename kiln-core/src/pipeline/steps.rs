// kiln-core/src/pipeline/steps.rs
// Sequential execution of a procedure's invocations with per-step logs.
use std::fs;
use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use kiln_common::model::procedure::Invocation;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::process::{StepOutcome, StepOutput, StepRunner};

/// Lines of output carried in an `ExternalStepFailed` error; the full output
/// stays in the step log.
const ERROR_OUTPUT_LINES: usize = 40;

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `<log_dir>/<prefix>NN.<label>.log`
pub fn step_log_path(log_dir: &Path, log_prefix: &str, index: usize, label: &str) -> PathBuf {
    log_dir.join(format!("{log_prefix}{index:02}.{}.log", sanitize_label(label)))
}

fn write_step_log(path: &Path, invocation: &Invocation, output: &StepOutput) -> Result<()> {
    let mut contents = format!(
        "$ {}\n# cwd: {}\n",
        invocation.command_line(),
        invocation.cwd.display()
    );
    for (key, value) in &invocation.env {
        contents.push_str(&format!("# env: {key}={value}\n"));
    }
    contents.push('\n');
    contents.push_str(&output.combined());
    fs::write(path, contents)?;
    Ok(())
}

fn output_tail(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(ERROR_OUTPUT_LINES);
    lines[start..].join("\n")
}

/// Run `invocations` in order. `before_step` is called with each invocation
/// just before it starts. The first failing or cancelled step ends the run.
pub async fn run_steps<F>(
    formula: &str,
    invocations: &[Invocation],
    runner: &dyn StepRunner,
    cancel: &CancellationToken,
    log_dir: &Path,
    log_prefix: &str,
    mut before_step: F,
) -> Result<()>
where
    F: FnMut(&Invocation) + Send,
{
    fs::create_dir_all(log_dir)?;
    for (index, invocation) in invocations.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(KilnError::Cancelled {
                formula: formula.to_string(),
                step: invocation.label.clone(),
            });
        }
        before_step(invocation);
        let outcome = runner.run(invocation, cancel).await?;
        let (output, cancelled) = match &outcome {
            StepOutcome::Exited(output) => (output, false),
            StepOutcome::Cancelled(output) => (output, true),
        };
        let log_path = step_log_path(log_dir, log_prefix, index + 1, &invocation.label);
        write_step_log(&log_path, invocation, output)?;
        debug!("[{}] Step log written to {}", formula, log_path.display());

        if cancelled {
            return Err(KilnError::Cancelled {
                formula: formula.to_string(),
                step: invocation.label.clone(),
            });
        }
        if !output.success() {
            error!(
                "[{}] Step '{}' failed with {:?}; see {}",
                formula,
                invocation.label,
                output.exit_code,
                log_path.display()
            );
            return Err(KilnError::ExternalStepFailed {
                formula: formula.to_string(),
                step: invocation.label.clone(),
                exit_code: output.exit_code,
                output: output_tail(&output.combined()),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_names_are_numbered_and_sanitized() {
        let path = step_log_path(Path::new("/logs/llvm"), "", 3, "make install");
        assert_eq!(path, PathBuf::from("/logs/llvm/03.make_install.log"));
        let path = step_log_path(Path::new("/logs/llvm"), "test.", 1, "llvm-config");
        assert_eq!(path, PathBuf::from("/logs/llvm/test.01.llvm-config.log"));
    }

    #[test]
    fn error_output_keeps_the_tail() {
        let long: String = (0..100).map(|i| format!("line {i}\n")).collect();
        let tail = output_tail(&long);
        assert!(tail.starts_with("line 60"));
        assert!(tail.ends_with("line 99"));
    }
}
