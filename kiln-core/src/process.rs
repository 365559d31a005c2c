// kiln-core/src/process.rs
//! Running external build steps.
//!
//! Every step goes through [`StepRunner`] so the executor can be driven by a
//! fake runner in tests. [`ProcessRunner`] is the real one: it starts each
//! command in a fresh process group, captures stdout/stderr, and on
//! cancellation signals the whole group.
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::procedure::Invocation;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How long a cancelled process group gets between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
/// How long output pipes may stay open after the step itself has exited.
/// A background process started by the step can hold them indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, as written to the step log.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Exited(StepOutput),
    /// The cancellation token fired while the step ran; holds whatever output
    /// was captured before the process group went away.
    Cancelled(StepOutput),
}

#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run one invocation to completion. `Err` is reserved for failures to
    /// start the process; a non-zero exit is reported through the outcome.
    async fn run(&self, invocation: &Invocation, cancel: &CancellationToken) -> Result<StepOutcome>;
}

/// Runs invocations as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

/// Output of one child stream, collected by a reader task. The buffer stays
/// readable if the task has to be aborted.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R: AsyncRead + Unpin + Send + 'static>(reader: Option<R>) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = reader.map(|r| tokio::spawn(read_stream(r, Arc::clone(&buf))));
        Self { buf, task }
    }

    async fn finished(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
        }
    }

    fn into_string(self) -> String {
        if let Some(task) = self.task {
            task.abort();
        }
        match self.buf.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(_) => String::new(),
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if let Ok(mut buf) = buf.lock() {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) => {
                debug!("Failed reading child output: {}", e);
                break;
            }
        }
    }
}

fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // The child leads its own group, so its pid is the group id.
    if let Err(e) = killpg(Pid::from_raw(pid), signal) {
        debug!("killpg({}, {:?}) failed: {}", pid, signal, e);
    }
}

#[async_trait]
impl StepRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation, cancel: &CancellationToken) -> Result<StepOutcome> {
        if cancel.is_cancelled() {
            return Ok(StepOutcome::Cancelled(StepOutput::default()));
        }
        debug!(
            "Running step '{}': {} (cwd: {}, env: {:?})",
            invocation.label,
            invocation.command_line(),
            invocation.cwd.display(),
            invocation.env.keys().collect::<Vec<_>>()
        );

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to start '{}': {}", invocation.program, e);
            KilnError::Io(Arc::new(e))
        })?;
        let pid = child.id();
        let mut stdout = Capture::start(child.stdout.take());
        let mut stderr = Capture::start(child.stderr.take());

        let (status, mut cancelled) = tokio::select! {
            status = child.wait() => (status?, false),
            _ = cancel.cancelled() => {
                warn!("Cancelling step '{}' (pid {:?})", invocation.label, pid);
                signal_group(pid, Signal::SIGTERM);
                let status = match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        signal_group(pid, Signal::SIGKILL);
                        child.wait().await?
                    }
                };
                (status, true)
            }
        };

        let drained = async {
            stdout.finished().await;
            stderr.finished().await;
        };
        tokio::select! {
            res = tokio::time::timeout(DRAIN_GRACE, drained) => {
                if res.is_err() {
                    warn!(
                        "Step '{}' exited but its output is still held open; keeping what was captured",
                        invocation.label
                    );
                }
            }
            _ = cancel.cancelled(), if !cancelled => {
                warn!("Cancelled while collecting output of step '{}'", invocation.label);
                cancelled = true;
            }
        }

        let output = StepOutput {
            exit_code: status.code(),
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
        };
        debug!("Step '{}' finished with {}", invocation.label, status);

        if cancelled {
            Ok(StepOutcome::Cancelled(output))
        } else {
            Ok(StepOutcome::Exited(output))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Instant;

    use kiln_common::model::procedure::StepPhase;

    use super::*;

    fn shell(script: &str, cwd: &Path) -> Invocation {
        Invocation {
            label: "sh".into(),
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            cwd: cwd.to_path_buf(),
            env: BTreeMap::from([("KILN_TEST_VALUE".to_string(), "overlay".to_string())]),
            phase: StepPhase::Build,
        }
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = shell("echo $KILN_TEST_VALUE; echo oops >&2; exit 3", dir.path());
        let outcome = ProcessRunner::new()
            .run(&invocation, &CancellationToken::new())
            .await
            .unwrap();
        let StepOutcome::Exited(output) = outcome else {
            panic!("expected the step to exit");
        };
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "overlay\n");
        assert_eq!(output.stderr, "oops\n");
        assert!(!output.success());
        assert_eq!(output.combined(), "overlay\noops\n");
    }

    #[tokio::test]
    async fn overlay_does_not_touch_process_environment() {
        let dir = tempfile::tempdir().unwrap();
        ProcessRunner::new()
            .run(&shell("true", dir.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(std::env::var("KILN_TEST_VALUE").is_err());
    }

    #[tokio::test]
    async fn cancellation_kills_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = ProcessRunner::new()
            .run(&shell("sleep 30 & wait", dir.path()), &token)
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn background_process_holding_output_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let outcome = ProcessRunner::new()
            .run(&shell("sleep 20 & echo started", dir.path()), &CancellationToken::new())
            .await
            .unwrap();
        let StepOutcome::Exited(output) = outcome else {
            panic!("expected the step to exit");
        };
        assert!(output.success());
        assert_eq!(output.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_interrupts_output_collection() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = ProcessRunner::new()
            .run(&shell("setsid sleep 20 & echo started", dir.path()), &token)
            .await
            .unwrap();
        let StepOutcome::Cancelled(output) = outcome else {
            panic!("expected the step to be cancelled");
        };
        assert_eq!(output.stdout, "started\n");
        assert!(started.elapsed() < DRAIN_GRACE);
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut invocation = shell("true", dir.path());
        invocation.program = "kiln-definitely-not-a-program".into();
        let err = ProcessRunner::new()
            .run(&invocation, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Io(_)));
    }
}
