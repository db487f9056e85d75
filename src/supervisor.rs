/// Supervised run lifecycle: spawn the subject in its own process group,
/// drain stdout/stderr, wait for a terminal outcome, tear the group down,
/// and report exit code plus captured output.
use crate::command::Command;
use crate::control::Platform;
use crate::detector::{self, deadline_after, DeadlineSpec, Outcome, TIMEOUT_CODE};
use crate::drain;
use crate::terminate;
use nix::unistd::Pid;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

/// Result of a supervised run. Built once, after both drains were joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    /// 0 for success (natural or sentinel), [`TIMEOUT_CODE`] on timeout,
    /// otherwise the subject's own exit code.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Which terminal state ended the run.
    pub outcome: Outcome,
    /// Wall-clock time from spawn to result.
    #[serde(rename = "duration_secs", serialize_with = "serialize_secs")]
    pub duration: Duration,
    /// False if a drain was still running when its join timed out.
    pub output_complete: bool,
}

impl RunResult {
    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_CODE
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Errors that prevent a run from producing a [`RunResult`].
#[derive(Debug)]
pub enum RunError {
    /// The command has no program to run.
    EmptyCommand,
    /// Failed to spawn the subject process.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// A piped stream was not available after spawn.
    MissingPipe(&'static str),
    /// The selected platform has no control implementation.
    UnsupportedPlatform(Platform),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::EmptyCommand => write!(f, "command is empty"),
            RunError::Spawn { program, source } => {
                write!(f, "failed to spawn subject {}: {}", program, source)
            }
            RunError::MissingPipe(stream) => {
                write!(f, "subject {} pipe was not captured", stream)
            }
            RunError::UnsupportedPlatform(platform) => {
                write!(f, "platform {} is not supported yet", platform)
            }
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Run the subject until it exits on its own or `timeout` elapses.
/// `Duration::MAX` means no practical timeout.
///
/// Like [`run_until_signaled`], this installs tokio's Ctrl-C listener.
pub async fn run_to_completion(command: &Command, timeout: Duration) -> Result<RunResult, RunError> {
    run_until_signaled(command, &DeadlineSpec::new(timeout)).await
}

/// Run the subject until it exits, the sentinel file appears, or the
/// deadline passes. Ctrl-C on the harness takes the timeout path.
///
/// The first call installs tokio's SIGINT listener for the rest of the
/// process, so Ctrl-C no longer terminates the harness between runs. Tests
/// and embedders that want default SIGINT handling should call
/// [`run_until_signaled_or`] with their own interrupt future.
pub async fn run_until_signaled(
    command: &Command,
    spec: &DeadlineSpec,
) -> Result<RunResult, RunError> {
    run_until_signaled_or(command, spec, ctrl_c()).await
}

/// Flat form of [`run_until_signaled`]: argv, environment, timeout, optional
/// sentinel and poll interval.
pub async fn run(
    args: &[String],
    env: &BTreeMap<String, String>,
    timeout: Duration,
    sentinel_path: Option<&Path>,
    poll_interval: Duration,
) -> Result<RunResult, RunError> {
    let command = Command::new(args.iter().cloned()).envs(env.clone());
    let spec = DeadlineSpec {
        sentinel_path: sentinel_path.map(Path::to_path_buf),
        ..DeadlineSpec::new(timeout).with_poll_interval(poll_interval)
    };
    run_until_signaled(&command, &spec).await
}

/// [`run_until_signaled`] with a caller-supplied interrupt. When `interrupt`
/// resolves the subject is torn down exactly as on timeout.
pub async fn run_until_signaled_or<F>(
    command: &Command,
    spec: &DeadlineSpec,
    interrupt: F,
) -> Result<RunResult, RunError>
where
    F: Future<Output = ()>,
{
    let mut cmd = command.to_tokio()?;
    let program = command.program().unwrap_or_default().to_string();

    tracing::info!(
        argv = ?command.argv(),
        timeout_ms = spec.timeout.as_millis() as u64,
        sentinel = ?spec.sentinel_path,
        "spawning subject"
    );

    let start = Instant::now();
    let deadline = deadline_after(start, spec.timeout);

    let mut child = cmd
        .spawn()
        .map_err(|source| RunError::Spawn { program, source })?;
    let pid = child.id().unwrap_or(0);
    tracing::info!(pid, "subject started in its own process group");

    // kill_on_drop covers the leader if we bail out here.
    let stdout = child.stdout.take().ok_or(RunError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(RunError::MissingPipe("stderr"))?;
    let stdout_drain = drain::spawn_drain("stdout", stdout);
    let stderr_drain = drain::spawn_drain("stderr", stderr);

    let outcome = detector::watch(&mut child, spec, deadline, interrupt).await;

    if outcome.needs_termination() {
        let grace = spec.grace_period(deadline, Instant::now());
        let termination = terminate::terminate(&mut child, grace).await;
        tracing::debug!(?termination, pid, "subject teardown finished");
    } else {
        // Background children of a subject that exited on its own would
        // otherwise outlive the run and hold the output pipes open.
        terminate::sweep_group(Pid::from_raw(pid as i32));
    }

    // Reap the leader; after SIGKILL this returns promptly.
    match tokio::time::timeout(spec.drain_join_timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(pid, %status, "subject reaped"),
        Ok(Err(e)) => tracing::warn!(pid, error = %e, "failed to reap subject"),
        Err(_) => tracing::warn!(pid, "subject not reaped within drain join timeout"),
    }

    let (stdout, stderr) = tokio::join!(
        stdout_drain.join(spec.drain_join_timeout),
        stderr_drain.join(spec.drain_join_timeout),
    );

    let result = RunResult {
        exit_code: outcome.exit_code(),
        stdout: stdout.text,
        stderr: stderr.text,
        outcome,
        duration: start.elapsed(),
        output_complete: stdout.complete && stderr.complete,
    };

    tracing::info!(
        exit_code = result.exit_code,
        ?outcome,
        stdout_bytes = result.stdout.len(),
        stderr_bytes = result.stderr.len(),
        duration_ms = result.duration.as_millis() as u64,
        output_complete = result.output_complete,
        "supervised run finished"
    );

    Ok(result)
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
