/// Completion detection: natural exit, sentinel file, or deadline.
///
/// `watch` polls the subject on a fixed interval and resolves to exactly one
/// terminal [`Outcome`]. The precedence rules live in [`evaluate`], which is
/// pure so the ordering can be checked without processes:
///
/// 1. a natural exit is ground truth and is never masked by a stale sentinel;
/// 2. a sentinel that exists counts as success even in the final instant
///    before the deadline;
/// 3. only then does the deadline apply.
use serde::Serialize;
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;

/// Exit code reported when the run hit its deadline (or was interrupted).
pub const TIMEOUT_CODE: i32 = -1;

/// Exit code reported when the sentinel file was observed.
pub const SUCCESS_CODE: i32 = 0;

/// Exit code for a status that carries neither an exit code nor a signal.
pub const UNKNOWN_EXIT_CODE: i32 = i32::MIN;

/// Smallest sleep between polls, so a zero interval cannot spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Stand-in for "no deadline" when `start + timeout` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `start + after`, saturating to a far-future instant instead of panicking.
pub fn deadline_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Terminal state of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Outcome {
    /// The subject exited on its own.
    Exited { code: i32 },
    /// The sentinel file appeared.
    Signaled,
    /// The deadline passed first.
    TimedOut,
    /// The harness itself was interrupted (e.g. Ctrl-C).
    Interrupted,
}

impl Outcome {
    /// Exit code under the harness convention: 0 for a sentinel,
    /// [`TIMEOUT_CODE`] for timeouts and interrupts, otherwise the subject's
    /// own code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Exited { code } => *code,
            Outcome::Signaled => SUCCESS_CODE,
            Outcome::TimedOut | Outcome::Interrupted => TIMEOUT_CODE,
        }
    }

    /// Whether the process group is still running and must be torn down.
    pub fn needs_termination(&self) -> bool {
        !matches!(self, Outcome::Exited { .. })
    }
}

/// Timing parameters of one supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineSpec {
    /// Wall-clock budget measured from spawn.
    pub timeout: Duration,
    /// Sleep between completion checks. Keep it well below `timeout`.
    pub poll_interval: Duration,
    /// File whose appearance ends the run successfully. `None` disables it.
    pub sentinel_path: Option<PathBuf>,
    /// Lower bound for the SIGTERM grace period.
    pub min_grace: Duration,
    /// How long to wait for the output drains after the subject stopped.
    pub drain_join_timeout: Duration,
}

impl Default for DeadlineSpec {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            sentinel_path: None,
            min_grace: Duration::from_secs(1),
            drain_join_timeout: Duration::from_secs(2),
        }
    }
}

impl DeadlineSpec {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn with_sentinel(mut self, path: impl Into<PathBuf>) -> Self {
        self.sentinel_path = Some(path.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_min_grace(mut self, grace: Duration) -> Self {
        self.min_grace = grace;
        self
    }

    pub fn with_drain_join_timeout(mut self, timeout: Duration) -> Self {
        self.drain_join_timeout = timeout;
        self
    }

    /// Grace period for a teardown requested at `now`: whatever is left of
    /// the deadline, but never less than `min_grace`.
    pub fn grace_period(&self, deadline: Instant, now: Instant) -> Duration {
        deadline
            .saturating_duration_since(now)
            .max(self.min_grace)
    }
}

/// Decide whether a poll observation is terminal.
pub fn evaluate(
    exit_code: Option<i32>,
    sentinel_present: bool,
    now: Instant,
    deadline: Instant,
) -> Option<Outcome> {
    if let Some(code) = exit_code {
        return Some(Outcome::Exited { code });
    }
    if sentinel_present {
        return Some(Outcome::Signaled);
    }
    if now >= deadline {
        return Some(Outcome::TimedOut);
    }
    None
}

/// Map an exit status to an integer code. Death by signal N is reported as
/// `128 + N`, the shell convention, so it never collides with
/// [`TIMEOUT_CODE`]. A status with neither maps to [`UNKNOWN_EXIT_CODE`].
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => UNKNOWN_EXIT_CODE,
    }
}

/// Poll the subject until a terminal outcome is reached.
///
/// `interrupt` resolving ends the watch with [`Outcome::Interrupted`]. When
/// the sentinel is observed it is removed before returning.
pub async fn watch<F>(
    child: &mut Child,
    spec: &DeadlineSpec,
    deadline: Instant,
    interrupt: F,
) -> Outcome
where
    F: Future<Output = ()>,
{
    tokio::pin!(interrupt);
    let sentinel = spec.sentinel_path.as_deref();
    let mut polls: u64 = 0;

    loop {
        polls += 1;
        let exit = match child.try_wait() {
            Ok(status) => status.map(exit_code),
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll subject status");
                None
            }
        };
        let sentinel_present = sentinel.is_some_and(Path::exists);
        let now = Instant::now();

        if let Some(outcome) = evaluate(exit, sentinel_present, now, deadline) {
            if outcome == Outcome::Signaled {
                if let Some(path) = sentinel {
                    remove_sentinel(path);
                }
            }
            tracing::info!(?outcome, polls, "subject reached terminal state");
            return outcome;
        }

        let nap = spec
            .poll_interval
            .min(deadline.saturating_duration_since(now))
            .max(MIN_POLL_INTERVAL);
        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = &mut interrupt => {
                tracing::warn!(polls, "harness interrupted, tearing down subject");
                return Outcome::Interrupted;
            }
        }
    }
}

/// Delete the sentinel so the next run does not see a stale signal.
fn remove_sentinel(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed sentinel file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "failed to remove sentinel file"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn spawn_sh(script: &str) -> Child {
        tokio::process::Command::new("/bin/sh")
            .args(["-c", script])
            .env("PATH", "/usr/bin:/bin")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_exit_beats_sentinel_and_deadline() {
        let now = Instant::now();
        let past = now - Duration::from_secs(1);
        assert_eq!(
            evaluate(Some(7), true, now, past),
            Some(Outcome::Exited { code: 7 })
        );
    }

    #[test]
    fn test_sentinel_beats_deadline() {
        let now = Instant::now();
        assert_eq!(evaluate(None, true, now, now), Some(Outcome::Signaled));
    }

    #[test]
    fn test_deadline_reached() {
        let now = Instant::now();
        assert_eq!(evaluate(None, false, now, now), Some(Outcome::TimedOut));
    }

    #[test]
    fn test_still_running() {
        let now = Instant::now();
        let later = now + Duration::from_secs(5);
        assert_eq!(evaluate(None, false, now, later), None);
    }

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(Outcome::Exited { code: 0 }.exit_code(), 0);
        assert_eq!(Outcome::Exited { code: 7 }.exit_code(), 7);
        assert_eq!(Outcome::Signaled.exit_code(), SUCCESS_CODE);
        assert_eq!(Outcome::TimedOut.exit_code(), TIMEOUT_CODE);
        assert_eq!(Outcome::Interrupted.exit_code(), TIMEOUT_CODE);
    }

    #[test]
    fn test_only_exited_skips_termination() {
        assert!(!Outcome::Exited { code: 1 }.needs_termination());
        assert!(Outcome::Signaled.needs_termination());
        assert!(Outcome::TimedOut.needs_termination());
        assert!(Outcome::Interrupted.needs_termination());
    }

    #[test]
    fn test_exit_code_from_signal() {
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 128 + 9);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
    }

    #[test]
    fn test_exit_code_without_code_or_signal_is_not_timeout() {
        // Raw wait status of a stopped process (SIGSTOP).
        let stopped = ExitStatus::from_raw(0x137f);
        assert_eq!(exit_code(stopped), UNKNOWN_EXIT_CODE);
        assert_ne!(exit_code(stopped), TIMEOUT_CODE);
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert_eq!(
            deadline_after(now, Duration::from_secs(2)),
            now + Duration::from_secs(2)
        );
        let far = deadline_after(now, Duration::MAX);
        assert!(far > now + Duration::from_secs(86400 * 365));
    }

    #[test]
    fn test_grace_period_uses_remaining_time() {
        let spec = DeadlineSpec::default().with_min_grace(Duration::from_millis(100));
        let now = Instant::now();
        let deadline = now + Duration::from_secs(3);
        assert_eq!(spec.grace_period(deadline, now), Duration::from_secs(3));
    }

    #[test]
    fn test_grace_period_floor_after_deadline() {
        let spec = DeadlineSpec::default().with_min_grace(Duration::from_millis(100));
        let now = Instant::now();
        assert_eq!(spec.grace_period(now, now), Duration::from_millis(100));
    }

    #[test]
    fn test_serialized_outcome() {
        let json = serde_json::to_string(&Outcome::Exited { code: 7 }).unwrap();
        assert_eq!(json, r#"{"state":"exited","code":7}"#);
        let json = serde_json::to_string(&Outcome::TimedOut).unwrap();
        assert_eq!(json, r#"{"state":"timed_out"}"#);
    }

    #[tokio::test]
    async fn test_watch_natural_exit() {
        let mut child = spawn_sh("exit 7");
        let spec = DeadlineSpec::new(Duration::from_secs(5));
        let deadline = Instant::now() + spec.timeout;
        let outcome = watch(&mut child, &spec, deadline, std::future::pending()).await;
        assert_eq!(outcome, Outcome::Exited { code: 7 });
    }

    #[tokio::test]
    async fn test_watch_times_out_close_to_deadline() {
        let mut child = spawn_sh("sleep 10");
        let spec = DeadlineSpec::new(Duration::from_millis(500))
            .with_poll_interval(Duration::from_millis(50));
        let start = Instant::now();
        let deadline = start + spec.timeout;

        let outcome = watch(&mut child, &spec, deadline, std::future::pending()).await;
        assert_eq!(outcome, Outcome::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(700), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_watch_sentinel_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = dir.path().join("test_end");
        std::fs::write(&sentinel, "").unwrap();

        let mut child = spawn_sh("sleep 10");
        let spec = DeadlineSpec::new(Duration::from_secs(5)).with_sentinel(&sentinel);
        let deadline = Instant::now() + spec.timeout;

        let outcome = watch(&mut child, &spec, deadline, std::future::pending()).await;
        assert_eq!(outcome, Outcome::Signaled);
        assert!(!sentinel.exists());
    }

    #[tokio::test]
    async fn test_watch_exit_wins_over_stale_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = dir.path().join("test_end");

        let mut child = spawn_sh("exit 4");
        child.wait().await.unwrap();
        std::fs::write(&sentinel, "").unwrap();

        let spec = DeadlineSpec::new(Duration::from_secs(5)).with_sentinel(&sentinel);
        let deadline = Instant::now() + spec.timeout;
        let outcome = watch(&mut child, &spec, deadline, std::future::pending()).await;

        assert_eq!(outcome, Outcome::Exited { code: 4 });
        // Only an observed signal consumes the file.
        assert!(sentinel.exists());
    }

    #[tokio::test]
    async fn test_watch_interrupt() {
        let mut child = spawn_sh("sleep 10");
        let spec = DeadlineSpec::new(Duration::from_secs(5));
        let deadline = Instant::now() + spec.timeout;

        let interrupt = tokio::time::sleep(Duration::from_millis(100));
        let outcome = watch(&mut child, &spec, deadline, interrupt).await;
        assert_eq!(outcome, Outcome::Interrupted);
    }
}
