/// Graceful-then-forceful termination of a subject's process group.
///
/// The subject leads its own process group (spawned with `process_group(0)`),
/// so its pid doubles as the pgid. SIGTERM goes to the whole group first; if
/// the leader has not exited within the grace period the group gets SIGKILL.
/// Every delivery failure is logged and swallowed.
use crate::detector::deadline_after;
use nix::errno::Errno;
use nix::sys::signal::{self, killpg, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;

/// How often the leader is polled while waiting out the grace period.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What `terminate` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The subject had already exited; no signal was sent.
    AlreadyExited,
    /// The subject exited within the grace period after SIGTERM.
    Graceful,
    /// The grace period ran out and SIGKILL was sent to the group.
    Killed,
}

/// Stop the subject and every process in its group.
///
/// Idempotent: once the subject has exited this is a no-op. After a
/// `Killed` return the caller still has to reap the child.
pub async fn terminate(child: &mut Child, grace_period: Duration) -> Termination {
    if has_exited(child) {
        return Termination::AlreadyExited;
    }
    // `id()` is None only once tokio has reaped the child.
    let Some(pid) = child.id() else {
        return Termination::AlreadyExited;
    };
    let pgid = Pid::from_raw(pid as i32);

    tracing::info!(
        pgid = pid,
        grace_ms = grace_period.as_millis() as u64,
        "sending SIGTERM to subject process group"
    );
    signal_group(child, pgid, Signal::SIGTERM);

    let deadline = deadline_after(Instant::now(), grace_period);
    loop {
        if has_exited(child) {
            // Members that outlived their leader already had their SIGTERM.
            sweep_group(pgid);
            tracing::debug!(pgid = pid, "subject exited within grace period");
            return Termination::Graceful;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL.min(deadline - now)).await;
    }

    tracing::warn!(
        pgid = pid,
        grace_ms = grace_period.as_millis() as u64,
        "subject ignored SIGTERM, sending SIGKILL to process group"
    );
    signal_group(child, pgid, Signal::SIGKILL);
    Termination::Killed
}

/// Reap-aware liveness check. A `try_wait` error is treated as "still
/// running" so the escalation continues.
fn has_exited(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(Some(_)) => true,
        Ok(None) => false,
        Err(e) => {
            tracing::warn!(error = %e, "failed to poll subject status");
            false
        }
    }
}

/// Signal the whole group, falling back to the leader alone.
fn signal_group(child: &mut Child, pgid: Pid, sig: Signal) {
    match killpg(pgid, sig) {
        Ok(()) => {}
        // Group already empty.
        Err(Errno::ESRCH) => {
            tracing::debug!(pgid = pgid.as_raw(), signal = %sig, "process group already gone");
        }
        Err(e) => {
            tracing::warn!(
                pgid = pgid.as_raw(),
                signal = %sig,
                error = %e,
                "group signal failed, signalling leader only"
            );
            signal_leader(child, pgid, sig);
        }
    }
}

fn signal_leader(child: &mut Child, pid: Pid, sig: Signal) {
    let result = match sig {
        Signal::SIGKILL => child.start_kill().map_err(|e| e.to_string()),
        _ => signal::kill(pid, sig).map_err(|e| e.to_string()),
    };
    if let Err(e) = result {
        tracing::warn!(pid = pid.as_raw(), signal = %sig, error = %e, "leader signal failed");
    }
}

/// SIGKILL stragglers left in the group after the leader exited.
///
/// The leader is already reaped here. While any member remains, the kernel
/// keeps the pgid allocated, so the signal can only reach this group. Once
/// the group is empty the number could in principle be recycled as a new
/// group leader's pid before this call; that window is accepted.
pub(crate) fn sweep_group(pgid: Pid) {
    // killpg(0) / negative ids would hit the harness's own group.
    if pgid.as_raw() <= 0 {
        return;
    }
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => tracing::debug!(pgid = pgid.as_raw(), "killed leftover group members"),
        Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid = pgid.as_raw(), error = %e, "failed to sweep process group"),
    }
}
