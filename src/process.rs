//! Helpers for the shell commands run on behalf of a push.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, info};

/// SIGKILL the process group led by `pid`.
///
/// Commands are spawned with `process_group(0)`, so the group holds
/// everything they started.  The leader itself still has to be reaped by
/// the caller.
pub fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, error = %e, "failed to kill process group");
    } else {
        info!(pid, "killed process group");
    }
}
