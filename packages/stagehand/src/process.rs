//! Invocation helpers for external tools.
//!
//! Every long-running subprocess (git clone, FUSE mount, engine run,
//! container pull) goes through [`run_checked`], which enforces the
//! abortable-child contract: a deadline, then SIGTERM, a grace period, and
//! finally SIGKILL. Children are spawned with `kill_on_drop` so a cancelled
//! future cannot leak a process.

use std::process::{Output, Stdio};
use std::time::Duration;

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tokio::process::Command;
use tracing::{instrument, trace, warn};

/// Deadline and termination grace for one subprocess invocation.
#[derive(Copy, Clone, Debug)]
pub struct Limits {
    pub timeout: Duration,
    pub grace: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            grace: Duration::from_secs(10),
        }
    }
}

/// Run a command to completion, capturing output. Fails when the command
/// cannot be spawned, exceeds its deadline, or exits non-zero.
#[instrument(skip(cmd))]
pub async fn run_checked(mut cmd: Command, what: &str, limits: Limits) -> Result<Output> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    trace!(?cmd, "spawn {what}");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("could not spawn {what}: is the binary installed and in PATH?"))?;

    let pid = child.id();
    let waited = tokio::time::timeout(limits.timeout, child.wait_with_output()).await;
    let output = match waited {
        Ok(output) => output.with_context(|| format!("could not complete {what}"))?,
        Err(_elapsed) => {
            // The deadline passed; the child handle was consumed by
            // wait_with_output, so signal by pid: terminate, wait out the
            // grace period, then let kill_on_drop finish the job.
            if let Some(pid) = pid {
                terminate(pid);
                tokio::time::sleep(limits.grace).await;
            }
            bail!("{what} exceeded its {:?} deadline", limits.timeout);
        }
    };

    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{what} exited with status {}:\n{}",
            output.status,
            stderr.trim()
        );
    }
}

/// Run a command and return its stdout as trimmed UTF-8.
pub async fn run_capture(cmd: Command, what: &str, limits: Limits) -> Result<String> {
    let output = run_checked(cmd, what, limits).await?;
    let stdout =
        String::from_utf8(output.stdout).with_context(|| format!("decode {what} output"))?;
    Ok(stdout.trim().to_string())
}

fn terminate(pid: u32) {
    // SAFETY: sending SIGTERM to a pid we spawned ourselves.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        warn!(pid, "failed to deliver SIGTERM");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[tokio::test]
    async fn captures_stdout() {
        let mut cmd = Command::new("echo");
        cmd.arg("staged");
        let out = run_capture(cmd, "echo", Limits::default()).await.unwrap();
        pretty_assert_eq!(out, "staged");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        let err = run_checked(cmd, "sh", Limits::default()).await.unwrap_err();
        assert!(err.to_string().contains("exited with status"));
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let limits = Limits {
            timeout: Duration::from_millis(100),
            grace: Duration::from_millis(50),
        };
        let err = run_checked(cmd, "sleep", limits).await.unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }
}
