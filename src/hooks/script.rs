//! Executable post-receive scripts registered in a repository's hooks
//! directory.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::event::{encode_events, PushEvent};
use super::{ClientOutput, PostReceiveHook};
use crate::process::kill_process_group;
use crate::store::Repository;

pub struct ScriptHook {
    path: PathBuf,
    timeout: Duration,
}

impl ScriptHook {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }
}

#[async_trait::async_trait]
impl PostReceiveHook for ScriptHook {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Feed the event lines on stdin and forward both output streams to the
    /// client.  The script runs with the bare repository as its working
    /// directory and `GIT_DIR` set, like a native git hook.
    #[instrument(skip(self, events, out), fields(hook = %self.path.display(), repo = %repo.name))]
    async fn run(
        &self,
        repo: &Repository,
        events: &[PushEvent],
        out: &mut ClientOutput,
    ) -> Result<()> {
        let mut child = Command::new(&self.path)
            .current_dir(&repo.path)
            .env("GIT_DIR", &repo.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start hook {}", self.path.display()))?;
        let pid = child.id();

        let mut stdin = child.stdin.take().context("hook stdin was not piped")?;
        let stdout = child.stdout.take().context("hook stdout was not piped")?;
        let stderr = child.stderr.take().context("hook stderr was not piped")?;

        let payload = encode_events(events);
        let feed = async move {
            // A hook that ignores stdin may exit before reading it.
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                debug!(error = %e, "hook closed stdin early");
            }
        };

        let forward = forward_output(stdout, stderr, out);
        let run = async {
            let ((), forwarded) = tokio::join!(feed, forward);
            forwarded?;
            child.wait().await.context("failed to wait for hook")
        };

        let status = match tokio::time::timeout(self.timeout, run).await {
            Ok(status) => status?,
            Err(_) => {
                kill_process_group(pid);
                let _ = child.kill().await;
                anyhow::bail!("timed out after {:?}", self.timeout);
            }
        };

        debug!(?status, "hook exited");
        if !status.success() {
            anyhow::bail!("exited with {}", describe_status(&status));
        }
        Ok(())
    }
}

/// Copy the child's stdout and stderr to the client as they arrive.
async fn forward_output<O, E>(mut stdout: O, mut stderr: E, out: &mut ClientOutput) -> Result<()>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        let (from_stdout, n) = tokio::select! {
            n = stdout.read(&mut out_buf), if out_open => (true, n?),
            n = stderr.read(&mut err_buf), if err_open => (false, n?),
        };
        let chunk = match (from_stdout, n) {
            (true, 0) => {
                out_open = false;
                continue;
            }
            (false, 0) => {
                err_open = false;
                continue;
            }
            (true, n) => &out_buf[..n],
            (false, n) => &err_buf[..n],
        };
        if out.write_all(chunk).await.is_err() {
            debug!("client went away; discarding hook output");
        }
    }
    let _ = out.flush().await;
    Ok(())
}

fn describe_status(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("status {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown status".to_string(),
    }
}
