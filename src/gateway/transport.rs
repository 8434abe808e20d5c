//! Backend transport: the external git pack-protocol executor.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::command::Operation;
use crate::hooks::ClientOutput;

/// The three byte streams of one client session.
pub struct SessionIo<'a> {
    pub stdin: &'a mut (dyn AsyncRead + Send + Unpin),
    pub stdout: &'a mut (dyn AsyncWrite + Send + Unpin),
    pub stderr: &'a mut ClientOutput,
}

/// Runs one git service against a bare repository.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Stream the session through the service and return its exit code.
    ///
    /// An `Err` means the service could not be started at all.
    async fn run(
        &self,
        operation: Operation,
        repo_path: &Path,
        git_protocol: Option<&str>,
        io: &mut SessionIo<'_>,
    ) -> Result<u32>;
}

/// Spawns `git upload-pack` / `git receive-pack`.
#[derive(Debug, Clone, Default)]
pub struct GitTransport;

#[async_trait::async_trait]
impl Transport for GitTransport {
    #[instrument(skip(self, io), fields(service = operation.service(), repo = %repo_path.display()))]
    async fn run(
        &self,
        operation: Operation,
        repo_path: &Path,
        git_protocol: Option<&str>,
        io: &mut SessionIo<'_>,
    ) -> Result<u32> {
        let mut cmd = Command::new("git");
        cmd.arg(operation.service())
            .arg(repo_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Lets the client negotiate protocol v2.
        if let Some(proto) = git_protocol {
            cmd.env("GIT_PROTOCOL", proto);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn git {}", operation.service()))?;

        let mut child_stdin = child.stdin.take().context("git stdin was not piped")?;
        let mut child_stdout = child.stdout.take().context("git stdout was not piped")?;
        let mut child_stderr = child.stderr.take().context("git stderr was not piped")?;

        let stdin = &mut *io.stdin;
        let stdout = &mut *io.stdout;
        let stderr = &mut *io.stderr;

        // Client -> git.  Closing the child's stdin on client EOF is what
        // lets receive-pack finish reading the pack.
        let mut pump_stdin = Box::pin(async move {
            let copied = tokio::io::copy(stdin, &mut child_stdin).await;
            let _ = child_stdin.shutdown().await;
            copied
        });

        // git -> client.  Both end when the child closes its pipes.
        let pump_output = async {
            let (out, err) = tokio::join!(
                tokio::io::copy(&mut child_stdout, stdout),
                tokio::io::copy(&mut child_stderr, stderr),
            );
            out.context("failed to relay git stdout")?;
            err.context("failed to relay git stderr")?;
            Ok::<_, anyhow::Error>(())
        };
        tokio::pin!(pump_output);

        let mut stdin_open = true;
        let relayed = loop {
            tokio::select! {
                copied = &mut pump_stdin, if stdin_open => {
                    stdin_open = false;
                    match copied {
                        Ok(bytes) => debug!(bytes, "client stdin closed"),
                        Err(e) => debug!(error = %e, "client stdin failed"),
                    }
                }
                relayed = &mut pump_output => break relayed,
            }
        };
        // A client that never sends EOF must not keep the child's stdin open.
        drop(pump_stdin);

        let status = child.wait().await.context("failed to wait for git")?;
        if let Err(e) = relayed {
            debug!(error = %e, "output relay ended early");
        }

        let code = status.code().map(|c| c as u32).unwrap_or(1);
        debug!(code, "git service exited");
        Ok(code)
    }
}
