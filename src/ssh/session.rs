//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`SshSession`].  The
//! handler authenticates the client against the authorized-keys file and,
//! on an `exec` request, runs the command through the [`Gateway`] in its own
//! task.  Channel data is bridged to the gateway through in-memory pipes.
//! Closing the channel or dropping the connection aborts that task, which
//! kills any git process it started.
//!
//! [`Gateway`]: crate::gateway::Gateway

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::keys::{fingerprint_of, AuthorizedKeys};
use super::server::SshContext;
use crate::error::EXIT_REJECTED;
use crate::gateway::{SessionIo, SessionRequest};

/// Buffer size of each in-memory pipe between the channel and the gateway.
const PIPE_CAPACITY: usize = 256 * 1024;

/// Extended data type code for stderr (RFC 4254 §5.2).
const EXTENDED_STDERR: u32 = 1;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    ctx: Arc<SshContext>,
    peer_addr: Option<SocketAddr>,
    fingerprint: Option<String>,
    username: Option<String>,
    /// `GIT_PROTOCOL` value sent by the client via SSH env request.
    git_protocol: Option<String>,
    /// Write end of the gateway's stdin.  Dropped on client EOF.
    stdin: Option<DuplexStream>,
    /// The running gateway session, if any.
    task: Option<JoinHandle<()>>,
}

impl SshSession {
    /// Create a new session for an incoming connection.
    pub fn new(ctx: Arc<SshContext>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            ctx,
            peer_addr,
            fingerprint: None,
            username: None,
            git_protocol: None,
            stdin: None,
            task: None,
        }
    }

    fn abort_task(&mut self) {
        self.stdin.take();
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                info!(peer = ?self.peer_addr, "aborting running session");
            }
            task.abort();
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.abort_task();
    }
}

// ---------------------------------------------------------------------------
// Channel helpers
// ---------------------------------------------------------------------------

/// Send exit-status, EOF, and close on a channel in the order required by
/// the SSH protocol (RFC 4254).  Git's SSH transport client expects all three
/// signals; omitting exit-status or EOF causes the client to treat the channel
/// close as a transport failure ("the remote end hung up unexpectedly").
fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: u32) {
    session.exit_status_request(channel_id, exit_status);
    session.eof(channel_id);
    session.close(channel_id);
}

/// Copy everything from `reader` onto the channel, as stdout or as
/// extended (stderr) data.
async fn pump_to_channel(
    mut reader: DuplexStream,
    handle: Handle,
    channel_id: ChannelId,
    extended: Option<u32>,
) {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "session output pipe failed");
                break;
            }
        };
        let data = CryptoVec::from_slice(&buf[..n]);
        let sent = match extended {
            Some(code) => handle.extended_data(channel_id, code, data).await,
            None => handle.data(channel_id, data).await,
        };
        if sent.is_err() {
            debug!("channel closed while sending output");
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Authenticate a client by public key.
    ///
    /// The authorized-keys file is read on every attempt so edits take
    /// effect without a restart.  The SSH login name is ignored; the key's
    /// entry decides who the user is.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fp = fingerprint_of(key);
        info!(
            peer = ?self.peer_addr,
            login = %user,
            fingerprint = %fp,
            "SSH public-key auth attempt"
        );

        let keys = match AuthorizedKeys::load(&self.ctx.authorized_keys).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "failed to load authorized keys");
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };

        match keys.user_for(&fp) {
            Some(username) => {
                info!(fingerprint = %fp, username = %username, "SSH key accepted");
                self.fingerprint = Some(fp);
                self.username = Some(username.to_string());
                Ok(Auth::Accept)
            }
            None => {
                warn!(fingerprint = %fp, "SSH key not in authorized keys");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    /// Accept new channel-open requests for sessions.
    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Capture environment variables sent by the client before the exec
    /// request.  Git clients send `GIT_PROTOCOL=version=2` here to negotiate
    /// protocol v2.
    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.git_protocol = Some(variable_value.to_string());
        }
        Ok(())
    }

    /// Forward client data to the gateway's stdin.
    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ref mut stdin) = self.stdin {
            if let Err(e) = stdin.write_all(data).await {
                debug!(error = %e, "session stdin closed (gateway may have finished)");
                self.stdin.take();
            }
        }
        Ok(())
    }

    /// Client EOF: close the gateway's stdin so the backend sees end of
    /// input.
    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdin.take();
        Ok(())
    }

    /// The client closed the channel; nothing may keep running for it.
    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.abort_task();
        Ok(())
    }

    /// Interactive logins are not offered.
    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(peer = ?self.peer_addr, username = ?self.username, "rejected interactive shell");
        session.extended_data(
            channel_id,
            EXTENDED_STDERR,
            CryptoVec::from_slice(b"ERROR: interactive shells are not supported\n"),
        );
        finish_channel(session, channel_id, EXIT_REJECTED);
        Ok(())
    }

    /// Run the requested command through the gateway.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        info!(
            peer = ?self.peer_addr,
            username = ?self.username,
            command = %command,
            "SSH exec request"
        );
        session.channel_success(channel_id);

        if self.task.is_some() {
            warn!(peer = ?self.peer_addr, "second exec request on one connection");
            session.extended_data(
                channel_id,
                EXTENDED_STDERR,
                CryptoVec::from_slice(b"ERROR: one command per connection\n"),
            );
            finish_channel(session, channel_id, EXIT_REJECTED);
            return Ok(());
        }

        let request = SessionRequest {
            command,
            username: self.username.clone().unwrap_or_default(),
            git_protocol: self.git_protocol.clone(),
        };

        // channel <-> gateway pipes
        let (stdin_tx, mut stdin_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut stdout_tx, stdout_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut stderr_tx, stderr_rx) = tokio::io::duplex(PIPE_CAPACITY);
        self.stdin = Some(stdin_tx);

        let handle = session.handle();
        let gateway = Arc::clone(&self.ctx.gateway);
        let fingerprint = self.fingerprint.clone();

        let task = tokio::spawn(async move {
            let stdout_pump = tokio::spawn(pump_to_channel(stdout_rx, handle.clone(), channel_id, None));
            let stderr_pump = tokio::spawn(pump_to_channel(
                stderr_rx,
                handle.clone(),
                channel_id,
                Some(EXTENDED_STDERR),
            ));

            let code = {
                let mut io = SessionIo {
                    stdin: &mut stdin_rx,
                    stdout: &mut stdout_tx,
                    stderr: &mut stderr_tx,
                };
                gateway.handle(&request, &mut io).await
            };
            debug!(code, fingerprint = ?fingerprint, "gateway session finished");

            // Closing the write ends lets the pumps drain and stop.
            drop(stdout_tx);
            drop(stderr_tx);
            let _ = stdout_pump.await;
            let _ = stderr_pump.await;

            // RFC 4254: exit-status → EOF → close.
            let _ = handle.exit_status_request(channel_id, code).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
        self.task = Some(task);

        Ok(())
    }
}
