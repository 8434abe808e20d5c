//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tracing::{info, warn};

use super::keys::AuthorizedKeys;
use super::session::SshSession;
use crate::config::SshConfig;
use crate::gateway::Gateway;

/// Shared by every connection.
pub struct SshContext {
    pub gateway: Arc<Gateway>,
    pub authorized_keys: PathBuf,
}

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    ctx: Arc<SshContext>,
}

impl SshServer {
    pub fn new(ctx: Arc<SshContext>) -> Self {
        Self { ctx }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(
            peer = ?peer_addr,
            "new SSH client connection",
        );
        SshSession::new(Arc::clone(&self.ctx), peer_addr)
    }
}

// ---------------------------------------------------------------------------
// Server key loading
// ---------------------------------------------------------------------------

/// Load the configured host key, or generate an ephemeral Ed25519 key when
/// none is configured.
fn load_or_generate_host_key(path: Option<&Path>) -> Result<KeyPair> {
    match path {
        Some(path) => {
            let key = russh_keys::load_secret_key(path, None)
                .with_context(|| format!("failed to load SSH host key: {}", path.display()))?;
            info!(path = %path.display(), "loaded SSH host key");
            Ok(key)
        }
        None => {
            warn!("no ssh.host_key_path configured; generating ephemeral Ed25519 host key");
            Ok(KeyPair::generate_ed25519())
        }
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Start the SSH listener.  This function runs until the server is shut down
/// or an unrecoverable error occurs.
pub async fn start_ssh_server(config: &SshConfig, gateway: Arc<Gateway>) -> Result<()> {
    let listen_addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid SSH listen address: {:?}", config.listen))?;

    // A missing or empty keys file is not fatal; it is re-read on every
    // authentication attempt.
    match AuthorizedKeys::load(&config.authorized_keys_path).await {
        Ok(keys) if keys.is_empty() => {
            warn!(path = %config.authorized_keys_path.display(), "no authorized keys; every login will be refused")
        }
        Ok(keys) => info!(keys = keys.len(), "authorized keys loaded"),
        Err(e) => warn!(error = %e, "authorized keys not readable yet"),
    }

    // -- Build russh server config ----------------------------------------

    let host_key = load_or_generate_host_key(config.host_key_path.as_deref())?;

    let russh_config = Arc::new(server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        preferred: russh::Preferred::DEFAULT,
        inactivity_timeout: Some(Duration::from_secs(config.inactivity_timeout)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: 3,
        ..Default::default()
    });

    // -- Start serving ----------------------------------------------------

    info!(address = %listen_addr, "starting SSH server");

    let ctx = Arc::new(SshContext {
        gateway,
        authorized_keys: config.authorized_keys_path.clone(),
    });
    let mut ssh_server = SshServer::new(ctx);
    ssh_server
        .run_on_address(russh_config, listen_addr)
        .await
        .context("SSH server exited with error")?;

    Ok(())
}
