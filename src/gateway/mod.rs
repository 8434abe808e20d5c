//! Command gateway: the per-session request path.
//!
//! A session arrives with the command the client asked to execute.  The
//! gateway parses it, confines the repository argument to the store, runs
//! the backend transport with the client's streams attached and, after a
//! successful push, runs the post-receive hooks.  The session's exit code is
//! always the transport's; hooks can only add output.

pub mod command;
pub mod transport;

use std::sync::Arc;
use std::time::Instant;

use prometheus_client::metrics::gauge::Gauge;
use tracing::{error, info, warn};

use crate::config::RefTracking;
use crate::error::{GatewayError, EXIT_REJECTED};
use crate::hooks::{notify, HookDispatcher};
use crate::metrics::{MetricsRegistry, OperationLabel, SessionLabels, SessionOutcome};
use crate::store::{RepoStore, Repository};

pub use command::{GitCommand, Operation};
pub use transport::{GitTransport, SessionIo, Transport};

/// What the client asked for, as received by the SSH layer.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub command: String,
    pub username: String,
    /// Client's `GIT_PROTOCOL` environment value, if it sent one.
    pub git_protocol: Option<String>,
}

pub struct Gateway {
    store: Arc<dyn RepoStore>,
    transport: Arc<dyn Transport>,
    hooks: HookDispatcher,
    metrics: MetricsRegistry,
}

/// Keeps the active-session gauge right even when a session is aborted.
struct ActiveSession(Gauge);

impl ActiveSession {
    fn enter(gauge: &Gauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.dec();
    }
}

impl Gateway {
    pub fn new(
        store: Arc<dyn RepoStore>,
        transport: Arc<dyn Transport>,
        hooks: HookDispatcher,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            transport,
            hooks,
            metrics,
        }
    }

    /// Serve one session and return its exit code.
    pub async fn handle(&self, request: &SessionRequest, io: &mut SessionIo<'_>) -> u32 {
        let _active = ActiveSession::enter(&self.metrics.metrics.active_sessions);

        let (operation, repo) = match self.authorize(&request.command) {
            Ok(authorized) => authorized,
            Err(e) => {
                warn!(
                    user = %request.username,
                    command = %request.command,
                    error = %e,
                    "rejected session"
                );
                let label = match &e {
                    GatewayError::InvalidCommand(_) => OperationLabel::Invalid,
                    GatewayError::Repository(_) => operation_label(&request.command),
                };
                self.record(label, SessionOutcome::Rejected);
                notify(io.stderr, &format!("ERROR: {e}")).await;
                return e.exit_code();
            }
        };

        info!(
            user = %request.username,
            operation = %operation,
            repo = %repo.name,
            "session started"
        );

        // Refs as they were before the push, for snapshot tracking.
        let before = if operation == Operation::Push
            && self.hooks.tracking() == RefTracking::Snapshot
        {
            match self.store.ref_snapshot(&repo).await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(repo = %repo.name, error = %e, "failed to snapshot refs before push");
                    None
                }
            }
        } else {
            None
        };

        let started = Instant::now();
        let code = match self
            .transport
            .run(operation, &repo.path, request.git_protocol.as_deref(), io)
            .await
        {
            Ok(code) => code,
            Err(e) => {
                error!(repo = %repo.name, error = %e, "transport failed to start");
                notify(io.stderr, &format!("ERROR: {e:#}")).await;
                EXIT_REJECTED
            }
        };
        self.metrics
            .metrics
            .transport_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        if operation == Operation::Push && code == 0 {
            self.hooks.dispatch(&repo, before.as_ref(), io.stderr).await;
        }

        let outcome = if code == 0 {
            SessionOutcome::Ok
        } else {
            SessionOutcome::TransportFailed
        };
        self.record(operation.into(), outcome);
        info!(
            user = %request.username,
            operation = %operation,
            repo = %repo.name,
            code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "session finished"
        );
        code
    }

    /// Parse the command and resolve its repository inside the store.
    fn authorize(&self, raw: &str) -> Result<(Operation, Repository), GatewayError> {
        let command: GitCommand = raw.parse()?;
        let repo = self.store.resolve(&command.repo)?;
        Ok((command.operation, repo))
    }

    fn record(&self, operation: OperationLabel, outcome: SessionOutcome) {
        self.metrics
            .metrics
            .sessions_total
            .get_or_create(&SessionLabels { operation, outcome })
            .inc();
    }
}

impl From<Operation> for OperationLabel {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Fetch => Self::Fetch,
            Operation::Push => Self::Push,
        }
    }
}

/// Label for a command that parsed but named a bad repository.
fn operation_label(raw: &str) -> OperationLabel {
    raw.parse::<GitCommand>()
        .map(|c| c.operation.into())
        .unwrap_or(OperationLabel::Invalid)
}
