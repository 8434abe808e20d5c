mod config;
mod error;
mod gateway;
mod git;
mod health;
mod hooks;
mod http;
mod metrics;
mod pages;
mod process;
mod ssh;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::Signal;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::gateway::{Gateway, GitTransport, SessionIo, SessionRequest};
use crate::hooks::HookDispatcher;
use crate::metrics::MetricsRegistry;
use crate::pages::{PagesPipeline, PipelineOutcome};
use crate::store::{FsRepoStore, RepoStore};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "pushgate", about = "SSH git gateway with push-to-deploy pages")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/pushgate/config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SSH listener and the health/metrics endpoint.
    Serve,
    /// Serve a single session, e.g. from an OpenSSH `ForceCommand`.
    Exec {
        /// Authenticated user the session runs for.
        #[arg(long, env = "USER")]
        user: String,
        /// Command line requested by the client.
        #[arg(long, env = "SSH_ORIGINAL_COMMAND")]
        command: String,
    },
    /// Deploy the current tip of a repository's pages branch.
    PagesBuild {
        /// Repository name, as a client would address it.
        repo: String,
        /// Branch to deploy instead of the configured one.
        #[arg(long)]
        branch: Option<String>,
    },
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared with the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
}

/// Everything a gateway session needs, wired from the config.
struct Services {
    store: Arc<dyn RepoStore>,
    pipeline: Arc<PagesPipeline>,
    gateway: Arc<Gateway>,
}

fn build_services(config: &Config, metrics: &MetricsRegistry) -> Services {
    let store: Arc<dyn RepoStore> = Arc::new(FsRepoStore::new(&config.store, &config.hooks));
    let pipeline = Arc::new(PagesPipeline::new(
        Arc::clone(&store),
        config.pages.clone(),
        metrics.clone(),
    ));
    let hooks = HookDispatcher::new(
        Arc::clone(&store),
        Arc::clone(&pipeline),
        config.hooks.ref_tracking,
        config.hooks.script_timeout(),
        metrics.clone(),
    );
    let gateway = Arc::new(Gateway::new(
        Arc::clone(&store),
        Arc::new(GitTransport),
        hooks,
        metrics.clone(),
    ));

    Services {
        store,
        pipeline,
        gateway,
    }
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_json_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Plain text on stderr; stdout may be carrying the git protocol.
fn init_stderr_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .http
        .listen
        .parse()
        .context("invalid http.listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

/// Resolves with the signal that ended an `exec` session.
async fn session_interrupted() -> Result<Signal> {
    let mut hangup = signal::unix::signal(SignalKind::hangup())?;
    let mut terminate = signal::unix::signal(SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(SignalKind::interrupt())?;

    let received = tokio::select! {
        _ = hangup.recv() => Signal::SIGHUP,
        _ = terminate.recv() => Signal::SIGTERM,
        _ = interrupt.recv() => Signal::SIGINT,
    };
    Ok(received)
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn serve(config: Arc<Config>) -> Result<()> {
    tracing::info!("starting pushgate");

    for dir in [&config.pages.sites_root, &config.pages.work_root] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create directory: {}", dir.display()))?;
    }

    let metrics = MetricsRegistry::new();
    let services = build_services(&config, &metrics);

    let state = AppState {
        config: Arc::clone(&config),
        metrics,
    };

    // ---- Spawn services ----
    let http_handle = tokio::spawn({
        let s = state.clone();
        async move {
            if let Err(e) = run_http_server(s).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }
    });

    let ssh_handle = tokio::spawn({
        let config = Arc::clone(&config);
        let gateway = Arc::clone(&services.gateway);
        async move {
            tokio::select! {
                result = ssh::start_ssh_server(&config.ssh, gateway) => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "SSH server failed");
                    }
                }
                () = shutdown_signal() => {}
            }
        }
    });

    let _ = tokio::try_join!(http_handle, ssh_handle);

    tracing::info!("pushgate shut down cleanly");
    Ok(())
}

async fn exec(config: Arc<Config>, user: String, command: String) -> Result<u32> {
    let metrics = MetricsRegistry::new();
    let services = build_services(&config, &metrics);

    let request = SessionRequest {
        command,
        username: user,
        git_protocol: std::env::var("GIT_PROTOCOL").ok(),
    };

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut io = SessionIo {
        stdin: &mut stdin,
        stdout: &mut stdout,
        stderr: &mut stderr,
    };

    // Dropping the session future kills the transport child.
    let code = tokio::select! {
        code = services.gateway.handle(&request, &mut io) => code,
        received = session_interrupted() => {
            let received = received?;
            tracing::warn!(signal = %received, "session interrupted");
            128 + received as u32
        }
    };
    Ok(code)
}

async fn pages_build(config: Arc<Config>, name: &str, branch: Option<&str>) -> Result<()> {
    let metrics = MetricsRegistry::new();
    let services = build_services(&config, &metrics);

    let repo = services.store.resolve(name)?;
    let mut out = tokio::io::stderr();

    match services.pipeline.rebuild(&repo, branch, &mut out).await? {
        PipelineOutcome::Published { release } => {
            println!("published {} ({})", repo.name, release.display());
        }
        PipelineOutcome::Skipped(reason) => {
            println!("skipped {}: {reason}", repo.name);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    match cli.command {
        Command::Serve => init_json_tracing(),
        _ => init_stderr_tracing(),
    }

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Exec { user, command } => {
            let code = exec(config, user, command).await?;
            std::process::exit(code as i32);
        }
        Command::PagesBuild { repo, branch } => {
            pages_build(config, &repo, branch.as_deref()).await
        }
        Command::CheckConfig => {
            println!(
                "{}: ok (store {}, sites {})",
                cli.config,
                config.store.root.display(),
                config.pages.sites_root.display()
            );
            Ok(())
        }
    }
}
