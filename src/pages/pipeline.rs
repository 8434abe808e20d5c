use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::config::PagesConfig;
use super::lock::{self, RepoLock};
use super::publish::Publisher;
use crate::config::PagesSettings;
use crate::hooks::{notify, ClientOutput, PushEvent};
use crate::metrics::{MetricsRegistry, PagesLabels, PagesOutcome};
use crate::process::kill_process_group;
use crate::store::{branch_ref, flat_key, RepoStore, Repository};

/// Dependency manifest that triggers the install step.
const MANIFEST: &str = "package.json";

// ---------------------------------------------------------------------------
// States and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    ConfigLoaded,
    Skipped,
    Building,
    Built,
    Publishing,
    Published,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ConfigLoaded => "config-loaded",
            Self::Skipped => "skipped",
            Self::Building => "building",
            Self::Built => "built",
            Self::Publishing => "publishing",
            Self::Published => "published",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Step of a run that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Lock,
    Checkout,
    Install,
    Build,
    Verify,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Lock => "lock",
            Self::Checkout => "checkout",
            Self::Install => "install",
            Self::Build => "build",
            Self::Verify => "verify",
            Self::Publish => "publish",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoConfig,
    Disabled,
    BranchMismatch,
    RefDeleted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoConfig => "no pages config",
            Self::Disabled => "pages disabled",
            Self::BranchMismatch => "not the pages branch",
            Self::RefDeleted => "branch deleted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Skipped(SkipReason),
    Published { release: PathBuf },
}

/// A run that ended in `Failed`.  The previously published site is intact.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {error:#}")]
pub struct PipelineFailure {
    pub stage: Stage,
    pub error: anyhow::Error,
}

impl PipelineFailure {
    fn new(stage: Stage, error: anyhow::Error) -> Self {
        Self { stage, error }
    }
}

/// Attach the failing stage to a fallible step.
trait StageExt<T> {
    fn stage(self, stage: Stage) -> Result<T, PipelineFailure>;
}

impl<T, E> StageExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn stage(self, stage: Stage) -> Result<T, PipelineFailure> {
        self.map_err(|e| PipelineFailure::new(stage, e.into()))
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct PagesPipeline {
    store: Arc<dyn RepoStore>,
    settings: PagesSettings,
    publisher: Publisher,
    metrics: MetricsRegistry,
}

impl PagesPipeline {
    pub fn new(store: Arc<dyn RepoStore>, settings: PagesSettings, metrics: MetricsRegistry) -> Self {
        let publisher = Publisher::new(&settings.sites_root, settings.keep_releases);
        Self {
            store,
            settings,
            publisher,
            metrics,
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Deploy `repo` for one pushed ref.
    ///
    /// Progress and failures are reported on `out`.  Config is read fresh on
    /// every call.
    pub async fn run(
        &self,
        repo: &Repository,
        event: &PushEvent,
        out: &mut ClientOutput,
    ) -> Result<PipelineOutcome, PipelineFailure> {
        let started = Instant::now();
        let mut state = PipelineState::Idle;
        let result = self.execute(repo, event, out, &mut state).await;

        match &result {
            Ok(PipelineOutcome::Skipped(reason)) => {
                self.count(PagesOutcome::Skipped);
                debug!(repo = %repo.name, ref_name = %event.ref_name, %reason, "pages run skipped");
                if matches!(reason, SkipReason::Disabled | SkipReason::RefDeleted) {
                    notify(out, &format!("pages: skipped ({reason})")).await;
                }
            }
            Ok(PipelineOutcome::Published { release }) => {
                self.count(PagesOutcome::Published);
                self.observe(started);
                notify(
                    out,
                    &format!(
                        "pages: published {} ({})",
                        repo.name,
                        release
                            .file_name()
                            .map(|n| n.to_string_lossy())
                            .unwrap_or_default()
                    ),
                )
                .await;
            }
            Err(failure) => {
                self.count(PagesOutcome::Failed);
                self.observe(started);
                warn!(
                    repo = %repo.name,
                    stage = %failure.stage,
                    last_state = %state,
                    error = %failure.error,
                    "pages deployment failed"
                );
                notify(
                    out,
                    &format!(
                        "pages: deployment of {} failed: {failure}; the previous site stays live",
                        repo.name
                    ),
                )
                .await;
            }
        }

        result
    }

    /// Redeploy the current tip of `branch`, or of the configured branch
    /// when `None`.
    pub async fn rebuild(
        &self,
        repo: &Repository,
        branch: Option<&str>,
        out: &mut ClientOutput,
    ) -> Result<PipelineOutcome, PipelineFailure> {
        let branch = match branch {
            Some(branch) => branch.to_string(),
            // A broken config is reported by `run` itself.
            None => self
                .store
                .pages_config(repo)
                .await
                .ok()
                .flatten()
                .unwrap_or_default()
                .branch,
        };
        self.run(repo, &PushEvent::synthesized(branch_ref(&branch)), out)
            .await
    }

    async fn execute(
        &self,
        repo: &Repository,
        event: &PushEvent,
        out: &mut ClientOutput,
        state: &mut PipelineState,
    ) -> Result<PipelineOutcome, PipelineFailure> {
        let failed = |state: &mut PipelineState, failure: PipelineFailure| {
            *state = PipelineState::Failed;
            failure
        };

        // -- ConfigLoaded --
        let config = match self.store.pages_config(repo).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                advance(repo, state, PipelineState::Skipped);
                return Ok(PipelineOutcome::Skipped(SkipReason::NoConfig));
            }
            Err(e) => return Err(failed(state, PipelineFailure::new(Stage::Config, e))),
        };
        advance(repo, state, PipelineState::ConfigLoaded);

        if let Some(reason) = skip_reason(&config, event) {
            advance(repo, state, PipelineState::Skipped);
            return Ok(PipelineOutcome::Skipped(reason));
        }

        // -- Building --
        let lock = self.lock(repo, out).await.map_err(|f| failed(state, f))?;
        advance(repo, state, PipelineState::Building);
        notify(
            out,
            &format!("pages: deploying {} from {}", repo.name, event.ref_name),
        )
        .await;

        let workspace = self
            .build(repo, event, &config, out)
            .await
            .map_err(|f| failed(state, f))?;

        // -- Built --
        advance(repo, state, PipelineState::Built);
        let output = verify_output(&workspace, &config)
            .await
            .map_err(|f| failed(state, f))?;

        // -- Publishing --
        advance(repo, state, PipelineState::Publishing);
        let publisher = self.publisher.clone();
        let name = repo.name.to_string();
        let release = tokio::task::spawn_blocking(move || {
            // Held until the swap is done even if the session goes away.
            let _lock: RepoLock = lock;
            publisher.publish(&name, &output)
        })
        .await
        .stage(Stage::Publish)
        .and_then(|published| published.stage(Stage::Publish))
        .map_err(|f| failed(state, f))?;

        advance(repo, state, PipelineState::Published);
        Ok(PipelineOutcome::Published { release })
    }

    /// Take the repository's deployment lock, waiting for a running
    /// deployment up to the configured limit.
    async fn lock(&self, repo: &Repository, out: &mut ClientOutput) -> Result<RepoLock, PipelineFailure> {
        let path = self
            .settings
            .work_root
            .join(format!("{}.lock", flat_key(repo.name.as_str())));

        if let Some(held) = lock::try_acquire(&path).stage(Stage::Lock)? {
            return Ok(held);
        }

        self.metrics.metrics.lock_waits.inc();
        notify(
            out,
            &format!("pages: waiting for another deployment of {}", repo.name),
        )
        .await;

        let timeout = self.settings.lock_wait_timeout();
        match lock::acquire(&path, timeout).await.stage(Stage::Lock)? {
            Some(held) => Ok(held),
            None => {
                self.metrics.metrics.lock_timeouts.inc();
                Err(PipelineFailure::new(
                    Stage::Lock,
                    anyhow::anyhow!(
                        "gave up after {}s waiting for the repository lock",
                        timeout.as_secs()
                    ),
                ))
            }
        }
    }

    /// Fresh workspace, checkout, then install and build when configured.
    async fn build(
        &self,
        repo: &Repository,
        event: &PushEvent,
        config: &PagesConfig,
        out: &mut ClientOutput,
    ) -> Result<PathBuf, PipelineFailure> {
        let workspace = self.settings.work_root.join(flat_key(repo.name.as_str()));
        recreate_dir(&workspace).await.stage(Stage::Checkout)?;
        self.store
            .materialize(repo, &event.ref_name, &workspace)
            .await
            .stage(Stage::Checkout)?;

        if !config.has_build_step() {
            return Ok(workspace);
        }

        let env = [
            ("PAGES_REPO", repo.name.as_str()),
            ("PAGES_BRANCH", config.branch.as_str()),
            ("PAGES_OUTPUT_DIR", config.output_dir.as_str()),
        ];
        let timeout = self.settings.build_timeout();

        let install = self.settings.install_command.trim();
        let has_manifest = tokio::fs::try_exists(workspace.join(MANIFEST))
            .await
            .unwrap_or(false);
        if has_manifest && !install.is_empty() {
            notify(out, &format!("pages: installing dependencies: {install}")).await;
            run_shell(install, &workspace, &env, timeout, out)
                .await
                .stage(Stage::Install)?;
        }

        notify(out, &format!("pages: building: {}", config.build_command)).await;
        run_shell(&config.build_command, &workspace, &env, timeout, out)
            .await
            .stage(Stage::Build)?;

        Ok(workspace)
    }

    fn count(&self, outcome: PagesOutcome) {
        self.metrics
            .metrics
            .pages_runs_total
            .get_or_create(&PagesLabels { outcome })
            .inc();
    }

    fn observe(&self, started: Instant) {
        self.metrics
            .metrics
            .pages_build_duration_seconds
            .observe(started.elapsed().as_secs_f64());
    }
}

fn advance(repo: &Repository, state: &mut PipelineState, next: PipelineState) {
    debug!(repo = %repo.name, from = %state, to = %next, "pages state");
    *state = next;
}

fn skip_reason(config: &PagesConfig, event: &PushEvent) -> Option<SkipReason> {
    if !config.enabled {
        Some(SkipReason::Disabled)
    } else if event.ref_name != branch_ref(&config.branch) {
        Some(SkipReason::BranchMismatch)
    } else if event.is_deletion() {
        Some(SkipReason::RefDeleted)
    } else {
        None
    }
}

async fn recreate_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to clear workspace {}", dir.display()))
        }
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create workspace {}", dir.display()))
}

async fn verify_output(workspace: &Path, config: &PagesConfig) -> Result<PathBuf, PipelineFailure> {
    let output = workspace.join(config.output_path().stage(Stage::Verify)?);
    match tokio::fs::metadata(&output).await {
        Ok(meta) if meta.is_dir() => Ok(output),
        _ => Err(PipelineFailure::new(
            Stage::Verify,
            anyhow::anyhow!("output directory {:?} does not exist", config.output_dir),
        )),
    }
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

/// Run `command` with `sh -c` in `dir`, streaming its output line by line.
///
/// The command gets its own process group so that a timeout kills anything
/// it spawned, not just the shell.
async fn run_shell(
    command: &str,
    dir: &Path,
    env: &[(&str, &str)],
    timeout: Duration,
    out: &mut ClientOutput,
) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .envs(env.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start `{command}`"))?;
    let pid = child.id();

    let stdout = child.stdout.take().context("command stdout was not piped")?;
    let stderr = child.stderr.take().context("command stderr was not piped")?;
    let mut stdout = BufReader::new(stdout).split(b'\n');
    let mut stderr = BufReader::new(stderr).split(b'\n');
    let (mut out_open, mut err_open) = (true, true);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let status = loop {
        tokio::select! {
            line = stdout.next_segment(), if out_open => match line? {
                Some(line) => relay(out, &line).await,
                None => out_open = false,
            },
            line = stderr.next_segment(), if err_open => match line? {
                Some(line) => relay(out, &line).await,
                None => err_open = false,
            },
            status = child.wait(), if !out_open && !err_open => {
                break status.context("failed to wait for command")?;
            }
            () = &mut deadline => {
                kill_process_group(pid);
                let _ = child.kill().await;
                anyhow::bail!("`{command}` timed out after {}s", timeout.as_secs());
            }
        }
    };

    if !status.success() {
        match status.code() {
            Some(code) => anyhow::bail!("`{command}` exited with status {code}"),
            None => anyhow::bail!("`{command}` was killed by a signal"),
        }
    }
    Ok(())
}

async fn relay(out: &mut ClientOutput, line: &[u8]) {
    debug!(line = %String::from_utf8_lossy(line), "build output");
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line);
    buf.push(b'\n');
    // A vanished client must not abort the build.
    let _ = out.write_all(&buf).await;
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::pages::publish::test_support::snapshot_tree;
    use crate::store::fake::FakeStore;

    struct Harness {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        store: Arc<FakeStore>,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().to_path_buf();
            let store = Arc::new(FakeStore::new(root.join("repos")));
            Self {
                _tmp: tmp,
                root,
                store,
            }
        }

        fn pipeline_with(&self, settings: PagesSettings) -> PagesPipeline {
            PagesPipeline::new(self.store.clone(), settings, MetricsRegistry::new())
        }

        fn pipeline(&self) -> PagesPipeline {
            self.pipeline_with(test_support::settings(&self.root))
        }

        fn repo(&self) -> Repository {
            self.store.resolve("site").unwrap()
        }

        fn configure(&self, build_command: &str, output_dir: &str) {
            self.store.set_config(
                "site",
                PagesConfig {
                    build_command: build_command.to_string(),
                    output_dir: output_dir.to_string(),
                    ..PagesConfig::default()
                },
            );
        }

        fn site(&self) -> PathBuf {
            self.root.join("sites/site")
        }
    }

    fn main_push() -> PushEvent {
        PushEvent::synthesized("refs/heads/main")
    }

    #[tokio::test]
    async fn static_site_publishes_exactly_the_tree() {
        let h = Harness::new();
        h.configure("", ".");
        h.store
            .set_tree("site", "refs/heads/main", &[("index.html", "<h1>hello</h1>")]);

        let mut out = Vec::new();
        let outcome = h.pipeline().run(&h.repo(), &main_push(), &mut out).await.unwrap();

        assert!(matches!(outcome, PipelineOutcome::Published { .. }));
        let expected: BTreeMap<String, Vec<u8>> =
            [("index.html".to_string(), b"<h1>hello</h1>".to_vec())].into();
        assert_eq!(snapshot_tree(&h.site()), expected);
    }

    #[tokio::test]
    async fn failing_build_keeps_previous_site() {
        let h = Harness::new();
        let pipeline = h.pipeline();
        h.configure("", ".");
        h.store.set_tree("site", "refs/heads/main", &[("index.html", "v1")]);
        let mut out = Vec::new();
        pipeline.run(&h.repo(), &main_push(), &mut out).await.unwrap();
        let before = snapshot_tree(&h.site());
        let live = pipeline.publisher().current_release("site");

        h.configure("false", ".");
        h.store.set_tree("site", "refs/heads/main", &[("index.html", "v2")]);
        let failure = pipeline
            .run(&h.repo(), &main_push(), &mut out)
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Build);
        assert_eq!(snapshot_tree(&h.site()), before);
        assert_eq!(pipeline.publisher().current_release("site"), live);
        let client = String::from_utf8(out).unwrap();
        assert!(client.contains("build stage failed"), "{client}");
    }

    #[tokio::test]
    async fn failing_first_build_publishes_nothing() {
        let h = Harness::new();
        h.configure("false", ".");
        h.store.set_tree("site", "refs/heads/main", &[("index.html", "v1")]);

        let mut out = Vec::new();
        let failure = h
            .pipeline()
            .run(&h.repo(), &main_push(), &mut out)
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Build);
        assert!(std::fs::symlink_metadata(h.site()).is_err());
    }

    #[tokio::test]
    async fn missing_config_skips_without_a_workspace() {
        let h = Harness::new();
        let mut out = Vec::new();
        let outcome = h.pipeline().run(&h.repo(), &main_push(), &mut out).await.unwrap();

        assert_eq!(outcome, PipelineOutcome::Skipped(SkipReason::NoConfig));
        assert_eq!(h.store.materialize_count(), 0);
        assert!(!h.root.join("work/site").exists());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn disabled_config_skips() {
        let h = Harness::new();
        h.store.set_config(
            "site",
            PagesConfig {
                enabled: false,
                ..PagesConfig::default()
            },
        );

        let mut out = Vec::new();
        let outcome = h.pipeline().run(&h.repo(), &main_push(), &mut out).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Skipped(SkipReason::Disabled));
        assert_eq!(h.store.materialize_count(), 0);
    }

    #[tokio::test]
    async fn other_branch_does_not_rebuild() {
        let h = Harness::new();
        h.configure("", ".");
        h.store.set_tree("site", "refs/heads/dev", &[("index.html", "dev")]);

        let mut out = Vec::new();
        let outcome = h
            .pipeline()
            .run(&h.repo(), &PushEvent::synthesized("refs/heads/dev"), &mut out)
            .await
            .unwrap();

        assert_eq!(outcome, PipelineOutcome::Skipped(SkipReason::BranchMismatch));
        assert_eq!(h.store.materialize_count(), 0);
        assert!(std::fs::symlink_metadata(h.site()).is_err());
    }

    #[tokio::test]
    async fn deleting_the_branch_skips() {
        let h = Harness::new();
        h.configure("", ".");
        let event: PushEvent = format!("abc {} refs/heads/main", crate::hooks::event::ZERO_ID)
            .parse()
            .unwrap();

        let mut out = Vec::new();
        let outcome = h.pipeline().run(&h.repo(), &event, &mut out).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Skipped(SkipReason::RefDeleted));
    }

    #[tokio::test]
    async fn redeploying_the_same_tree_is_idempotent() {
        let h = Harness::new();
        let pipeline = h.pipeline();
        h.configure("", ".");
        h.store.set_tree(
            "site",
            "refs/heads/main",
            &[("index.html", "same"), ("css/site.css", "body {}")],
        );

        let mut out = Vec::new();
        pipeline.run(&h.repo(), &main_push(), &mut out).await.unwrap();
        let first = snapshot_tree(&h.site());
        pipeline.run(&h.repo(), &main_push(), &mut out).await.unwrap();

        assert_eq!(snapshot_tree(&h.site()), first);
    }

    #[tokio::test]
    async fn build_sees_pages_environment_and_output_is_streamed() {
        let h = Harness::new();
        h.configure(
            "mkdir -p out && echo \"$PAGES_REPO:$PAGES_BRANCH:$PAGES_OUTPUT_DIR\" > out/env.txt && echo built-ok",
            "out",
        );
        h.store.set_tree("site", "refs/heads/main", &[("src.txt", "x")]);

        let mut out = Vec::new();
        h.pipeline().run(&h.repo(), &main_push(), &mut out).await.unwrap();

        let site = snapshot_tree(&h.site());
        assert_eq!(site.get("env.txt").unwrap(), b"site:main:out\n");
        assert!(!site.contains_key("src.txt"));
        assert!(String::from_utf8(out).unwrap().contains("built-ok\n"));
    }

    #[tokio::test]
    async fn manifest_triggers_install_before_build() {
        let h = Harness::new();
        h.configure("mkdir -p public && cp installed.txt public/", "public");
        h.store
            .set_tree("site", "refs/heads/main", &[("package.json", "{}")]);

        let mut out = Vec::new();
        h.pipeline().run(&h.repo(), &main_push(), &mut out).await.unwrap();

        assert_eq!(
            snapshot_tree(&h.site()).get("installed.txt").unwrap(),
            b"installed\n"
        );
    }

    #[tokio::test]
    async fn no_install_without_a_build_command() {
        let h = Harness::new();
        h.configure("", ".");
        h.store.set_tree(
            "site",
            "refs/heads/main",
            &[("package.json", "{}"), ("index.html", "x")],
        );

        let mut out = Vec::new();
        h.pipeline().run(&h.repo(), &main_push(), &mut out).await.unwrap();

        let site = snapshot_tree(&h.site());
        assert!(!site.contains_key("installed.txt"));
        assert!(site.contains_key("package.json"));
    }

    #[tokio::test]
    async fn slow_build_times_out() {
        let h = Harness::new();
        let mut settings = test_support::settings(&h.root);
        settings.build_timeout = 1;
        h.configure("sleep 30", ".");
        h.store.set_tree("site", "refs/heads/main", &[("index.html", "x")]);

        let mut out = Vec::new();
        let started = Instant::now();
        let failure = h
            .pipeline_with(settings)
            .run(&h.repo(), &main_push(), &mut out)
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Build);
        assert!(failure.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(std::fs::symlink_metadata(h.site()).is_err());
    }

    #[tokio::test]
    async fn missing_output_dir_fails_verification() {
        let h = Harness::new();
        h.configure("", "dist");
        h.store.set_tree("site", "refs/heads/main", &[("index.html", "x")]);

        let mut out = Vec::new();
        let failure = h
            .pipeline()
            .run(&h.repo(), &main_push(), &mut out)
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Verify);
    }

    #[tokio::test]
    async fn unreadable_config_fails_config_stage() {
        let h = Harness::new();
        h.store
            .broken_configs
            .lock()
            .unwrap()
            .push("site".to_string());

        let mut out = Vec::new();
        let failure = h
            .pipeline()
            .run(&h.repo(), &main_push(), &mut out)
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Config);
        assert_eq!(h.store.materialize_count(), 0);
    }

    #[tokio::test]
    async fn held_lock_times_out() {
        let h = Harness::new();
        let mut settings = test_support::settings(&h.root);
        settings.lock_wait_timeout = 1;
        h.configure("", ".");
        h.store.set_tree("site", "refs/heads/main", &[("index.html", "x")]);
        let _held = lock::try_acquire(&h.root.join("work/site.lock"))
            .unwrap()
            .unwrap();

        let mut out = Vec::new();
        let failure = h
            .pipeline_with(settings)
            .run(&h.repo(), &main_push(), &mut out)
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Lock);
        assert_eq!(h.store.materialize_count(), 0);
        assert!(String::from_utf8(out).unwrap().contains("waiting for another deployment"));
    }

    #[tokio::test]
    async fn rebuild_uses_the_configured_branch() {
        let h = Harness::new();
        h.store.set_config(
            "site",
            PagesConfig {
                branch: "pages".to_string(),
                output_dir: ".".to_string(),
                ..PagesConfig::default()
            },
        );
        h.store.set_tree("site", "refs/heads/pages", &[("index.html", "p")]);

        let mut out = Vec::new();
        let outcome = h.pipeline().rebuild(&h.repo(), None, &mut out).await.unwrap();

        assert!(matches!(outcome, PipelineOutcome::Published { .. }));
        assert_eq!(snapshot_tree(&h.site()).get("index.html").unwrap(), b"p");
    }
}
