//! Post-receive hook dispatch.
//!
//! After the backend accepts a push, the dispatcher works out which refs
//! moved and runs the repository's hook chain once: every registered script
//! in the hooks directory (in file-name order), then the built-in pages hook.
//! Hook failures are reported to the client and counted, but never change
//! the outcome of the push itself.

pub mod event;
pub mod script;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::RefTracking;
use crate::metrics::MetricsRegistry;
use crate::pages::PagesPipeline;
use crate::store::{RefSnapshot, RepoStore, Repository};

pub use event::PushEvent;
pub use script::ScriptHook;

/// Client-facing byte sink (the SSH channel's extended data stream).
pub type ClientOutput = dyn AsyncWrite + Send + Unpin;

/// Write `line` to the client, ignoring a client that has gone away.
pub(crate) async fn notify(out: &mut ClientOutput, line: &str) {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    if !line.ends_with('\n') {
        buf.push(b'\n');
    }
    if let Err(e) = out.write_all(&buf).await {
        debug!(error = %e, "client output closed");
        return;
    }
    let _ = out.flush().await;
}

// ---------------------------------------------------------------------------
// Hook trait
// ---------------------------------------------------------------------------

/// One link in the post-receive chain.
#[async_trait::async_trait]
pub trait PostReceiveHook: Send + Sync {
    fn name(&self) -> String;

    /// `true` if the hook already tells the client when it fails.
    fn reports_own_failures(&self) -> bool {
        false
    }

    /// Run the hook for one push.  Anything written to `out` reaches the
    /// pushing client.
    async fn run(
        &self,
        repo: &Repository,
        events: &[PushEvent],
        out: &mut ClientOutput,
    ) -> Result<()>;
}

/// Built-in hook driving the pages pipeline once per pushed ref.
pub struct PagesHook {
    pipeline: Arc<PagesPipeline>,
}

impl PagesHook {
    pub fn new(pipeline: Arc<PagesPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait::async_trait]
impl PostReceiveHook for PagesHook {
    fn name(&self) -> String {
        "pages".to_string()
    }

    fn reports_own_failures(&self) -> bool {
        true
    }

    async fn run(
        &self,
        repo: &Repository,
        events: &[PushEvent],
        out: &mut ClientOutput,
    ) -> Result<()> {
        let mut first_failure = None;
        for event in events {
            if let Err(failure) = self.pipeline.run(repo, event, out).await {
                first_failure.get_or_insert(failure);
            }
        }
        match first_failure {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookReport {
    pub name: String,
    pub ok: bool,
    pub message: Option<String>,
}

/// What a dispatch did, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub events: Vec<PushEvent>,
    pub hooks: Vec<HookReport>,
}

impl DispatchReport {
    pub fn failures(&self) -> usize {
        self.hooks.iter().filter(|h| !h.ok).count()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct HookDispatcher {
    store: Arc<dyn RepoStore>,
    pages: Arc<PagesPipeline>,
    tracking: RefTracking,
    script_timeout: Duration,
    metrics: MetricsRegistry,
}

impl HookDispatcher {
    pub fn new(
        store: Arc<dyn RepoStore>,
        pages: Arc<PagesPipeline>,
        tracking: RefTracking,
        script_timeout: Duration,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            pages,
            tracking,
            script_timeout,
            metrics,
        }
    }

    pub fn tracking(&self) -> RefTracking {
        self.tracking
    }

    /// Run the hook chain for a push that the backend just accepted.
    ///
    /// `before` is the ref snapshot taken before the transport ran; it is
    /// only consulted in snapshot tracking mode.
    pub async fn dispatch(
        &self,
        repo: &Repository,
        before: Option<&RefSnapshot>,
        out: &mut ClientOutput,
    ) -> DispatchReport {
        let events = self.updated_refs(repo, before, out).await;
        if events.is_empty() {
            info!(repo = %repo.name, "push updated no branch; skipping hooks");
            return DispatchReport::default();
        }
        debug!(repo = %repo.name, events = events.len(), "dispatching post-receive hooks");

        let mut report = DispatchReport {
            events,
            hooks: Vec::new(),
        };

        for hook in self.chain(repo).await {
            let name = hook.name();
            self.metrics.metrics.hook_runs_total.inc();

            let hook_report = match hook.run(repo, &report.events, out).await {
                Ok(()) => HookReport {
                    name,
                    ok: true,
                    message: None,
                },
                Err(e) => {
                    self.metrics.metrics.hook_failures_total.inc();
                    warn!(repo = %repo.name, hook = %name, error = %e, "post-receive hook failed");
                    if !hook.reports_own_failures() {
                        notify(out, &format!("hook {name} failed: {e:#}")).await;
                    }
                    HookReport {
                        name,
                        ok: false,
                        message: Some(format!("{e:#}")),
                    }
                }
            };
            report.hooks.push(hook_report);
        }

        info!(
            repo = %repo.name,
            hooks = report.hooks.len(),
            failed = report.failures(),
            "post-receive hooks finished"
        );
        report
    }

    /// Registered scripts followed by the built-in pages hook.
    async fn chain(&self, repo: &Repository) -> Vec<Box<dyn PostReceiveHook>> {
        let scripts: Vec<PathBuf> = match self.store.hooks(repo).await {
            Ok(scripts) => scripts,
            Err(e) => {
                warn!(repo = %repo.name, error = %e, "failed to list hook scripts");
                Vec::new()
            }
        };

        let mut chain: Vec<Box<dyn PostReceiveHook>> = scripts
            .into_iter()
            .map(|path| {
                Box::new(ScriptHook::new(path, self.script_timeout)) as Box<dyn PostReceiveHook>
            })
            .collect();
        chain.push(Box::new(PagesHook::new(Arc::clone(&self.pages))));
        chain
    }

    /// Refs the push moved.  When that cannot be told (most-recent mode, a
    /// failed snapshot, or a push that moved nothing, such as a no-op push
    /// or one whose every ref was refused) the most recently committed
    /// branch stands in, with sentinel ids.
    async fn updated_refs(
        &self,
        repo: &Repository,
        before: Option<&RefSnapshot>,
        out: &mut ClientOutput,
    ) -> Vec<PushEvent> {
        let mut unchanged = false;
        if let (RefTracking::Snapshot, Some(before)) = (self.tracking, before) {
            match self.store.ref_snapshot(repo).await {
                Ok(after) => {
                    let events = PushEvent::diff(before, &after);
                    if !events.is_empty() {
                        return events;
                    }
                    unchanged = true;
                    debug!(repo = %repo.name, "ref snapshot unchanged; using most recent branch");
                }
                Err(e) => {
                    warn!(repo = %repo.name, error = %e, "failed to snapshot refs after push");
                }
            }
        }

        match self.store.most_recent_branch(repo).await {
            Ok(Some(ref_name)) => {
                if unchanged {
                    notify(
                        out,
                        &format!("note: push changed no refs; running hooks for {ref_name}"),
                    )
                    .await;
                }
                vec![PushEvent::synthesized(ref_name)]
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(repo = %repo.name, error = %e, "failed to find most recent branch");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::*;
    use crate::pages::config::PagesConfig;
    use crate::pages::pipeline::test_support::settings;
    use crate::store::fake::FakeStore;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn dispatcher(store: Arc<FakeStore>, root: &Path, tracking: RefTracking) -> HookDispatcher {
        let metrics = MetricsRegistry::new();
        let pages = Arc::new(PagesPipeline::new(
            store.clone(),
            settings(root),
            metrics.clone(),
        ));
        HookDispatcher::new(store, pages, tracking, Duration::from_secs(10), metrics)
    }

    #[tokio::test]
    async fn most_recent_mode_synthesizes_one_event() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::new(tmp.path().join("repos")));
        store
            .most_recent
            .lock()
            .unwrap()
            .insert("site".to_string(), "refs/heads/main".to_string());
        let repo = store.resolve("site").unwrap();

        let d = dispatcher(store.clone(), tmp.path(), RefTracking::MostRecent);
        let mut out = Vec::new();
        let report = d.dispatch(&repo, None, &mut out).await;

        assert_eq!(report.events, vec![PushEvent::synthesized("refs/heads/main")]);
        assert_eq!(report.hooks.len(), 1);
        assert_eq!(report.hooks[0].name, "pages");
        assert!(report.hooks[0].ok);
    }

    #[tokio::test]
    async fn snapshot_mode_reports_changed_refs_only() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::new(tmp.path().join("repos")));
        store.set_refs(
            "site",
            &[("refs/heads/main", "bbb"), ("refs/heads/dev", "ccc")],
        );
        let before: RefSnapshot = [
            ("refs/heads/main".to_string(), "aaa".to_string()),
            ("refs/heads/dev".to_string(), "ccc".to_string()),
        ]
        .into_iter()
        .collect();
        let repo = store.resolve("site").unwrap();

        let d = dispatcher(store.clone(), tmp.path(), RefTracking::Snapshot);
        let mut out = Vec::new();
        let report = d.dispatch(&repo, Some(&before), &mut out).await;

        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].to_string(), "aaa bbb refs/heads/main");
    }

    #[tokio::test]
    async fn empty_snapshot_diff_falls_back_to_most_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::new(tmp.path().join("repos")));
        store.set_refs("site", &[("refs/heads/main", "aaa")]);
        store
            .most_recent
            .lock()
            .unwrap()
            .insert("site".to_string(), "refs/heads/main".to_string());
        let before = store.refs.lock().unwrap().get("site").cloned().unwrap();
        let repo = store.resolve("site").unwrap();

        let d = dispatcher(store.clone(), tmp.path(), RefTracking::Snapshot);
        let mut out = Vec::new();
        let report = d.dispatch(&repo, Some(&before), &mut out).await;

        assert_eq!(report.events, vec![PushEvent::synthesized("refs/heads/main")]);
        assert_eq!(report.hooks.len(), 1);
        assert!(String::from_utf8(out)
            .unwrap()
            .starts_with("note: push changed no refs; running hooks for refs/heads/main\n"));
    }

    #[tokio::test]
    async fn changed_refs_get_no_fallback_note() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::new(tmp.path().join("repos")));
        store.set_refs("site", &[("refs/heads/main", "bbb")]);
        let before: RefSnapshot = [("refs/heads/main".to_string(), "aaa".to_string())]
            .into_iter()
            .collect();
        let repo = store.resolve("site").unwrap();

        let d = dispatcher(store.clone(), tmp.path(), RefTracking::Snapshot);
        let mut out = Vec::new();
        d.dispatch(&repo, Some(&before), &mut out).await;

        assert!(!String::from_utf8(out).unwrap().contains("note:"));
    }

    #[tokio::test]
    async fn scripts_run_in_order_before_pages_and_failures_are_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let scripts = tmp.path().join("scripts");
        std::fs::create_dir_all(&scripts).unwrap();
        let log = tmp.path().join("stdin.log");

        let first = write_script(&scripts, "10-fail", "echo failing >&2; exit 3");
        let second = write_script(
            &scripts,
            "20-record",
            &format!("cat > {}; echo recorded", log.display()),
        );

        let store = Arc::new(FakeStore::new(tmp.path().join("repos")));
        store
            .most_recent
            .lock()
            .unwrap()
            .insert("site".to_string(), "refs/heads/main".to_string());
        store
            .hooks
            .lock()
            .unwrap()
            .insert("site".to_string(), vec![first, second]);
        let repo = store.resolve("site").unwrap();
        std::fs::create_dir_all(&repo.path).unwrap();

        let d = dispatcher(store.clone(), tmp.path(), RefTracking::MostRecent);
        let mut out = Vec::new();
        let report = d.dispatch(&repo, None, &mut out).await;

        let names: Vec<&str> = report.hooks.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["10-fail", "20-record", "pages"]);
        assert!(!report.hooks[0].ok);
        assert!(report.hooks[1].ok);
        assert_eq!(report.failures(), 1);

        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "unknown current refs/heads/main\n"
        );
        let client = String::from_utf8(out).unwrap();
        assert!(client.contains("failing"));
        assert!(client.contains("hook 10-fail failed: exited with status 3"), "{client}");
        assert!(client.contains("recorded"));
    }

    #[tokio::test]
    async fn pages_failure_is_reported_not_raised() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::new(tmp.path().join("repos")));
        store
            .most_recent
            .lock()
            .unwrap()
            .insert("site".to_string(), "refs/heads/main".to_string());
        store.set_config(
            "site",
            PagesConfig {
                build_command: "false".to_string(),
                output_dir: ".".to_string(),
                ..PagesConfig::default()
            },
        );
        store.set_tree("site", "refs/heads/main", &[("index.html", "hi")]);
        let repo = store.resolve("site").unwrap();

        let d = dispatcher(store.clone(), tmp.path(), RefTracking::MostRecent);
        let mut out = Vec::new();
        let report = d.dispatch(&repo, None, &mut out).await;

        assert_eq!(report.failures(), 1);
        let message = report.hooks[0].message.as_deref().unwrap();
        assert!(message.contains("build"), "{message}");
    }

    #[tokio::test]
    async fn nothing_runs_without_a_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::new(tmp.path().join("repos")));
        let repo = store.resolve("empty").unwrap();

        let d = dispatcher(store.clone(), tmp.path(), RefTracking::MostRecent);
        let mut out = Vec::new();
        let report = d.dispatch(&repo, None, &mut out).await;

        assert!(report.events.is_empty());
        assert!(report.hooks.is_empty());
    }
}
