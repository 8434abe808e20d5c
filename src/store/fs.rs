//! Filesystem-backed [`RepoStore`].
//!
//! Repos are stored as bare Git repositories under `{root}/{name}.git`.
//! Deployment config and registered hooks live inside the bare repository
//! directory next to git's own files.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::{RefSnapshot, RepoName, RepoStore, Repository};
use crate::config::{HooksConfig, StoreConfig};
use crate::error::StoreError;
use crate::git;
use crate::pages::config::PagesConfig;

/// Bare repositories on local disk.
#[derive(Debug, Clone)]
pub struct FsRepoStore {
    /// Root directory holding the bare repos (e.g. `/srv/git`).
    root: PathBuf,
    /// Deployment config file name, relative to each bare repo.
    pages_config_file: String,
    /// Registered post-receive scripts directory, relative to each bare repo.
    hooks_dir: String,
}

impl FsRepoStore {
    pub fn new(store: &StoreConfig, hooks: &HooksConfig) -> Self {
        Self {
            root: store.root.clone(),
            pages_config_file: store.pages_config_file.clone(),
            hooks_dir: hooks.dir.clone(),
        }
    }

    /// Reject `path` if, after resolving symlinks, it is not under the root.
    fn check_confined(&self, path: &Path) -> Result<(), StoreError> {
        if !path.starts_with(&self.root) {
            return Err(StoreError::Escape(path.to_path_buf()));
        }

        // Only existing paths can be canonicalised; a missing repository is
        // reported later by the transport.
        match std::fs::canonicalize(path) {
            Ok(real) => {
                let root = std::fs::canonicalize(&self.root)?;
                if !real.starts_with(&root) {
                    return Err(StoreError::Escape(real));
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

#[async_trait::async_trait]
impl RepoStore for FsRepoStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, raw: &str) -> Result<Repository, StoreError> {
        let name = RepoName::parse(raw)?;
        let path = self.root.join(name.bare_dir());
        self.check_confined(&path)?;
        debug!(repo = %name, path = %path.display(), "resolved repository");
        Ok(Repository { name, path })
    }

    async fn pages_config(&self, repo: &Repository) -> Result<Option<PagesConfig>> {
        let path = repo.path.join(&self.pages_config_file);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read pages config: {}", path.display())
                })
            }
        };
        let config = PagesConfig::from_json(&contents)
            .with_context(|| format!("failed to parse pages config: {}", path.display()))?;
        Ok(Some(config))
    }

    async fn most_recent_branch(&self, repo: &Repository) -> Result<Option<String>> {
        git::git_most_recent_branch(&repo.path).await
    }

    async fn ref_snapshot(&self, repo: &Repository) -> Result<RefSnapshot> {
        git::git_for_each_ref(&repo.path).await
    }

    async fn hooks(&self, repo: &Repository) -> Result<Vec<PathBuf>> {
        let dir = repo.path.join(&self.hooks_dir);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read hooks dir: {}", dir.display()))
            }
        };

        let mut hooks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            // Follows symlinks so hooks can point at shared scripts.
            let meta = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(hook = %path.display(), error = %e, "skipping unreadable hook");
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }
            if meta.permissions().mode() & 0o111 == 0 {
                debug!(hook = %path.display(), "skipping non-executable hook");
                continue;
            }
            hooks.push(path);
        }

        hooks.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(hooks)
    }

    async fn materialize(&self, repo: &Repository, ref_name: &str, dest: &Path) -> Result<()> {
        git::git_checkout_tree(&repo.path, ref_name, dest).await
    }
}
