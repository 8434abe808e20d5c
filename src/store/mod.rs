//! Repository store: the filesystem-backed collection of bare repositories.
//!
//! The gateway, hook dispatcher and pages pipeline only talk to repositories
//! through the [`RepoStore`] trait so that each of them can be exercised
//! against an in-memory fake.  [`FsRepoStore`] is the production
//! implementation and shells out to `git` for anything that touches objects
//! or refs.

pub mod fs;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::error::StoreError;
use crate::pages::config::PagesConfig;

pub use fs::FsRepoStore;

/// Suffix carried by every bare repository directory.
pub const REPO_SUFFIX: &str = ".git";

// ---------------------------------------------------------------------------
// Repository identity
// ---------------------------------------------------------------------------

/// A sanitized repository name such as `site` or `alice/blog`.
///
/// Construction through [`RepoName::parse`] guarantees that every segment is
/// non-empty, does not start with `.`, and only contains ASCII alphanumerics,
/// `-`, `_` and `.`.  The name can therefore be joined onto any root without
/// escaping it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoName(String);

impl RepoName {
    /// Normalise a client-supplied repository argument.
    ///
    /// A single leading `/` is dropped and a trailing `.git` suffix is
    /// stripped; the suffix is re-appended canonically by
    /// [`RepoStore::resolve`].
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let invalid = |reason| StoreError::InvalidName {
            name: raw.to_string(),
            reason,
        };

        let trimmed = raw.strip_prefix('/').unwrap_or(raw);
        let trimmed = trimmed.strip_suffix(REPO_SUFFIX).unwrap_or(trimmed);

        if trimmed.is_empty() {
            return Err(invalid("empty name"));
        }
        if trimmed.starts_with('/') {
            return Err(invalid("absolute path"));
        }

        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if segment == "." || segment == ".." {
                return Err(invalid("relative path segment"));
            }
            if segment.starts_with('.') {
                return Err(invalid("segment starts with '.'"));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(invalid("unsupported character"));
            }
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name of the bare repository relative to the store root.
    pub fn bare_dir(&self) -> String {
        format!("{}{REPO_SUFFIX}", self.0)
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Single path component standing for `name`, for directories that hold
/// one entry per repository side by side.  `/` becomes `+`, which can never
/// occur in a valid name, so distinct names never share a key.
pub fn flat_key(name: &str) -> String {
    name.replace('/', "+")
}

/// A resolved repository: its name plus the validated bare storage path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub name: RepoName,
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Refs
// ---------------------------------------------------------------------------

/// Point-in-time view of a repository's refs: `ref_name -> object_id`.
pub type RefSnapshot = BTreeMap<String, String>;

/// Namespace holding branch refs.
pub const HEADS_PREFIX: &str = "refs/heads/";

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Data access used by the gateway, hook dispatcher and pages pipeline.
#[async_trait::async_trait]
pub trait RepoStore: Send + Sync {
    /// Root directory under which every repository lives.
    fn root(&self) -> &Path;

    /// Validate `raw` and resolve it to a repository inside [`root`].
    ///
    /// [`root`]: RepoStore::root
    fn resolve(&self, raw: &str) -> Result<Repository, StoreError>;

    /// Load the repository's deployment config, `None` when it has none.
    async fn pages_config(&self, repo: &Repository) -> Result<Option<PagesConfig>>;

    /// Most recently committed branch ref under `refs/heads/`, `None` for an
    /// empty repository.
    async fn most_recent_branch(&self, repo: &Repository) -> Result<Option<String>>;

    /// Current branch and tag refs.
    async fn ref_snapshot(&self, repo: &Repository) -> Result<RefSnapshot>;

    /// Registered post-receive hook executables, in invocation order.
    async fn hooks(&self, repo: &Repository) -> Result<Vec<PathBuf>>;

    /// Write the full tree of `ref_name` into the existing, empty directory
    /// `dest`.  No repository metadata is written.
    async fn materialize(&self, repo: &Repository, ref_name: &str, dest: &Path) -> Result<()>;
}

/// Branch name (`main`) to full ref (`refs/heads/main`).
pub fn branch_ref(branch: &str) -> String {
    if branch.starts_with(HEADS_PREFIX) {
        branch.to_string()
    } else {
        format!("{HEADS_PREFIX}{branch}")
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_suffix_and_leading_slash() {
        assert_eq!(RepoName::parse("/site.git").unwrap().as_str(), "site");
        assert_eq!(RepoName::parse("alice/blog").unwrap().as_str(), "alice/blog");
        assert_eq!(
            RepoName::parse("alice/blog.git").unwrap().bare_dir(),
            "alice/blog.git"
        );
    }

    #[test]
    fn parse_keeps_inner_dots() {
        assert_eq!(
            RepoName::parse("docs.example.org").unwrap().as_str(),
            "docs.example.org"
        );
    }

    #[test]
    fn parse_rejects_traversal() {
        for raw in [
            "..",
            "../etc",
            "a/../../b",
            "a/./b",
            "//etc/passwd",
            "a//b",
            ".hidden",
            "a/.git",
            "",
            ".git",
            "a b",
            "a\\b",
            "repo\n",
        ] {
            assert!(RepoName::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn flat_keys_do_not_nest() {
        assert_eq!(flat_key("site"), "site");
        assert_eq!(flat_key("alice/blog"), "alice+blog");
        assert_ne!(flat_key("alice/blog"), flat_key("alice-blog"));
    }

    #[test]
    fn branch_ref_qualifies_short_names() {
        assert_eq!(branch_ref("main"), "refs/heads/main");
        assert_eq!(branch_ref("refs/heads/dev"), "refs/heads/dev");
    }
}
