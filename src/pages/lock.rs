//! Per-repository advisory lock serializing pages deployments.
//!
//! The lock is an exclusive `flock(2)` on `{work_root}/{key}.lock`, with `key`
//! the repository's flattened name.  It is
//! released when the [`RepoLock`] guard is dropped or the holding
//! process exits, so a crashed build never wedges the repository.  Locks on
//! different repositories are different files and never contend.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

/// Held lock; dropping it unlocks.
pub struct RepoLock {
    path: PathBuf,
    _guard: Flock<File>,
}

impl RepoLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Attempt to take the lock without blocking.
///
/// Returns `None` if another deployment currently holds it.
pub fn try_acquire(path: &Path) -> Result<Option<RepoLock>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create lock dir: {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(guard) => {
            debug!(lock = %path.display(), "repo lock acquired");
            Ok(Some(RepoLock {
                path: path.to_path_buf(),
                _guard: guard,
            }))
        }
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
        Err((_, errno)) => Err(anyhow::anyhow!(
            "flock on {} failed: {errno}",
            path.display()
        )),
    }
}

/// Wait until the lock is free and take it, or give up after `timeout`.
///
/// Returns `None` if the timeout expired while the lock was still held.
pub async fn acquire(path: &Path, timeout: Duration) -> Result<Option<RepoLock>> {
    let now = tokio::time::Instant::now();
    // Roughly thirty years stands in for "forever".
    let deadline = now
        .checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30));
    let poll_interval = Duration::from_millis(250);

    loop {
        if let Some(lock) = try_acquire(path)? {
            return Ok(Some(lock));
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(poll_interval.min(remaining)).await;
    }

    warn!(lock = %path.display(), ?timeout, "timed out waiting for repo lock");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("site.lock");

        let first = try_acquire(&path).unwrap().expect("lock is free");
        assert!(try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn different_repos_do_not_contend() {
        let tmp = tempfile::tempdir().unwrap();
        let _a = try_acquire(&tmp.path().join("a.lock")).unwrap().unwrap();
        let b = try_acquire(&tmp.path().join("nested/b.lock")).unwrap();
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn acquire_times_out_while_held() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("site.lock");
        let _held = try_acquire(&path).unwrap().unwrap();

        let waited = acquire(&path, Duration::from_millis(300)).await.unwrap();
        assert!(waited.is_none());
    }

    #[tokio::test]
    async fn unbounded_wait_does_not_overflow() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("site.lock");

        let lock = acquire(&path, Duration::MAX).await.unwrap();
        assert!(lock.is_some());
    }

    #[tokio::test]
    async fn acquire_succeeds_after_release() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("site.lock");
        let held = try_acquire(&path).unwrap().unwrap();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(held);
        });

        let lock = acquire(&path, Duration::from_secs(5)).await.unwrap();
        assert!(lock.is_some());
        release.await.unwrap();
    }
}
