//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the system `git` binary for
//! the actual work.  Repositories are always addressed with `--git-dir` so
//! that a bare repository's `HEAD` and config are never touched by a
//! checkout.

use std::path::Path;
use std::process::{Output, Stdio};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::store::RefSnapshot;

// ---------------------------------------------------------------------------
// Plumbing
// ---------------------------------------------------------------------------

/// Run `git --git-dir=<repo_path> <args...>` and fail on a non-zero status.
async fn run_git(
    repo_path: &Path,
    args: &[&str],
    work_tree: Option<&Path>,
    index_file: Option<&Path>,
) -> Result<Output> {
    let mut cmd = Command::new("git");
    cmd.arg("--git-dir").arg(repo_path);
    if let Some(work_tree) = work_tree {
        cmd.arg("--work-tree").arg(work_tree);
    }
    cmd.args(args);

    if let Some(index_file) = index_file {
        cmd.env("GIT_INDEX_FILE", index_file);
    }
    cmd.env("GIT_TERMINAL_PROMPT", "0");

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let subcommand = args.first().copied().unwrap_or_default();
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn git {subcommand}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git {subcommand} failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    Ok(output)
}

// ---------------------------------------------------------------------------
// for-each-ref
// ---------------------------------------------------------------------------

/// Run `git for-each-ref` over branches and tags and return a map of
/// `ref_name -> object_id`.
///
/// Uses the format `%(objectname) %(refname)` so each output line is
/// `<oid> <refname>`.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_for_each_ref(repo_path: &Path) -> Result<RefSnapshot> {
    let output = run_git(
        repo_path,
        &[
            "for-each-ref",
            "--format=%(objectname) %(refname)",
            "refs/heads/",
            "refs/tags/",
        ],
        None,
        None,
    )
    .await?;

    let refs = parse_for_each_ref(&String::from_utf8_lossy(&output.stdout));
    debug!(ref_count = refs.len(), "git for-each-ref complete");
    Ok(refs)
}

fn parse_for_each_ref(stdout: &str) -> RefSnapshot {
    let mut refs = RefSnapshot::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Format: "<objectname> <refname>"
        if let Some((oid, refname)) = line.split_once(' ') {
            refs.insert(refname.trim().to_string(), oid.trim().to_string());
        }
    }
    refs
}

/// Return the branch ref whose tip commit has the newest committer date.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_most_recent_branch(repo_path: &Path) -> Result<Option<String>> {
    let output = run_git(
        repo_path,
        &[
            "for-each-ref",
            "--sort=-committerdate",
            "--count=1",
            "--format=%(refname)",
            "refs/heads/",
        ],
        None,
        None,
    )
    .await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let branch = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string);

    debug!(branch = ?branch, "most recent branch");
    Ok(branch)
}

// ---------------------------------------------------------------------------
// Checkout
// ---------------------------------------------------------------------------

/// Write the complete tree of `ref_name` into `dest`.
///
/// Uses `read-tree` + `checkout-index` against a throwaway index file, so the
/// bare repository gains no index and `dest` gains no `.git` directory.
#[instrument(fields(repo = %repo_path.display(), %ref_name, dest = %dest.display()))]
pub async fn git_checkout_tree(repo_path: &Path, ref_name: &str, dest: &Path) -> Result<()> {
    let index_dir = tempfile::tempdir().context("failed to create temp dir for index")?;
    let index_file = index_dir.path().join("index");

    run_git(
        repo_path,
        &["read-tree", ref_name],
        Some(dest),
        Some(&index_file),
    )
    .await?;

    run_git(
        repo_path,
        &["checkout-index", "--all", "--force"],
        Some(dest),
        Some(&index_file),
    )
    .await?;

    debug!("tree materialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers that build real repositories with the system `git`.

    use std::path::Path;
    use std::process::Command;

    pub fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args([
                "-c",
                "user.name=pushgate",
                "-c",
                "user.email=pushgate@example.invalid",
                "-c",
                "init.defaultBranch=main",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .status()
            .expect("git is installed");
        assert!(status.success(), "git {args:?} failed");
    }

    /// Create `{root}/{name}.git` with one commit per `(branch, files, date)`
    /// entry, pushed from a scratch clone.
    pub fn bare_repo_with_commits(
        root: &Path,
        name: &str,
        commits: &[(&str, &[(&str, &str)], &str)],
    ) -> std::path::PathBuf {
        let bare = root.join(format!("{name}.git"));
        std::fs::create_dir_all(&bare).unwrap();
        git(&bare, &["init", "--bare", "--quiet"]);

        let scratch = tempfile::tempdir().unwrap();
        let work = scratch.path();
        git(work, &["init", "--quiet"]);

        for (branch, files, date) in commits {
            git(work, &["checkout", "--quiet", "-B", branch]);
            for (rel, contents) in *files {
                let path = work.join(rel);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, contents).unwrap();
            }
            git(work, &["add", "--all"]);
            let status = Command::new("git")
                .arg("-C")
                .arg(work)
                .args([
                    "-c",
                    "user.name=pushgate",
                    "-c",
                    "user.email=pushgate@example.invalid",
                    "-c",
                    "commit.gpgsign=false",
                    "commit",
                    "--quiet",
                    "--allow-empty",
                    "-m",
                    "commit",
                ])
                .env("GIT_COMMITTER_DATE", date)
                .env("GIT_AUTHOR_DATE", date)
                .status()
                .unwrap();
            assert!(status.success());
            let refspec = format!("{branch}:refs/heads/{branch}");
            git(work, &["push", "--quiet", bare.to_str().unwrap(), &refspec]);
        }

        bare
    }
}
