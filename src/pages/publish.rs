//! Stage-then-swap publication of a built site.
//!
//! Layout under the sites root:
//!
//! ```text
//! {sites_root}/{name}                          -> symlink to the live release
//! {sites_root}/.releases/{key}/{release_id}/   complete, immutable releases
//! {sites_root}/.releases/{key}/.staging-*      release being copied
//! ```
//!
//! where `key` is the site name with `/` flattened to `+`.
//!
//! A release only gets its final name once its copy is complete, and the
//! served path is switched with a single `rename(2)` of a freshly created
//! symlink over the old one.  Readers therefore see either the previous
//! release or the new one, never a partially written tree.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::store::flat_key;

/// Directory (under the sites root) holding every site's releases.
pub const RELEASES_DIR: &str = ".releases";

const STAGING_PREFIX: &str = ".staging-";
const LEGACY_PREFIX: &str = "legacy-";

/// Publishes releases for any site under one sites root.
#[derive(Debug, Clone)]
pub struct Publisher {
    sites_root: PathBuf,
    keep_releases: usize,
}

impl Publisher {
    pub fn new(sites_root: impl Into<PathBuf>, keep_releases: usize) -> Self {
        Self {
            sites_root: sites_root.into(),
            keep_releases: keep_releases.max(1),
        }
    }

    /// Served path for the site `name`.
    pub fn site_path(&self, name: &str) -> PathBuf {
        self.sites_root.join(name)
    }

    fn releases_dir(&self, name: &str) -> PathBuf {
        self.sites_root.join(RELEASES_DIR).join(flat_key(name))
    }

    /// Release the served path currently points at, if any.
    pub fn current_release(&self, name: &str) -> Option<PathBuf> {
        std::fs::read_link(self.site_path(name)).ok()
    }

    /// Copy `source` into a new release and make it live.
    ///
    /// Returns the path of the new release directory.  On error the served
    /// path is left pointing at whatever it pointed at before.
    pub fn publish(&self, name: &str, source: &Path) -> Result<PathBuf> {
        self.check_overlap(name)?;

        let releases = self.releases_dir(name);
        std::fs::create_dir_all(&releases)
            .with_context(|| format!("failed to create releases dir: {}", releases.display()))?;

        let release_id = unique_release_id(&releases);
        let staging = releases.join(format!("{STAGING_PREFIX}{release_id}"));
        let release = releases.join(&release_id);

        let staged = copy_tree(source, &staging)
            .and_then(|files| {
                std::fs::rename(&staging, &release).with_context(|| {
                    format!("failed to finalise release {}", release.display())
                })?;
                Ok(files)
            });
        let files = match staged {
            Ok(files) => files,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(e);
            }
        };
        debug!(site = name, release = %release.display(), files, "release staged");

        if let Err(e) = self.swap(name, &release, &release_id) {
            let _ = std::fs::remove_dir_all(&release);
            return Err(e);
        }

        info!(site = name, release = %release_id, files, "site published");

        if let Err(e) = self.prune(name) {
            warn!(site = name, error = %e, "failed to prune old releases");
        }

        Ok(release)
    }

    /// Refuse a served path that sits inside another live site, or that is a
    /// directory holding other sites' served paths.  Names such as `alice`
    /// and `alice/blog` cannot both be published.
    fn check_overlap(&self, name: &str) -> Result<()> {
        let segments: Vec<&str> = name.split('/').collect();
        let mut prefix = PathBuf::new();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            prefix.push(segment);
            let is_site = std::fs::symlink_metadata(self.sites_root.join(&prefix))
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(false);
            if is_site {
                anyhow::bail!(
                    "site {name} would be served inside site {}",
                    prefix.display()
                );
            }
        }

        let site = self.site_path(name);
        let is_dir = std::fs::symlink_metadata(&site)
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if is_dir && self.holds_live_sites(&site)? {
            anyhow::bail!(
                "served path {} holds other sites; site {name} cannot replace it",
                site.display()
            );
        }
        Ok(())
    }

    /// `true` if any symlink below `dir` points into the releases tree.
    fn holds_live_sites(&self, dir: &Path) -> Result<bool> {
        let releases = self.sites_root.join(RELEASES_DIR);
        let mut stack = vec![dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)
                .with_context(|| format!("failed to read {}", dir.display()))?
            {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_symlink() {
                    if std::fs::read_link(entry.path())?.starts_with(&releases) {
                        return Ok(true);
                    }
                } else if file_type.is_dir() {
                    stack.push(entry.path());
                }
            }
        }
        Ok(false)
    }

    /// Atomically point the served path at `release`.
    fn swap(&self, name: &str, release: &Path, release_id: &str) -> Result<()> {
        let site = self.site_path(name);
        let parent = site
            .parent()
            .context("site path has no parent directory")?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create sites dir: {}", parent.display()))?;

        let file_name = site
            .file_name()
            .context("site path has no file name")?
            .to_string_lossy()
            .into_owned();
        let tmp_link = parent.join(format!(".{file_name}.swap-{release_id}"));

        std::os::unix::fs::symlink(release, &tmp_link)
            .with_context(|| format!("failed to create symlink {}", tmp_link.display()))?;

        // A real directory cannot be replaced by rename(2); retire it into
        // the releases dir first.  Only sites published before releases
        // existed hit this path, and only once.
        if let Ok(meta) = std::fs::symlink_metadata(&site) {
            if meta.is_dir() {
                let legacy = self
                    .releases_dir(name)
                    .join(format!("{LEGACY_PREFIX}{release_id}"));
                warn!(
                    site = name,
                    legacy = %legacy.display(),
                    "served path is a plain directory; retiring it"
                );
                if let Err(e) = std::fs::rename(&site, &legacy) {
                    let _ = std::fs::remove_file(&tmp_link);
                    return Err(e).with_context(|| {
                        format!("failed to retire legacy site dir {}", site.display())
                    });
                }
            }
        }

        if let Err(e) = std::fs::rename(&tmp_link, &site) {
            let _ = std::fs::remove_file(&tmp_link);
            return Err(e)
                .with_context(|| format!("failed to swap served path {}", site.display()));
        }

        Ok(())
    }

    /// Remove releases beyond `keep_releases` plus leftover staging dirs.
    ///
    /// Callers hold the repository lock, so no other run can own a staging
    /// dir at this point.  The live release is never removed.
    pub fn prune(&self, name: &str) -> Result<usize> {
        let releases = self.releases_dir(name);
        let live = self.current_release(name);

        let mut candidates = Vec::new();
        for entry in std::fs::read_dir(&releases)
            .with_context(|| format!("failed to read releases dir: {}", releases.display()))?
        {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if file_name.starts_with(STAGING_PREFIX) {
                let _ = std::fs::remove_dir_all(&path);
                continue;
            }
            if file_name.starts_with('.') {
                continue;
            }
            candidates.push((file_name, path));
        }

        // Oldest first: retired legacy dirs, then release ids in order.
        candidates.sort_by(|(a, _), (b, _)| {
            let key = |n: &String| (!n.starts_with(LEGACY_PREFIX), n.clone());
            key(a).cmp(&key(b))
        });

        let excess = candidates.len().saturating_sub(self.keep_releases);
        let mut removed = 0;
        for (_, path) in candidates.into_iter().take(excess) {
            if live.as_deref() == Some(path.as_path()) {
                continue;
            }
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove release {}", path.display()))?;
            removed += 1;
        }

        if removed > 0 {
            debug!(site = name, removed, "pruned old releases");
        }
        Ok(removed)
    }
}

/// Sortable, unique release id such as `20241015T101010.123456789Z`.
fn unique_release_id(releases: &Path) -> String {
    let base = chrono::Utc::now()
        .format("%Y%m%dT%H%M%S%.9fZ")
        .to_string();
    let mut id = base.clone();
    let mut n = 1;
    while releases.join(&id).exists() {
        id = format!("{base}-{n}");
        n += 1;
    }
    id
}

/// Recursively copy `src` into the new directory `dst`, skipping `.git`.
///
/// Symlinks are recreated rather than followed.  Returns the number of
/// files and links copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    std::fs::create_dir_all(dst)
        .with_context(|| format!("failed to create {}", dst.display()))?;

    let mut copied = 0;
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from_dir, to_dir)) = stack.pop() {
        let entries = std::fs::read_dir(&from_dir)
            .with_context(|| format!("failed to read {}", from_dir.display()))?;

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if name == ".git" {
                continue;
            }
            let from = entry.path();
            let to = to_dir.join(&name);
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                std::fs::create_dir(&to)
                    .with_context(|| format!("failed to create {}", to.display()))?;
                stack.push((from, to));
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(&from)?;
                std::os::unix::fs::symlink(&target, &to)
                    .with_context(|| format!("failed to link {}", to.display()))?;
                copied += 1;
            } else if file_type.is_file() {
                std::fs::copy(&from, &to).with_context(|| {
                    format!("failed to copy {} to {}", from.display(), to.display())
                })?;
                copied += 1;
            }
            // Sockets, fifos and devices are not publishable.
        }
    }

    Ok(copied)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;
    use std::path::Path;

    /// Every regular file under `root` as `relative path -> bytes`.
    pub fn snapshot_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut out = BTreeMap::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let entry = entry.unwrap();
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                    out.insert(rel, std::fs::read(&path).unwrap());
                }
            }
        }
        out
    }
}
