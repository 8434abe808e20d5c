use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub http: HttpConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    pub pages: PagesSettings,
}

// ---------------------------------------------------------------------------
// SSH listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Socket address for the SSH listener (e.g. `0.0.0.0:2222`).
    #[serde(default = "default_ssh_listen")]
    pub listen: String,
    /// OpenSSH-format private host key.  When unset an ephemeral Ed25519 key
    /// is generated at startup.
    #[serde(default)]
    pub host_key_path: Option<PathBuf>,
    /// OpenSSH `authorized_keys`-style file.  The comment field of each entry
    /// is the username the key authenticates as.
    #[serde(default = "default_authorized_keys_path")]
    pub authorized_keys_path: PathBuf,
    /// Idle timeout (seconds) for an SSH connection.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            listen: default_ssh_listen(),
            host_key_path: None,
            authorized_keys_path: default_authorized_keys_path(),
            inactivity_timeout: default_inactivity_timeout(),
        }
    }
}

fn default_ssh_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_authorized_keys_path() -> PathBuf {
    PathBuf::from("/etc/pushgate/authorized_keys")
}

fn default_inactivity_timeout() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// HTTP (health + metrics)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Socket address for the health/metrics listener.
    #[serde(default = "default_http_listen")]
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "127.0.0.1:9090".to_string()
}

// ---------------------------------------------------------------------------
// Repository store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Root directory holding the bare repositories (`{root}/{name}.git`).
    pub root: PathBuf,
    /// Name of the per-repository deployment config file, relative to the
    /// bare repository directory.
    #[serde(default = "default_pages_config_file")]
    pub pages_config_file: String,
}

fn default_pages_config_file() -> String {
    "pages.json".to_string()
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// How the dispatcher works out which refs a push updated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefTracking {
    /// Diff ref snapshots taken before and after the transport ran.  Hooks
    /// receive real object ids, one event per updated ref.
    #[default]
    Snapshot,
    /// Only report the most recently committed branch, with sentinel ids.
    MostRecent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub ref_tracking: RefTracking,
    /// Directory of registered post-receive scripts, relative to the bare
    /// repository.
    #[serde(default = "default_hooks_dir")]
    pub dir: String,
    /// Upper bound (seconds) on a single script hook run.
    #[serde(default = "default_script_timeout")]
    pub script_timeout: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            ref_tracking: RefTracking::default(),
            dir: default_hooks_dir(),
            script_timeout: default_script_timeout(),
        }
    }
}

impl HooksConfig {
    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout)
    }
}

fn default_hooks_dir() -> String {
    "hooks/post-receive.d".to_string()
}

fn default_script_timeout() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PagesSettings {
    /// Root for per-repository build workspaces and lock files.
    pub work_root: PathBuf,
    /// Root of the publication surface served by the reverse proxy.
    pub sites_root: PathBuf,
    /// Upper bound (seconds) on the dependency install and build commands.
    #[serde(default = "default_build_timeout")]
    pub build_timeout: u64,
    /// How long (seconds) a pipeline run waits for the per-repository lock.
    #[serde(default = "default_lock_wait_timeout")]
    pub lock_wait_timeout: u64,
    /// Command run in the workspace when a dependency manifest is present.
    #[serde(default = "default_install_command")]
    pub install_command: String,
    /// Number of releases kept per site, including the live one.
    #[serde(default = "default_keep_releases")]
    pub keep_releases: usize,
}

impl PagesSettings {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_wait_timeout)
    }
}

fn default_build_timeout() -> u64 {
    600
}

fn default_lock_wait_timeout() -> u64 {
    900
}

fn default_install_command() -> String {
    "npm install".to_string()
}

fn default_keep_releases() -> usize {
    2
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.store.root.is_absolute(),
        "store.root must be an absolute path"
    );
    anyhow::ensure!(
        config.pages.work_root.is_absolute() && config.pages.sites_root.is_absolute(),
        "pages.work_root and pages.sites_root must be absolute paths"
    );
    anyhow::ensure!(
        !config.pages.work_root.starts_with(&config.pages.sites_root),
        "pages.work_root must not live inside pages.sites_root"
    );
    anyhow::ensure!(
        config.pages.keep_releases >= 1,
        "pages.keep_releases must be at least 1"
    );
    anyhow::ensure!(
        config.pages.build_timeout > 0,
        "pages.build_timeout must be greater than zero"
    );
    anyhow::ensure!(
        !config.store.pages_config_file.contains(".."),
        "store.pages_config_file must not contain '..'"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
store:
  root: /srv/git
pages:
  work_root: /var/lib/pushgate/builds
  sites_root: /var/www/pages
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        validate_config(&config).unwrap();

        assert_eq!(config.ssh.listen, "0.0.0.0:2222");
        assert_eq!(config.store.pages_config_file, "pages.json");
        assert_eq!(config.hooks.ref_tracking, RefTracking::Snapshot);
        assert_eq!(config.hooks.dir, "hooks/post-receive.d");
        assert_eq!(config.pages.keep_releases, 2);
        assert_eq!(config.pages.build_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn ref_tracking_is_kebab_case() {
        let yaml = format!("{MINIMAL}hooks:\n  ref_tracking: most-recent\n");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.hooks.ref_tracking, RefTracking::MostRecent);
    }

    #[test]
    fn relative_store_root_is_rejected() {
        let yaml = MINIMAL.replace("/srv/git", "srv/git");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn work_root_inside_sites_root_is_rejected() {
        let yaml = MINIMAL.replace("/var/lib/pushgate/builds", "/var/www/pages/.builds");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn load_config_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.store.root, PathBuf::from("/srv/git"));
    }
}
