//! Per-repository deployment config (`pages.json`).

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;

/// Deployment settings for one repository.  Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PagesConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Branch whose pushes trigger a deployment.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Shell command run in the workspace; empty means publish as-is.
    #[serde(default)]
    pub build_command: String,
    /// Directory, relative to the workspace, that gets published.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for PagesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            branch: default_branch(),
            build_command: String::new(),
            output_dir: default_output_dir(),
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_output_dir() -> String {
    "public".to_string()
}

impl PagesConfig {
    pub fn from_json(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn has_build_step(&self) -> bool {
        !self.build_command.trim().is_empty()
    }

    /// Output directory as a workspace-relative path.
    ///
    /// Empty and `.` mean the workspace root.  Absolute paths and `..`
    /// components are rejected so the published tree always comes from
    /// inside the workspace.
    pub fn output_path(&self) -> Result<PathBuf> {
        let raw = Path::new(self.output_dir.trim());
        let mut rel = PathBuf::new();
        for component in raw.components() {
            match component {
                Component::Normal(part) => rel.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    anyhow::bail!("output_dir {:?} must not contain '..'", self.output_dir)
                }
                Component::RootDir | Component::Prefix(_) => {
                    anyhow::bail!("output_dir {:?} must be relative", self.output_dir)
                }
            }
        }
        Ok(rel)
    }
}
