//! Bind mount of a run workspace into a container

use std::path::{Path, PathBuf};

/// Container path the workspace is mounted at
pub(crate) const CONTAINER_WORKSPACE: &str = "/workspace";

/// Bind mount for a sandboxed container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host path
    pub source: PathBuf,
    /// Container path
    pub target: String,
    /// Read-only mount
    pub read_only: bool,
}

impl Mount {
    /// Mount the workspace read-write (build step writes the binary)
    #[must_use]
    pub fn workspace_rw(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            target: CONTAINER_WORKSPACE.to_string(),
            read_only: false,
        }
    }

    /// Mount the workspace read-only (the program itself)
    #[must_use]
    pub fn workspace_ro(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            target: CONTAINER_WORKSPACE.to_string(),
            read_only: true,
        }
    }

    /// Docker `--mount` argument
    #[must_use]
    pub fn to_docker_arg(&self) -> String {
        let ro = if self.read_only { ",readonly" } else { "" };
        format!(
            "--mount=type=bind,source={},target={}{}",
            self.source.display(),
            self.target,
            ro
        )
    }

    /// Apple Container `--mount` argument
    #[must_use]
    pub fn to_apple_container_arg(&self) -> String {
        let ro = if self.read_only { ":ro" } else { "" };
        format!("--mount={}:{}{}", self.source.display(), self.target, ro)
    }
}
